//! Circular buffers in a device address space.
//!
//! A [`RingBuffer`] is just the address of a control block. Producer and
//! consumer each own one offset: the producer only ever writes `head`, the
//! consumer only ever writes `tail`, so the data bytes need no locking as
//! long as there is one producer and one consumer per ring.

use bytes::Bytes;
use etsoc_chip::ring::{self, ControlBlock, CONTROL_BLOCK_SIZE};
use etsoc_chip::wire::{CommonHeader, COMMON_HEADER_SIZE};

use crate::error::{EtError, Result};
use crate::mmio::MmioAccess;

/// Handle on a control block at a fixed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBuffer {
    base: u64,
}

impl RingBuffer {
    /// Ring whose control block starts at `base`.
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    /// Address of the control block.
    pub const fn base(&self) -> u64 {
        self.base
    }

    const fn data_addr(&self, offset: u64) -> u64 {
        self.base + CONTROL_BLOCK_SIZE as u64 + offset
    }

    /// Write an empty control block for `length` data bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the control block is not backed.
    pub fn init<B: MmioAccess + ?Sized>(&self, bus: &B, length: u64) -> Result<()> {
        bus.mmio_write(self.base, &ControlBlock::empty(length).encode())
    }

    /// Read and validate the control block.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the offsets are outside the data area.
    pub fn control<B: MmioAccess + ?Sized>(&self, bus: &B) -> Result<ControlBlock> {
        let mut raw = [0u8; CONTROL_BLOCK_SIZE];
        bus.mmio_read(self.base, &mut raw)?;
        let cb = ControlBlock::decode(&raw)
            .ok_or_else(|| EtError::protocol("short control block"))?;
        if !cb.is_valid() {
            return Err(EtError::protocol(format!(
                "corrupt control block at {:#x}: head={} tail={} length={}",
                self.base, cb.head, cb.tail, cb.length
            )));
        }
        Ok(cb)
    }

    fn write_wrapped<B: MmioAccess + ?Sized>(
        &self,
        bus: &B,
        length: u64,
        pos: u64,
        data: &[u8],
    ) -> Result<u64> {
        let (first, _) = ring::wrap_split(pos, data.len() as u64, length);
        #[allow(clippy::cast_possible_truncation)]
        let (front, back) = data.split_at(first as usize);
        bus.mmio_write(self.data_addr(pos), front)?;
        if !back.is_empty() {
            bus.mmio_write(self.data_addr(0), back)?;
        }
        Ok(ring::advance(pos, data.len() as u64, length))
    }

    fn read_wrapped<B: MmioAccess + ?Sized>(
        &self,
        bus: &B,
        length: u64,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<u64> {
        let (first, _) = ring::wrap_split(pos, buf.len() as u64, length);
        #[allow(clippy::cast_possible_truncation)]
        let (front, back) = buf.split_at_mut(first as usize);
        bus.mmio_read(self.data_addr(pos), front)?;
        if !back.is_empty() {
            bus.mmio_read(self.data_addr(0), back)?;
        }
        Ok(ring::advance(pos, buf.len() as u64, length))
    }

    /// Producer side: append `data` as a unit.
    ///
    /// Returns the control block after the write, or `None` (nothing
    /// touched) if `data` does not fit in the available space.
    ///
    /// # Errors
    ///
    /// Returns error if the window access fails or the control block is corrupt.
    pub fn push<B: MmioAccess + ?Sized>(&self, bus: &B, data: &[u8]) -> Result<Option<ControlBlock>> {
        let mut cb = self.control(bus)?;
        if data.len() as u64 > cb.available() {
            return Ok(None);
        }
        cb.head = self.write_wrapped(bus, cb.length, cb.head, data)?;
        bus.write_u64(self.base + ring::HEAD_OFFSET, cb.head)?;
        Ok(Some(cb))
    }

    /// Consumer side: pop one framed message (common header plus `size`
    /// bytes).
    ///
    /// Returns `None` when the ring is empty, otherwise the frame and the
    /// control block after the pop.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for a zero `size` field (the header is consumed) or
    /// for a frame longer than the queued bytes (everything queued is
    /// discarded, since the framing is lost). Either way the ring stays
    /// usable.
    pub fn pop_frame<B: MmioAccess + ?Sized>(
        &self,
        bus: &B,
    ) -> Result<Option<(Bytes, ControlBlock)>> {
        self.pop(bus, false)
    }

    /// Device side of a submission queue: like [`Self::pop_frame`], but a
    /// command may have an empty body.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for a frame longer than the queued bytes, after
    /// discarding them.
    pub fn pop_command<B: MmioAccess + ?Sized>(
        &self,
        bus: &B,
    ) -> Result<Option<(Bytes, ControlBlock)>> {
        self.pop(bus, true)
    }

    fn pop<B: MmioAccess + ?Sized>(
        &self,
        bus: &B,
        allow_empty: bool,
    ) -> Result<Option<(Bytes, ControlBlock)>> {
        let mut cb = self.control(bus)?;
        let used = cb.used();
        if used == 0 {
            return Ok(None);
        }
        if used < COMMON_HEADER_SIZE as u64 {
            self.discard(bus, &cb)?;
            return Err(EtError::protocol(format!(
                "{used} queued bytes cannot hold a message header"
            )));
        }
        let mut frame = vec![0u8; COMMON_HEADER_SIZE];
        let after_header = self.read_wrapped(bus, cb.length, cb.tail, &mut frame)?;
        let header = CommonHeader::decode(&frame)
            .ok_or_else(|| EtError::protocol("short message header"))?;
        if header.size == 0 && !allow_empty {
            bus.write_u64(self.base + ring::TAIL_OFFSET, after_header)?;
            return Err(EtError::protocol(format!(
                "message {} (tag {}) declares an empty body",
                header.msg_id, header.tag_id
            )));
        }
        if header.frame_len() as u64 > used {
            self.discard(bus, &cb)?;
            return Err(EtError::protocol(format!(
                "message {} declares {} bytes but only {used} are queued",
                header.msg_id,
                header.frame_len()
            )));
        }
        frame.resize(header.frame_len(), 0);
        cb.tail = self.read_wrapped(bus, cb.length, after_header, &mut frame[COMMON_HEADER_SIZE..])?;
        bus.write_u64(self.base + ring::TAIL_OFFSET, cb.tail)?;
        Ok(Some((Bytes::from(frame), cb)))
    }

    /// Drop every byte queued when `cb` was read. Bytes pushed after that
    /// stay queued.
    fn discard<B: MmioAccess + ?Sized>(&self, bus: &B, cb: &ControlBlock) -> Result<()> {
        tracing::debug!("Ring {:#x}: discarding {} queued bytes", self.base, cb.used());
        bus.write_u64(self.base + ring::TAIL_OFFSET, cb.head)
    }

    /// Move `head` (producer side) or `tail` (consumer side) directly.
    ///
    /// # Errors
    ///
    /// Returns error if the window access fails.
    pub fn set_offsets<B: MmioAccess + ?Sized>(&self, bus: &B, head: u64, tail: u64) -> Result<()> {
        bus.write_u64(self.base + ring::HEAD_OFFSET, head)?;
        bus.write_u64(self.base + ring::TAIL_OFFSET, tail)
    }
}

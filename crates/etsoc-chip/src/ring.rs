//! Circular buffer control block.
//!
//! Every queue in the shared window starts with a 24-byte control block
//! immediately followed by `length` data bytes:
//!
//! ```text
//! +0x00  head_offset  u64   next byte the producer writes
//! +0x08  tail_offset  u64   next byte the consumer reads
//! +0x10  length       u64   size of the data area
//! +0x18  data[length]
//! ```
//!
//! One byte is always left unused so that `head == tail` means empty, which
//! gives `used + available == length - 1` for every valid block.

/// Offset of `head_offset` within the control block.
pub const HEAD_OFFSET: u64 = 0x00;

/// Offset of `tail_offset` within the control block.
pub const TAIL_OFFSET: u64 = 0x08;

/// Offset of `length` within the control block.
pub const LENGTH_OFFSET: u64 = 0x10;

/// Size of the control block; data follows at this offset.
pub const CONTROL_BLOCK_SIZE: usize = 24;

/// Bytes currently queued between `tail` and `head`.
pub const fn used_space(head: u64, tail: u64, length: u64) -> u64 {
    if head >= tail {
        head - tail
    } else {
        length + head - tail
    }
}

/// Bytes a producer may write without overtaking the consumer.
pub const fn available_space(head: u64, tail: u64, length: u64) -> u64 {
    if head >= tail {
        (length - 1) - (head - tail)
    } else {
        tail - head - 1
    }
}

/// Position `n` bytes after `pos`, modulo `length`.
pub const fn advance(pos: u64, n: u64, length: u64) -> u64 {
    (pos + n) % length
}

/// Split an access of `len` bytes at `pos` into `(before_wrap, after_wrap)`.
///
/// The first chunk runs from `pos` to at most the end of the buffer; the
/// second (possibly empty) chunk starts at offset 0.
pub const fn wrap_split(pos: u64, len: u64, length: u64) -> (u64, u64) {
    if pos + len > length {
        let first = length - pos;
        (first, len - first)
    } else {
        (len, 0)
    }
}

/// Decoded control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    /// Producer offset.
    pub head: u64,
    /// Consumer offset.
    pub tail: u64,
    /// Size of the data area in bytes.
    pub length: u64,
}

impl ControlBlock {
    /// Empty ring of `length` data bytes.
    pub const fn empty(length: u64) -> Self {
        Self {
            head: 0,
            tail: 0,
            length,
        }
    }

    /// Decode from the first 24 bytes of `bytes` (little-endian).
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let field = |at: usize| -> Option<u64> {
            let raw: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
            Some(u64::from_le_bytes(raw))
        };
        Some(Self {
            head: field(0)?,
            tail: field(8)?,
            length: field(16)?,
        })
    }

    /// Encode as 24 little-endian bytes.
    pub fn encode(&self) -> [u8; CONTROL_BLOCK_SIZE] {
        let mut out = [0u8; CONTROL_BLOCK_SIZE];
        out[0..8].copy_from_slice(&self.head.to_le_bytes());
        out[8..16].copy_from_slice(&self.tail.to_le_bytes());
        out[16..24].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// `length > 0` and both offsets inside the data area.
    pub const fn is_valid(&self) -> bool {
        self.length > 0 && self.head < self.length && self.tail < self.length
    }

    /// See [`used_space`].
    pub const fn used(&self) -> u64 {
        used_space(self.head, self.tail, self.length)
    }

    /// See [`available_space`].
    pub const fn available(&self) -> u64 {
        available_space(self.head, self.tail, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_plus_available_is_length_minus_one() {
        for length in 1..=40u64 {
            for head in 0..length {
                for tail in 0..length {
                    assert_eq!(
                        used_space(head, tail, length) + available_space(head, tail, length),
                        length - 1,
                        "head={head} tail={tail} length={length}"
                    );
                }
            }
        }
    }

    #[test]
    fn space_check_example() {
        let cb = ControlBlock {
            head: 1000,
            tail: 100,
            length: 1024,
        };
        assert_eq!(cb.used(), 900);
        assert_eq!(cb.available(), 123);
    }

    #[test]
    fn empty_ring_has_one_reserved_byte() {
        let cb = ControlBlock::empty(64);
        assert_eq!(cb.used(), 0);
        assert_eq!(cb.available(), 63);
    }

    #[test]
    fn head_behind_tail() {
        assert_eq!(used_space(10, 50, 64), 24);
        assert_eq!(available_space(10, 50, 64), 39);
    }

    #[test]
    fn wrap_split_crosses_end() {
        assert_eq!(wrap_split(60, 10, 64), (4, 6));
        assert_eq!(wrap_split(0, 10, 64), (10, 0));
        assert_eq!(wrap_split(54, 10, 64), (10, 0));
        assert_eq!(advance(60, 10, 64), 6);
        assert_eq!(advance(54, 10, 64), 0);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(ControlBlock::decode(&[0u8; 23]), None);
        let cb = ControlBlock {
            head: 3,
            tail: 2,
            length: 9,
        };
        assert_eq!(ControlBlock::decode(&cb.encode()), Some(cb));
        assert!(cb.is_valid());
        assert!(!ControlBlock { head: 9, ..cb }.is_valid());
    }
}

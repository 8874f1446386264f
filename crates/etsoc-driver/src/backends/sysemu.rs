//! System emulator transport
//!
//! Drives a simulated device through its shared memory window. Nothing is
//! known about the device up front: each channel's firmware publishes a
//! descriptor (the DIRs) at a fixed BAR2 offset, and bring-up polls its boot
//! status, validates its CRC32 and derives every queue address from it.
//!
//! ```text
//! host                                   device
//! submit ──► SQ ring ──► doorbell ─────► firmware
//!                                          │
//! wait_for_readiness ◄── condvar ◄── irq ◄─┘ (SQ drained / CQ written)
//! poll_response ◄── CQ ring
//! ```
//!
//! Readiness is edge-triggered: an interrupt only marks the channel as worth
//! re-checking, and a wait reports a queue only when its state flipped from
//! not-ready to ready since the last report.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use etsoc_chip::bar;
use etsoc_chip::dir::{self, boot, region, DeviceInterface, GenericAttr, GENERIC_ATTR_SIZE};
use etsoc_chip::ring::CONTROL_BLOCK_SIZE;
use tracing::{debug, error, info, warn};

use crate::error::{EtError, Result};
use crate::mmio::MmioAccess;
use crate::ring::RingBuffer;
use crate::transport::{
    Channel, DeviceConfig, DeviceState, DmaInfo, FormFactor, QueueTransport, Readiness,
    TransportType,
};

/// Longest wait for a reset command to take the device down
const RESET_NOTICE: Duration = Duration::from_secs(1);

/// The simulator side of the emulated transport.
///
/// Implemented by the in-process [`crate::SoftDevice`]; an out-of-process
/// emulator would implement it over its IPC link.
pub trait SimBus: MmioAccess + std::fmt::Debug + Send + Sync {
    /// Ring the device doorbell with the given interrupt bits.
    ///
    /// # Errors
    ///
    /// Returns error if the simulator has stopped.
    fn raise_device_interrupt(&self, bits: u32) -> Result<()>;

    /// Block up to `timeout` for host interrupts in `mask`.
    ///
    /// Returns the pending bits (cleared on return), zero on timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the simulator has stopped.
    fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> Result<u32>;

    /// Stop the simulator. Blocked interrupt waits return.
    fn stop(&self);

    /// Last fatal error recorded by the simulator, if any.
    fn last_error(&self) -> Option<String>;
}

/// Emulated transport configuration
#[derive(Debug, Clone)]
pub struct SysEmuConfig {
    /// Give up on bring-up after this long
    pub bringup_timeout: Duration,
    /// Boot-status polling interval
    pub poll_interval: Duration,
    /// Address of the management channel descriptor
    pub mgmt_dir_addr: u64,
    /// Address of the compute channel descriptor
    pub ops_dir_addr: u64,
    /// Bring up the compute channel as well
    pub enable_compute: bool,
    /// DMA alignment reported to callers, in bits
    pub dma_alignment_bits: u32,
    /// Largest DMA element reported to callers
    pub max_dma_element_size: u64,
    /// Longest DMA list reported to callers
    pub max_dma_element_count: u32,
    /// Interrupt dispatcher wait slice
    pub irq_poll: Duration,
}

impl Default for SysEmuConfig {
    fn default() -> Self {
        Self {
            bringup_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
            mgmt_dir_addr: bar::BAR2_BASE + bar::SP_DIR_OFFSET,
            ops_dir_addr: bar::BAR2_BASE + bar::MM_DIR_OFFSET,
            enable_compute: true,
            dma_alignment_bits: 64,
            max_dma_element_size: 128 << 20,
            max_dma_element_count: 4,
            irq_poll: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Queue {
    ring: RingBuffer,
    /// Bytes including the control block
    size: u64,
    threshold: AtomicU64,
    io: Mutex<()>,
}

impl Queue {
    fn new(addr: u64, size: u64) -> Self {
        let capacity = size - CONTROL_BLOCK_SIZE as u64;
        Self {
            ring: RingBuffer::new(addr),
            size,
            threshold: AtomicU64::new(capacity / 4),
            io: Mutex::new(()),
        }
    }

    const fn capacity(&self) -> u64 {
        self.size - CONTROL_BLOCK_SIZE as u64
    }
}

#[derive(Debug)]
struct Queues {
    dir: DeviceInterface,
    sqs: Vec<Queue>,
    cq: Queue,
}

/// Last reported state plus the "interrupt arrived" latch.
#[derive(Debug, Default)]
struct Edges {
    irq_pending: bool,
    sq_state: u64,
    cq_state: bool,
}

#[derive(Debug)]
struct ChannelState {
    channel: Channel,
    dir_addr: u64,
    ready_status: i16,
    irq_mask: u32,
    queues: RwLock<Option<Queues>>,
    edges: Mutex<Edges>,
    wake: Condvar,
}

impl ChannelState {
    fn new(channel: Channel, dir_addr: u64) -> Self {
        let (ready_status, irq_mask) = match channel {
            Channel::Management => (boot::SP_DEV_READY, bar::IRQ_SP_SQ | bar::IRQ_SP_CQ),
            Channel::Compute => (boot::MM_READY, bar::IRQ_MM_SQ | bar::IRQ_MM_CQ),
        };
        Self {
            channel,
            dir_addr,
            ready_status,
            irq_mask,
            queues: RwLock::new(None),
            edges: Mutex::new(Edges::default()),
            wake: Condvar::new(),
        }
    }

    fn mark_interrupt(&self) {
        self.edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .irq_pending = true;
        self.wake.notify_all();
    }
}

#[derive(Debug)]
struct Shared {
    bus: Arc<dyn SimBus>,
    running: AtomicBool,
    mgmt: ChannelState,
    ops: ChannelState,
}

impl Shared {
    const fn channel(&self, channel: Channel) -> &ChannelState {
        match channel {
            Channel::Management => &self.mgmt,
            Channel::Compute => &self.ops,
        }
    }

    /// Recompute queue states; report only false→true transitions.
    fn found_events(&self, ch: &ChannelState, edges: &mut Edges) -> Result<Readiness> {
        if !edges.irq_pending {
            return Ok(Readiness::none());
        }
        edges.irq_pending = false;

        let guard = ch.queues.read().unwrap_or_else(PoisonError::into_inner);
        let Some(queues) = guard.as_ref() else {
            return Ok(Readiness::none());
        };
        let mut sq_now = 0u64;
        for (i, sq) in queues.sqs.iter().enumerate() {
            if sq.ring.control(&*self.bus)?.available() >= sq.threshold.load(Ordering::Relaxed) {
                sq_now |= 1 << i;
            }
        }
        let cq_now = queues.cq.ring.control(&*self.bus)?.used() > 0;

        let found = Readiness {
            sq_bitmap: sq_now & !edges.sq_state,
            cq_ready: cq_now && !edges.cq_state,
        };
        edges.sq_state = sq_now;
        edges.cq_state = cq_now;
        Ok(found)
    }
}

/// Emulated transport over a [`SimBus`]
#[derive(Debug)]
pub struct SysEmuTransport {
    shared: Arc<Shared>,
    config: SysEmuConfig,
    irq_listener: Option<JoinHandle<()>>,
}

impl SysEmuTransport {
    /// Start the interrupt dispatcher and bring up both channels
    ///
    /// # Errors
    ///
    /// Returns `BringUp` if firmware reports a boot error, `Timeout` if it
    /// never becomes ready, `ChecksumMismatch` for a corrupt descriptor.
    pub fn start(bus: Arc<dyn SimBus>, config: SysEmuConfig) -> Result<Self> {
        info!(
            "Starting emulated transport (BAR0 {:#x}, BAR2 {:#x})",
            bar::BAR0_BASE,
            bar::BAR2_BASE
        );
        let shared = Arc::new(Shared {
            bus,
            running: AtomicBool::new(true),
            mgmt: ChannelState::new(Channel::Management, config.mgmt_dir_addr),
            ops: ChannelState::new(Channel::Compute, config.ops_dir_addr),
        });

        let listener = Arc::clone(&shared);
        let irq_poll = config.irq_poll;
        let irq_listener = thread::Builder::new()
            .name("etsoc-sysemu-irq".into())
            .spawn(move || interrupt_loop(&listener, irq_poll))?;

        let transport = Self {
            shared,
            config,
            irq_listener: Some(irq_listener),
        };
        let timeout = transport.config.bringup_timeout;
        transport.bring_up_channel(Channel::Management, timeout)?;
        if transport.config.enable_compute {
            transport.bring_up_channel(Channel::Compute, timeout)?;
        }
        // Dropping `transport` on the error paths above joins the listener.
        Ok(transport)
    }

    fn bring_up_channel(&self, channel: Channel, timeout: Duration) -> Result<()> {
        let ch = self.shared.channel(channel);
        let queues = bring_up(&*self.shared.bus, ch, &self.config, timeout)?;
        info!(
            "{channel} channel ready: {} SQ(s) of {} bytes, CQ of {} bytes",
            queues.sqs.len(),
            queues.sqs.first().map_or(0, Queue::capacity),
            queues.cq.capacity()
        );
        *ch.queues.write().unwrap_or_else(PoisonError::into_inner) = Some(queues);
        {
            let mut edges = ch.edges.lock().unwrap_or_else(PoisonError::into_inner);
            *edges = Edges {
                irq_pending: true,
                ..Edges::default()
            };
        }
        ch.wake.notify_all();
        Ok(())
    }

    /// The reset command is only consumed after it was queued; bring-up
    /// must not read the descriptor from before the device went down.
    fn await_reset_notice(&self, until: Instant) -> Result<()> {
        let ch = &self.shared.mgmt;
        loop {
            let status = self.shared.bus.read_i16(ch.dir_addr + dir::STATUS_OFFSET)?;
            if status < ch.ready_status {
                debug!("Device left ready state (boot status {status})");
                return Ok(());
            }
            if Instant::now() >= until {
                debug!("No reset observed, descriptor still ready");
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn check_device(device: usize) -> Result<()> {
        if device == 0 {
            Ok(())
        } else {
            Err(EtError::InvalidIndex {
                index: device,
                count: 1,
            })
        }
    }

    fn with_queues<T>(
        &self,
        device: usize,
        channel: Channel,
        f: impl FnOnce(&Queues) -> Result<T>,
    ) -> Result<T> {
        Self::check_device(device)?;
        let ch = self.shared.channel(channel);
        let guard = ch.queues.read().unwrap_or_else(PoisonError::into_inner);
        let queues = guard
            .as_ref()
            .ok_or_else(|| EtError::invalid_state(format!("{channel} channel not brought up")))?;
        f(queues)
    }

    fn sq<'q>(queues: &'q Queues, channel: Channel, sq_index: usize) -> Result<&'q Queue> {
        queues.sqs.get(sq_index).ok_or_else(|| {
            EtError::invalid_argument(format!(
                "{channel} SQ {sq_index} out of range ({} queues)",
                queues.sqs.len()
            ))
        })
    }
}

fn interrupt_loop(shared: &Shared, poll: Duration) {
    let mask = shared.mgmt.irq_mask | shared.ops.irq_mask;
    while shared.running.load(Ordering::Acquire) {
        match shared.bus.wait_for_interrupt(mask, poll) {
            Ok(0) => {}
            Ok(bits) => {
                for ch in [&shared.mgmt, &shared.ops] {
                    if bits & ch.irq_mask != 0 {
                        ch.mark_interrupt();
                    }
                }
            }
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("Interrupt listener stopping: {e}");
                }
                break;
            }
        }
    }
    debug!("Interrupt listener exited");
}

fn bring_up(
    bus: &dyn SimBus,
    ch: &ChannelState,
    config: &SysEmuConfig,
    timeout: Duration,
) -> Result<Queues> {
    let channel = ch.channel;
    let deadline = Instant::now() + timeout;
    loop {
        let status = bus.read_i16(ch.dir_addr + dir::STATUS_OFFSET)?;
        if status < 0 {
            return Err(EtError::bring_up(format!(
                "{channel} firmware reported boot status {status}"
            )));
        }
        if status >= ch.ready_status {
            debug!("{channel} boot status {status}");
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(EtError::timeout(timeout));
        }
        thread::sleep(config.poll_interval.min(deadline - now));
    }

    let mut head = [0u8; GENERIC_ATTR_SIZE];
    bus.mmio_read(ch.dir_addr, &mut head)?;
    let generic = GenericAttr::decode(&head)
        .ok_or_else(|| EtError::protocol("short descriptor header"))?;
    let total = usize::from(generic.total_size);
    if total < DeviceInterface::wire_size(0) {
        return Err(EtError::protocol(format!(
            "{channel} descriptor total size {total} too small"
        )));
    }
    let mut raw = vec![0u8; total];
    bus.mmio_read(ch.dir_addr, &mut raw)?;

    let span = dir::checksum_span(&raw)
        .ok_or_else(|| EtError::protocol(format!("{channel} descriptor sizes inconsistent")))?;
    let computed = crc32fast::hash(span);
    if computed != generic.crc32 {
        return Err(EtError::ChecksumMismatch {
            expected: generic.crc32,
            computed,
        });
    }
    let dir = DeviceInterface::decode(&raw)
        .ok_or_else(|| EtError::protocol(format!("{channel} descriptor does not decode")))?;
    if dir.generic.version != dir::DIR_VERSION {
        warn!(
            "{channel} descriptor version {} (expected {})",
            dir.generic.version,
            dir::DIR_VERSION
        );
    }

    let vq_region = dir
        .region(region::VQ_BUFFER)
        .ok_or_else(|| EtError::protocol(format!("{channel} descriptor has no queue region")))?;
    let base = bar::bar_address(vq_region.bar, vq_region.bar_offset).ok_or_else(|| {
        EtError::protocol(format!("{channel} queue region in unknown BAR{}", vq_region.bar))
    })?;
    let vq = dir.vq;
    let bad_count = match channel {
        Channel::Management => vq.sq_count != 1,
        Channel::Compute => vq.sq_count == 0 || vq.sq_count > 64,
    };
    if bad_count || vq.cq_count == 0 {
        return Err(EtError::protocol(format!(
            "{channel} descriptor advertises {} SQs",
            vq.sq_count
        )));
    }

    let checked = |addr: u64, size: u64, what: &str| -> Result<Queue> {
        if size <= CONTROL_BLOCK_SIZE as u64 + 1 {
            return Err(EtError::protocol(format!(
                "{channel} {what} of {size} bytes cannot hold a ring"
            )));
        }
        let queue = Queue::new(addr, size);
        let cb = queue.ring.control(bus)?;
        if cb.length != queue.capacity() {
            return Err(EtError::protocol(format!(
                "{channel} {what} ring length {} does not match descriptor size {}",
                cb.length,
                queue.capacity()
            )));
        }
        Ok(queue)
    };

    let per_sq = u64::from(vq.per_sq_size);
    let sqs = (0..u64::from(vq.sq_count))
        .map(|i| checked(base + u64::from(vq.sq_offset) + i * per_sq, per_sq, "SQ"))
        .collect::<Result<Vec<_>>>()?;
    let cq_size = u64::from(vq.per_cq_size) * u64::from(vq.cq_count);
    let cq = checked(base + u64::from(vq.cq_offset), cq_size, "CQ")?;

    Ok(Queues { dir, sqs, cq })
}

impl QueueTransport for SysEmuTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::SysEmu
    }

    fn device_count(&self) -> usize {
        1
    }

    fn sq_count(&self, device: usize, channel: Channel) -> Result<usize> {
        self.with_queues(device, channel, |q| Ok(q.sqs.len()))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sq_capacity(&self, device: usize, channel: Channel) -> Result<usize> {
        self.with_queues(device, channel, |q| {
            Ok(q.sqs.first().map_or(0, Queue::capacity) as usize)
        })
    }

    fn submit(&self, device: usize, channel: Channel, sq_index: usize, frame: &[u8]) -> Result<bool> {
        let bus = &*self.shared.bus;
        let writable = self.with_queues(device, channel, |queues| {
            let sq = Self::sq(queues, channel, sq_index)?;
            let _io = sq.io.lock().unwrap_or_else(PoisonError::into_inner);
            match sq.ring.push(bus, frame)? {
                None => Ok(None),
                Some(cb) => Ok(Some(cb.available() >= sq.threshold.load(Ordering::Relaxed))),
            }
        })?;
        let Some(still_writable) = writable else {
            debug!("{channel} SQ {sq_index} full, {} byte frame deferred", frame.len());
            return Ok(false);
        };

        let ch = self.shared.channel(channel);
        {
            let mut edges = ch.edges.lock().unwrap_or_else(PoisonError::into_inner);
            if still_writable {
                edges.sq_state |= 1 << sq_index;
            } else {
                edges.sq_state &= !(1 << sq_index);
            }
        }
        let doorbell = match channel {
            Channel::Management => bar::IRQ_SP_SQ,
            Channel::Compute => bar::IRQ_MM_SQ,
        };
        bus.raise_device_interrupt(doorbell)?;
        Ok(true)
    }

    fn set_sq_threshold(&self, device: usize, channel: Channel, sq_index: usize, bytes: usize) -> Result<()> {
        self.with_queues(device, channel, |queues| {
            let sq = Self::sq(queues, channel, sq_index)?;
            if bytes == 0 || bytes as u64 > sq.capacity() {
                return Err(EtError::invalid_argument(format!(
                    "threshold {bytes} outside (0, {}]",
                    sq.capacity()
                )));
            }
            sq.threshold.store(bytes as u64, Ordering::Relaxed);
            Ok(())
        })
    }

    fn wait_for_readiness(&self, device: usize, channel: Channel, timeout: Duration) -> Result<Readiness> {
        Self::check_device(device)?;
        let shared = &*self.shared;
        let ch = shared.channel(channel);
        let mut found = Readiness::none();
        let mut fault = None;
        let guard = ch.edges.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = ch
            .wake
            .wait_timeout_while(guard, timeout, |edges| {
                if !shared.running.load(Ordering::Acquire) {
                    return false;
                }
                match shared.found_events(ch, edges) {
                    Ok(r) => {
                        found = r;
                        !r.any()
                    }
                    Err(e) => {
                        fault = Some(e);
                        false
                    }
                }
            })
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);

        if let Some(e) = fault {
            return Err(e);
        }
        if !shared.running.load(Ordering::Acquire) {
            return Err(EtError::invalid_state("emulator stopped"));
        }
        Ok(found)
    }

    fn poll_response(&self, device: usize, channel: Channel) -> Result<Option<Bytes>> {
        let bus = &*self.shared.bus;
        let popped = self.with_queues(device, channel, |queues| {
            let _io = queues.cq.io.lock().unwrap_or_else(PoisonError::into_inner);
            queues.cq.ring.pop_frame(bus)
        })?;
        let Some((frame, cb)) = popped else {
            return Ok(None);
        };
        let ch = self.shared.channel(channel);
        ch.edges.lock().unwrap_or_else(PoisonError::into_inner).cq_state = cb.used() > 0;
        Ok(Some(frame))
    }

    fn dma_info(&self, device: usize) -> Result<DmaInfo> {
        self.with_queues(device, Channel::Compute, |q| {
            let dram = q.dir.region(region::OPS_HOST_MANAGED);
            Ok(DmaInfo {
                alignment_bits: self.config.dma_alignment_bits,
                dram_base: dram.map_or(0, |r| r.dev_address),
                dram_size: dram.map_or(0, |r| r.bar_size),
                max_element_size: self.config.max_dma_element_size,
                max_element_count: self.config.max_dma_element_count,
            })
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn device_config(&self, device: usize) -> Result<DeviceConfig> {
        self.with_queues(device, Channel::Management, |q| {
            let g = &q.dir.generic;
            Ok(DeviceConfig {
                form_factor: if g.form_factor == dir::form_factor::M_2 {
                    FormFactor::M2
                } else {
                    FormFactor::Pcie
                },
                tdp_watts: g.device_tdp.min(u16::from(u8::MAX)) as u8,
                l3_mb: u32::from(g.l3_size),
                l2_mb: u32::from(g.l2_size),
                scratchpad_mb: u32::from(g.scp_size),
                cache_line_bytes: u32::from(g.cache_line_size),
                l2_banks: 4,
                ddr_bandwidth_mbps: 128_000,
                boot_freq_mhz: g.minion_boot_freq,
                // Compute shires are the low 32 bits; bit 32 is the spare.
                #[allow(clippy::cast_possible_truncation)]
                shire_mask: g.minion_shires_mask as u32,
                spare_shire_id: 32,
                arch_revision: 0,
            })
        })
    }

    fn device_state(&self, device: usize, channel: Channel) -> Result<DeviceState> {
        Self::check_device(device)?;
        let ch = self.shared.channel(channel);
        let ready = ch.queues.read().unwrap_or_else(PoisonError::into_inner).is_some();
        Ok(if ready {
            DeviceState::Ready
        } else {
            DeviceState::ResetInProgress
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn trace_buffer_size(&self, device: usize) -> Result<usize> {
        self.with_queues(device, Channel::Management, |q| {
            Ok(q.dir.region(region::MGMT_TRACE).map_or(0, |r| r.bar_size as usize))
        })
    }

    fn update_firmware(&self, device: usize, image: &[u8]) -> Result<()> {
        let bus = &*self.shared.bus;
        self.with_queues(device, Channel::Management, |q| {
            let scratch = q
                .dir
                .region(region::MGMT_SCRATCH)
                .ok_or_else(|| EtError::invalid_state("no firmware staging region"))?;
            if image.len() as u64 > scratch.bar_size {
                return Err(EtError::invalid_argument(format!(
                    "firmware image of {} bytes exceeds staging area of {}",
                    image.len(),
                    scratch.bar_size
                )));
            }
            let addr = bar::bar_address(scratch.bar, scratch.bar_offset)
                .ok_or_else(|| EtError::protocol("staging region in unknown BAR"))?;
            bus.mmio_write(addr, image)?;
            info!("Staged {} byte firmware image at {addr:#x}", image.len());
            Ok(())
        })
    }

    fn reinitialize(&self, device: usize, timeout: Duration) -> Result<()> {
        Self::check_device(device)?;
        info!("Re-running bring-up after reset");
        let mut channels = vec![Channel::Management];
        if self.config.enable_compute {
            channels.push(Channel::Compute);
        }
        let deadline = Instant::now() + timeout;
        self.await_reset_notice(deadline.min(Instant::now() + RESET_NOTICE))?;
        for channel in &channels {
            let ch = self.shared.channel(*channel);
            *ch.queues.write().unwrap_or_else(PoisonError::into_inner) = None;
        }
        for channel in channels {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.bring_up_channel(channel, remaining)?;
        }
        Ok(())
    }
}

impl Drop for SysEmuTransport {
    fn drop(&mut self) {
        info!("Stopping emulated transport");
        self.shared.running.store(false, Ordering::Release);
        self.shared.bus.stop();
        if let Some(e) = self.shared.bus.last_error() {
            error!("Emulator reported: {e}");
        }
        self.shared.mgmt.wake.notify_all();
        self.shared.ops.wake.notify_all();
        if let Some(listener) = self.irq_listener.take() {
            if listener.join().is_err() {
                error!("Interrupt listener panicked");
            }
        }
        debug!("Emulated transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::software::{Reply, SimConfig, SoftDevice};
    use crate::protocol::{decode_message, encode_command, Message};
    use etsoc_chip::mgmt;

    fn fast() -> SysEmuConfig {
        SysEmuConfig {
            bringup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            ..SysEmuConfig::default()
        }
    }

    fn start(sim: SimConfig) -> (SoftDevice, Result<SysEmuTransport>) {
        let dev = SoftDevice::start(sim).unwrap();
        let transport = SysEmuTransport::start(Arc::new(dev.clone()), fast());
        (dev, transport)
    }

    fn wait_cq(t: &SysEmuTransport, channel: Channel) -> Bytes {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = t.poll_response(0, channel).unwrap() {
                return frame;
            }
            assert!(Instant::now() < deadline, "no completion");
            let _ = t.wait_for_readiness(0, channel, Duration::from_millis(20)).unwrap();
        }
    }

    #[test]
    fn brings_up_both_channels() {
        let (_dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        assert_eq!(t.sq_count(0, Channel::Management).unwrap(), 1);
        assert_eq!(t.sq_count(0, Channel::Compute).unwrap(), 2);
        assert_eq!(t.sq_capacity(0, Channel::Management).unwrap(), 0x800 - 24);
        assert_eq!(t.trace_buffer_size(0).unwrap(), 0x1_0000);
        assert_eq!(t.dma_info(0).unwrap().dram_base, 0x80_0000_0000);
        assert_eq!(t.device_state(0, Channel::Management).unwrap(), DeviceState::Ready);
        assert!(t.device_config(0).unwrap().active_shires() > 0);
        assert!(t.sq_count(1, Channel::Management).is_err());
    }

    #[test]
    fn checksum_mismatch_fails_bring_up() {
        let (_dev, t) = start(SimConfig {
            corrupt_checksum: true,
            ..SimConfig::default()
        });
        assert!(matches!(t, Err(EtError::ChecksumMismatch { .. })));
    }

    #[test]
    fn boot_error_fails_bring_up() {
        let (_dev, t) = start(SimConfig {
            boot_error: true,
            ..SimConfig::default()
        });
        assert!(matches!(t, Err(EtError::BringUp { .. })));
    }

    #[test]
    fn waits_for_delayed_boot() {
        let (_dev, t) = start(SimConfig {
            boot_delay: Duration::from_millis(50),
            ..SimConfig::default()
        });
        assert!(t.is_ok());
    }

    #[test]
    fn management_round_trip() {
        let (dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        dev.set_reply(mgmt::id::GET_MODULE_PART_NUMBER, Reply::with_payload(*b"ET1"));
        let cmd = encode_command(11, mgmt::id::GET_MODULE_PART_NUMBER, 0, &[]).unwrap();
        assert!(t.submit(0, Channel::Management, 0, &cmd).unwrap());

        let Message::Response(rsp) = decode_message(wait_cq(&t, Channel::Management), mgmt::is_event).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(rsp.tag(), 11);
        assert_eq!(&rsp.payload[..], b"ET1");
    }

    #[test]
    fn compute_echo_on_second_queue() {
        let (_dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        let cmd = encode_command(4, etsoc_chip::ops::ECHO_CMD, 0, &[1, 2, 3]).unwrap();
        assert!(t.submit(0, Channel::Compute, 1, &cmd).unwrap());
        let frame = wait_cq(&t, Channel::Compute);
        let Message::Response(rsp) = decode_message(frame, etsoc_chip::ops::is_event).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(rsp.header.common.msg_id, etsoc_chip::ops::ECHO_RSP);
        assert_eq!(&rsp.payload[..], &[1, 2, 3]);
        assert!(t.submit(0, Channel::Compute, 2, &cmd).is_err());
    }

    #[test]
    fn oversize_frame_is_refused_without_side_effects() {
        let (dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        let big = vec![0u8; 0x800];
        assert!(!t.submit(0, Channel::Management, 0, &big).unwrap());
        assert!(dev.received().is_empty());
    }

    #[test]
    fn readiness_reports_edges_once() {
        let (dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        // Bring-up arms one report of the initial writable state.
        let first = t.wait_for_readiness(0, Channel::Management, Duration::from_secs(1)).unwrap();
        assert!(first.sq_ready(0));
        let again = t.wait_for_readiness(0, Channel::Management, Duration::from_millis(30)).unwrap();
        assert!(!again.any());

        dev.inject_event(mgmt::EVENT_SP_TRACE_BUFFER_FULL, &[]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let r = t.wait_for_readiness(0, Channel::Management, Duration::from_millis(50)).unwrap();
            if r.cq_ready {
                break;
            }
            assert!(Instant::now() < deadline, "CQ edge never reported");
        }
        assert!(t.poll_response(0, Channel::Management).unwrap().is_some());
    }

    #[test]
    fn zero_size_completion_is_protocol_fault() {
        let (dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        let bogus = etsoc_chip::wire::CommonHeader {
            size: 0,
            tag_id: 1,
            msg_id: 3,
            flags: 0,
        };
        dev.inject_frame(Bytes::copy_from_slice(&bogus.encode()));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match t.poll_response(0, Channel::Management) {
                Err(EtError::Protocol { .. }) => break,
                Ok(None) => {
                    assert!(Instant::now() < deadline);
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(t.poll_response(0, Channel::Management).unwrap().is_none());
    }

    #[test]
    fn threshold_bounds() {
        let (_dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        assert!(t.set_sq_threshold(0, Channel::Compute, 0, 0).is_err());
        assert!(t.set_sq_threshold(0, Channel::Compute, 0, 0x1000).is_err());
        t.set_sq_threshold(0, Channel::Compute, 0, 64).unwrap();
    }

    #[test]
    fn firmware_image_lands_in_scratch() {
        let (dev, t) = start(SimConfig::default());
        let t = t.unwrap();
        t.update_firmware(0, b"fw-image").unwrap();
        assert_eq!(dev.scratch_contents(8).unwrap(), b"fw-image");
        let too_big = vec![0u8; 0x4_0001];
        assert!(matches!(
            t.update_firmware(0, &too_big),
            Err(EtError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn drop_stops_simulator() {
        let (dev, t) = start(SimConfig::default());
        drop(t.unwrap());
        assert!(dev.raise_device_interrupt(bar::IRQ_SP_SQ).is_err());
    }
}

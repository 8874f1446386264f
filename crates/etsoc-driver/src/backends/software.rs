//! In-process simulated device
//!
//! [`SoftDevice`] plays the firmware side of the emulated transport: it
//! owns the shared memory window, publishes both channel descriptors,
//! serves submission queues from a firmware thread and answers through the
//! completion queues with interrupts. It is the device behind
//! [`TransportSelection::SysEmu`](crate::TransportSelection::SysEmu) and
//! the fixture of the test suite, so its behaviour can be scripted per
//! message id (status, payload, latency, duplicates, interleaved events).
//!
//! ## Address map
//!
//! ```text
//! BAR2 + 0x0000  compute descriptor
//! BAR2 + 0x1000  management descriptor
//! BAR0 + ...     mgmt SQ | mgmt CQ, scratch, trace, ops SQs | ops CQ
//! ```
//!
//! Device DRAM appears in the compute descriptor's region table but is not
//! backed by host memory.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use etsoc_chip::bar;
use etsoc_chip::dir::{
    self, boot, form_factor, region, DeviceInterface, GenericAttr, MemRegion, VqAttr,
    GENERIC_ATTR_SIZE, MEM_REGION_SIZE, VQ_ATTR_SIZE,
};
use etsoc_chip::mgmt::{self, CommandClass};
use etsoc_chip::ring::CONTROL_BLOCK_SIZE;
use etsoc_chip::wire::{CommonHeader, STATUS_SUCCESS};
use tracing::{debug, error, info, trace, warn};

use crate::backends::sysemu::SimBus;
use crate::error::{EtError, Result};
use crate::mmio::{MemoryWindow, MmioAccess};
use crate::protocol::{encode_event, encode_response};
use crate::ring::RingBuffer;

const PAGE: u64 = 0x1000;

/// Simulated device configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Management SQ size in bytes, control block included
    pub mgmt_sq_size: u16,
    /// Management CQ size in bytes, control block included
    pub mgmt_cq_size: u16,
    /// Number of compute SQs
    pub ops_sq_count: u16,
    /// Compute SQ size in bytes, control block included
    pub ops_sq_size: u16,
    /// Compute CQ size in bytes, control block included
    pub ops_cq_size: u16,
    /// Firmware staging area
    pub scratch_size: u64,
    /// Management trace buffer
    pub trace_size: u64,
    /// Device address of host-managed DRAM
    pub dram_base: u64,
    /// Size of host-managed DRAM
    pub dram_size: u64,
    /// Time from start until the descriptors report ready
    pub boot_delay: Duration,
    /// Time the device stays down after `RESET_ETSOC`
    pub reset_delay: Duration,
    /// Default per-command processing time
    pub response_latency: Duration,
    /// Publish descriptors with a wrong CRC32
    pub corrupt_checksum: bool,
    /// Report a boot failure instead of becoming ready
    pub boot_error: bool,
    /// Minion shires present
    pub shire_mask: u64,
    /// Minion boot frequency in MHz
    pub boot_freq_mhz: u32,
    /// Thermal design power in watts
    pub tdp_watts: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mgmt_sq_size: 0x800,
            mgmt_cq_size: 0x800,
            ops_sq_count: 2,
            ops_sq_size: 0x1000,
            ops_cq_size: 0x1000,
            scratch_size: 0x4_0000,
            trace_size: 0x1_0000,
            dram_base: 0x80_0000_0000,
            dram_size: 0x4_0000_0000,
            boot_delay: Duration::ZERO,
            reset_delay: Duration::from_millis(20),
            response_latency: Duration::ZERO,
            corrupt_checksum: false,
            boot_error: false,
            shire_mask: 0x1_FFFF_FFFF,
            boot_freq_mhz: 1000,
            tdp_watts: 25,
        }
    }
}

/// Scripted reply to one management message id
#[derive(Debug, Clone, Default)]
pub struct Reply {
    /// Response status
    pub status: u32,
    /// Response payload; `None` for the default
    pub payload: Option<Vec<u8>>,
    /// Processing time; `None` for [`SimConfig::response_latency`]
    pub latency: Option<Duration>,
    /// Emit the response twice
    pub duplicate: bool,
    /// Emit this event (same tag) before the response
    pub event_before: Option<u16>,
    /// Never respond
    pub silent: bool,
}

impl Reply {
    /// Successful reply carrying `payload`
    #[must_use]
    pub fn with_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    /// Reply with a non-success status
    #[must_use]
    pub fn failing(status: u32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// A command the firmware swallows
    #[must_use]
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// Delay the reply
    #[must_use]
    pub const fn after(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueLayout {
    region_offset: u64,
    region_size: u64,
    sq_offset: u64,
    sq_size: u64,
    sq_count: u64,
    cq_offset: u64,
    cq_size: u64,
}

impl QueueLayout {
    fn new(region_offset: u64, sq_size: u16, sq_count: u16, cq_size: u16) -> Self {
        let sq_total = u64::from(sq_size) * u64::from(sq_count);
        let region_size = (sq_total + u64::from(cq_size)).next_multiple_of(PAGE);
        Self {
            region_offset,
            region_size,
            sq_offset: 0,
            sq_size: u64::from(sq_size),
            sq_count: u64::from(sq_count),
            cq_offset: sq_total,
            cq_size: u64::from(cq_size),
        }
    }

    fn base(&self) -> u64 {
        bar::BAR0_BASE + self.region_offset
    }

    fn sq(&self, i: u64) -> RingBuffer {
        RingBuffer::new(self.base() + self.sq_offset + i * self.sq_size)
    }

    fn cq(&self) -> RingBuffer {
        RingBuffer::new(self.base() + self.cq_offset)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn vq_attr(&self) -> VqAttr {
        VqAttr {
            attributes_size: VQ_ATTR_SIZE as u16,
            int_trg_size: 0,
            int_id: 0,
            int_trg_offset: 0,
            sq_offset: self.sq_offset as u32,
            sq_count: self.sq_count as u16,
            per_sq_size: self.sq_size as u16,
            cq_offset: self.cq_offset as u32,
            cq_count: 1,
            per_cq_size: self.cq_size as u16,
        }
    }

    fn vq_region(&self) -> MemRegion {
        bar0_region(region::VQ_BUFFER, self.region_offset, self.region_size)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn bar0_region(region_type: u8, offset: u64, size: u64) -> MemRegion {
    MemRegion {
        attributes_size: MEM_REGION_SIZE as u16,
        region_type,
        bar: 0,
        access_attr: 0,
        bar_offset: offset,
        bar_size: size,
        dev_address: 0,
    }
}

#[derive(Debug)]
struct Layout {
    mgmt: QueueLayout,
    ops: QueueLayout,
    scratch_offset: u64,
    trace_offset: u64,
    bar0_size: u64,
}

impl Layout {
    fn new(config: &SimConfig) -> Result<Self> {
        for (name, size) in [
            ("management SQ", config.mgmt_sq_size),
            ("management CQ", config.mgmt_cq_size),
            ("compute SQ", config.ops_sq_size),
            ("compute CQ", config.ops_cq_size),
        ] {
            if usize::from(size) <= CONTROL_BLOCK_SIZE + 1 {
                return Err(EtError::invalid_argument(format!(
                    "{name} of {size} bytes cannot hold a ring"
                )));
            }
        }
        if config.ops_sq_count == 0 || config.ops_sq_count > 64 {
            return Err(EtError::invalid_argument(format!(
                "{} compute SQs (1..=64 supported)",
                config.ops_sq_count
            )));
        }
        let mgmt = QueueLayout::new(0, config.mgmt_sq_size, 1, config.mgmt_cq_size);
        let scratch_offset = mgmt.region_size;
        let trace_offset = scratch_offset + config.scratch_size.next_multiple_of(PAGE);
        let ops_offset = trace_offset + config.trace_size.next_multiple_of(PAGE);
        let ops = QueueLayout::new(
            ops_offset,
            config.ops_sq_size,
            config.ops_sq_count,
            config.ops_cq_size,
        );
        Ok(Self {
            mgmt,
            ops,
            scratch_offset,
            trace_offset,
            bar0_size: ops_offset + ops.region_size,
        })
    }

    fn rings(&self) -> impl Iterator<Item = (RingBuffer, u64)> + '_ {
        let sqs = |q: &QueueLayout| {
            let q = *q;
            (0..q.sq_count).map(move |i| (q.sq(i), q.sq_size))
        };
        sqs(&self.mgmt)
            .chain(std::iter::once((self.mgmt.cq(), self.mgmt.cq_size)))
            .chain(sqs(&self.ops))
            .chain(std::iter::once((self.ops.cq(), self.ops.cq_size)))
    }
}

#[derive(Debug)]
struct Inner {
    config: SimConfig,
    layout: Layout,
    window: MemoryWindow,
    running: AtomicBool,
    doorbell: Mutex<u32>,
    doorbell_cv: Condvar,
    host_irq: Mutex<u32>,
    host_cv: Condvar,
    script: Mutex<HashMap<u16, Reply>>,
    outbox: Mutex<VecDeque<Bytes>>,
    received: Mutex<Vec<CommonHeader>>,
    resets: AtomicUsize,
    last_error: Mutex<Option<String>>,
    firmware: Mutex<Option<JoinHandle<()>>>,
}

/// Simulated ET-SoC-1 behind a shared memory window
///
/// Cloning yields another handle to the same device.
#[derive(Debug, Clone)]
pub struct SoftDevice {
    inner: Arc<Inner>,
}

impl SoftDevice {
    /// Lay out the window, publish descriptors and start the firmware thread
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a layout that does not fit the
    /// descriptor fields, or an I/O error if the thread cannot be spawned.
    pub fn start(config: SimConfig) -> Result<Self> {
        let layout = Layout::new(&config)?;
        let mut window = MemoryWindow::new();
        window.add_region(bar::BAR2_BASE, usize_of(2 * bar::DIR_REGION_SIZE)?)?;
        window.add_region(bar::BAR0_BASE, usize_of(layout.bar0_size)?)?;

        let inner = Arc::new(Inner {
            config,
            layout,
            window,
            running: AtomicBool::new(true),
            doorbell: Mutex::new(0),
            doorbell_cv: Condvar::new(),
            host_irq: Mutex::new(0),
            host_cv: Condvar::new(),
            script: Mutex::new(HashMap::new()),
            outbox: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            firmware: Mutex::new(None),
        });

        inner.init_rings()?;
        let booting = inner.config.boot_error || !inner.config.boot_delay.is_zero();
        inner.publish(!booting)?;
        info!(
            "Simulated device up: {} byte BAR0, {} compute SQ(s)",
            inner.layout.bar0_size, inner.config.ops_sq_count
        );

        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("etsoc-sim-fw".into())
            .spawn(move || firmware_loop(&weak))?;
        *lock(&inner.firmware) = Some(handle);

        Ok(Self { inner })
    }

    /// Script the reply to a management message id
    pub fn set_reply(&self, msg_id: u16, reply: Reply) {
        lock(&self.inner.script).insert(msg_id, reply);
    }

    /// Queue an unsolicited management event
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the payload does not fit a frame.
    pub fn inject_event(&self, msg_id: u16, payload: &[u8]) -> Result<()> {
        self.inject_frame(encode_event(0, msg_id, 0, payload)?);
        Ok(())
    }

    /// Queue a management response nobody asked for
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the payload does not fit a frame.
    pub fn inject_response(&self, tag_id: u16, msg_id: u16, status: u32, payload: &[u8]) -> Result<()> {
        self.inject_frame(encode_response(tag_id, msg_id, status, 0, payload)?);
        Ok(())
    }

    /// Queue raw bytes for the management CQ, well-formed or not
    pub fn inject_frame(&self, frame: Bytes) {
        lock(&self.inner.outbox).push_back(frame);
        self.inner.ring_doorbell(0);
    }

    /// Headers of every management command the firmware consumed
    #[must_use]
    pub fn received(&self) -> Vec<CommonHeader> {
        lock(&self.inner.received).clone()
    }

    /// Completed `RESET_ETSOC` cycles
    #[must_use]
    pub fn reset_count(&self) -> usize {
        self.inner.resets.load(Ordering::Acquire)
    }

    /// First `len` bytes of the firmware staging area
    ///
    /// # Errors
    ///
    /// Returns error if `len` exceeds the staging area.
    pub fn scratch_contents(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .window
            .mmio_read(bar::BAR0_BASE + self.inner.layout.scratch_offset, &mut buf)?;
        Ok(buf)
    }
}

impl MmioAccess for SoftDevice {
    fn mmio_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.window.mmio_read(addr, buf)
    }

    fn mmio_write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.inner.window.mmio_write(addr, data)
    }
}

impl SimBus for SoftDevice {
    fn raise_device_interrupt(&self, bits: u32) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(EtError::invalid_state("simulated device stopped"));
        }
        self.inner.ring_doorbell(bits);
        Ok(())
    }

    fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> Result<u32> {
        let inner = &*self.inner;
        let pending = lock(&inner.host_irq);
        let (mut pending, _) = inner
            .host_cv
            .wait_timeout_while(pending, timeout, |p| {
                *p & mask == 0 && inner.running.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        if !inner.running.load(Ordering::Acquire) {
            return Err(EtError::invalid_state("simulated device stopped"));
        }
        let bits = *pending & mask;
        *pending &= !bits;
        Ok(bits)
    }

    fn stop(&self) {
        let inner = &*self.inner;
        if inner.running.swap(false, Ordering::AcqRel) {
            debug!("Stopping simulated device");
        }
        inner.doorbell_cv.notify_all();
        inner.host_cv.notify_all();
        let handle = lock(&inner.firmware).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Firmware thread panicked");
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }
}

impl Inner {
    fn ring_doorbell(&self, bits: u32) {
        *lock(&self.doorbell) |= bits;
        self.doorbell_cv.notify_all();
    }

    fn raise_host(&self, bits: u32) {
        *lock(&self.host_irq) |= bits;
        self.host_cv.notify_all();
    }

    fn init_rings(&self) -> Result<()> {
        for (ring, size) in self.layout.rings() {
            ring.init(&self.window, size - CONTROL_BLOCK_SIZE as u64)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn descriptor(&self, regions: Vec<MemRegion>, vq: VqAttr, ready: i16) -> DeviceInterface {
        let c = &self.config;
        DeviceInterface {
            generic: GenericAttr {
                attributes_size: GENERIC_ATTR_SIZE as u16,
                version: dir::DIR_VERSION,
                total_size: DeviceInterface::wire_size(regions.len()) as u16,
                num_mem_regions: regions.len() as u16,
                minion_shires_mask: c.shire_mask,
                minion_boot_freq: c.boot_freq_mhz,
                crc32: 0,
                status: ready,
                form_factor: form_factor::PCIE,
                device_tdp: c.tdp_watts,
                l3_size: 16,
                l2_size: 8,
                scp_size: 4,
                cache_line_size: 64,
            },
            vq,
            regions,
        }
    }

    /// Write both descriptors. The status field goes last so a reader that
    /// sees "ready" also sees a complete body.
    fn publish(&self, ready: bool) -> Result<()> {
        let l = &self.layout;
        let mgmt = self.descriptor(
            vec![
                l.mgmt.vq_region(),
                bar0_region(region::MGMT_SCRATCH, l.scratch_offset, self.config.scratch_size),
                bar0_region(region::MGMT_TRACE, l.trace_offset, self.config.trace_size),
            ],
            l.mgmt.vq_attr(),
            boot::SP_DEV_READY,
        );
        let mut dram = bar0_region(region::OPS_HOST_MANAGED, 0, self.config.dram_size);
        dram.dev_address = self.config.dram_base;
        let ops = self.descriptor(vec![l.ops.vq_region(), dram], l.ops.vq_attr(), boot::MM_READY);

        for (addr, desc) in [
            (bar::BAR2_BASE + bar::SP_DIR_OFFSET, mgmt),
            (bar::BAR2_BASE + bar::MM_DIR_OFFSET, ops),
        ] {
            let final_status = match (ready, self.config.boot_error) {
                (true, _) => desc.generic.status,
                (false, true) => boot::BOOT_ERROR,
                (false, false) => boot::DEV_NOT_READY,
            };
            let mut raw = desc.encode();
            let crc = dir::checksum_span(&raw).map_or(0, crc32fast::hash);
            let crc = if self.config.corrupt_checksum {
                crc ^ 0xFFFF_FFFF
            } else {
                crc
            };
            dir::patch_crc32(&mut raw, crc);
            let status_at = usize_of(dir::STATUS_OFFSET)?;
            raw[status_at..status_at + 2].copy_from_slice(&boot::DEV_NOT_READY.to_le_bytes());
            self.window.mmio_write(addr, &raw)?;
            self.set_status(addr, final_status)?;
        }
        Ok(())
    }

    fn set_status(&self, dir_addr: u64, status: i16) -> Result<()> {
        self.window
            .mmio_write(dir_addr + dir::STATUS_OFFSET, &status.to_le_bytes())
    }

    fn reset(&self) -> Result<()> {
        info!("RESET_ETSOC: device going down");
        for addr in [
            bar::BAR2_BASE + bar::SP_DIR_OFFSET,
            bar::BAR2_BASE + bar::MM_DIR_OFFSET,
        ] {
            self.set_status(addr, boot::DEV_NOT_READY)?;
        }
        thread::sleep(self.config.reset_delay);
        self.init_rings()?;
        *lock(&self.host_irq) = 0;
        self.resets.fetch_add(1, Ordering::AcqRel);
        self.publish(true)?;
        info!("RESET_ETSOC: device back up");
        Ok(())
    }

    fn push_cq(&self, ring: &RingBuffer, frame: &[u8], irq: u32) -> Result<()> {
        loop {
            if ring.push(&self.window, frame)?.is_some() {
                self.raise_host(irq);
                return Ok(());
            }
            if !self.running.load(Ordering::Acquire) {
                return Err(EtError::invalid_state("stopped with a full completion queue"));
            }
            trace!("CQ full, holding {} byte frame", frame.len());
            self.raise_host(irq);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn default_payload(msg_id: u16) -> Vec<u8> {
        match mgmt::class(msg_id) {
            Some(CommandClass::Get) => u64::from(msg_id).to_le_bytes().to_vec(),
            _ => Vec::new(),
        }
    }

    fn serve_management(&self) -> Result<()> {
        let sq = self.layout.mgmt.sq(0);
        let cq = self.layout.mgmt.cq();
        loop {
            // Injected frames were queued before anything popped below.
            self.flush_outbox()?;
            let Some((frame, _)) = sq.pop_command(&self.window)? else {
                break;
            };
            self.raise_host(bar::IRQ_SP_SQ);
            let header = CommonHeader::decode(&frame)
                .ok_or_else(|| EtError::protocol("short command header"))?;
            trace!("mgmt command {} tag {}", header.msg_id, header.tag_id);
            lock(&self.received).push(header);

            if mgmt::is_device_reset(header.msg_id) {
                return self.reset();
            }

            let reply = lock(&self.script)
                .get(&header.msg_id)
                .cloned()
                .unwrap_or_default();
            if reply.silent {
                debug!("Swallowing command {} (tag {})", header.msg_id, header.tag_id);
                continue;
            }
            let latency = reply.latency.unwrap_or(self.config.response_latency);
            if !self.pause(latency) {
                return Ok(());
            }

            if let Some(event) = reply.event_before {
                let frame = encode_event(header.tag_id, event, 0, &[])?;
                self.push_cq(&cq, &frame, bar::IRQ_SP_CQ)?;
            }
            let payload = reply
                .payload
                .unwrap_or_else(|| Self::default_payload(header.msg_id));
            let latency_usec = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
            let response =
                encode_response(header.tag_id, header.msg_id, reply.status, latency_usec, &payload)?;
            self.push_cq(&cq, &response, bar::IRQ_SP_CQ)?;
            if reply.duplicate {
                self.push_cq(&cq, &response, bar::IRQ_SP_CQ)?;
            }
        }
        Ok(())
    }

    fn serve_compute(&self) -> Result<()> {
        let cq = self.layout.ops.cq();
        for i in 0..self.layout.ops.sq_count {
            let sq = self.layout.ops.sq(i);
            let mut drained = false;
            while let Some((frame, _)) = sq.pop_command(&self.window)? {
                drained = true;
                let header = CommonHeader::decode(&frame)
                    .ok_or_else(|| EtError::protocol("short command header"))?;
                trace!("ops command {} tag {} on SQ {i}", header.msg_id, header.tag_id);
                let body = frame.slice(etsoc_chip::wire::COMMON_HEADER_SIZE..);
                let response = encode_response(
                    header.tag_id,
                    header.msg_id.wrapping_add(1),
                    STATUS_SUCCESS,
                    0,
                    &body,
                )?;
                self.push_cq(&cq, &response, bar::IRQ_MM_CQ)?;
            }
            if drained {
                self.raise_host(bar::IRQ_MM_SQ);
            }
        }
        Ok(())
    }

    fn flush_outbox(&self) -> Result<()> {
        let cq = self.layout.mgmt.cq();
        loop {
            let Some(frame) = lock(&self.outbox).pop_front() else {
                return Ok(());
            };
            self.push_cq(&cq, &frame, bar::IRQ_SP_CQ)?;
        }
    }

    fn step(&self) -> Result<()> {
        self.flush_outbox()?;
        self.serve_management()?;
        self.serve_compute()
    }

    /// Sleep unless stopped first; `false` if stopped.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut bell = lock(&self.doorbell);
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            bell = self
                .doorbell_cv
                .wait_timeout(bell, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }

    fn wait_doorbell(&self, timeout: Duration) -> u32 {
        let bell = lock(&self.doorbell);
        let (mut bell, _) = self
            .doorbell_cv
            .wait_timeout_while(bell, timeout, |b| {
                *b == 0 && self.running.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *bell)
    }
}

fn firmware_loop(weak: &Weak<Inner>) {
    if let Some(inner) = weak.upgrade() {
        if inner.config.boot_error || !inner.config.boot_delay.is_zero() {
            if !inner.pause(inner.config.boot_delay) {
                debug!("Stopped while booting");
                return;
            }
            if inner.config.boot_error {
                warn!("Simulated boot failure");
            } else if let Err(e) = inner.publish(true) {
                error!("Simulated boot failed: {e}");
            }
        }
    }

    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        let bits = inner.wait_doorbell(Duration::from_millis(10));
        if bits != 0 {
            trace!("doorbell {bits:#x}");
        }
        if let Err(e) = inner.step() {
            if inner.running.load(Ordering::Acquire) {
                error!("Simulated firmware fault: {e}");
                *lock(&inner.last_error) = Some(e.to_string());
                inner.running.store(false, Ordering::Release);
                inner.host_cv.notify_all();
            }
            break;
        }
    }
    debug!("Firmware thread exited");
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn usize_of(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| EtError::invalid_argument(format!("{v:#x} exceeds address width")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_message, encode_command, Message};

    fn mgmt_dir(dev: &SoftDevice) -> DeviceInterface {
        let mut raw = vec![0u8; usize::try_from(bar::DIR_REGION_SIZE).unwrap()];
        dev.mmio_read(bar::BAR2_BASE + bar::SP_DIR_OFFSET, &mut raw).unwrap();
        DeviceInterface::decode(&raw).unwrap()
    }

    #[test]
    fn publishes_valid_descriptors() {
        let dev = SoftDevice::start(SimConfig::default()).unwrap();
        for off in [bar::SP_DIR_OFFSET, bar::MM_DIR_OFFSET] {
            let mut raw = vec![0u8; 0x200];
            dev.mmio_read(bar::BAR2_BASE + off, &mut raw).unwrap();
            let dir = DeviceInterface::decode(&raw).unwrap();
            let span = dir::checksum_span(&raw).unwrap();
            assert_eq!(crc32fast::hash(span), dir.generic.crc32);
            assert!(dir.generic.status > 0);
        }
        assert_eq!(mgmt_dir(&dev).vq.sq_count, 1);
        dev.stop();
    }

    #[test]
    fn corrupt_checksum_is_published() {
        let dev = SoftDevice::start(SimConfig {
            corrupt_checksum: true,
            ..SimConfig::default()
        })
        .unwrap();
        let mut raw = vec![0u8; 0x200];
        dev.mmio_read(bar::BAR2_BASE + bar::SP_DIR_OFFSET, &mut raw).unwrap();
        let dir = DeviceInterface::decode(&raw).unwrap();
        assert_ne!(crc32fast::hash(dir::checksum_span(&raw).unwrap()), dir.generic.crc32);
        dev.stop();
    }

    #[test]
    fn answers_management_command() {
        let dev = SoftDevice::start(SimConfig::default()).unwrap();
        dev.set_reply(mgmt::id::GET_MODULE_SERIAL_NUMBER, Reply::with_payload(*b"SN-0001"));
        let layout = &dev.inner.layout.mgmt;
        let cmd = encode_command(3, mgmt::id::GET_MODULE_SERIAL_NUMBER, 0, &[]).unwrap();
        layout.sq(0).push(&dev, &cmd).unwrap().unwrap();
        dev.raise_device_interrupt(bar::IRQ_SP_SQ).unwrap();

        let bits = dev
            .wait_for_interrupt(bar::IRQ_SP_CQ, Duration::from_secs(5))
            .unwrap();
        assert_ne!(bits & bar::IRQ_SP_CQ, 0);
        let (frame, _) = layout.cq().pop_frame(&dev).unwrap().unwrap();
        let Message::Response(rsp) = decode_message(frame, mgmt::is_event).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(rsp.tag(), 3);
        assert_eq!(&rsp.payload[..], b"SN-0001");
        assert_eq!(dev.received().len(), 1);
        dev.stop();
    }

    #[test]
    fn stop_fails_pending_waits() {
        let dev = SoftDevice::start(SimConfig::default()).unwrap();
        dev.stop();
        assert!(dev.wait_for_interrupt(bar::IRQ_SP_CQ, Duration::from_millis(10)).is_err());
        assert!(dev.raise_device_interrupt(bar::IRQ_SP_SQ).is_err());
    }

    #[test]
    fn rejects_tiny_queues() {
        let err = SoftDevice::start(SimConfig {
            mgmt_sq_size: 16,
            ..SimConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, EtError::InvalidArgument { .. }));
    }
}

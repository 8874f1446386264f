//! Request/response correlation for one device
//!
//! A [`DeviceInstance`] owns the management channel of one device: it hands
//! out tags, registers a one-shot slot per outstanding command and runs a
//! receiver thread that drains the completion queue. Responses are routed to
//! their slot by tag; events (decided by message id, never by tag) go to a
//! bounded queue that drops its oldest entry when full.
//!
//! ```text
//! caller ── issue(tag T) ──► pending[T] ──► submit ──► SQ
//!                                 ▲
//! receiver ◄── poll_response ◄── CQ
//!    ├─ response T ──► pending.remove(T).send()
//!    └─ event      ──► events (drop-oldest)
//! ```
//!
//! A caller that stops waiting frees its slot; a response arriving later
//! for that tag is logged as stray and dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use etsoc_chip::mgmt;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{EtError, Result};
use crate::protocol::{decode_message, encode_command, Event, Message, Response};
use crate::transport::{Channel, QueueTransport};

const CHANNEL: Channel = Channel::Management;

/// Malformed completions tolerated in one drain pass before the receiver
/// goes back to waiting.
const MAX_MALFORMED_PER_DRAIN: usize = 16;

/// Device instance configuration
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Events kept before the oldest is dropped
    pub event_capacity: usize,
    /// Receiver wait slice; also the submit retry slice
    pub readiness_timeout: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            readiness_timeout: Duration::from_millis(50),
        }
    }
}

/// One registered caller; `serial` tells a reused tag from the slot that
/// held it before.
#[derive(Debug)]
struct Slot {
    serial: u64,
    tx: SyncSender<Response>,
}

#[derive(Debug)]
struct Shared {
    device: usize,
    transport: Arc<dyn QueueTransport>,
    config: InstanceConfig,
    pending: Mutex<HashMap<u16, Slot>>,
    events: Mutex<VecDeque<Event>>,
    drain: Mutex<()>,
    stop: AtomicBool,
}

impl Shared {
    fn dispatch(&self, frame: Bytes) {
        match decode_message(frame, mgmt::is_event) {
            Ok(Message::Event(event)) => {
                debug!("Device {}: event {}", self.device, event.msg_id());
                let mut events = self.events.lock();
                if events.len() >= self.config.event_capacity {
                    if let Some(old) = events.pop_front() {
                        warn!(
                            "Device {}: event queue full, dropping event {}",
                            self.device,
                            old.msg_id()
                        );
                    }
                }
                events.push_back(event);
            }
            Ok(Message::Response(rsp)) => {
                let tag = rsp.tag();
                let slot = self.pending.lock().remove(&tag);
                match slot {
                    Some(slot) => {
                        if slot.tx.send(rsp).is_err() {
                            debug!("Device {}: response for tag {tag} arrived after caller gave up", self.device);
                        }
                    }
                    None => warn!(
                        "Device {}: stray response (tag {tag}, msg {})",
                        self.device, rsp.header.common.msg_id
                    ),
                }
            }
            Err(e) => warn!("Device {}: dropping undecodable completion: {e}", self.device),
        }
    }

    /// Pop every queued completion.
    fn drain(&self) {
        let _drain = self.drain.lock();
        let mut malformed = 0;
        while !self.stop.load(Ordering::Acquire) {
            match self.transport.poll_response(self.device, CHANNEL) {
                Ok(Some(frame)) => {
                    malformed = 0;
                    self.dispatch(frame);
                }
                Ok(None) => return,
                Err(e @ EtError::Protocol { .. }) => {
                    warn!("Device {}: malformed completion dropped: {e}", self.device);
                    malformed += 1;
                    if malformed >= MAX_MALFORMED_PER_DRAIN {
                        warn!(
                            "Device {}: {malformed} malformed completions in a row, pausing drain",
                            self.device
                        );
                        return;
                    }
                }
                Err(e) => {
                    error!("Device {}: completion queue read failed: {e}", self.device);
                    thread::sleep(self.config.readiness_timeout);
                    return;
                }
            }
        }
    }

    fn receive_loop(&self) {
        debug!("Device {}: receiver started", self.device);
        while !self.stop.load(Ordering::Acquire) {
            self.drain();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match self
                .transport
                .wait_for_readiness(self.device, CHANNEL, self.config.readiness_timeout)
            {
                Ok(_) | Err(EtError::Interrupted) => {}
                Err(e) => {
                    error!("Device {}: readiness wait failed: {e}", self.device);
                    thread::sleep(self.config.readiness_timeout);
                }
            }
        }
        debug!("Device {}: receiver stopped", self.device);
    }
}

/// Outstanding command awaiting its response
///
/// Dropping it, or a [`wait`](Self::wait) that times out, releases the tag.
#[derive(Debug)]
pub struct PendingResponse {
    tag: u16,
    serial: u64,
    rx: Receiver<Response>,
    shared: Weak<Shared>,
}

impl PendingResponse {
    /// Tag the command was sent with
    #[must_use]
    pub const fn tag(&self) -> u16 {
        self.tag
    }

    /// Wait for the response until `deadline`
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the deadline passes, `InvalidState` if the
    /// instance was shut down first.
    pub fn wait(self, deadline: Instant) -> Result<Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(rsp) => Ok(rsp),
            Err(RecvTimeoutError::Timeout) => {
                debug!("Tag {} abandoned after {remaining:?}", self.tag);
                Err(EtError::timeout(remaining))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(EtError::invalid_state("device instance shut down"))
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut pending = shared.pending.lock();
        if pending.get(&self.tag).is_some_and(|slot| slot.serial == self.serial) {
            pending.remove(&self.tag);
        }
    }
}

/// Correlation state of one device's management channel
#[derive(Debug)]
pub struct DeviceInstance {
    shared: Arc<Shared>,
    next_tag: AtomicU16,
    next_serial: AtomicU64,
    submit_lock: Mutex<()>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceInstance {
    /// Create the instance and start its receiver thread
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndex` for an unknown device, or an I/O error if the
    /// thread cannot be spawned.
    pub fn new(transport: Arc<dyn QueueTransport>, device: usize, config: InstanceConfig) -> Result<Self> {
        let count = transport.device_count();
        if device >= count {
            return Err(EtError::InvalidIndex {
                index: device,
                count,
            });
        }
        let shared = Arc::new(Shared {
            device,
            transport,
            config,
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            drain: Mutex::new(()),
            stop: AtomicBool::new(false),
        });
        let rx_shared = Arc::clone(&shared);
        let receiver = thread::Builder::new()
            .name(format!("etsoc-rx-{device}"))
            .spawn(move || rx_shared.receive_loop())?;
        info!("Device {device}: instance active");
        Ok(Self {
            shared,
            next_tag: AtomicU16::new(0),
            next_serial: AtomicU64::new(0),
            submit_lock: Mutex::new(()),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Device index
    #[must_use]
    pub fn device(&self) -> usize {
        self.shared.device
    }

    /// Transport this instance drives
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.shared.transport
    }

    /// `false` once [`shutdown`](Self::shutdown) has started
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.shared.stop.load(Ordering::Acquire)
    }

    /// Take the per-device submission lock
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another caller holds it past `deadline`.
    pub fn lock_submission(&self, deadline: Instant) -> Result<MutexGuard<'_, ()>> {
        self.submit_lock
            .try_lock_until(deadline)
            .ok_or(EtError::Busy {
                device: self.shared.device,
            })
    }

    /// Next tag not held by an outstanding slot; registers a slot if `rx` is
    /// wanted.
    fn allocate(&self, register: bool) -> Result<(u16, Option<(u64, Receiver<Response>)>)> {
        let mut pending = self.shared.pending.lock();
        for _ in 0..=u16::MAX {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if pending.contains_key(&tag) {
                continue;
            }
            if !register {
                return Ok((tag, None));
            }
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::sync_channel(1);
            pending.insert(tag, Slot { serial, tx });
            return Ok((tag, Some((serial, rx))));
        }
        Err(EtError::Busy {
            device: self.shared.device,
        })
    }

    fn submit_frame(&self, frame: &[u8], deadline: Instant) -> Result<()> {
        let shared = &*self.shared;
        if shared.stop.load(Ordering::Acquire) {
            return Err(EtError::invalid_state("device instance shut down"));
        }
        loop {
            if shared.transport.submit(shared.device, CHANNEL, 0, frame)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EtError::Busy {
                    device: shared.device,
                });
            }
            let slice = shared.config.readiness_timeout.min(deadline - now);
            match shared.transport.wait_for_readiness(shared.device, CHANNEL, slice) {
                Ok(_) | Err(EtError::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a command and register for its response
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the SQ stays full until `deadline`, or any
    /// transport error from the submit.
    pub fn issue(&self, msg_id: u16, flags: u16, payload: &[u8], deadline: Instant) -> Result<PendingResponse> {
        let (tag, slot) = self.allocate(true)?;
        let (serial, rx) = slot.ok_or_else(|| EtError::invalid_state("slot not registered"))?;
        // Built first so an early return below releases the slot.
        let pending = PendingResponse {
            tag,
            serial,
            rx,
            shared: Arc::downgrade(&self.shared),
        };
        let frame = encode_command(tag, msg_id, flags, payload)?;
        self.submit_frame(&frame, deadline)?;
        debug!("Device {}: sent msg {msg_id} tag {tag}", self.shared.device);
        Ok(pending)
    }

    /// Send a command nobody waits on
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the SQ stays full until `deadline`, or any
    /// transport error from the submit.
    pub fn submit_only(&self, msg_id: u16, flags: u16, payload: &[u8], deadline: Instant) -> Result<u16> {
        let (tag, _) = self.allocate(false)?;
        let frame = encode_command(tag, msg_id, flags, payload)?;
        self.submit_frame(&frame, deadline)?;
        debug!("Device {}: sent msg {msg_id} tag {tag} (no response expected)", self.shared.device);
        Ok(tag)
    }

    /// Oldest queued event
    #[must_use]
    pub fn next_event(&self) -> Option<Event> {
        self.shared.events.lock().pop_front()
    }

    /// Every queued event, oldest first
    #[must_use]
    pub fn drain_events(&self) -> Vec<Event> {
        self.shared.events.lock().drain(..).collect()
    }

    /// Callers still waiting for a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Stop the receiver and fail every outstanding slot
    pub fn shutdown(&self) {
        let handle = self.receiver.lock().take();
        let Some(handle) = handle else {
            return;
        };
        info!("Device {}: instance draining", self.shared.device);
        self.shared.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            error!("Device {}: receiver thread panicked", self.shared.device);
        }
        let abandoned = {
            let mut pending = self.shared.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if abandoned > 0 {
            debug!("Device {}: {abandoned} slot(s) abandoned", self.shared.device);
        }
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

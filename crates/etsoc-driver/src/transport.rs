//! Queue transport abstraction
//!
//! One interface over the kernel driver and the system emulator. Every
//! device has two independent command channels, each with its own
//! submission queue(s) and one completion queue.
//!
//! # Threading
//!
//! Implementations take `&self` and may be shared behind an `Arc`. At most
//! one thread may drive a given channel of a given device at a time; the
//! compute and management channels of one device may be driven from two
//! different threads concurrently. Serialising callers of the same channel
//! is the job of the layer above (see [`crate::DeviceInstance`]).

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Command channel of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Master minion: kernel launches, DMA, compute runtime traffic
    Compute,
    /// Service processor: device management requests and events
    Management,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Management => write!(f, "management"),
        }
    }
}

/// Readiness edges reported by [`QueueTransport::wait_for_readiness`].
///
/// Bits are set only for queues that became ready since the previous
/// report, never for queues that merely stayed ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Bit `i` set: submission queue `i` became writable
    pub sq_bitmap: u64,
    /// Completion queue became readable
    pub cq_ready: bool,
}

impl Readiness {
    /// No edge (timeout or interruption)
    pub const fn none() -> Self {
        Self {
            sq_bitmap: 0,
            cq_ready: false,
        }
    }

    /// Whether submission queue `index` became writable
    pub const fn sq_ready(&self, index: usize) -> bool {
        index < 64 && self.sq_bitmap & (1 << index) != 0
    }

    /// Whether anything fired
    pub const fn any(&self) -> bool {
        self.sq_bitmap != 0 || self.cq_ready
    }
}

/// DMA constraints and the host-managed DRAM window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaInfo {
    /// Required buffer alignment, in bits
    pub alignment_bits: u32,
    /// Device address of host-managed DRAM
    pub dram_base: u64,
    /// Size of host-managed DRAM in bytes
    pub dram_size: u64,
    /// Largest single DMA element in bytes
    pub max_element_size: u64,
    /// Most elements in one DMA list
    pub max_element_count: u32,
}

/// Board form factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormFactor {
    /// PCIe add-in card
    Pcie,
    /// M.2 module
    M2,
}

/// Static device configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DeviceConfig {
    pub form_factor: FormFactor,
    pub tdp_watts: u8,
    pub l3_mb: u32,
    pub l2_mb: u32,
    pub scratchpad_mb: u32,
    pub cache_line_bytes: u32,
    pub l2_banks: u32,
    pub ddr_bandwidth_mbps: u32,
    pub boot_freq_mhz: u32,
    pub shire_mask: u32,
    pub spare_shire_id: u8,
    pub arch_revision: u8,
}

impl DeviceConfig {
    /// Number of compute shires enabled in `shire_mask`
    pub const fn active_shires(&self) -> u32 {
        self.shire_mask.count_ones()
    }
}

/// Health of one channel as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Accepting commands
    Ready,
    /// Commands outstanding
    PendingCommands,
    /// Firmware stopped answering
    NotResponding,
    /// Reset in progress
    ResetInProgress,
}

/// Queue transport trait - unified interface for hardware and emulation
pub trait QueueTransport: Debug + Send + Sync {
    /// Transport type for debugging
    fn transport_type(&self) -> TransportType;

    /// Number of devices served by this transport
    fn device_count(&self) -> usize;

    /// Number of submission queues of a channel
    ///
    /// # Errors
    ///
    /// Returns error if the device index is out of range.
    fn sq_count(&self, device: usize, channel: Channel) -> Result<usize>;

    /// Usable bytes of one submission queue of a channel
    ///
    /// # Errors
    ///
    /// Returns error if the device index is out of range.
    fn sq_capacity(&self, device: usize, channel: Channel) -> Result<usize>;

    /// Non-blocking, all-or-nothing submission of one framed command
    ///
    /// Returns `Ok(false)` if the queue has no room for `frame`; nothing is
    /// written in that case.
    ///
    /// # Errors
    ///
    /// Returns error on a bad index or a transport fault.
    fn submit(&self, device: usize, channel: Channel, sq_index: usize, frame: &[u8]) -> Result<bool>;

    /// Free bytes a submission queue needs before it is reported writable
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `0 < bytes <= sq_capacity`.
    fn set_sq_threshold(&self, device: usize, channel: Channel, sq_index: usize, bytes: usize) -> Result<()>;

    /// Block up to `timeout` for readiness edges
    ///
    /// Returns [`Readiness::none`] on timeout.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if a signal cut the wait short, or a transport
    /// fault.
    fn wait_for_readiness(&self, device: usize, channel: Channel, timeout: Duration) -> Result<Readiness>;

    /// Non-blocking pop of one framed message from the completion queue
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for a malformed message (which is dropped) or a
    /// transport fault.
    fn poll_response(&self, device: usize, channel: Channel) -> Result<Option<Bytes>>;

    /// DMA constraints and DRAM window
    ///
    /// # Errors
    ///
    /// Returns error if the device index is out of range.
    fn dma_info(&self, device: usize) -> Result<DmaInfo>;

    /// Static configuration snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the device index is out of range or the query fails.
    fn device_config(&self, device: usize) -> Result<DeviceConfig>;

    /// Channel health
    ///
    /// # Errors
    ///
    /// Returns error if the device index is out of range or the query fails.
    fn device_state(&self, device: usize, channel: Channel) -> Result<DeviceState>;

    /// Size of the management trace buffer in bytes
    ///
    /// # Errors
    ///
    /// Returns error if the device index is out of range or the query fails.
    fn trace_buffer_size(&self, device: usize) -> Result<usize>;

    /// Stage a firmware image on the device
    ///
    /// # Errors
    ///
    /// Returns error if the transfer fails.
    fn update_firmware(&self, device: usize, image: &[u8]) -> Result<()>;

    /// Re-discover queues after a full device reset
    ///
    /// # Errors
    ///
    /// Returns error if the device does not come back before `timeout`.
    fn reinitialize(&self, device: usize, timeout: Duration) -> Result<()>;
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Kernel driver (`/dev/et*_{mgmt,ops}`)
    Pcie,
    /// System emulator shared-memory window
    SysEmu,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pcie => write!(f, "PCIe"),
            Self::SysEmu => write!(f, "SysEmu"),
        }
    }
}

/// Transport selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSelection {
    /// Hardware if any device node exists, otherwise the in-process emulator
    Auto,
    /// Force the kernel driver
    Pcie,
    /// Force the emulator with an in-process simulated device
    SysEmu,
}

/// Select a transport based on availability
///
/// # Errors
///
/// Returns error if the requested transport cannot be brought up.
pub fn select_transport(selection: TransportSelection) -> Result<Arc<dyn QueueTransport>> {
    use crate::backends::pcie::PcieTransport;
    use crate::backends::software::{SimConfig, SoftDevice};
    use crate::backends::sysemu::{SysEmuConfig, SysEmuTransport};

    let sysemu = || -> Result<Arc<dyn QueueTransport>> {
        let device = SoftDevice::start(SimConfig::default())?;
        let transport = SysEmuTransport::start(Arc::new(device), SysEmuConfig::default())?;
        Ok(Arc::new(transport))
    };

    match selection {
        TransportSelection::Auto => match PcieTransport::open() {
            Ok(transport) => {
                tracing::info!("Using PCIe transport ({} devices)", transport.device_count());
                Ok(Arc::new(transport))
            }
            Err(e) => {
                tracing::info!("PCIe transport unavailable ({e}), using emulator");
                sysemu()
            }
        },
        TransportSelection::Pcie => Ok(Arc::new(PcieTransport::open()?)),
        TransportSelection::SysEmu => sysemu(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_bits() {
        let r = Readiness {
            sq_bitmap: 0b101,
            cq_ready: false,
        };
        assert!(r.sq_ready(0));
        assert!(!r.sq_ready(1));
        assert!(r.sq_ready(2));
        assert!(!r.sq_ready(64));
        assert!(r.any());
        assert!(!Readiness::none().any());
    }

    #[test]
    fn active_shires_counts_mask_bits() {
        let cfg = DeviceConfig {
            form_factor: FormFactor::Pcie,
            tdp_watts: 25,
            l3_mb: 32,
            l2_mb: 16,
            scratchpad_mb: 80,
            cache_line_bytes: 64,
            l2_banks: 4,
            ddr_bandwidth_mbps: 128_000,
            boot_freq_mhz: 1000,
            shire_mask: 0x0000_00FF,
            spare_shire_id: 32,
            arch_revision: 0,
        };
        assert_eq!(cfg.active_shires(), 8);
    }
}

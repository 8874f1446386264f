//! Kernel driver transport
//!
//! Every queue operation is a control transfer on the device node: the
//! driver owns the rings, the host only pushes and pops whole messages.
//! Readiness comes from the node's edge-triggered epoll.
// ioctl argument structs mirror the driver ABI widths
#![allow(clippy::cast_possible_truncation)]

use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use etsoc_chip::{ops, pcie};
use parking_lot::RwLock;
use etsoc_chip::wire::{CommonHeader, COMMON_HEADER_SIZE};

use crate::device::{ioc, DeviceNode};
use crate::discovery::{DeviceInfo, DeviceManager};
use crate::error::{EtError, Result};
use crate::transport::{
    Channel, DeviceConfig, DeviceState, DmaInfo, FormFactor, QueueTransport, Readiness,
    TransportType,
};

/// Driver ioctl ABI
mod abi {
    use std::os::raw::c_ulong;

    use bytemuck::{Pod, Zeroable};

    use crate::device::ioc::{ior, iow};

    pub const MAGIC: u8 = 0xE7;

    /// Host-managed DRAM window of the compute channel
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
    pub struct DramInfo {
        pub base: u64,
        pub size: u64,
        pub dma_max_elem_size: u32,
        pub dma_max_elem_count: u16,
        pub align_in_bits: u16,
    }

    /// `PUSH_SQ` argument; `cmd` is a user address
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
    pub struct CmdDesc {
        pub size: u16,
        pub sq_index: u16,
        pub flags: u32,
        pub cmd: u64,
    }

    /// `CmdDesc::flags`: the command carries a DMA list
    pub const CMD_DESC_FLAG_DMA: u32 = 1 << 0;

    /// `POP_CQ` argument; `rsp` is a user address
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
    pub struct RspDesc {
        pub size: u16,
        pub cq_index: u16,
        pub reserved: u32,
        pub rsp: u64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
    pub struct SqThreshold {
        pub bytes_needed: u16,
        pub sq_index: u16,
    }

    /// `FW_UPDATE` argument; `ubuf` is a user address
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
    pub struct FwUpdateDesc {
        pub ubuf: u64,
        pub size: u64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
    pub struct DevConfig {
        pub form_factor: u8,
        pub tdp: u8,
        pub spare_shire_id: u8,
        pub arch_revision: u8,
        pub l3_mb: u32,
        pub l2_mb: u32,
        pub scp_mb: u32,
        pub cache_line_bytes: u32,
        pub l2_banks: u32,
        pub ddr_bandwidth_mbps: u32,
        pub boot_freq_mhz: u32,
        pub shire_mask: u32,
    }

    pub const GET_USER_DRAM_INFO: c_ulong = ior::<DramInfo>(MAGIC, 1);
    pub const GET_SQ_COUNT: c_ulong = ior::<u16>(MAGIC, 2);
    pub const GET_SQ_MAX_MSG_SIZE: c_ulong = ior::<u16>(MAGIC, 3);
    pub const GET_DEVICE_MGMT_TRACE_BUFFER_SIZE: c_ulong = ior::<u32>(MAGIC, 4);
    pub const PUSH_SQ: c_ulong = iow::<CmdDesc>(MAGIC, 5);
    pub const POP_CQ: c_ulong = iow::<RspDesc>(MAGIC, 6);
    pub const GET_SQ_AVAIL_BITMAP: c_ulong = ior::<u64>(MAGIC, 7);
    pub const SET_SQ_THRESHOLD: c_ulong = iow::<SqThreshold>(MAGIC, 8);
    pub const GET_DEVICE_STATE: c_ulong = ior::<u32>(MAGIC, 9);
    pub const GET_DEVICE_CONFIGURATION: c_ulong = ior::<DevConfig>(MAGIC, 10);
    pub const FW_UPDATE: c_ulong = iow::<FwUpdateDesc>(MAGIC, 11);

    pub const DEV_STATE_READY: u32 = 0;
    pub const DEV_STATE_PENDING_COMMANDS: u32 = 1;
    pub const DEV_STATE_NOT_RESPONDING: u32 = 2;
}

#[derive(Debug)]
struct PcieDevice {
    info: DeviceInfo,
    mgmt: DeviceNode,
    ops: DeviceNode,
    mgmt_max_msg: u16,
    ops_max_msg: u16,
    ops_sq_count: u16,
    dram: abi::DramInfo,
    trace_size: u32,
}

/// Read a plain value the driver fills in.
fn query<T: bytemuck::Pod>(node: &DeviceNode, request: std::os::raw::c_ulong) -> Result<T> {
    let mut value = T::zeroed();
    // SAFETY: the argument carries no user addresses.
    let rc = unsafe { node.ioctl(request, &mut value)? };
    rc.map(|_| value).ok_or_else(|| {
        EtError::transport_fault(format!("{} busy answering query", node.path().display()))
    })
}

impl PcieDevice {
    fn open(info: DeviceInfo) -> Result<Self> {
        let mgmt = DeviceNode::open(&info.mgmt_path)?;
        let ops = DeviceNode::open(&info.ops_path)?;

        let mgmt_max_msg: u16 = query(&mgmt, abi::GET_SQ_MAX_MSG_SIZE)?;
        let trace_size: u32 = query(&mgmt, abi::GET_DEVICE_MGMT_TRACE_BUFFER_SIZE)?;
        let dram: abi::DramInfo = query(&ops, abi::GET_USER_DRAM_INFO)?;
        let ops_sq_count: u16 = query(&ops, abi::GET_SQ_COUNT)?;
        let ops_max_msg: u16 = query(&ops, abi::GET_SQ_MAX_MSG_SIZE)?;

        tracing::info!(
            "Device {}: DRAM {:#x}+{:#x} ({} bit alignment), {} compute SQ(s), max message {}/{} bytes",
            info.index,
            dram.base,
            dram.size,
            dram.align_in_bits,
            ops_sq_count,
            mgmt_max_msg,
            ops_max_msg
        );

        Ok(Self {
            info,
            mgmt,
            ops,
            mgmt_max_msg,
            ops_max_msg,
            ops_sq_count,
            dram,
            trace_size,
        })
    }

    const fn node(&self, channel: Channel) -> &DeviceNode {
        match channel {
            Channel::Management => &self.mgmt,
            Channel::Compute => &self.ops,
        }
    }

    const fn max_msg(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Management => self.mgmt_max_msg,
            Channel::Compute => self.ops_max_msg,
        }
    }

    fn state(&self, channel: Channel) -> Result<DeviceState> {
        let raw: u32 = query(self.node(channel), abi::GET_DEVICE_STATE)?;
        Ok(match raw {
            abi::DEV_STATE_READY => DeviceState::Ready,
            abi::DEV_STATE_PENDING_COMMANDS => DeviceState::PendingCommands,
            abi::DEV_STATE_NOT_RESPONDING => DeviceState::NotResponding,
            _ => DeviceState::ResetInProgress,
        })
    }

    fn check_sq(&self, channel: Channel, sq_index: usize) -> Result<()> {
        let count = match channel {
            Channel::Management => 1,
            Channel::Compute => usize::from(self.ops_sq_count),
        };
        if sq_index < count {
            Ok(())
        } else {
            Err(EtError::invalid_argument(format!(
                "{channel} SQ {sq_index} out of range ({count} queues)"
            )))
        }
    }
}

/// How long a reset may take to show on the device node
const RESET_NOTICE: Duration = Duration::from_secs(1);

/// Poll period while a reset is in progress
const RESET_POLL: Duration = Duration::from_millis(100);

/// The node vanished or is on its way out; expected while the driver
/// rebinds a device.
fn is_gone(err: &EtError) -> bool {
    match err {
        EtError::DeviceNotFound { .. } | EtError::NoDevicesFound => true,
        EtError::Io { source } => {
            source.kind() == std::io::ErrorKind::NotFound
                || source.raw_os_error() == Some(libc::ENODEV)
        }
        _ => false,
    }
}

/// `EAGAIN` on a command ioctl means the driver did not take it.
fn accepted(rc: Option<c_int>, device: usize) -> Result<()> {
    rc.map(|_| ()).ok_or(EtError::Busy { device })
}

/// Rediscover device `index` under `dir` and open it once it reports ready.
fn reopen(dir: &Path, index: usize) -> Result<PcieDevice> {
    let manager = DeviceManager::discover_in(dir)?;
    let info = manager
        .devices()
        .iter()
        .find(|info| info.index == index)
        .cloned()
        .ok_or_else(|| EtError::device_not_found(dir.join(pcie::mgmt_node(index))))?;
    let dev = PcieDevice::open(info)?;
    match dev.state(Channel::Management)? {
        DeviceState::Ready => Ok(dev),
        state => Err(EtError::invalid_state(format!("{state:?}"))),
    }
}

/// Transport over the kernel driver's device nodes
#[derive(Debug)]
pub struct PcieTransport {
    devices: Vec<RwLock<Arc<PcieDevice>>>,
}

impl PcieTransport {
    /// Discover and open every device under `/dev`
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no complete node pair exists, or the
    /// first open/query failure.
    pub fn open() -> Result<Self> {
        Self::from_manager(&DeviceManager::discover()?)
    }

    /// Open the devices a manager discovered
    ///
    /// # Errors
    ///
    /// Returns the first open/query failure.
    pub fn from_manager(manager: &DeviceManager) -> Result<Self> {
        let devices = manager
            .devices()
            .iter()
            .cloned()
            .map(|info| PcieDevice::open(info).map(|dev| RwLock::new(Arc::new(dev))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }

    fn slot(&self, device: usize) -> Result<&RwLock<Arc<PcieDevice>>> {
        self.devices.get(device).ok_or(EtError::InvalidIndex {
            index: device,
            count: self.devices.len(),
        })
    }

    fn device(&self, device: usize) -> Result<Arc<PcieDevice>> {
        Ok(Arc::clone(&*self.slot(device)?.read()))
    }

    /// Wait for the node to leave `Ready` (or vanish) after a reset was
    /// sent. Gives up quietly after `until`; the device may have been fast.
    fn await_reset_notice(dev: &PcieDevice, until: Instant) -> Result<()> {
        loop {
            match dev.state(Channel::Management) {
                Ok(DeviceState::Ready) => {}
                Ok(state) => {
                    tracing::debug!("Device {}: {state:?}", dev.info.index);
                    return Ok(());
                }
                Err(e) if is_gone(&e) => {
                    tracing::debug!("Device {}: node gone", dev.info.index);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= until {
                tracing::debug!("Device {}: no reset notice", dev.info.index);
                return Ok(());
            }
            std::thread::sleep(RESET_POLL.min(until - now));
        }
    }
}

impl QueueTransport for PcieTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Pcie
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn sq_count(&self, device: usize, channel: Channel) -> Result<usize> {
        let dev = self.device(device)?;
        Ok(match channel {
            Channel::Management => 1,
            Channel::Compute => usize::from(dev.ops_sq_count),
        })
    }

    fn sq_capacity(&self, device: usize, channel: Channel) -> Result<usize> {
        Ok(usize::from(self.device(device)?.max_msg(channel)))
    }

    fn submit(&self, device: usize, channel: Channel, sq_index: usize, frame: &[u8]) -> Result<bool> {
        let dev = self.device(device)?;
        dev.check_sq(channel, sq_index)?;
        let size = u16::try_from(frame.len())
            .map_err(|_| EtError::invalid_argument(format!("{} byte frame too large", frame.len())))?;
        let msg_id = CommonHeader::decode(frame).map_or(0, |h| h.msg_id);
        let mut desc = abi::CmdDesc {
            size,
            sq_index: sq_index as u16,
            flags: if channel == Channel::Compute && ops::is_dma(msg_id) {
                abi::CMD_DESC_FLAG_DMA
            } else {
                0
            },
            cmd: frame.as_ptr() as u64,
        };
        // SAFETY: `cmd` points at `frame`, borrowed for the whole call and
        // `size` bytes long; PUSH_SQ only reads it.
        let pushed = unsafe { dev.node(channel).ioctl(abi::PUSH_SQ, &mut desc)? };
        Ok(pushed.is_some())
    }

    fn set_sq_threshold(&self, device: usize, channel: Channel, sq_index: usize, bytes: usize) -> Result<()> {
        let dev = self.device(device)?;
        dev.check_sq(channel, sq_index)?;
        let max = usize::from(dev.max_msg(channel));
        if bytes == 0 || bytes > max {
            return Err(EtError::invalid_argument(format!(
                "threshold {bytes} outside (0, {max}]"
            )));
        }
        let mut arg = abi::SqThreshold {
            bytes_needed: bytes as u16,
            sq_index: sq_index as u16,
        };
        // SAFETY: the argument carries no user addresses.
        let rc = unsafe { dev.node(channel).ioctl(abi::SET_SQ_THRESHOLD, &mut arg)? };
        accepted(rc, device)
    }

    fn wait_for_readiness(&self, device: usize, channel: Channel, timeout: Duration) -> Result<Readiness> {
        let dev = self.device(device)?;
        let node = dev.node(channel);
        let edges = node.wait(timeout)?;
        let sq_bitmap = if !edges.writable {
            0
        } else if channel == Channel::Compute {
            query::<u64>(node, abi::GET_SQ_AVAIL_BITMAP)?
        } else {
            1
        };
        Ok(Readiness {
            sq_bitmap,
            cq_ready: edges.readable,
        })
    }

    fn poll_response(&self, device: usize, channel: Channel) -> Result<Option<Bytes>> {
        let dev = self.device(device)?;
        let max = dev.max_msg(channel);
        let mut buf = vec![0u8; usize::from(max)];
        let mut desc = abi::RspDesc {
            size: max,
            cq_index: 0,
            reserved: 0,
            rsp: buf.as_mut_ptr() as u64,
        };
        // SAFETY: `rsp` points at `buf`, `size` bytes, alive and not
        // otherwise borrowed until the call returns.
        let popped = unsafe { dev.node(channel).ioctl(abi::POP_CQ, &mut desc)? };
        if popped.is_none() {
            return Ok(None);
        }
        let header = CommonHeader::decode(&buf)
            .ok_or_else(|| EtError::protocol("completion shorter than a message header"))?;
        if header.size == 0 {
            return Err(EtError::protocol(format!(
                "message {} (tag {}) declares an empty body",
                header.msg_id, header.tag_id
            )));
        }
        let len = header.frame_len();
        if len > buf.len() {
            return Err(EtError::protocol(format!(
                "message {} declares {len} bytes, driver limit is {max}",
                header.msg_id
            )));
        }
        buf.truncate(len.max(COMMON_HEADER_SIZE));
        Ok(Some(Bytes::from(buf)))
    }

    fn dma_info(&self, device: usize) -> Result<DmaInfo> {
        let dram = self.device(device)?.dram;
        Ok(DmaInfo {
            alignment_bits: u32::from(dram.align_in_bits),
            dram_base: dram.base,
            dram_size: dram.size,
            max_element_size: u64::from(dram.dma_max_elem_size),
            max_element_count: u32::from(dram.dma_max_elem_count),
        })
    }

    fn device_config(&self, device: usize) -> Result<DeviceConfig> {
        let dev = self.device(device)?;
        let cfg: abi::DevConfig = query(&dev.mgmt, abi::GET_DEVICE_CONFIGURATION)?;
        Ok(DeviceConfig {
            form_factor: if u16::from(cfg.form_factor) == etsoc_chip::dir::form_factor::M_2 {
                FormFactor::M2
            } else {
                FormFactor::Pcie
            },
            tdp_watts: cfg.tdp,
            l3_mb: cfg.l3_mb,
            l2_mb: cfg.l2_mb,
            scratchpad_mb: cfg.scp_mb,
            cache_line_bytes: cfg.cache_line_bytes,
            l2_banks: cfg.l2_banks,
            ddr_bandwidth_mbps: cfg.ddr_bandwidth_mbps,
            boot_freq_mhz: cfg.boot_freq_mhz,
            shire_mask: cfg.shire_mask,
            spare_shire_id: cfg.spare_shire_id,
            arch_revision: cfg.arch_revision,
        })
    }

    fn device_state(&self, device: usize, channel: Channel) -> Result<DeviceState> {
        self.device(device)?.state(channel)
    }

    fn trace_buffer_size(&self, device: usize) -> Result<usize> {
        Ok(self.device(device)?.trace_size as usize)
    }

    fn update_firmware(&self, device: usize, image: &[u8]) -> Result<()> {
        let dev = self.device(device)?;
        let mut desc = abi::FwUpdateDesc {
            ubuf: image.as_ptr() as u64,
            size: image.len() as u64,
        };
        // SAFETY: `ubuf` points at `image`, borrowed for the whole call;
        // FW_UPDATE only reads `size` bytes from it.
        let rc = unsafe { dev.mgmt.ioctl(abi::FW_UPDATE, &mut desc)? };
        accepted(rc, device)?;
        tracing::info!("Device {device}: {} byte firmware image handed to driver", image.len());
        Ok(())
    }

    fn reinitialize(&self, device: usize, timeout: Duration) -> Result<()> {
        let slot = self.slot(device)?;
        let old = Arc::clone(&*slot.read());
        let index = old.info.index;
        let start = Instant::now();
        let deadline = start + timeout;
        tracing::info!("Device {index}: waiting for driver to finish reset");

        Self::await_reset_notice(&old, deadline.min(start + RESET_NOTICE))?;
        let dir = old
            .info
            .mgmt_path
            .parent()
            .unwrap_or_else(|| Path::new(pcie::DEV_DIR))
            .to_path_buf();
        drop(old);

        loop {
            match reopen(&dir, index) {
                Ok(fresh) => {
                    *slot.write() = Arc::new(fresh);
                    tracing::info!("Device {index}: reopened after reset");
                    return Ok(());
                }
                Err(e) if is_gone(&e) || matches!(e, EtError::InvalidState { .. }) => {
                    tracing::trace!("Device {index}: not back yet: {e}");
                }
                Err(e @ EtError::TransportFault { .. }) => return Err(e),
                Err(e) => {
                    return Err(EtError::transport_fault(format!(
                        "reopening device {index}: {e}"
                    )))
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EtError::timeout(timeout));
            }
            std::thread::sleep(RESET_POLL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_sizes() {
        assert_eq!(std::mem::size_of::<abi::DramInfo>(), 24);
        assert_eq!(std::mem::size_of::<abi::CmdDesc>(), 16);
        assert_eq!(std::mem::size_of::<abi::RspDesc>(), 16);
        assert_eq!(std::mem::size_of::<abi::DevConfig>(), 36);
        assert_eq!(ioc::size(abi::PUSH_SQ), 16);
    }

    #[test]
    fn refused_command_is_busy() {
        assert!(accepted(Some(0), 0).is_ok());
        assert!(matches!(accepted(None, 2), Err(EtError::Busy { device: 2 })));
    }

    #[test]
    fn reopen_waits_for_missing_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let err = reopen(dir.path(), 0).unwrap_err();
        assert!(is_gone(&err));

        // Only a recovery node: still not back.
        std::fs::File::create(dir.path().join(pcie::mgmt_node(0))).unwrap();
        let err = reopen(dir.path(), 0).unwrap_err();
        assert!(is_gone(&err));

        let io = EtError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!is_gone(&io));
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_all_devices() {
        let transport = PcieTransport::open().unwrap();
        assert!(transport.device_count() > 0);
        let info = transport.dma_info(0).unwrap();
        assert!(info.dram_size > 0);
        let config = transport.device_config(0).unwrap();
        assert!(config.active_shires() > 0);
    }

    #[test]
    #[ignore] // Requires hardware
    fn reset_reopens_nodes() {
        use crate::correlation::{DeviceInstance, InstanceConfig};
        use etsoc_chip::mgmt;

        let transport = Arc::new(PcieTransport::open().unwrap());
        let before = transport.device(0).unwrap();
        let instance = DeviceInstance::new(transport.clone(), 0, InstanceConfig::default()).unwrap();
        instance
            .submit_only(mgmt::id::RESET_ETSOC, 0, &[], Instant::now() + Duration::from_secs(5))
            .unwrap();
        instance.shutdown();
        transport.reinitialize(0, Duration::from_secs(120)).unwrap();
        assert!(!Arc::ptr_eq(&before, &transport.device(0).unwrap()));
        assert_eq!(transport.device_state(0, Channel::Management).unwrap(), DeviceState::Ready);
    }
}

//! Queue transport implementations
//!
//! - **PCIe**: kernel driver nodes `/dev/et<N>_{mgmt,ops}` (ioctl + epoll)
//! - **SysEmu**: shared-memory window of a system emulator, brought up from
//!   the device interface registers
//! - **Software**: in-process simulated device driving the SysEmu window,
//!   for CI and development without hardware

pub mod pcie;
pub mod software;
pub mod sysemu;

pub use pcie::PcieTransport;
pub use software::{Reply, SimConfig, SoftDevice};
pub use sysemu::{SimBus, SysEmuConfig, SysEmuTransport};

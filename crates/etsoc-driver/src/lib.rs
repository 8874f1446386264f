//! Host driver stack for Esperanto ET-SoC-1 devices.
//!
//! Each device exposes two channels: a **management** channel served by the
//! service processor (SP) and a **compute** (ops) channel served by the
//! master minion (MM). Both carry framed messages over shared-memory
//! circular queues. This crate moves those frames, pairs responses with the
//! commands that caused them, and wraps the management protocol as a
//! synchronous service request.
//!
//! # Layers
//!
//! ```text
//! DeviceManagement        service_request(): validate, encode, wait, decode
//!   DeviceInstance        tag allocation, receive thread, event queue
//!     QueueTransport      push/pop frames, readiness, reset
//!       PcieTransport     /dev/et<N>_{mgmt,ops} via ioctl + epoll
//!       SysEmuTransport   emulator memory window, descriptor bring-up
//!         SoftDevice      in-process firmware model for CI
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use etsoc_driver::{
//!     DeviceManagement, InstanceConfig, SimConfig, SoftDevice, SysEmuConfig, SysEmuTransport,
//! };
//! use etsoc_chip::mgmt;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = SoftDevice::start(SimConfig::default())?;
//! let transport = SysEmuTransport::start(Arc::new(device), SysEmuConfig::default())?;
//! let service = DeviceManagement::new(Arc::new(transport), InstanceConfig::default())?;
//!
//! let mut out = [0u8; 8];
//! let outcome = service.service_request(
//!     0,
//!     u32::from(mgmt::id::GET_MODULE_TEMPERATURE_THRESHOLDS),
//!     None,
//!     Some(&mut out),
//!     Duration::from_secs(1),
//! );
//! println!("status {} after {:?}", outcome.status, outcome.host_latency);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod attrs;
pub mod backends;
mod correlation;
mod device;
mod discovery;
mod error;
pub mod mmio;
pub mod protocol;
pub mod ring;
mod service;
mod transport;

pub use attrs::{parse_attributes, read_attribute_file, Attribute};
pub use backends::{
    PcieTransport, Reply, SimBus, SimConfig, SoftDevice, SysEmuConfig, SysEmuTransport,
};
pub use correlation::{DeviceInstance, InstanceConfig, PendingResponse};
pub use device::{DeviceNode, NodeReadiness};
pub use discovery::{DeviceInfo, DeviceManager};
pub use error::{EtError, Result};
pub use protocol::{Event, Message, Response};
pub use service::{read_hash_file, DeviceManagement, ServiceOutcome, MAX_INPUT_SIZE};
pub use transport::{
    select_transport, Channel, DeviceConfig, DeviceState, DmaInfo, FormFactor, QueueTransport,
    Readiness, TransportSelection, TransportType,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Channel, DeviceInstance, DeviceManagement, DeviceManager, EtError, InstanceConfig,
        QueueTransport, Result, ServiceOutcome, SimConfig, SoftDevice, SysEmuConfig,
        SysEmuTransport, TransportSelection,
    };
}

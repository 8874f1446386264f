//! Silicon and protocol model for the ET-SoC-1 accelerator host interface.
//!
//! This crate has **no dependencies** and **no I/O**. It describes what the
//! host sees of the device: PCIe identity and device nodes, the emulated
//! memory window, the ring-buffer control block, the device interface
//! registers published at bring-up, the wire headers and the message-id
//! tables of both command channels.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, `/dev/et<N>_{mgmt,ops}` node naming |
//! | [`bar`] | Emulated BAR bases, descriptor offsets, interrupt vectors |
//! | [`ring`] | Circular buffer control block and space arithmetic |
//! | [`dir`] | Device interface registers (descriptor) layout and CRC span |
//! | [`wire`] | Command / response / event headers (little-endian) |
//! | [`mgmt`] | Management channel message ids and value tables |
//! | [`ops`] | Compute channel message ids and DMA classification |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod dir;
pub mod mgmt;
pub mod ops;
pub mod pcie;
pub mod ring;
pub mod wire;

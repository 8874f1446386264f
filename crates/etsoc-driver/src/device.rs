//! Kernel driver node handle
//!
//! One open `/dev/et<N>_{mgmt,ops}` node plus its edge-triggered epoll
//! instance. The driver signals "SQ has room" as `EPOLLOUT` and "CQ has
//! data" as `EPOLLIN`; with `EPOLLET` each is reported once per transition.

use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::raw::{c_int, c_ulong};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustix::event::epoll;
use rustix::fs::OFlags;
use rustix::io::Errno;

use crate::error::{EtError, Result};

/// Linux `_IOC` request encoding
pub(crate) mod ioc {
    use std::os::raw::c_ulong;

    const NRBITS: u32 = 8;
    const TYPEBITS: u32 = 8;
    const SIZEBITS: u32 = 14;
    const TYPESHIFT: u32 = NRBITS;
    const SIZESHIFT: u32 = TYPESHIFT + TYPEBITS;
    const DIRSHIFT: u32 = SIZESHIFT + SIZEBITS;

    const WRITE: c_ulong = 1;
    const READ: c_ulong = 2;

    #[allow(clippy::cast_possible_truncation)]
    const fn ioc(dir: c_ulong, ty: u8, nr: u8, size: usize) -> c_ulong {
        (dir << DIRSHIFT) | ((size as c_ulong) << SIZESHIFT) | ((ty as c_ulong) << TYPESHIFT) | nr as c_ulong
    }

    /// `_IOR(ty, nr, T)`: kernel writes a `T`
    pub const fn ior<T>(ty: u8, nr: u8) -> c_ulong {
        ioc(READ, ty, nr, std::mem::size_of::<T>())
    }

    /// `_IOW(ty, nr, T)`: kernel reads a `T`
    pub const fn iow<T>(ty: u8, nr: u8) -> c_ulong {
        ioc(WRITE, ty, nr, std::mem::size_of::<T>())
    }

    /// Argument size encoded in a request
    pub const fn size(request: c_ulong) -> usize {
        ((request >> SIZESHIFT) & ((1 << SIZEBITS) - 1)) as usize
    }
}

/// Readiness reported by one epoll wait
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeReadiness {
    /// `EPOLLOUT`: a submission queue crossed its threshold
    pub writable: bool,
    /// `EPOLLIN`: the completion queue has data
    pub readable: bool,
}

/// Open device node
#[derive(Debug)]
pub struct DeviceNode {
    path: PathBuf,
    file: File,
    epoll: OwnedFd,
}

impl DeviceNode {
    /// Open a node read-write, non-blocking, and register it with epoll
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the node does not exist, or an I/O error
    /// if it cannot be opened or registered.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EtError::device_not_found(path));
        }

        // OFlags::NONBLOCK.bits() is a small positive flag value
        #[allow(clippy::cast_possible_wrap)]
        let nonblock_flag = OFlags::NONBLOCK.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nonblock_flag)
            .open(path)?;

        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC).map_err(std::io::Error::from)?;
        epoll::add(
            &epoll,
            &file,
            epoll::EventData::new_u64(0),
            epoll::EventFlags::IN | epoll::EventFlags::OUT | epoll::EventFlags::ET,
        )
        .map_err(std::io::Error::from)?;

        tracing::debug!("Opened {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
            epoll,
        })
    }

    /// Node path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue an ioctl with `arg` as its argument.
    ///
    /// Returns `Ok(None)` for `EAGAIN`, the driver's "queue full / queue
    /// empty" answer on a non-blocking node.
    ///
    /// # Safety
    ///
    /// Every user address embedded in `arg` must reference memory valid for
    /// the access `request` performs, for the duration of the call.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `T` does not match the size encoded in
    /// `request`, `DeviceNotFound` once the device has been removed,
    /// `TransportFault` for any other failure.
    pub(crate) unsafe fn ioctl<T: bytemuck::Pod>(
        &self,
        request: c_ulong,
        arg: &mut T,
    ) -> Result<Option<c_int>> {
        if ioc::size(request) != std::mem::size_of::<T>() {
            return Err(EtError::invalid_argument(format!(
                "ioctl {request:#x} expects {} argument bytes, got {}",
                ioc::size(request),
                std::mem::size_of::<T>()
            )));
        }
        tracing::trace!("ioctl {request:#x} on {}", self.path.display());
        // SAFETY: ioctl on an fd we own. Invariants: (1) fd valid for the
        // life of `self`; (2) `arg` is a live, exclusively borrowed Pod whose
        // size matches the request encoding (checked above); (3) embedded
        // user addresses are valid per this function's contract.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, std::ptr::from_mut(arg)) };
        if rc >= 0 {
            return Ok(Some(rc));
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            Some(libc::ENODEV | libc::ENXIO) => Err(EtError::device_not_found(&self.path)),
            _ => Err(EtError::transport_fault(format!(
                "ioctl {request:#x} on {}: {err}",
                self.path.display()
            ))),
        }
    }

    /// Block up to `timeout` for a readiness edge
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if a signal arrived, `TransportFault` on any
    /// other epoll failure or an event other than in/out.
    pub fn wait(&self, timeout: Duration) -> Result<NodeReadiness> {
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        let mut events = epoll::EventVec::with_capacity(6);
        match epoll::wait(&self.epoll, &mut events, timeout_ms) {
            Ok(()) => {}
            Err(Errno::INTR) => return Err(EtError::Interrupted),
            Err(e) => {
                return Err(EtError::transport_fault(format!(
                    "epoll on {}: {e}",
                    self.path.display()
                )))
            }
        }

        let mut ready = NodeReadiness::default();
        for event in &events {
            let flags = event.flags;
            if !flags.intersects(epoll::EventFlags::IN | epoll::EventFlags::OUT) {
                return Err(EtError::transport_fault(format!(
                    "unexpected epoll event {flags:?} on {}",
                    self.path.display()
                )));
            }
            ready.writable |= flags.contains(epoll::EventFlags::OUT);
            ready.readable |= flags.contains(epoll::EventFlags::IN);
        }
        Ok(ready)
    }
}

impl Drop for DeviceNode {
    fn drop(&mut self) {
        tracing::debug!("Closing {}", self.path.display());
    }
}

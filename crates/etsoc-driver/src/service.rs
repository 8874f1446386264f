//! Device management service requests
//!
//! [`DeviceManagement`] is the synchronous entry point: one call validates
//! the command against the command table, builds its payload (reading a
//! firmware image or hash file where the command takes a path), sends it on
//! the management channel and waits for the matching response, all under
//! one deadline. The outcome is a status code rather than a `Result` so the
//! call maps directly onto the C-style management interface:
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `0` | success |
//! | `-EINVAL` | rejected before any I/O |
//! | `-EAGAIN` | lock or response not obtained before the deadline |
//! | `-EIO` | transport failure or non-zero device status |

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use etsoc_chip::mgmt::{self, id, CommandClass, PayloadViolation};
use parking_lot::Mutex;

use crate::correlation::{DeviceInstance, InstanceConfig};
use crate::error::{EtError, Result};
use crate::protocol::{Event, Response};
use crate::transport::QueueTransport;

/// Largest direct (non-file) input payload
pub const MAX_INPUT_SIZE: usize = 128;

/// Result of one service request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOutcome {
    /// `0` or a negated errno
    pub status: i32,
    /// Processing time reported by the device
    pub device_latency: Duration,
    /// Wall-clock time spent in the call
    pub host_latency: Duration,
}

impl ServiceOutcome {
    /// `status == 0`
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Management front end over every device of a transport
#[derive(Debug)]
pub struct DeviceManagement {
    transport: Arc<dyn QueueTransport>,
    config: InstanceConfig,
    instances: Vec<Mutex<Option<Arc<DeviceInstance>>>>,
}

impl DeviceManagement {
    /// Create one device instance per transport device
    ///
    /// # Errors
    ///
    /// Returns error if an instance cannot be started.
    pub fn new(transport: Arc<dyn QueueTransport>, config: InstanceConfig) -> Result<Self> {
        let instances = (0..transport.device_count())
            .map(|device| {
                DeviceInstance::new(Arc::clone(&transport), device, config.clone())
                    .map(|inst| Mutex::new(Some(Arc::new(inst))))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            "Device management ready on {} ({} device(s))",
            transport.transport_type(),
            instances.len()
        );
        Ok(Self {
            transport,
            config,
            instances,
        })
    }

    /// Number of managed devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.instances.len()
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Current instance of a device
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndex` for an unknown device, `Busy` while a reset
    /// has the instance torn down.
    pub fn instance(&self, device: usize) -> Result<Arc<DeviceInstance>> {
        let slot = self.instances.get(device).ok_or(EtError::InvalidIndex {
            index: device,
            count: self.instances.len(),
        })?;
        slot.lock().clone().ok_or(EtError::Busy { device })
    }

    /// Events the device sent since the last call, oldest first
    ///
    /// # Errors
    ///
    /// Same as [`Self::instance`].
    pub fn events(&self, device: usize) -> Result<Vec<Event>> {
        Ok(self.instance(device)?.drain_events())
    }

    /// Run one management command
    ///
    /// `input` carries the payload of `SET_*` commands (a file path for
    /// firmware update and root-certificate provisioning); `output` receives
    /// the response payload of `GET_*` commands, truncated to its length.
    pub fn service_request(
        &self,
        device: usize,
        command_id: u32,
        input: Option<&[u8]>,
        output: Option<&mut [u8]>,
        timeout: Duration,
    ) -> ServiceOutcome {
        let start = Instant::now();
        let deadline = start + timeout;
        let has_output = output.as_ref().is_some_and(|out| !out.is_empty());
        let result = self.request(device, command_id, input, has_output, deadline);

        let (status, device_latency) = match result {
            Ok(None) => (0, Duration::ZERO),
            Ok(Some(rsp)) => {
                let latency = Duration::from_micros(rsp.header.device_latency_usec);
                if let Some(out) = output {
                    let n = out.len().min(rsp.payload.len());
                    out[..n].copy_from_slice(&rsp.payload[..n]);
                }
                if rsp.header.status == 0 {
                    (0, latency)
                } else {
                    let err = EtError::DeviceStatus {
                        msg_id: rsp.header.common.msg_id,
                        status: rsp.header.status,
                    };
                    tracing::warn!("Device {device}: {err}");
                    (err.status(), latency)
                }
            }
            Err(e) => {
                tracing::debug!("Device {device}: command {command_id} failed: {e}");
                (e.status(), Duration::ZERO)
            }
        };
        ServiceOutcome {
            status,
            device_latency,
            host_latency: start.elapsed(),
        }
    }

    fn validate(
        &self,
        device: usize,
        command_id: u32,
        input: Option<&[u8]>,
        has_output: bool,
    ) -> Result<u16> {
        if device >= self.instances.len() {
            return Err(EtError::InvalidIndex {
                index: device,
                count: self.instances.len(),
            });
        }
        let msg_id = u16::try_from(command_id)
            .ok()
            .filter(|id| mgmt::name(*id).is_some())
            .ok_or_else(|| EtError::invalid_argument(format!("unknown command {command_id}")))?;
        match mgmt::class(msg_id) {
            Some(CommandClass::Set) if input.map_or(true, <[u8]>::is_empty) => {
                return Err(EtError::invalid_argument(format!(
                    "{} needs an input buffer",
                    mgmt::name(msg_id).unwrap_or("command")
                )));
            }
            Some(CommandClass::Get) if !has_output => {
                return Err(EtError::invalid_argument(format!(
                    "{} needs an output buffer",
                    mgmt::name(msg_id).unwrap_or("command")
                )));
            }
            _ => {}
        }
        Ok(msg_id)
    }

    /// Payload to send, built from the caller's input before any I/O.
    fn prepare(msg_id: u16, input: Option<&[u8]>) -> Result<Prepared> {
        let input = input.unwrap_or_default();
        match msg_id {
            id::SET_FIRMWARE_UPDATE => {
                let path = path_from(input)?;
                let image = std::fs::read(path).map_err(|e| {
                    EtError::invalid_argument(format!("firmware image {}: {e}", path.display()))
                })?;
                tracing::info!("Firmware image {} ({} bytes)", path.display(), image.len());
                Ok(Prepared {
                    payload: Vec::new(),
                    firmware: Some(image),
                })
            }
            id::SET_SP_BOOT_ROOT_CERT | id::SET_SW_BOOT_ROOT_CERT => Ok(Prepared {
                payload: read_hash_file(path_from(input)?)?.to_vec(),
                firmware: None,
            }),
            _ => {
                if input.len() > MAX_INPUT_SIZE {
                    return Err(EtError::invalid_argument(format!(
                        "{} byte input exceeds {MAX_INPUT_SIZE}",
                        input.len()
                    )));
                }
                mgmt::check_payload(msg_id, input).map_err(|v| match v {
                    PayloadViolation::TooShort => {
                        EtError::invalid_argument("payload too short for command")
                    }
                    PayloadViolation::OutOfRange(value) => EtError::invalid_argument(format!(
                        "value {value} not accepted by {}",
                        mgmt::name(msg_id).unwrap_or("command")
                    )),
                })?;
                Ok(Prepared {
                    payload: input.to_vec(),
                    firmware: None,
                })
            }
        }
    }

    fn request(
        &self,
        device: usize,
        command_id: u32,
        input: Option<&[u8]>,
        has_output: bool,
        deadline: Instant,
    ) -> Result<Option<Response>> {
        let msg_id = self.validate(device, command_id, input, has_output)?;
        let prepared = Self::prepare(msg_id, input)?;

        loop {
            let inst = self.current(device, deadline)?;
            let _submission = inst.lock_submission(deadline)?;
            if inst.is_active() {
                return self.exchange(&inst, msg_id, prepared, deadline);
            }
            // A reset replaced the instance while this caller was queued on
            // its lock.
            tracing::debug!("Device {device}: instance replaced, retrying");
        }
    }

    /// Current instance, waiting until `deadline` while a reset has it torn
    /// down.
    fn current(&self, device: usize, deadline: Instant) -> Result<Arc<DeviceInstance>> {
        loop {
            match self.instance(device) {
                Err(EtError::Busy { .. }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EtError::Busy { device });
                    }
                    std::thread::sleep(self.config.readiness_timeout.min(deadline - now));
                }
                found => return found,
            }
        }
    }

    fn exchange(
        &self,
        inst: &DeviceInstance,
        msg_id: u16,
        prepared: Prepared,
        deadline: Instant,
    ) -> Result<Option<Response>> {
        let device = inst.device();
        if let Some(image) = prepared.firmware {
            self.transport.update_firmware(device, &image)?;
        }

        if mgmt::is_device_reset(msg_id) {
            inst.submit_only(msg_id, 0, &prepared.payload, deadline)?;
            self.reset_instance(device, inst, deadline)?;
            return Ok(None);
        }

        let rsp = inst.issue(msg_id, 0, &prepared.payload, deadline)?.wait(deadline)?;
        Ok(Some(rsp))
    }

    /// Tear the instance down, wait for the device, start a fresh one.
    fn reset_instance(&self, device: usize, inst: &DeviceInstance, deadline: Instant) -> Result<()> {
        let slot = &self.instances[device];
        slot.lock().take();
        inst.shutdown();

        let remaining = deadline.saturating_duration_since(Instant::now());
        let reinit = self.transport.reinitialize(device, remaining);
        let fresh = DeviceInstance::new(Arc::clone(&self.transport), device, self.config.clone())?;
        *slot.lock() = Some(Arc::new(fresh));
        reinit?;
        tracing::info!("Device {device}: reset complete");
        Ok(())
    }
}

struct Prepared {
    payload: Vec<u8>,
    firmware: Option<Vec<u8>>,
}

fn path_from(input: &[u8]) -> Result<&Path> {
    let end = input.iter().position(|&b| b == 0).unwrap_or(input.len());
    let text = std::str::from_utf8(&input[..end])
        .map_err(|_| EtError::invalid_argument("path is not UTF-8"))?;
    if text.is_empty() {
        return Err(EtError::invalid_argument("empty path"));
    }
    Ok(Path::new(text))
}

/// Read a root-certificate hash file: the first
/// [`HASH_HEX_LEN`](mgmt::HASH_HEX_LEN) characters must be hex digits and
/// become the [`HASH_LEN`](mgmt::HASH_LEN)-byte digest.
///
/// # Errors
///
/// Returns `InvalidArgument` if the file is missing, short or not hex.
pub fn read_hash_file(path: &Path) -> Result<[u8; mgmt::HASH_LEN]> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EtError::invalid_argument(format!("hash file {}: {e}", path.display())))?;
    let hex = text
        .as_bytes()
        .get(..mgmt::HASH_HEX_LEN)
        .ok_or_else(|| EtError::invalid_argument(format!("hash file {} too short", path.display())))?;

    let nibble = |c: u8| -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(EtError::invalid_argument(format!(
                "hash file {} is not hex",
                path.display()
            ))),
        }
    };
    let mut digest = [0u8; mgmt::HASH_LEN];
    for (byte, pair) in digest.iter_mut().zip(hex.chunks_exact(2)) {
        *byte = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_file_decodes_first_128_hex_chars() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}trailing", "0a".repeat(64)).unwrap();
        let digest = read_hash_file(file.path()).unwrap();
        assert!(digest.iter().all(|&b| b == 0x0a));
    }

    #[test]
    fn hash_file_rejects_bad_input() {
        let mut short = tempfile::NamedTempFile::new().unwrap();
        write!(short, "abcd").unwrap();
        assert!(read_hash_file(short.path()).is_err());

        let mut not_hex = tempfile::NamedTempFile::new().unwrap();
        write!(not_hex, "{}", "zz".repeat(64)).unwrap();
        assert!(read_hash_file(not_hex.path()).is_err());

        assert!(read_hash_file(Path::new("/nonexistent/hash")).is_err());
    }

    #[test]
    fn path_stops_at_nul() {
        assert_eq!(path_from(b"/tmp/fw.bin\0junk").unwrap(), Path::new("/tmp/fw.bin"));
        assert!(path_from(b"\0").is_err());
    }
}

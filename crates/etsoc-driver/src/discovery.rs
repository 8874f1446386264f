//! Runtime device discovery
//!
//! The kernel driver exposes two character devices per accelerator:
//! `/dev/et<N>_mgmt` (service processor) and `/dev/et<N>_ops` (master
//! minion). A device is usable once both nodes exist; a lone management
//! node means the device booted into recovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use etsoc_chip::pcie::{self, NodeKind};

use crate::error::{EtError, Result};

/// Device manager for runtime discovery
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
    recovery: Vec<usize>,
}

/// Device nodes of one accelerator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device index (`N` in `et<N>_*`)
    pub index: usize,
    /// Management node path
    pub mgmt_path: PathBuf,
    /// Compute node path
    pub ops_path: PathBuf,
}

impl DeviceManager {
    /// Discover devices under `/dev`
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no complete node pair exists.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(pcie::DEV_DIR))
    }

    /// Discover devices under an arbitrary directory
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no complete node pair exists, or an I/O
    /// error if the directory cannot be read.
    pub fn discover_in(dir: &Path) -> Result<Self> {
        tracing::info!("Discovering ET-SoC-1 devices in {}", dir.display());

        let mut seen: BTreeMap<usize, (bool, bool)> = BTreeMap::new();
        for entry in std::fs::read_dir(dir)?.flatten() {
            let name = entry.file_name();
            let Some((index, kind)) = name.to_str().and_then(pcie::parse_node) else {
                continue;
            };
            tracing::debug!("Found device node: {}", entry.path().display());
            let slot = seen.entry(index).or_default();
            match kind {
                NodeKind::Mgmt => slot.0 = true,
                NodeKind::Ops => slot.1 = true,
            }
        }

        let mut devices = Vec::new();
        let mut recovery = Vec::new();
        for (index, (mgmt, ops)) in seen {
            match (mgmt, ops) {
                (true, true) => devices.push(DeviceInfo {
                    index,
                    mgmt_path: dir.join(pcie::mgmt_node(index)),
                    ops_path: dir.join(pcie::ops_node(index)),
                }),
                (true, false) => {
                    tracing::warn!("Device {index} has no compute node (recovery mode)");
                    recovery.push(index);
                }
                (false, _) => tracing::warn!("Device {index} has no management node, ignored"),
            }
        }

        if devices.is_empty() {
            tracing::debug!("No ET-SoC-1 devices found");
            return Err(EtError::NoDevicesFound);
        }
        tracing::info!("Discovered {} ET-SoC-1 device(s)", devices.len());
        Ok(Self { devices, recovery })
    }

    /// Number of complete devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All complete devices, in index order
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Indices of devices with only a management node
    #[must_use]
    pub fn recovery_devices(&self) -> &[usize] {
        &self.recovery
    }

    /// Get device info by position
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndex` if the position is out of bounds.
    pub fn device(&self, position: usize) -> Result<&DeviceInfo> {
        self.devices.get(position).ok_or(EtError::InvalidIndex {
            index: position,
            count: self.devices.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn counts_complete_pairs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "et0_mgmt");
        touch(dir.path(), "et0_ops");
        touch(dir.path(), "et1_mgmt");
        touch(dir.path(), "et2_ops");
        touch(dir.path(), "ttyS0");

        let manager = DeviceManager::discover_in(dir.path()).unwrap();
        assert_eq!(manager.device_count(), 1);
        assert_eq!(manager.recovery_devices(), &[1]);
        let dev = manager.device(0).unwrap();
        assert_eq!(dev.mgmt_path, dir.path().join("et0_mgmt"));
        assert_eq!(dev.ops_path, dir.path().join("et0_ops"));
        assert!(manager.device(1).is_err());
    }

    #[test]
    fn empty_directory_has_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DeviceManager::discover_in(dir.path()),
            Err(EtError::NoDevicesFound)
        ));
    }

    #[test]
    fn devices_sorted_by_index() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["et3_mgmt", "et3_ops", "et1_ops", "et1_mgmt"] {
            touch(dir.path(), name);
        }
        let manager = DeviceManager::discover_in(dir.path()).unwrap();
        let indices: Vec<_> = manager.devices().iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }
}

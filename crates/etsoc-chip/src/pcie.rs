//! PCIe identifiers and device node naming.
//!
//! The kernel driver exposes every ET-SoC-1 as two character devices, one
//! per command channel:
//!
//! ```text
//! /dev/et0_mgmt   service processor (management channel)
//! /dev/et0_ops    master minion     (compute channel)
//! ```

/// Vendor ID currently programmed in the PCIe endpoint.
pub const VENDOR_ID: u16 = 0x10ee;

/// Vendor ID assigned by PCI-SIG (not yet used by shipping boards).
pub const OFFICIAL_VENDOR_ID: u16 = 0x1e0a;

/// Device ID of the ET-SoC-1 endpoint.
pub const DEVICE_ID: u16 = 0x9038;

/// Directory scanned for device nodes.
pub const DEV_DIR: &str = "/dev";

/// Node-name prefix shared by both channels.
pub const NODE_PREFIX: &str = "et";

/// Suffix of the management channel node.
pub const MGMT_SUFFIX: &str = "_mgmt";

/// Suffix of the compute channel node.
pub const OPS_SUFFIX: &str = "_ops";

/// Upper bound on devices scanned during discovery.
pub const MAX_DEVICES: usize = 64;

/// Management node name for a device index (`et3_mgmt`).
pub fn mgmt_node(index: usize) -> String {
    format!("{NODE_PREFIX}{index}{MGMT_SUFFIX}")
}

/// Compute node name for a device index (`et3_ops`).
pub fn ops_node(index: usize) -> String {
    format!("{NODE_PREFIX}{index}{OPS_SUFFIX}")
}

/// Which node kind a `/dev` entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `et<N>_mgmt`
    Mgmt,
    /// `et<N>_ops`
    Ops,
}

/// Parse a `/dev` entry name into `(index, kind)`.
///
/// Returns `None` for anything that is not exactly `et<decimal>_mgmt` or
/// `et<decimal>_ops`.
pub fn parse_node(name: &str) -> Option<(usize, NodeKind)> {
    let rest = name.strip_prefix(NODE_PREFIX)?;
    let (digits, kind) = if let Some(d) = rest.strip_suffix(MGMT_SUFFIX) {
        (d, NodeKind::Mgmt)
    } else if let Some(d) = rest.strip_suffix(OPS_SUFFIX) {
        (d, NodeKind::Ops)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|index| (index, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_round_trip() {
        assert_eq!(mgmt_node(0), "et0_mgmt");
        assert_eq!(parse_node(&ops_node(12)), Some((12, NodeKind::Ops)));
        assert_eq!(parse_node("et7_mgmt"), Some((7, NodeKind::Mgmt)));
    }

    #[test]
    fn rejects_foreign_nodes() {
        assert_eq!(parse_node("eth0"), None);
        assert_eq!(parse_node("et_mgmt"), None);
        assert_eq!(parse_node("etx_ops"), None);
        assert_eq!(parse_node("et1_ops.bak"), None);
    }
}

//! Management channel (service processor) message ids and value tables.
//!
//! Command ids 0..=73 are device-management requests, 128..=255 are the
//! debug interface (MDI). Ids 256..=639 never travel host→device: they are
//! device-initiated events (256..=511 service processor errors,
//! 512..=639 management events).
//!
//! Whether a command reads or writes is encoded in its name: `GET_*`
//! commands need an output buffer, `SET_*` commands need an input buffer.

use std::ops::RangeInclusive;

macro_rules! dm_commands {
    ($($name:ident = $id:expr,)*) => {
        /// Management command ids.
        #[allow(missing_docs)]
        pub mod id {
            $(pub const $name: u16 = $id;)*
        }

        /// `(id, name)` of every command the host may send.
        pub const COMMANDS: &[(u16, &str)] = &[$(($id, stringify!($name)),)*];
    };
}

dm_commands! {
    GET_MODULE_MANUFACTURE_NAME = 0,
    GET_MODULE_PART_NUMBER = 1,
    GET_MODULE_SERIAL_NUMBER = 2,
    GET_ASIC_CHIP_REVISION = 3,
    GET_MODULE_DRIVER_REVISION = 4,
    GET_MODULE_PCIE_ADDR = 5,
    GET_MODULE_PCIE_NUM_PORTS_MAX_SPEED = 6,
    GET_MODULE_MEMORY_SIZE_MB = 7,
    GET_MODULE_REVISION = 8,
    GET_MODULE_FORM_FACTOR = 9,
    GET_MODULE_MEMORY_VENDOR_PART_NUMBER = 10,
    GET_MODULE_MEMORY_TYPE = 11,
    SET_MODULE_PART_NUMBER = 12,
    GET_FUSED_PUBLIC_KEYS = 13,
    GET_MODULE_FIRMWARE_REVISIONS = 14,
    SET_FIRMWARE_UPDATE = 15,
    GET_FIRMWARE_BOOT_STATUS = 16,
    SET_SP_BOOT_ROOT_CERT = 17,
    SET_SW_BOOT_ROOT_CERT = 18,
    SET_FIRMWARE_VERSION_COUNTER = 19,
    SET_FIRMWARE_VALID = 20,
    GET_MODULE_TEMPERATURE_THRESHOLDS = 21,
    SET_MODULE_TEMPERATURE_THRESHOLDS = 22,
    GET_MODULE_POWER_STATE = 23,
    SET_MODULE_ACTIVE_POWER_MANAGEMENT = 24,
    GET_MODULE_STATIC_TDP_LEVEL = 25,
    SET_MODULE_STATIC_TDP_LEVEL = 26,
    GET_MODULE_CURRENT_TEMPERATURE = 27,
    GET_MODULE_TEMPERATURE_THROTTLE_STATUS = 28,
    GET_MODULE_RESIDENCY_THROTTLE_STATES = 29,
    GET_MODULE_UPTIME = 30,
    GET_MODULE_VOLTAGE = 31,
    GET_ASIC_VOLTAGE = 32,
    GET_MODULE_POWER = 33,
    GET_MODULE_RESIDENCY_POWER_STATES = 34,
    SET_MODULE_VOLTAGE = 35,
    SET_THROTTLE_POWER_STATE_TEST = 36,
    SET_FREQUENCY = 37,
    GET_MODULE_MAX_TEMPERATURE = 38,
    GET_MODULE_MAX_DDR_BW = 39,
    GET_MAX_MEMORY_ERROR = 40,
    SET_DDR_ECC_COUNT = 41,
    SET_PCIE_ECC_COUNT = 42,
    SET_SRAM_ECC_COUNT = 43,
    SET_PCIE_RESET = 44,
    GET_MODULE_PCIE_ECC_UECC = 45,
    GET_MODULE_DDR_BW_COUNTER = 46,
    GET_MODULE_DDR_ECC_UECC = 47,
    GET_MODULE_SRAM_ECC_UECC = 48,
    SET_PCIE_MAX_LINK_SPEED = 49,
    SET_PCIE_LANE_WIDTH = 50,
    SET_PCIE_RETRAIN_PHY = 51,
    RESET_ETSOC = 52,
    GET_ASIC_FREQUENCIES = 53,
    GET_DRAM_BANDWIDTH = 54,
    GET_DRAM_CAPACITY_UTILIZATION = 55,
    GET_ASIC_PER_CORE_DATAPATH_UTILIZATION = 56,
    GET_ASIC_UTILIZATION = 57,
    GET_ASIC_STALLS = 58,
    GET_ASIC_LATENCY = 59,
    GET_SP_STATS = 60,
    GET_MM_STATS = 61,
    SET_STATS_RUN_CONTROL = 62,
    GET_MM_ERROR_COUNT = 63,
    MM_RESET = 64,
    GET_DEVICE_ERROR_EVENTS = 65,
    SET_DM_TRACE_RUN_CONTROL = 66,
    SET_DM_TRACE_CONFIG = 67,
    SET_SHIRE_CACHE_CONFIG = 68,
    GET_SHIRE_CACHE_CONFIG = 69,
    SET_FRU = 70,
    GET_FRU = 71,
    SET_VMIN_LUT = 72,
    GET_VMIN_LUT = 73,
    MDI_SELECT_HART = 128,
    MDI_UNSELECT_HART = 129,
    MDI_RESET_HART = 130,
    MDI_HALT_HART = 131,
    MDI_RESUME_HART = 132,
    MDI_GET_HART_STATUS = 133,
    MDI_SET_BREAKPOINT = 134,
    MDI_UNSET_BREAKPOINT = 135,
    MDI_ENABLE_SINGLE_STEP = 136,
    MDI_DISABLE_SINGLE_STEP = 137,
    MDI_READ_GPR = 138,
    MDI_DUMP_GPR = 139,
    MDI_WRITE_GPR = 140,
    MDI_READ_CSR = 141,
    MDI_WRITE_CSR = 142,
    MDI_READ_MEM = 143,
    MDI_WRITE_MEM = 144,
    MDI_SET_BREAKPOINT_EVENT = 192,
    MDI_END = 255,
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Service processor error events.
pub const SP_ERROR_EVENTS: RangeInclusive<u16> = 256..=511;

/// Device-management events.
pub const DM_EVENTS: RangeInclusive<u16> = 512..=639;

/// Trace buffer of the service processor reached its threshold.
pub const EVENT_SP_TRACE_BUFFER_FULL: u16 = 512;

/// Whether `msg_id` is a device-initiated event rather than a response.
pub fn is_event(msg_id: u16) -> bool {
    SP_ERROR_EVENTS.contains(&msg_id) || DM_EVENTS.contains(&msg_id)
}

// ── Command classes ──────────────────────────────────────────────────────────

/// How a command uses the caller's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Reads device state into the output buffer.
    Get,
    /// Writes the input buffer to the device.
    Set,
    /// Neither (`RESET_ETSOC`, `MM_RESET`, debug interface).
    Other,
}

/// Name of a command id.
pub fn name(msg_id: u16) -> Option<&'static str> {
    COMMANDS
        .iter()
        .find(|(id, _)| *id == msg_id)
        .map(|(_, name)| *name)
}

/// Class of a known command id.
pub fn class(msg_id: u16) -> Option<CommandClass> {
    let name = name(msg_id)?;
    Some(if name.starts_with("GET_") {
        CommandClass::Get
    } else if name.starts_with("SET_") {
        CommandClass::Set
    } else {
        CommandClass::Other
    })
}

/// Commands that reset the whole device and never get a response.
pub const fn is_device_reset(msg_id: u16) -> bool {
    msg_id == id::RESET_ETSOC
}

// ── Value tables ─────────────────────────────────────────────────────────────

/// Valid software temperature threshold, °C.
pub const TEMPERATURE_THRESHOLD_C: RangeInclusive<u8> = 20..=125;

/// Static TDP levels are `0..TDP_LEVEL_LIMIT`.
pub const TDP_LEVEL_LIMIT: u8 = 40;

/// `SET_MODULE_ACTIVE_POWER_MANAGEMENT`: off, on.
pub const ACTIVE_POWER_MANAGEMENT: &[u8] = &[0, 1];

/// `SET_PCIE_MAX_LINK_SPEED`: Gen3, Gen4.
pub const PCIE_LINK_SPEEDS: &[u8] = &[0, 1];

/// `SET_PCIE_LANE_WIDTH`: x4, x8.
pub const PCIE_LANE_WIDTHS: &[u8] = &[0, 1];

/// `SET_PCIE_RESET`: FLR, hot, warm.
pub const PCIE_RESET_TYPES: &[u8] = &[0, 1, 2];

/// `SET_THROTTLE_POWER_STATE_TEST`: power states 0..=4.
pub const POWER_STATES: &[u8] = &[0, 1, 2, 3, 4];

/// Stats and trace run control: stop, start.
pub const RUN_CONTROL: &[u8] = &[0, 1];

/// Length of a SHA-512 digest in hex characters, as stored in hash files.
pub const HASH_HEX_LEN: usize = 128;

/// Length of a SHA-512 digest in bytes.
pub const HASH_LEN: usize = 64;

/// Why a command payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadViolation {
    /// Payload shorter than the field being checked.
    TooShort,
    /// First byte outside a range or table.
    OutOfRange(u8),
}

fn accepts(msg_id: u16) -> Option<fn(u8) -> bool> {
    let accept: fn(u8) -> bool = match msg_id {
        id::SET_MODULE_TEMPERATURE_THRESHOLDS => |v| TEMPERATURE_THRESHOLD_C.contains(&v),
        id::SET_MODULE_STATIC_TDP_LEVEL => |v| v < TDP_LEVEL_LIMIT,
        id::SET_MODULE_ACTIVE_POWER_MANAGEMENT => |v| ACTIVE_POWER_MANAGEMENT.contains(&v),
        id::SET_PCIE_MAX_LINK_SPEED => |v| PCIE_LINK_SPEEDS.contains(&v),
        id::SET_PCIE_LANE_WIDTH => |v| PCIE_LANE_WIDTHS.contains(&v),
        id::SET_PCIE_RESET => |v| PCIE_RESET_TYPES.contains(&v),
        id::SET_THROTTLE_POWER_STATE_TEST => |v| POWER_STATES.contains(&v),
        id::SET_STATS_RUN_CONTROL | id::SET_DM_TRACE_RUN_CONTROL => |v| RUN_CONTROL.contains(&v),
        _ => return None,
    };
    Some(accept)
}

/// Check the value constraints a command places on its first payload byte.
///
/// Commands without constraints always pass.
pub fn check_payload(msg_id: u16, payload: &[u8]) -> Result<(), PayloadViolation> {
    let Some(accept) = accepts(msg_id) else {
        return Ok(());
    };
    let value = *payload.first().ok_or(PayloadViolation::TooShort)?;
    if accept(value) {
        Ok(())
    } else {
        Err(PayloadViolation::OutOfRange(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_follows_name_prefix() {
        assert_eq!(class(id::GET_MODULE_UPTIME), Some(CommandClass::Get));
        assert_eq!(class(id::SET_FIRMWARE_UPDATE), Some(CommandClass::Set));
        assert_eq!(class(id::RESET_ETSOC), Some(CommandClass::Other));
        assert_eq!(class(id::MDI_READ_MEM), Some(CommandClass::Other));
        assert_eq!(class(74), None);
        assert_eq!(class(300), None);
    }

    #[test]
    fn ids_are_unique() {
        for (i, (a, _)) in COMMANDS.iter().enumerate() {
            assert!(COMMANDS[i + 1..].iter().all(|(b, _)| a != b), "duplicate id {a}");
        }
    }

    #[test]
    fn event_ranges() {
        assert!(!is_event(id::GET_VMIN_LUT));
        assert!(!is_event(id::MDI_END));
        assert!(is_event(256));
        assert!(is_event(EVENT_SP_TRACE_BUFFER_FULL));
        assert!(is_event(639));
        assert!(!is_event(640));
    }

    #[test]
    fn temperature_threshold_bounds() {
        let t = id::SET_MODULE_TEMPERATURE_THRESHOLDS;
        assert!(check_payload(t, &[20, 0]).is_ok());
        assert!(check_payload(t, &[125]).is_ok());
        assert_eq!(check_payload(t, &[19]), Err(PayloadViolation::OutOfRange(19)));
        assert_eq!(check_payload(t, &[126]), Err(PayloadViolation::OutOfRange(126)));
        assert_eq!(check_payload(t, &[]), Err(PayloadViolation::TooShort));
    }

    #[test]
    fn enum_tables() {
        assert!(check_payload(id::SET_MODULE_STATIC_TDP_LEVEL, &[39]).is_ok());
        assert!(check_payload(id::SET_MODULE_STATIC_TDP_LEVEL, &[40]).is_err());
        assert!(check_payload(id::SET_PCIE_RESET, &[2]).is_ok());
        assert!(check_payload(id::SET_PCIE_RESET, &[3]).is_err());
        assert!(check_payload(id::SET_PCIE_LANE_WIDTH, &[1]).is_ok());
        assert!(check_payload(id::SET_PCIE_LANE_WIDTH, &[2]).is_err());
        assert!(check_payload(id::SET_FRU, &[0xFF]).is_ok());
    }
}

//! Memory window layout of the emulated device.
//!
//! The system emulator exposes the device's PCIe BARs as a flat physical
//! address space. Descriptor and queue addresses published by firmware are
//! BAR-relative; the host adds the base of the BAR they name.
//!
//! ```text
//! BAR0  0x10_0000_0000   ring buffers, scratch, DRAM window
//! BAR2  0x20_0000_0000   device interface registers
//!        +0x0000          compute channel (master minion) descriptor
//!        +0x1000          management channel (service processor) descriptor
//! ```

// ── BAR bases ────────────────────────────────────────────────────────────────

/// Host-visible base of BAR0.
pub const BAR0_BASE: u64 = 0x10_0000_0000;

/// Host-visible base of BAR2.
pub const BAR2_BASE: u64 = 0x20_0000_0000;

/// BAR bases indexed by BAR number. Unimplemented BARs are zero.
pub const BAR_BASES: [u64; 6] = [BAR0_BASE, 0, BAR2_BASE, 0, 0, 0];

/// Host address of `bar_offset` inside BAR `bar`, or `None` for an unknown BAR.
pub fn bar_address(bar: u8, bar_offset: u64) -> Option<u64> {
    let base = *BAR_BASES.get(usize::from(bar))?;
    if base == 0 {
        return None;
    }
    base.checked_add(bar_offset)
}

// ── Device interface registers ───────────────────────────────────────────────

/// Offset of the compute channel descriptor within BAR2.
pub const MM_DIR_OFFSET: u64 = 0x0;

/// Offset of the management channel descriptor within BAR2.
pub const SP_DIR_OFFSET: u64 = 0x1000;

/// Bytes reserved for one descriptor.
pub const DIR_REGION_SIZE: u64 = 0x1000;

// ── Interrupt vectors ────────────────────────────────────────────────────────

/// Interrupt raised by the host after pushing to the management SQ.
pub const IRQ_SP_SQ: u32 = 1 << 0;

/// Interrupt raised by the device after pushing to the management CQ.
pub const IRQ_SP_CQ: u32 = 1 << 1;

/// Interrupt raised by the host after pushing to a compute SQ.
pub const IRQ_MM_SQ: u32 = 1 << 2;

/// Interrupt raised by the device after pushing to the compute CQ.
pub const IRQ_MM_CQ: u32 = 1 << 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_address_adds_base() {
        assert_eq!(bar_address(2, SP_DIR_OFFSET), Some(0x20_0000_1000));
        assert_eq!(bar_address(0, 0x40), Some(0x10_0000_0040));
    }

    #[test]
    fn unknown_bars_have_no_address() {
        assert_eq!(bar_address(1, 0), None);
        assert_eq!(bar_address(9, 0), None);
    }
}

//! Compute channel (master minion) message ids.
//!
//! Commands and their responses alternate: every `*_CMD` id is followed by
//! its `*_RSP`. The kernel driver must know which commands carry DMA lists
//! so it can pin and translate the referenced host buffers.

#![allow(missing_docs)]

use std::ops::RangeInclusive;

pub const CHECK_DEVICE_OPS_API_COMPATIBILITY_CMD: u16 = 513;
pub const DEVICE_OPS_API_COMPATIBILITY_RSP: u16 = 514;
pub const DEVICE_FW_VERSION_CMD: u16 = 515;
pub const FW_VERSION_RSP: u16 = 516;
pub const ECHO_CMD: u16 = 517;
pub const ECHO_RSP: u16 = 518;
pub const ABORT_CMD: u16 = 519;
pub const ABORT_RSP: u16 = 520;
pub const KERNEL_LAUNCH_CMD: u16 = 521;
pub const KERNEL_LAUNCH_RSP: u16 = 522;
pub const KERNEL_ABORT_CMD: u16 = 523;
pub const KERNEL_ABORT_RSP: u16 = 524;
pub const DMA_READLIST_CMD: u16 = 525;
pub const DMA_READLIST_RSP: u16 = 526;
pub const DMA_WRITELIST_CMD: u16 = 527;
pub const DMA_WRITELIST_RSP: u16 = 528;
pub const TRACE_RT_CONFIG_CMD: u16 = 529;
pub const TRACE_RT_CONFIG_RSP: u16 = 530;
pub const TRACE_RT_CONTROL_CMD: u16 = 531;
pub const TRACE_RT_CONTROL_RSP: u16 = 532;
pub const CM_RESET_CMD: u16 = 533;
pub const CM_RESET_RSP: u16 = 534;
pub const DEVICE_FW_ERROR: u16 = 535;
pub const TRACE_BUFFER_FULL_EVENT: u16 = 536;
pub const P2PDMA_READLIST_CMD: u16 = 537;
pub const P2PDMA_READLIST_RSP: u16 = 538;
pub const P2PDMA_WRITELIST_CMD: u16 = 539;
pub const P2PDMA_WRITELIST_RSP: u16 = 540;

/// All ids owned by the compute API.
pub const OPS_IDS: RangeInclusive<u16> = 512..=1023;

/// Commands whose payload is a DMA list.
pub const fn is_dma(msg_id: u16) -> bool {
    matches!(
        msg_id,
        DMA_READLIST_CMD | DMA_WRITELIST_CMD | P2PDMA_READLIST_CMD | P2PDMA_WRITELIST_CMD
    )
}

/// Unsolicited messages on the compute CQ.
pub const fn is_event(msg_id: u16) -> bool {
    matches!(msg_id, DEVICE_FW_ERROR | TRACE_BUFFER_FULL_EVENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_commands_are_flagged() {
        assert!(is_dma(DMA_READLIST_CMD));
        assert!(is_dma(P2PDMA_WRITELIST_CMD));
        assert!(!is_dma(DMA_READLIST_RSP));
        assert!(!is_dma(KERNEL_LAUNCH_CMD));
    }

    #[test]
    fn events_are_not_responses() {
        assert!(is_event(DEVICE_FW_ERROR));
        assert!(!is_event(ECHO_RSP));
    }
}

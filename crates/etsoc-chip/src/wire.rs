//! Message headers exchanged over both channels.
//!
//! Every frame starts with the same 8-byte common header. `size` counts the
//! bytes that follow the common header, so a reader can pop the header,
//! validate `size` and then pop exactly that many more bytes.
//!
//! ```text
//! common    +0 size u16 | +2 tag_id u16 | +4 msg_id u16 | +6 flags u16
//! response  common | +8 device_latency_usec u64 | +16 status u32 | +20 reserved u32 | payload
//! event     common | +8 session_id u32 | +12 source u16 | +14 severity u16 | payload
//! ```
//!
//! Commands carry their payload directly after the common header.

/// Size of [`CommonHeader`].
pub const COMMON_HEADER_SIZE: usize = 8;

/// Size of a full [`ResponseHeader`].
pub const RESPONSE_HEADER_SIZE: usize = 24;

/// Size of a full [`EventHeader`].
pub const EVENT_HEADER_SIZE: usize = 16;

/// Ask firmware to finish earlier commands on the queue first.
pub const CMD_FLAG_BARRIER: u16 = 1 << 0;

/// Response status: command completed.
pub const STATUS_SUCCESS: u32 = 0;

/// Response status: command failed on the device.
pub const STATUS_ERROR: u32 = 1;

/// Header shared by commands, responses and events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonHeader {
    /// Bytes following this header.
    pub size: u16,
    /// Correlation tag (zero for events).
    pub tag_id: u16,
    /// Message id.
    pub msg_id: u16,
    /// Command flags; reserved in responses and events.
    pub flags: u16,
}

impl CommonHeader {
    /// Decode from the first 8 bytes.
    pub fn decode(b: &[u8]) -> Option<Self> {
        let word = |at: usize| -> Option<u16> {
            Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
        };
        Some(Self {
            size: word(0)?,
            tag_id: word(2)?,
            msg_id: word(4)?,
            flags: word(6)?,
        })
    }

    /// Encode as 8 little-endian bytes.
    pub fn encode(&self) -> [u8; COMMON_HEADER_SIZE] {
        let mut out = [0u8; COMMON_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.size.to_le_bytes());
        out[2..4].copy_from_slice(&self.tag_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.msg_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Header size plus `size`.
    pub const fn frame_len(&self) -> usize {
        COMMON_HEADER_SIZE + self.size as usize
    }
}

/// Header of a correlated response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Common part; `size` includes the 16 extension bytes.
    pub common: CommonHeader,
    /// Time the device spent on the command.
    pub device_latency_usec: u64,
    /// [`STATUS_SUCCESS`] or a device error code.
    pub status: u32,
}

impl ResponseHeader {
    /// Decode from the first 24 bytes.
    pub fn decode(b: &[u8]) -> Option<Self> {
        let common = CommonHeader::decode(b)?;
        if usize::from(common.size) < RESPONSE_HEADER_SIZE - COMMON_HEADER_SIZE {
            return None;
        }
        Some(Self {
            common,
            device_latency_usec: u64::from_le_bytes(b.get(8..16)?.try_into().ok()?),
            status: u32::from_le_bytes(b.get(16..20)?.try_into().ok()?),
        })
    }

    /// Encode as 24 little-endian bytes.
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.common.encode());
        out[8..16].copy_from_slice(&self.device_latency_usec.to_le_bytes());
        out[16..20].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    /// Payload bytes after the full response header.
    pub const fn payload_len(&self) -> usize {
        self.common.frame_len() - RESPONSE_HEADER_SIZE
    }
}

/// Header of a device-initiated event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventHeader {
    /// Common part; `tag_id` carries no meaning.
    pub common: CommonHeader,
    /// Firmware session that raised the event.
    pub session_id: u32,
    /// Originating unit (0 service processor, 1 master minion).
    pub source: u16,
    /// Severity class as reported by firmware.
    pub severity: u16,
}

impl EventHeader {
    /// Decode from the first 16 bytes.
    pub fn decode(b: &[u8]) -> Option<Self> {
        let common = CommonHeader::decode(b)?;
        if usize::from(common.size) < EVENT_HEADER_SIZE - COMMON_HEADER_SIZE {
            return None;
        }
        Some(Self {
            common,
            session_id: u32::from_le_bytes(b.get(8..12)?.try_into().ok()?),
            source: u16::from_le_bytes(b.get(12..14)?.try_into().ok()?),
            severity: u16::from_le_bytes(b.get(14..16)?.try_into().ok()?),
        })
    }

    /// Encode as 16 little-endian bytes.
    pub fn encode(&self) -> [u8; EVENT_HEADER_SIZE] {
        let mut out = [0u8; EVENT_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.common.encode());
        out[8..12].copy_from_slice(&self.session_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.source.to_le_bytes());
        out[14..16].copy_from_slice(&self.severity.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_header_is_little_endian() {
        let h = CommonHeader {
            size: 0x0102,
            tag_id: 0x0304,
            msg_id: 0x0506,
            flags: CMD_FLAG_BARRIER,
        };
        assert_eq!(h.encode(), [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x01, 0x00]);
        assert_eq!(h.frame_len(), 8 + 0x0102);
    }

    #[test]
    fn response_header_requires_extension() {
        let short = CommonHeader {
            size: 4,
            ..CommonHeader::default()
        }
        .encode();
        let mut buf = short.to_vec();
        buf.resize(RESPONSE_HEADER_SIZE, 0);
        assert!(ResponseHeader::decode(&buf).is_none());
    }

    #[test]
    fn response_payload_len_excludes_extension() {
        let h = ResponseHeader {
            common: CommonHeader {
                size: 16 + 5,
                tag_id: 9,
                msg_id: 30,
                flags: 0,
            },
            device_latency_usec: 77,
            status: STATUS_ERROR,
        };
        let decoded = ResponseHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.payload_len(), 5);
    }

    #[test]
    fn decoders_reject_truncated_input() {
        assert!(CommonHeader::decode(&[0u8; 7]).is_none());
        assert!(EventHeader::decode(&[0u8; 15]).is_none());
    }
}

//! Frame encoding and decoding.
//!
//! Header layouts live in [`etsoc_chip::wire`]; this module builds whole
//! frames and classifies what comes back from a completion queue.

use bytes::{BufMut, Bytes, BytesMut};
use etsoc_chip::wire::{
    CommonHeader, EventHeader, ResponseHeader, COMMON_HEADER_SIZE, EVENT_HEADER_SIZE,
    RESPONSE_HEADER_SIZE,
};

use crate::error::{EtError, Result};

/// A correlated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Decoded header
    pub header: ResponseHeader,
    /// Bytes after the response header
    pub payload: Bytes,
}

impl Response {
    /// Correlation tag
    pub const fn tag(&self) -> u16 {
        self.header.common.tag_id
    }
}

/// A device-initiated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Decoded header
    pub header: EventHeader,
    /// Bytes after the event header
    pub payload: Bytes,
}

impl Event {
    /// Event id
    pub const fn msg_id(&self) -> u16 {
        self.header.common.msg_id
    }
}

/// Anything popped from a completion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Reply to a command
    Response(Response),
    /// Unsolicited device message
    Event(Event),
}

fn frame_size(extension: usize, payload: usize) -> Result<u16> {
    u16::try_from(extension + payload).map_err(|_| {
        EtError::invalid_argument(format!("payload of {payload} bytes does not fit a frame"))
    })
}

/// Build a command frame: common header followed by `payload`.
///
/// # Errors
///
/// Returns `InvalidArgument` if the payload exceeds the 16-bit size field.
pub fn encode_command(tag_id: u16, msg_id: u16, flags: u16, payload: &[u8]) -> Result<Bytes> {
    let header = CommonHeader {
        size: frame_size(0, payload.len())?,
        tag_id,
        msg_id,
        flags,
    };
    let mut buf = BytesMut::with_capacity(COMMON_HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build a response frame.
///
/// # Errors
///
/// Returns `InvalidArgument` if the payload exceeds the 16-bit size field.
pub fn encode_response(
    tag_id: u16,
    msg_id: u16,
    status: u32,
    device_latency_usec: u64,
    payload: &[u8],
) -> Result<Bytes> {
    let header = ResponseHeader {
        common: CommonHeader {
            size: frame_size(RESPONSE_HEADER_SIZE - COMMON_HEADER_SIZE, payload.len())?,
            tag_id,
            msg_id,
            flags: 0,
        },
        device_latency_usec,
        status,
    };
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build an event frame. `tag_id` is carried verbatim and means nothing.
///
/// # Errors
///
/// Returns `InvalidArgument` if the payload exceeds the 16-bit size field.
pub fn encode_event(tag_id: u16, msg_id: u16, session_id: u32, payload: &[u8]) -> Result<Bytes> {
    let header = EventHeader {
        common: CommonHeader {
            size: frame_size(EVENT_HEADER_SIZE - COMMON_HEADER_SIZE, payload.len())?,
            tag_id,
            msg_id,
            flags: 0,
        },
        session_id,
        source: 0,
        severity: 0,
    };
    let mut buf = BytesMut::with_capacity(EVENT_HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a complete frame popped from a completion queue.
///
/// `is_event` decides by message id whether the frame is an event; the tag
/// is never consulted for that decision.
///
/// # Errors
///
/// Returns `Protocol` if the frame is shorter than its header claims or
/// too short for the header kind.
pub fn decode_message(frame: Bytes, is_event: impl Fn(u16) -> bool) -> Result<Message> {
    let common = CommonHeader::decode(&frame)
        .ok_or_else(|| EtError::protocol(format!("frame of {} bytes has no header", frame.len())))?;
    if frame.len() != common.frame_len() {
        return Err(EtError::protocol(format!(
            "frame is {} bytes but header declares {}",
            frame.len(),
            common.frame_len()
        )));
    }
    if is_event(common.msg_id) {
        let header = EventHeader::decode(&frame).ok_or_else(|| {
            EtError::protocol(format!("event {} shorter than its header", common.msg_id))
        })?;
        Ok(Message::Event(Event {
            header,
            payload: frame.slice(EVENT_HEADER_SIZE..),
        }))
    } else {
        let header = ResponseHeader::decode(&frame).ok_or_else(|| {
            EtError::protocol(format!("response {} shorter than its header", common.msg_id))
        })?;
        Ok(Message::Response(Response {
            header,
            payload: frame.slice(RESPONSE_HEADER_SIZE..),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etsoc_chip::mgmt;

    #[test]
    fn command_size_counts_payload_only() {
        let frame = encode_command(7, mgmt::id::SET_FRU, 0, &[1, 2, 3]).unwrap();
        assert_eq!(frame.len(), 11);
        let header = CommonHeader::decode(&frame).unwrap();
        assert_eq!(header.size, 3);
        assert_eq!(header.tag_id, 7);
    }

    #[test]
    fn response_decodes_with_payload() {
        let frame = encode_response(3, mgmt::id::GET_MODULE_UPTIME, 0, 42, &[9; 8]).unwrap();
        let Message::Response(rsp) = decode_message(frame, mgmt::is_event).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(rsp.tag(), 3);
        assert_eq!(rsp.header.device_latency_usec, 42);
        assert_eq!(rsp.payload.as_ref(), &[9; 8]);
    }

    #[test]
    fn event_range_wins_over_tag() {
        let frame = encode_event(3, mgmt::EVENT_SP_TRACE_BUFFER_FULL, 1, b"full").unwrap();
        let msg = decode_message(frame, mgmt::is_event).unwrap();
        assert!(matches!(msg, Message::Event(ev) if ev.payload.as_ref() == b"full"));
    }

    #[test]
    fn truncated_frame_is_protocol_fault() {
        let frame = encode_response(1, 2, 0, 0, &[0; 4]).unwrap();
        let short = frame.slice(..frame.len() - 1);
        assert!(matches!(
            decode_message(short, mgmt::is_event),
            Err(EtError::Protocol { .. })
        ));
    }

    #[test]
    fn response_without_extension_is_rejected() {
        let frame = encode_command(1, mgmt::id::GET_MODULE_UPTIME, 0, &[0; 4]).unwrap();
        assert!(decode_message(frame, mgmt::is_event).is_err());
    }
}

//! On-wire framing for ZMQ: each logical message is two ZMQ frames, a fixed
//! header followed by the serialized payload, mirroring
//! `struct pubsub_msg_header` from the original admin. The header's topic
//! field starts the frame so a subscriber's ZMQ subscription filter (a raw
//! byte prefix) matches the topic name directly, without needing to parse
//! anything first.

use pubsub_types::{MsgVersion, PsError, PsResult};

/// Capped well below the original's 1024 bytes: topic names in practice
/// are short, and a smaller fixed field means less wasted bandwidth per
/// message without changing the prefix-match property subscriptions rely
/// on.
pub const MAX_TOPIC_LEN: usize = 256;
const TYPE_OFFSET: usize = MAX_TOPIC_LEN;
const MAJOR_OFFSET: usize = TYPE_OFFSET + 4;
const MINOR_OFFSET: usize = MAJOR_OFFSET + 1;
pub const HEADER_SIZE: usize = MINOR_OFFSET + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZmqHeader {
    pub msg_type_id: u32,
    pub version: MsgVersion,
}

/// Builds the header frame: `topic` zero-padded into the first
/// `MAX_TOPIC_LEN` bytes, followed by `msg_type_id` and `(major, minor)`.
pub fn header_frame(topic: &str, msg_type_id: u32, version: MsgVersion) -> PsResult<Vec<u8>> {
    let topic_bytes = topic.as_bytes();
    if topic_bytes.len() >= MAX_TOPIC_LEN {
        return Err(PsError::IllegalArgument(format!(
            "topic '{topic}' exceeds the {MAX_TOPIC_LEN}-byte header field"
        )));
    }
    let mut buf = vec![0u8; HEADER_SIZE];
    buf[..topic_bytes.len()].copy_from_slice(topic_bytes);
    buf[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&msg_type_id.to_le_bytes());
    buf[MAJOR_OFFSET] = version.0;
    buf[MINOR_OFFSET] = version.1;
    Ok(buf)
}

/// Extracts `msg_type_id`/`version` from a received header frame. The topic
/// itself is not recovered here — the subscription already knows which
/// topic it subscribed to via the ZMQ filter.
pub fn parse_header(buf: &[u8]) -> PsResult<ZmqHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(PsError::IllegalArgument("zmq header frame truncated".into()));
    }
    let msg_type_id = u32::from_le_bytes(buf[TYPE_OFFSET..TYPE_OFFSET + 4].try_into().unwrap());
    let version = (buf[MAJOR_OFFSET], buf[MINOR_OFFSET]);
    Ok(ZmqHeader {
        msg_type_id,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let frame = header_frame("sensors.temp", 7, (2, 1)).unwrap();
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.msg_type_id, 7);
        assert_eq!(header.version, (2, 1));
    }

    #[test]
    fn topic_prefix_is_at_frame_start() {
        let frame = header_frame("abc", 1, (1, 0)).unwrap();
        assert_eq!(&frame[0..3], b"abc");
    }

    #[test]
    fn oversized_topic_is_rejected() {
        let topic = "x".repeat(MAX_TOPIC_LEN);
        assert!(header_frame(&topic, 1, (1, 0)).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(parse_header(&[0u8; 4]).is_err());
    }
}

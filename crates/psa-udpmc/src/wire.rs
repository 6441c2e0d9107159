//! On-wire framing for one UDP multicast datagram's payload, once
//! [`large_udp::LargeUdp`] has already reassembled the raw bytes.
//!
//! Carries the same `{topic, type, major, minor}{payload_size}{payload}`
//! fixed header spec.md §4.2/§6 mandates for every transport — the topic
//! field is NUL-padded the same way `psa-zmq`'s header frame is, and for
//! the same reason: 1024 bytes per message is wasted bandwidth for topic
//! names that are realistically under 256 bytes, while the prefix-match
//! property that field exists for isn't something UDP-MC relies on (there's
//! no subscription filter here — connect/bind already scope a socket to one
//! topic). `payload_size` is redundant with `LargeUdp`'s own exact-sized
//! reassembly buffer but is still carried on the wire, matching spec.md §6.

use pubsub_types::{MsgVersion, PsError, PsResult};

/// Capped well below the original's 1024 bytes, mirroring `psa-zmq::wire`'s
/// topic field shrink.
pub const MAX_TOPIC_LEN: usize = 256;
const TYPE_OFFSET: usize = MAX_TOPIC_LEN;
const MAJOR_OFFSET: usize = TYPE_OFFSET + 4;
const MINOR_OFFSET: usize = MAJOR_OFFSET + 1;
const PAYLOAD_SIZE_OFFSET: usize = MINOR_OFFSET + 1;
pub const HEADER_SIZE: usize = PAYLOAD_SIZE_OFFSET + 4;

/// Fixed header: `topic[MAX_TOPIC_LEN]` NUL-padded, a stable message-type
/// id, the sender's `(major, minor)` version, and the payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    pub topic: String,
    pub msg_type_id: u32,
    pub version: MsgVersion,
    pub payload_size: u32,
}

impl WireHeader {
    pub fn to_bytes(&self) -> PsResult<Vec<u8>> {
        let topic_bytes = self.topic.as_bytes();
        if topic_bytes.len() >= MAX_TOPIC_LEN {
            return Err(PsError::IllegalArgument(format!(
                "topic '{}' exceeds the {MAX_TOPIC_LEN}-byte header field",
                self.topic
            )));
        }
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..topic_bytes.len()].copy_from_slice(topic_bytes);
        buf[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&self.msg_type_id.to_ne_bytes());
        buf[MAJOR_OFFSET] = self.version.0;
        buf[MINOR_OFFSET] = self.version.1;
        buf[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 4]
            .copy_from_slice(&self.payload_size.to_ne_bytes());
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> PsResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(PsError::IllegalArgument("wire header truncated".into()));
        }
        let topic_end = buf[..MAX_TOPIC_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_TOPIC_LEN);
        let topic = String::from_utf8_lossy(&buf[..topic_end]).into_owned();
        let msg_type_id = u32::from_ne_bytes(buf[TYPE_OFFSET..TYPE_OFFSET + 4].try_into().unwrap());
        let version = (buf[MAJOR_OFFSET], buf[MINOR_OFFSET]);
        let payload_size = u32::from_ne_bytes(
            buf[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        Ok(WireHeader {
            topic,
            msg_type_id,
            version,
            payload_size,
        })
    }
}

/// Prefixes `payload` with a `WireHeader` for `topic`/`msg_type_id`/`version`.
pub fn frame(topic: &str, msg_type_id: u32, version: MsgVersion, payload: &[u8]) -> PsResult<Vec<u8>> {
    let header = WireHeader {
        topic: topic.to_string(),
        msg_type_id,
        version,
        payload_size: payload.len() as u32,
    };
    let mut out = header.to_bytes()?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Splits a reassembled datagram back into its header and payload, checked
/// against the header's own declared `payload_size`.
pub fn unframe(buf: &[u8]) -> PsResult<(WireHeader, &[u8])> {
    let header = WireHeader::from_bytes(buf)?;
    let body = &buf[HEADER_SIZE..];
    if body.len() != header.payload_size as usize {
        return Err(PsError::IllegalArgument(format!(
            "frame declares payload_size {} but carries {} bytes",
            header.payload_size,
            body.len()
        )));
    }
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let payload = b"hello world";
        let wire = frame("s:t", 42, (1, 3), payload).unwrap();
        let (header, body) = unframe(&wire).unwrap();
        assert_eq!(header.topic, "s:t");
        assert_eq!(header.msg_type_id, 42);
        assert_eq!(header.version, (1, 3));
        assert_eq!(header.payload_size, payload.len() as u32);
        assert_eq!(body, payload);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(WireHeader::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn oversized_topic_is_rejected() {
        let topic = "x".repeat(MAX_TOPIC_LEN);
        assert!(frame(&topic, 1, (1, 0), b"x").is_err());
    }

    #[test]
    fn payload_size_mismatch_is_rejected() {
        let mut wire = frame("s:t", 1, (1, 0), b"hello").unwrap();
        wire.truncate(wire.len() - 1);
        assert!(unframe(&wire).is_err());
    }
}

//! Wire shapes for the control datagram (§6): an 8-byte `{descriptor_offset
//! u64}` request, exactly as specified, plus one addition this port needs
//! that the original gets for free from System V `shmget`'s integer ids —
//! an out-of-band "attach" datagram that tells the server which named
//! POSIX arena a peer's subsequent request offsets refer to. A real
//! deployment sends this once per `rsaShmClientManager_createOrAttachClient`
//! call, not per request.

pub const ATTACH_TAG: u32 = u32::MAX;

pub enum ControlMessage {
    Attach { arena_name: String },
    Request { descriptor_offset: u64 },
}

pub fn encode_request(descriptor_offset: u64) -> [u8; 8] {
    descriptor_offset.to_ne_bytes()
}

pub fn encode_attach(arena_name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + arena_name.len());
    buf.extend_from_slice(&ATTACH_TAG.to_ne_bytes());
    buf.extend_from_slice(&(arena_name.len() as u32).to_ne_bytes());
    buf.extend_from_slice(arena_name.as_bytes());
    buf
}

/// A request datagram is always exactly 8 bytes; an attach datagram is
/// always longer (a 4-byte tag, a 4-byte name length, and at least one byte
/// of name), so the two never collide regardless of the offset's value.
pub fn decode(buf: &[u8]) -> Option<ControlMessage> {
    if buf.len() == 8 {
        return Some(ControlMessage::Request {
            descriptor_offset: u64::from_ne_bytes(buf.try_into().ok()?),
        });
    }
    if buf.len() > 8 {
        let tag = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
        if tag != ATTACH_TAG {
            return None;
        }
        let name_len = u32::from_ne_bytes(buf[4..8].try_into().ok()?) as usize;
        let name_bytes = buf.get(8..8 + name_len)?;
        let arena_name = String::from_utf8(name_bytes.to_vec()).ok()?;
        return Some(ControlMessage::Attach { arena_name });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips() {
        let buf = encode_request(0x1122_3344_5566_7788);
        match decode(&buf) {
            Some(ControlMessage::Request { descriptor_offset }) => {
                assert_eq!(descriptor_offset, 0x1122_3344_5566_7788)
            }
            _ => panic!("expected a request message"),
        }
    }

    #[test]
    fn attach_roundtrips() {
        let buf = encode_attach("/rsa-shm-42");
        match decode(&buf) {
            Some(ControlMessage::Attach { arena_name }) => assert_eq!(arena_name, "/rsa-shm-42"),
            _ => panic!("expected an attach message"),
        }
    }
}

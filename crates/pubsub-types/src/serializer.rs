use crate::error::PsResult;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// `(major, minor)` message version, compared on receive per the
/// compatibility rule in [`crate::version_compatible`].
pub type MsgVersion = (u8, u8);

type SerializeFn = Box<dyn Fn(&(dyn Any + Send)) -> PsResult<Vec<u8>> + Send + Sync>;
type DeserializeFn = Box<dyn Fn(&[u8]) -> PsResult<Box<dyn Any + Send>> + Send + Sync>;
type FreeMsgFn = Box<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// One entry of a [`SerializerMap`]: the encode/decode/free trio the
/// serializer collaborator supplies for a single message type.
pub struct MsgEntry {
    pub msg_name: String,
    pub msg_version: MsgVersion,
    pub serialize: SerializeFn,
    pub deserialize: DeserializeFn,
    pub free_msg: FreeMsgFn,
}

impl fmt::Debug for MsgEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgEntry")
            .field("msg_name", &self.msg_name)
            .field("msg_version", &self.msg_version)
            .finish_non_exhaustive()
    }
}

/// A per-`(serializer, bundle)` table mapping message-type id to its
/// serialize/deserialize/free callbacks. One map is materialized whenever a
/// bundle first needs a serializer; it is released on bundle unload.
#[derive(Default)]
pub struct SerializerMap {
    entries: HashMap<u32, MsgEntry>,
}

impl SerializerMap {
    pub fn new() -> Self {
        SerializerMap::default()
    }

    pub fn insert(&mut self, msg_type_id: u32, entry: MsgEntry) {
        self.entries.insert(msg_type_id, entry);
    }

    pub fn get(&self, msg_type_id: u32) -> Option<&MsgEntry> {
        self.entries.get(&msg_type_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The serializer collaborator's contract (§6): create/destroy a bundle's
/// map of known message types, plus a stable type name.
pub trait Serializer: Send + Sync {
    /// A short identifier such as `"json"`, matched against
    /// `endpoint.pubsub.serializer`.
    fn serializer_type(&self) -> &str;

    /// Builds the `SerializerMap` for one consuming bundle. `bundle_id` is
    /// only used to key the result in the caller; this crate does not
    /// enforce bundle lifecycle itself.
    fn create_serializer_map(&self, bundle_id: u64) -> PsResult<SerializerMap>;
}

/// Major must match exactly; the sender's minor must be greater than or
/// equal to the receiver's (a newer sender may add optional fields a older
/// receiver ignores, but an older sender cannot satisfy a receiver that
/// expects fields it doesn't send).
pub fn version_compatible(sender: MsgVersion, receiver: MsgVersion) -> bool {
    sender.0 == receiver.0 && sender.1 >= receiver.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_mismatch_is_incompatible() {
        assert!(!version_compatible((2, 0), (1, 0)));
    }

    #[test]
    fn sender_minor_greater_or_equal_is_compatible() {
        assert!(version_compatible((1, 2), (1, 1)));
        assert!(version_compatible((1, 1), (1, 1)));
        assert!(!version_compatible((1, 0), (1, 1)));
    }
}

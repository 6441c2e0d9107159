//! A minimal `Serializer` for the bootstrap binary: messages are treated as
//! opaque `Vec<u8>`, registered under the single message type name `"bytes"`.
//! Real wire encoding is out of this core's scope (spec.md §1's "serializer
//! implementation" non-goal); this exists only so the demo binary has
//! *something* to hand `psa-core`, the same role `NullSerializer` plays in
//! `psa-core`'s own tests.

use std::any::Any;

use pubsub_types::{msg_type_id_for_name, MsgEntry, PsError, PsResult, Serializer, SerializerMap};

pub const BYTES_MSG_NAME: &str = "bytes";

pub struct BytesSerializer;

impl Serializer for BytesSerializer {
    fn serializer_type(&self) -> &str {
        "bytes"
    }

    fn create_serializer_map(&self, _bundle_id: u64) -> PsResult<SerializerMap> {
        let mut map = SerializerMap::new();
        map.insert(
            msg_type_id_for_name(BYTES_MSG_NAME),
            MsgEntry {
                msg_name: BYTES_MSG_NAME.to_string(),
                msg_version: (1, 0),
                serialize: Box::new(|msg: &(dyn Any + Send)| {
                    msg.downcast_ref::<Vec<u8>>()
                        .cloned()
                        .ok_or_else(|| PsError::IllegalArgument("expected a Vec<u8> message".into()))
                }),
                deserialize: Box::new(|bytes: &[u8]| Ok(Box::new(bytes.to_vec()) as Box<dyn Any + Send>)),
                free_msg: Box::new(|_msg| {}),
            },
        );
        Ok(map)
    }
}

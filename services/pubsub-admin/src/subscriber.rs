//! A logging-only `Subscriber`, the bootstrap binary's stand-in for a real
//! consumer bundle: it just reports what arrived.

use std::any::Any;

use pubsub_types::{PsResult, ScopeTopicKey, Subscriber};

pub struct LoggingSubscriber {
    key: ScopeTopicKey,
}

impl LoggingSubscriber {
    pub fn new(key: ScopeTopicKey) -> Self {
        LoggingSubscriber { key }
    }
}

impl Subscriber for LoggingSubscriber {
    fn receive(
        &self,
        msg_name: &str,
        msg_type_id: u32,
        msg_inst: Box<dyn Any + Send>,
        release: &mut bool,
    ) -> PsResult<()> {
        let len = msg_inst.downcast_ref::<Vec<u8>>().map(Vec::len);
        tracing::debug!(
            topic = %self.key,
            msg_name,
            msg_type_id,
            payload_len = ?len,
            "pubsub-admin: message received"
        );
        *release = false;
        Ok(())
    }
}

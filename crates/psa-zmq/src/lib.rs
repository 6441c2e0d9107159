//! ZeroMQ pubsub admin: a [`psa_core::TransportFactory`] built on `PUB`/`SUB`
//! sockets, adding multipart send/receive (§4.2-4.3) that UDP-MC can't offer.

mod publication;
mod socket;
mod subscription;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use pubsub_types::{keys, Endpoint, PsResult, PsaUdpMcConfig, ScopeTopicKey, Serializer};

pub use publication::TopicPublication;
pub use subscription::TopicSubscription;

use psa_core::{TopicPublicationHandle, TopicSubscriptionHandle, TransportFactory};

pub const ADMIN_TYPE: &str = "zmq";

/// Builds `TopicPublication`/`TopicSubscription` instances bound to one
/// shared `zmq::Context`, with ports drawn from `PSA_ZMQ_BASE_PORT`..
/// `PSA_ZMQ_MAX_PORT` and receives polled every
/// `PSA_ZMQ_RECEIVE_TIMEOUT_MICROSEC`.
pub struct ZmqTransportFactory {
    ctx: zmq::Context,
    config: PsaUdpMcConfig,
    advertise_host: String,
}

impl ZmqTransportFactory {
    pub fn new(config: PsaUdpMcConfig, advertise_host: String) -> Self {
        ZmqTransportFactory {
            ctx: zmq::Context::new(),
            config,
            advertise_host,
        }
    }
}

impl TransportFactory for ZmqTransportFactory {
    fn admin_type(&self) -> &str {
        ADMIN_TYPE
    }

    fn create_publication(
        &self,
        key: &ScopeTopicKey,
        ep: &Endpoint,
        serializer: Arc<dyn Serializer>,
        serializer_type: &str,
    ) -> PsResult<(Arc<dyn TopicPublicationHandle>, Endpoint)> {
        let (socket, port, url) = socket::open_pub_socket(
            &self.ctx,
            &self.advertise_host,
            self.config.zmq_base_port,
            self.config.zmq_max_port,
        )?;
        tracing::info!(topic = %key, %url, "psa-zmq: opened publication socket");

        let mut stamped = ep.clone();
        stamped.set(keys::ENDPOINT_URL, url.clone());
        stamped.set(keys::UDPMC_SOCKET_PORT, port.to_string());
        stamped.set(keys::ADMIN_TYPE, ADMIN_TYPE);
        stamped.set(keys::SERIALIZER_TYPE, serializer_type);

        let publication = TopicPublication::new(socket, url, serializer, stamped.clone());
        Ok((Arc::new(publication), stamped))
    }

    fn create_subscription(
        &self,
        key: &ScopeTopicKey,
        serializer: Arc<dyn Serializer>,
    ) -> PsResult<Arc<dyn TopicSubscriptionHandle>> {
        let topic_prefix: Vec<u8> = if *key == ScopeTopicKey::wildcard() {
            Vec::new()
        } else {
            key.topic().as_bytes().to_vec()
        };
        let socket = socket::open_sub_socket(&self.ctx, &topic_prefix)?;

        let receive_timeout =
            Duration::from_micros(self.config.zmq_receive_timeout_micros.max(1));
        let subscription = TopicSubscription::new(socket, serializer, receive_timeout)?;
        subscription.start()?;
        tracing::info!(topic = %key, "psa-zmq: started subscription receive thread");
        Ok(Arc::new(subscription))
    }
}

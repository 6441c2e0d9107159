//! UDP multicast pubsub admin: a [`psa_core::TransportFactory`] that moves
//! single-part messages over raw multicast sockets, chunked through
//! `large_udp` when they exceed one datagram (§4).

mod ifaddr;
mod publication;
mod socket;
mod subscription;
mod wire;

use std::net::SocketAddrV4;
use std::sync::Arc;

use pubsub_types::{keys, Endpoint, PsResult, PsaUdpMcConfig, ScopeTopicKey, Serializer};

pub use publication::TopicPublication;
pub use subscription::TopicSubscription;

use psa_core::{TopicPublicationHandle, TopicSubscriptionHandle, TransportFactory};

pub const ADMIN_TYPE: &str = "udp_mc";

/// Builds `TopicPublication`/`TopicSubscription` instances bound to the
/// interface resolved once at construction time from `PSA_IP`/`PSA_INTERFACE`.
pub struct UdpMcTransportFactory {
    config: PsaUdpMcConfig,
    interface_ip: std::net::Ipv4Addr,
}

impl UdpMcTransportFactory {
    pub fn new(config: PsaUdpMcConfig) -> Self {
        let interface_ip =
            ifaddr::resolve_interface_ip(config.interface.as_deref(), config.ip.as_deref());
        UdpMcTransportFactory {
            config,
            interface_ip,
        }
    }
}

impl TransportFactory for UdpMcTransportFactory {
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
        let group = ifaddr::derive_multicast_group(&self.config.mc_prefix, self.interface_ip);
        let (fd, port) = socket::open_send_socket(
            self.interface_ip,
            self.config.zmq_base_port,
            self.config.zmq_max_port,
        )?;
        let dest_addr = SocketAddrV4::new(group, port);
        let url = format!("udp://{group}:{port}");
        tracing::info!(topic = %key, %url, "psa-udpmc: opened publication socket");

        let mut stamped = ep.clone();
        stamped.set(keys::ENDPOINT_URL, url.clone());
        stamped.set(keys::UDPMC_SOCKET_ADDRESS, group.to_string());
        stamped.set(keys::UDPMC_SOCKET_PORT, port.to_string());
        stamped.set(keys::ADMIN_TYPE, ADMIN_TYPE);
        stamped.set(keys::SERIALIZER_TYPE, serializer_type);

        let publication = TopicPublication::new(fd, dest_addr, url, serializer, stamped.clone());
        Ok((Arc::new(publication), stamped))
    }

    fn create_subscription(
        &self,
        key: &ScopeTopicKey,
        serializer: Arc<dyn Serializer>,
    ) -> PsResult<Arc<dyn TopicSubscriptionHandle>> {
        let subscription = TopicSubscription::new(self.interface_ip, serializer)?;
        subscription.start()?;
        tracing::info!(topic = %key, "psa-udpmc: started subscription receive thread");
        Ok(Arc::new(subscription))
    }
}

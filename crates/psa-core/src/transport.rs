use std::sync::Arc;

use pubsub_types::{Endpoint, Publisher, PsResult, ScopeTopicKey, Serializer, Subscriber};

/// One admin's live send side for a scope/topic. Reference-counted:
/// multiple local publisher endpoints on the same key share one handle.
pub trait TopicPublicationHandle: Send + Sync {
    /// Stamped endpoint URL this publication sends to.
    fn url(&self) -> String;

    fn add_publisher_endpoint(&self, ep: Endpoint);
    fn remove_publisher_endpoint(&self, ep: &Endpoint);
    fn publisher_endpoint_count(&self) -> usize;

    /// The bundle-scoped send handle (§9 design notes): multiple bundles
    /// publishing on the same topic share the transport's one bound
    /// socket but each get their own serializer map and multipart state,
    /// keyed by an opaque `bundle_id` the caller supplies.
    fn publisher_for(&self, bundle_id: u64, topic: &str) -> PsResult<Arc<dyn Publisher>>;

    fn stop(&self);
}

/// One admin's live receive side for a scope/topic (or the wildcard key).
pub trait TopicSubscriptionHandle: Send + Sync {
    /// Registers the subscriber collaborator backing `ep`. The transport
    /// keeps `subscriber` around to invoke `receive` on the receive
    /// thread; the control plane itself never calls into it directly.
    fn add_subscriber(&self, ep: Endpoint, subscriber: Arc<dyn Subscriber>);
    fn remove_subscriber(&self, ep: &Endpoint);
    fn subscriber_count(&self) -> usize;

    /// Defers a connect to a newly known publisher URL to the receive
    /// thread's next pending-connections drain.
    fn enqueue_connect(&self, url: &str);
    /// Defers a disconnect in the same way.
    fn enqueue_disconnect(&self, url: &str);

    fn start(&self) -> PsResult<()>;
    fn stop(&self);
}

/// A wire transport's factory collaborator: builds the send/receive sides a
/// [`crate::PsaControlPlane`] drives, and names the admin type this
/// transport answers to in `matchEndpoint`.
pub trait TransportFactory: Send + Sync {
    fn admin_type(&self) -> &str;

    /// Creates (or would create) the send side for `key`, returning both the
    /// handle and the endpoint stamped with the chosen URL and serializer
    /// type, ready to be announced.
    fn create_publication(
        &self,
        key: &ScopeTopicKey,
        ep: &Endpoint,
        serializer: Arc<dyn Serializer>,
        serializer_type: &str,
    ) -> PsResult<(Arc<dyn TopicPublicationHandle>, Endpoint)>;

    fn create_subscription(
        &self,
        key: &ScopeTopicKey,
        serializer: Arc<dyn Serializer>,
    ) -> PsResult<Arc<dyn TopicSubscriptionHandle>>;
}

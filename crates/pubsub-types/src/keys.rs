//! Endpoint property keys consumed by the core (see the wire-format section
//! of the pubsub admin specification).

pub const FRAMEWORK_UUID: &str = "endpoint.framework.uuid";
pub const TOPIC_SCOPE: &str = "endpoint.scope";
pub const TOPIC_NAME: &str = "endpoint.topic";
pub const ENDPOINT_ID: &str = "endpoint.id";
pub const ENDPOINT_TYPE: &str = "endpoint.type";
pub const ADMIN_TYPE: &str = "pubsub.config";
pub const SERIALIZER_TYPE: &str = "pubsub.serializer";
pub const ENDPOINT_URL: &str = "endpoint.url";
pub const UDPMC_SOCKET_ADDRESS: &str = "udpmc.socket_address";
pub const UDPMC_SOCKET_PORT: &str = "udpmc.socket_port";
pub const SHM_SERVER_NAME: &str = "celix.remote.admin.shm.server_name";
pub const SHM_RPC_TYPE: &str = "celix.remote.admin.shm.rpc_type";

pub const ENDPOINT_TYPE_PUBLISHER: &str = "pubsub.publisher";
pub const ENDPOINT_TYPE_SUBSCRIBER: &str = "pubsub.subscriber";

/// Wildcard topic name for a subscription that receives every topic a PSA
/// knows about.
pub const ANY_TOPIC: &str = "any";

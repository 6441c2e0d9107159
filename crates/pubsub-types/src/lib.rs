//! Shared data model for the pubsub admin stack: endpoints, the
//! `ScopeTopicKey` wiring key, serializer/subscriber/publisher contracts,
//! and the environment-driven configuration every transport admin reads.

mod config;
mod endpoint;
mod error;
mod hash;
pub mod keys;
mod pubsub;
mod serializer;

pub use config::{PsaUdpMcConfig, RsaShmConfig};
pub use endpoint::{Endpoint, EndpointType, ScopeTopicKey};
pub use error::{PsError, PsResult};
pub use hash::msg_type_id_for_name;
pub use pubsub::{MultipartFlags, Publisher, Subscriber};
pub use serializer::{version_compatible, MsgEntry, MsgVersion, Serializer, SerializerMap};

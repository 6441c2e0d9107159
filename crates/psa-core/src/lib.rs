//! Transport-agnostic publish/subscribe admin control plane: the
//! bookkeeping a concrete transport (UDP multicast, ZMQ, ...) shares
//! regardless of how bytes actually move on the wire.

mod control_plane;
mod transport;

pub use control_plane::{add_endpoint, MatchScoring, PsaControlPlane};
pub use transport::{TopicPublicationHandle, TopicSubscriptionHandle, TransportFactory};

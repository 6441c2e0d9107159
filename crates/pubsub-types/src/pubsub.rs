use crate::error::PsResult;
use std::any::Any;
use std::ops::BitOr;

/// ZMQ multipart send flags. A bundle-scoped publisher must issue exactly
/// one `FIRST`, zero-or-more `PART`, and one `LAST` before starting another
/// multipart message; violations are `PsError::IllegalState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartFlags(u8);

impl MultipartFlags {
    pub const FIRST: MultipartFlags = MultipartFlags(0b001);
    pub const PART: MultipartFlags = MultipartFlags(0b010);
    pub const LAST: MultipartFlags = MultipartFlags(0b100);

    pub fn contains(self, other: MultipartFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MultipartFlags {
    type Output = MultipartFlags;
    fn bitor(self, rhs: MultipartFlags) -> MultipartFlags {
        MultipartFlags(self.0 | rhs.0)
    }
}

/// Per-bundle publisher capability exposed by a `TopicPublication`.
pub trait Publisher: Send + Sync {
    /// Stable hash of `msg_type_name`, the same function the serializer
    /// uses to key its [`crate::SerializerMap`].
    fn local_msg_type_id_for_msg_type(&self, msg_type_name: &str) -> u32 {
        crate::hash::msg_type_id_for_name(msg_type_name)
    }

    /// Single-part send.
    fn send(&self, msg_type_id: u32, msg: &(dyn Any + Send)) -> PsResult<()>;

    /// ZMQ-only multipart send. Transports that don't support multipart
    /// (UDP-MC) return `PsError::IllegalState` unconditionally.
    fn send_multipart(
        &self,
        msg_type_id: u32,
        msg: &(dyn Any + Send),
        flags: MultipartFlags,
    ) -> PsResult<()>;
}

/// Subscriber collaborator contract (§6).
pub trait Subscriber: Send + Sync {
    /// Called once, on the receive thread, before the first `receive` —
    /// deferred there so it observes a stable epoll state.
    fn init(&self) -> PsResult<()> {
        Ok(())
    }

    /// `release` starts `false`; if the subscriber sets it `true`, the
    /// caller frees `msg_inst` via the serializer's `free_msg` after this
    /// call returns.
    fn receive(
        &self,
        msg_name: &str,
        msg_type_id: u32,
        msg_inst: Box<dyn Any + Send>,
        release: &mut bool,
    ) -> PsResult<()>;

    /// ZMQ-only: offers an additional part of a multipart message. Exposed
    /// only on transports that guarantee intra-message ordering (ZMQ), not
    /// on UDP-MC.
    fn get_multipart(&self, _msg_type_id: u32, _retain: bool) -> Option<Box<dyn Any + Send>> {
        None
    }
}

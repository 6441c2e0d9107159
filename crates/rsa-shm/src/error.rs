use pubsub_types::PsError;

/// Richer error kinds for the shared-memory RPC transport. Everything that
/// also has a meaning at the generic PSA boundary maps onto [`PsError`] via
/// [`From`]; the SHM-specific variants (pool exhaustion, broken peer) exist
/// because callers of [`crate::RsaShmClientManager`] care about the
/// distinction a plain `PsError::ServiceException` would erase.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared memory pool exhausted: requested {requested} of {pool_size} byte pool")]
    PoolExhausted { requested: usize, pool_size: usize },

    #[error("shared memory arena {0} could not be attached: {1}")]
    AttachFailed(String, std::io::Error),

    #[error("circuit breaker open for peer {0}")]
    CircuitOpen(String),

    #[error("rpc timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("peer refused connection: {0}")]
    ConnectionRefused(String),

    #[error(transparent)]
    Ps(#[from] PsError),
}

pub type ShmResult<T> = Result<T, ShmError>;

impl From<ShmError> for PsError {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::PoolExhausted { .. } => PsError::OutOfMemory(e.to_string()),
            ShmError::AttachFailed(..) => PsError::ServiceException(e.to_string()),
            ShmError::CircuitOpen(_) => PsError::IllegalState(e.to_string()),
            ShmError::Timeout(_) => PsError::Timeout,
            ShmError::ConnectionRefused(peer) => PsError::ConnectionRefused(peer),
            ShmError::Ps(inner) => inner,
        }
    }
}

impl From<std::io::Error> for ShmError {
    fn from(e: std::io::Error) -> Self {
        ShmError::Ps(PsError::from(e))
    }
}

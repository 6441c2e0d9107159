use std::io;

/// Error kinds shared across the pubsub admin and remote-service-admin crates.
///
/// Constructors either succeed with a fully-initialized object or return one
/// of these and leak no resources. Runtime send/receive errors are logged
/// and counted by the caller; they never propagate out of a receive thread.
#[derive(Debug, thiserror::Error)]
pub enum PsError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("service exception: {0}")]
    ServiceException(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("timeout waiting for reply")]
    Timeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("bundle exception: {0}")]
    BundleException(String),
}

impl From<io::Error> for PsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => PsError::ConnectionRefused(e.to_string()),
            io::ErrorKind::TimedOut => PsError::Timeout,
            _ => PsError::ServiceException(e.to_string()),
        }
    }
}

pub type PsResult<T> = Result<T, PsError>;

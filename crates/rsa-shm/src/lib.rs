//! Shared-memory remote service admin transport: same-host RPC over a
//! `shm_open`/`mmap` arena and a `PTHREAD_PROCESS_SHARED` mutex/condvar pair,
//! with an abstract Unix-domain datagram socket as the out-of-band control
//! channel (§4.5–§4.7).
//!
//! [`RsaShmServer`] binds a control socket and dispatches requests to a
//! [`ShmRequestHandler`] through a bounded worker pool; [`RsaShmClientManager`]
//! is the corresponding client, with a per-peer circuit breaker so a dead
//! service degrades to fast failures instead of hanging every caller.

mod client;
mod control_socket;
mod descriptor;
mod error;
mod protocol;
mod server;
mod shm_cache;
mod shm_pool;

pub use client::RsaShmClientManager;
pub use descriptor::{RpcStatus, ShmDescriptor};
pub use error::{ShmError, ShmResult};
pub use server::{RsaShmServer, ShmRequestHandler};
pub use shm_cache::ShmCache;
pub use shm_pool::ShmPool;

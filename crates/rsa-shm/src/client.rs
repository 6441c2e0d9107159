//! `RsaShmClientManager`: the client side of a shared-memory RPC invocation
//! (§4.7) plus the per-peer circuit breaker that keeps a dead or wedged
//! server from hanging every future call.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::control_socket;
use crate::descriptor::{RpcStatus, ShmDescriptor, DESCRIPTOR_SIZE};
use crate::error::{ShmError, ShmResult};
use crate::protocol;
use crate::shm_pool::ShmPool;

/// Consecutive non-success responses (timeouts, connection refusals, or the
/// peer's handler itself failing) before a peer's circuit opens.
const MAX_INVOKED_SVC_FAILURES: u32 = 15;
/// How long the circuit stays open once tripped.
const MAX_SVC_BREAKED_TIME: Duration = Duration::from_secs(60);

struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

struct ClientEntry {
    pool: Arc<ShmPool>,
    control_fd: RawFd,
    circuit: Mutex<CircuitState>,
}

/// One entry per `(peer, serviceId)` pair the local bundle has created or
/// attached a client for (§4.7 `createOrAttachClient`/`destroyOrDetachClient`).
/// Each entry owns its own arena: a server writes its response directly back
/// into it, so a client never needs to map a foreign arena of its own.
pub struct RsaShmClientManager {
    pool_size: usize,
    entries: Mutex<HashMap<(String, u64), Arc<ClientEntry>>>,
}

impl RsaShmClientManager {
    pub fn new() -> Self {
        Self::with_pool_size(crate::shm_pool::MIN_POOL_SIZE)
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        RsaShmClientManager {
            pool_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Creates this client's arena (if not already present for `peer`/
    /// `service_id`) and announces it to the peer with an attach datagram.
    /// Idempotent: a second call for the same key is a no-op.
    ///
    /// The entry is created and persisted regardless of whether the
    /// announce datagram actually reaches a peer: an abstract-namespace
    /// `sendto` to a name nobody is bound to fails with `ECONNREFUSED`
    /// immediately, and a peer that doesn't exist yet (or never will) is
    /// exactly the case the circuit breaker in `send_msg_to` needs to see
    /// as a string of failures, not as an error that never reaches
    /// `record_outcome`. The request datagram `invoke` sends next fails
    /// the same way and is what actually gets counted.
    pub fn attach(&self, peer_server_name: &str, service_id: u64) -> ShmResult<()> {
        let key = (peer_server_name.to_string(), service_id);
        if self.entries.lock().contains_key(&key) {
            return Ok(());
        }

        let pool = Arc::new(ShmPool::create(self.pool_size)?);
        let control_fd = control_socket::bind_dgram(pool.name())?;

        let entry = Arc::new(ClientEntry {
            pool,
            control_fd,
            circuit: Mutex::new(CircuitState {
                consecutive_failures: 0,
                open_until: None,
            }),
        });
        self.entries.lock().insert(key, entry.clone());

        if let Err(e) = control_socket::sendto(
            control_fd,
            &protocol::encode_attach(entry.pool.name()),
            peer_server_name,
        ) {
            tracing::debug!(
                peer = peer_server_name, error = %e,
                "rsa-shm: attach announce did not reach peer, entry kept for retry"
            );
        }
        Ok(())
    }

    pub fn detach(&self, peer_server_name: &str, service_id: u64) {
        if let Some(entry) = self
            .entries
            .lock()
            .remove(&(peer_server_name.to_string(), service_id))
        {
            control_socket::close(entry.control_fd);
        }
    }

    /// Implements the six-step `sendMsgTo` (§4.7): fast-fail if the circuit
    /// is open, allocate and fill a descriptor in the client's own arena,
    /// send the request datagram, wait on the descriptor's condvar, and
    /// translate the result (copying the response out before the arena can
    /// be reused) while updating the breaker's failure count.
    pub fn send_msg_to(
        &self,
        peer_server_name: &str,
        service_id: u64,
        metadata: &[u8],
        request: &[u8],
        timeout: Duration,
    ) -> ShmResult<Vec<u8>> {
        self.attach(peer_server_name, service_id)?;
        let entry = self
            .entries
            .lock()
            .get(&(peer_server_name.to_string(), service_id))
            .cloned()
            .expect("attach just inserted this entry");

        if let Some(until) = entry.circuit.lock().open_until {
            if Instant::now() < until {
                return Err(ShmError::CircuitOpen(peer_server_name.to_string()));
            }
        }

        let result = self.invoke(&entry, peer_server_name, metadata, request, timeout);
        self.record_outcome(&entry, &result);
        result
    }

    fn invoke(
        &self,
        entry: &ClientEntry,
        peer_server_name: &str,
        metadata: &[u8],
        request: &[u8],
        timeout: Duration,
    ) -> ShmResult<Vec<u8>> {
        let pool = &entry.pool;

        let metadata_ptr = pool.malloc(metadata.len().max(1))?;
        unsafe { std::ptr::copy_nonoverlapping(metadata.as_ptr(), metadata_ptr, metadata.len()) };

        let request_ptr = pool.malloc(request.len().max(1))?;
        unsafe { std::ptr::copy_nonoverlapping(request.as_ptr(), request_ptr, request.len()) };

        let desc_ptr = pool.malloc(DESCRIPTOR_SIZE)?;
        unsafe {
            ShmDescriptor::init(desc_ptr)?;
            let desc = ShmDescriptor::at(desc_ptr);
            (*desc).metadata_offset = pool.memory_offset(metadata_ptr);
            (*desc).metadata_len = metadata.len() as u32;
            (*desc).request_offset = pool.memory_offset(request_ptr);
            (*desc).request_len = request.len() as u32;
        }

        let descriptor_offset = pool.memory_offset(desc_ptr) as u64;
        control_socket::sendto(
            entry.control_fd,
            &protocol::encode_request(descriptor_offset),
            peer_server_name,
        )?;

        let desc = unsafe { ShmDescriptor::at(desc_ptr) };
        let status = unsafe { ShmDescriptor::wait(desc, timeout) };

        let response = match status {
            None => {
                pool.free(desc_ptr);
                pool.free(request_ptr);
                pool.free(metadata_ptr);
                return Err(ShmError::Timeout(timeout));
            }
            Some(RpcStatus::Success) => unsafe {
                let d = &*desc;
                let bytes = std::slice::from_raw_parts(
                    pool.ptr_at_offset(d.response_offset),
                    d.response_len as usize,
                )
                .to_vec();
                Ok(bytes)
            },
            Some(RpcStatus::ServiceException) => Err(ShmError::Ps(
                pubsub_types::PsError::ServiceException("remote handler failed".into()),
            )),
            Some(RpcStatus::IllegalState) => {
                Err(ShmError::Ps(pubsub_types::PsError::IllegalState(
                    "peer rejected the request under load".into(),
                )))
            }
            Some(RpcStatus::Pending) => unreachable!("wait only returns once status has changed"),
        };

        pool.free(desc_ptr);
        pool.free(request_ptr);
        pool.free(metadata_ptr);
        response
    }

    fn record_outcome(&self, entry: &ClientEntry, result: &ShmResult<Vec<u8>>) {
        // Any non-success response counts, not just transport-level failures
        // (§4.7): a peer that's up but whose handler keeps raising
        // `ServiceException` is exactly as unusable as one that's unreachable.
        let failed = result.is_err();
        let mut circuit = entry.circuit.lock();
        if failed {
            circuit.consecutive_failures += 1;
            if circuit.consecutive_failures >= MAX_INVOKED_SVC_FAILURES {
                circuit.open_until = Some(Instant::now() + MAX_SVC_BREAKED_TIME);
                tracing::warn!("rsa-shm: circuit breaker opened after repeated failures");
            }
        } else {
            circuit.consecutive_failures = 0;
            circuit.open_until = None;
        }
    }
}

impl Default for RsaShmClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RsaShmClientManager {
    fn drop(&mut self) {
        for entry in self.entries.lock().values() {
            control_socket::close(entry.control_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_call_with_no_listening_peer_is_refused() {
        // Nobody is bound to this abstract-namespace name, so the request
        // datagram `invoke` sends fails immediately with ECONNREFUSED —
        // there's no descriptor for the peer to ever answer, so this never
        // reaches the condvar wait and never times out.
        let client = RsaShmClientManager::new();
        let result = client.send_msg_to(
            "rsa-shm-nobody-is-listening-here",
            0,
            b"meta",
            b"req",
            Duration::from_millis(200),
        );
        assert!(matches!(result, Err(ShmError::ConnectionRefused(_))));
    }

    #[test]
    fn repeated_failures_trip_the_circuit_breaker() {
        let client = RsaShmClientManager::new();
        let peer = "rsa-shm-nobody-is-listening-either";
        for _ in 0..MAX_INVOKED_SVC_FAILURES {
            let result = client.send_msg_to(peer, 0, b"m", b"r", Duration::from_millis(20));
            assert!(matches!(result, Err(ShmError::ConnectionRefused(_))));
        }
        let result = client.send_msg_to(peer, 0, b"m", b"r", Duration::from_millis(20));
        assert!(matches!(result, Err(ShmError::CircuitOpen(_))));
    }
}

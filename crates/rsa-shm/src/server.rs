//! `RsaShmServer`: listens on an abstract Unix-domain datagram socket and
//! dispatches request descriptors to a worker pool (§4.6).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use threadpool::ThreadPool;

use crate::control_socket;
use crate::descriptor::{RpcStatus, ShmDescriptor};
use crate::error::ShmResult;
use crate::protocol::{self, ControlMessage};
use crate::shm_cache::ShmCache;

/// The user collaborator a server dispatches requests to. `metadata` and
/// `request` are the raw bytes the client placed in its arena; a
/// successful return's bytes become the response payload, mirroring
/// `receive(metadata, request_iov) -> (status, response_iov)` (§4.6 step 4).
pub trait ShmRequestHandler: Send + Sync {
    fn receive(&self, metadata: &[u8], request: &[u8]) -> ShmResult<Vec<u8>>;
}

struct ServerState {
    cache: ShmCache,
    sessions: Mutex<HashMap<Vec<u8>, String>>,
    handler: Arc<dyn ShmRequestHandler>,
    inflight: AtomicUsize,
    max_concurrent: usize,
}

/// One abstract-socket listener plus a bounded worker pool. `max_concurrent`
/// backpressures independently of the thread-pool size: once that many
/// requests are in flight, new ones are answered `IllegalState` without
/// being queued at all (§4.6 "Backpressure").
pub struct RsaShmServer {
    name: String,
    fd: RawFd,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    pool: Mutex<ThreadPool>,
    state: Arc<ServerState>,
}

impl RsaShmServer {
    pub fn bind(
        name: &str,
        worker_threads: usize,
        max_concurrent: u32,
        handler: Arc<dyn ShmRequestHandler>,
    ) -> ShmResult<Self> {
        let fd = control_socket::bind_dgram(name)?;
        let server = RsaShmServer {
            name: name.to_string(),
            fd,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
            pool: Mutex::new(ThreadPool::new(worker_threads.max(1))),
            state: Arc::new(ServerState {
                cache: ShmCache::create(false),
                sessions: Mutex::new(HashMap::new()),
                handler,
                inflight: AtomicUsize::new(0),
                max_concurrent: max_concurrent.max(1) as usize,
            }),
        };
        server.start();
        Ok(server)
    }

    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let fd = self.fd;
        let running = self.running.clone();
        let state = self.state.clone();
        let pool = self.pool.lock().clone();
        let handle = std::thread::spawn(move || Self::accept_loop(fd, running, state, pool));
        *self.accept_thread.lock() = Some(handle);
    }

    fn accept_loop(fd: RawFd, running: Arc<AtomicBool>, state: Arc<ServerState>, pool: ThreadPool) {
        let mut buf = [0u8; 512];
        while running.load(Ordering::SeqCst) {
            let (n, src) = match control_socket::recvfrom(fd, &mut buf) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match protocol::decode(&buf[..n]) {
                Some(ControlMessage::Attach { arena_name }) => {
                    state.sessions.lock().insert(src, arena_name);
                }
                Some(ControlMessage::Request { descriptor_offset }) => {
                    Self::dispatch(&state, &pool, src, descriptor_offset);
                }
                None => {
                    tracing::warn!("rsa-shm: dropping malformed control datagram");
                }
            }
        }
    }

    fn dispatch(state: &Arc<ServerState>, pool: &ThreadPool, src: Vec<u8>, descriptor_offset: u64) {
        let Some(arena_name) = state.sessions.lock().get(&src).cloned() else {
            tracing::warn!("rsa-shm: request from an unattached peer, dropping");
            return;
        };

        if state.inflight.fetch_add(1, Ordering::SeqCst) >= state.max_concurrent {
            state.inflight.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(
                arena = %arena_name,
                "rsa-shm: worker pool at capacity, responding ILLEGAL_STATE without dispatch"
            );
            Self::complete_with_status(state, &arena_name, descriptor_offset, RpcStatus::IllegalState);
            return;
        }

        let state = state.clone();
        pool.execute(move || {
            Self::process_one(&state, &arena_name, descriptor_offset);
            state.inflight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn process_one(state: &Arc<ServerState>, arena_name: &str, descriptor_offset: u64) {
        let pool = match state.cache.pool_for(arena_name) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(arena = %arena_name, error = %e, "rsa-shm: could not attach client arena");
                return;
            }
        };
        let desc_ptr = pool.ptr_at_offset(descriptor_offset as isize);
        let desc = unsafe { ShmDescriptor::at(desc_ptr) };

        let (request, metadata) = unsafe {
            let d = &*desc;
            let request = std::slice::from_raw_parts(
                pool.ptr_at_offset(d.request_offset),
                d.request_len as usize,
            );
            let metadata = std::slice::from_raw_parts(
                pool.ptr_at_offset(d.metadata_offset),
                d.metadata_len as usize,
            );
            (request.to_vec(), metadata.to_vec())
        };

        match state.handler.receive(&metadata, &request) {
            Ok(response) => {
                let resp_ptr = match pool.malloc(response.len().max(1)) {
                    Ok(p) => p,
                    Err(_) => {
                        unsafe {
                            ShmDescriptor::complete(desc, RpcStatus::ServiceException, 0, 0);
                        }
                        return;
                    }
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(response.as_ptr(), resp_ptr, response.len());
                    let response_offset = pool.memory_offset(resp_ptr);
                    ShmDescriptor::complete(
                        desc,
                        RpcStatus::Success,
                        response_offset,
                        response.len() as u32,
                    );
                }
            }
            Err(_) => unsafe {
                ShmDescriptor::complete(desc, RpcStatus::ServiceException, 0, 0);
            },
        }
    }

    fn complete_with_status(
        state: &Arc<ServerState>,
        arena_name: &str,
        descriptor_offset: u64,
        status: RpcStatus,
    ) {
        let Ok(pool) = state.cache.pool_for(arena_name) else {
            return;
        };
        let desc_ptr = pool.ptr_at_offset(descriptor_offset as isize);
        let desc = unsafe { ShmDescriptor::at(desc_ptr) };
        unsafe { ShmDescriptor::complete(desc, status, 0, 0) };
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for RsaShmServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        control_socket::close(self.fd);
        if let Some(handle) = self.accept_thread.lock().take() {
            // The accept thread is blocked in recvfrom; on a datagram
            // socket closing our own fd is enough to unblock it with an
            // error on the next call, which the loop then sees via `running`.
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RsaShmClientManager;
    use std::time::Duration;

    struct EchoHandler;
    impl ShmRequestHandler for EchoHandler {
        fn receive(&self, _metadata: &[u8], request: &[u8]) -> ShmResult<Vec<u8>> {
            Ok(request.to_vec())
        }
    }

    #[test]
    fn round_trips_a_request_through_the_server() {
        let name = format!("rsa-shm-srv-{}", std::process::id());
        let _server = RsaShmServer::bind(&name, 2, 8, Arc::new(EchoHandler)).unwrap();
        let client = RsaShmClientManager::new();
        client.attach(&name, 0).unwrap();

        let response = client
            .send_msg_to(&name, 0, b"meta", b"ping", Duration::from_secs(2))
            .unwrap();
        assert_eq!(response, b"ping");
    }
}

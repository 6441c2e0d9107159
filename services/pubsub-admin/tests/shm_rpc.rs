//! End-to-end coverage of the shared-memory RPC path: a real
//! `RsaShmServer` bound on an abstract Unix-domain socket, driven through
//! `RsaShmClientManager`.
//!
//! Abstract-namespace sockets and POSIX `shm_open` arenas have no path on
//! disk, so there is nothing for `tempfile` to hand out here; a server
//! name salted with the process id plays the same "don't collide with a
//! concurrently running test" role a temp path would.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pubsub_types::PsError;
use rsa_shm::{RsaShmClientManager, RsaShmServer, ShmError, ShmRequestHandler, ShmResult};

fn unique_server_name(case: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "pubsub-admin-test-{}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst),
        case
    )
}

struct SleepyHandler {
    delay: Duration,
}

impl ShmRequestHandler for SleepyHandler {
    fn receive(&self, _metadata: &[u8], request: &[u8]) -> ShmResult<Vec<u8>> {
        std::thread::sleep(self.delay);
        Ok(request.to_vec())
    }
}

struct AlwaysFailsHandler;

impl ShmRequestHandler for AlwaysFailsHandler {
    fn receive(&self, _metadata: &[u8], _request: &[u8]) -> ShmResult<Vec<u8>> {
        Err(ShmError::Ps(PsError::ServiceException(
            "handler deliberately fails".into(),
        )))
    }
}

/// spec.md §8 scenario 5: a handler slower than the configured timeout
/// yields `Timeout`, counted as one failure toward the peer's breaker.
#[test]
fn slow_handler_times_out_the_caller() {
    let name = unique_server_name("timeout");
    let _server = RsaShmServer::bind(&name, 2, 8, Arc::new(SleepyHandler { delay: Duration::from_secs(3) }))
        .expect("server binds");
    let client = RsaShmClientManager::new();

    let started = std::time::Instant::now();
    let result = client.send_msg_to(&name, 0, b"meta", b"ping", Duration::from_secs(1));
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(ShmError::Timeout(_))));
    assert!(elapsed < Duration::from_secs(2), "should not wait for the full 3s handler sleep");
}

/// spec.md §8 scenario 6: a handler that always fails trips the breaker
/// after 15 consecutive calls, and the 16th fails fast without touching
/// the peer again.
#[test]
fn repeated_service_exceptions_trip_the_circuit_breaker() {
    let name = unique_server_name("breaker");
    let _server = RsaShmServer::bind(&name, 2, 8, Arc::new(AlwaysFailsHandler)).expect("server binds");
    let client = RsaShmClientManager::new();

    for _ in 0..15 {
        let result = client.send_msg_to(&name, 0, b"m", b"r", Duration::from_secs(1));
        assert!(matches!(result, Err(ShmError::Ps(PsError::ServiceException(_)))));
    }

    let result = client.send_msg_to(&name, 0, b"m", b"r", Duration::from_secs(1));
    assert!(
        matches!(result, Err(ShmError::CircuitOpen(_))),
        "16th call should fail fast without reaching the server"
    );
}

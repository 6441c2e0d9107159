//! `TopicPublication`: the UDP-MC send side for one `ScopeTopicKey` (§4.2).
//!
//! One bound send socket is shared by every bundle that publishes on this
//! topic; each bundle gets its own [`BoundPublisher`] handle (the
//! service-factory substitute described in spec.md §9) with a private
//! `LargeUdp` instance and serializer map.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use large_udp::LargeUdp;
use psa_core::TopicPublicationHandle;
use pubsub_types::{
    Endpoint, MultipartFlags, PsError, PsResult, Publisher, Serializer, SerializerMap,
};

use crate::wire;

/// Exactly one delay, the first time any bundle on this process sends its
/// first message on any topic — process-global per spec.md §9, so this is
/// a free function backed by a single `Once`, not a per-`TopicPublication`
/// flag.
static FIRST_SEND_DELAY: Once = Once::new();
const FIRST_SEND_DELAY_SECS: u64 = 2;

fn delay_first_send_for_late_joiners() {
    FIRST_SEND_DELAY.call_once(|| {
        tracing::info!("psa-udpmc: delaying first send for late joiners");
        std::thread::sleep(std::time::Duration::from_secs(FIRST_SEND_DELAY_SECS));
    });
}

struct BoundPublisher {
    topic: String,
    msg_types: Mutex<SerializerMap>,
    large_udp: LargeUdp,
    fd: RawFd,
    dest_addr: SocketAddrV4,
    get_count: AtomicUsize,
}

impl Publisher for BoundPublisher {
    fn send(&self, msg_type_id: u32, msg: &(dyn std::any::Any + Send)) -> PsResult<()> {
        delay_first_send_for_late_joiners();

        let (payload, version) = {
            let map = self.msg_types.lock();
            let entry = map.get(msg_type_id).ok_or_else(|| {
                PsError::IllegalState(format!(
                    "no serializer entry for msgTypeId {msg_type_id} on topic {}",
                    self.topic
                ))
            })?;
            ((entry.serialize)(msg)?, entry.msg_version)
        };

        let framed = wire::frame(&self.topic, msg_type_id, version, &payload)?;
        self.large_udp.sendmsg(self.fd, &framed, self.dest_addr)?;
        Ok(())
    }

    fn send_multipart(
        &self,
        _msg_type_id: u32,
        _msg: &(dyn std::any::Any + Send),
        _flags: MultipartFlags,
    ) -> PsResult<()> {
        Err(PsError::IllegalState(
            "multipart send is not supported over udp_mc".into(),
        ))
    }
}

/// Owns the bound send socket and bundle-scoped publisher handles for one
/// `ScopeTopicKey`. Implements [`psa_core::TopicPublicationHandle`].
pub struct TopicPublication {
    url: String,
    fd: RawFd,
    dest_addr: SocketAddrV4,
    serializer: Arc<dyn Serializer>,
    endpoints: Mutex<Vec<Endpoint>>,
    bound: Mutex<HashMap<u64, Arc<BoundPublisher>>>,
    stopped: AtomicBool,
}

impl TopicPublication {
    pub fn new(
        fd: RawFd,
        dest_addr: SocketAddrV4,
        url: String,
        serializer: Arc<dyn Serializer>,
        initial_endpoint: Endpoint,
    ) -> Self {
        TopicPublication {
            url,
            fd,
            dest_addr,
            serializer,
            endpoints: Mutex::new(vec![initial_endpoint]),
            bound: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Per-bundle publisher lookup/creation — the service-factory
    /// `getService` substitute. `bundle_id` is caller-supplied and opaque
    /// to this crate; repeated calls with the same id share one
    /// [`Publisher`] and bump its reference count.
    pub fn handle_for(&self, bundle_id: u64, topic: &str) -> PsResult<Arc<dyn Publisher>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PsError::IllegalState(
                "topic publication is stopped, no new publishers".into(),
            ));
        }
        let mut bound = self.bound.lock();
        if let Some(existing) = bound.get(&bundle_id) {
            existing.get_count.fetch_add(1, Ordering::SeqCst);
            return Ok(existing.clone() as Arc<dyn Publisher>);
        }

        let msg_types = self.serializer.create_serializer_map(bundle_id)?;
        let publisher = Arc::new(BoundPublisher {
            topic: topic.to_string(),
            msg_types: Mutex::new(msg_types),
            large_udp: LargeUdp::create(1),
            fd: self.fd,
            dest_addr: self.dest_addr,
            get_count: AtomicUsize::new(1),
        });
        bound.insert(bundle_id, publisher.clone());
        Ok(publisher as Arc<dyn Publisher>)
    }

    /// Releases one reference to a bundle-bound publisher; removes it once
    /// the count drops to zero (the `ungetService` substitute).
    pub fn release_handle(&self, bundle_id: u64) {
        let mut bound = self.bound.lock();
        let Some(entry) = bound.get(&bundle_id) else {
            return;
        };
        if entry.get_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            bound.remove(&bundle_id);
        }
    }
}

impl TopicPublicationHandle for TopicPublication {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn add_publisher_endpoint(&self, ep: Endpoint) {
        self.endpoints.lock().push(ep);
    }

    fn remove_publisher_endpoint(&self, ep: &Endpoint) {
        self.endpoints
            .lock()
            .retain(|e| e.endpoint_id() != ep.endpoint_id());
    }

    fn publisher_endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    fn publisher_for(&self, bundle_id: u64, topic: &str) -> PsResult<Arc<dyn Publisher>> {
        self.handle_for(bundle_id, topic)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        unsafe {
            libc::close(self.fd);
        }
    }
}

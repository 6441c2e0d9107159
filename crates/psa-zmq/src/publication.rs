//! `TopicPublication`: the ZMQ send side for one `ScopeTopicKey` (§4.2).
//! One bound `PUB` socket is shared by every bundle publishing on this
//! topic; each bundle gets a [`BoundPublisher`] with its own serializer map
//! and multipart assembly state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use psa_core::TopicPublicationHandle;
use pubsub_types::{
    Endpoint, MultipartFlags, PsError, PsResult, Publisher, Serializer, SerializerMap,
};

use crate::socket::zmq_err;
use crate::wire;

static FIRST_SEND_DELAY: Once = Once::new();
const FIRST_SEND_DELAY_SECS: u64 = 2;

fn delay_first_send_for_late_joiners() {
    FIRST_SEND_DELAY.call_once(|| {
        tracing::info!("psa-zmq: delaying first send for late joiners");
        std::thread::sleep(std::time::Duration::from_secs(FIRST_SEND_DELAY_SECS));
    });
}

struct PublicationShared {
    socket: Mutex<zmq::Socket>,
    url: String,
}

struct MpState {
    in_progress: bool,
    parts: Vec<(Vec<u8>, Vec<u8>)>,
}

struct BoundPublisher {
    parent: Arc<PublicationShared>,
    topic: String,
    msg_types: Mutex<SerializerMap>,
    mp: Mutex<MpState>,
    get_count: AtomicUsize,
}

impl BoundPublisher {
    fn encode(&self, msg_type_id: u32, msg: &(dyn std::any::Any + Send)) -> PsResult<(Vec<u8>, Vec<u8>)> {
        let map = self.msg_types.lock();
        let entry = map.get(msg_type_id).ok_or_else(|| {
            PsError::IllegalState(format!(
                "no serializer entry for msgTypeId {msg_type_id} on topic {}",
                self.topic
            ))
        })?;
        let payload = (entry.serialize)(msg)?;
        let header = wire::header_frame(&self.topic, msg_type_id, entry.msg_version)?;
        Ok((header, payload))
    }

    fn send_pair(socket: &zmq::Socket, header: &[u8], payload: &[u8], last: bool) -> PsResult<()> {
        socket
            .send(header, zmq::SNDMORE)
            .map_err(zmq_err)?;
        let flags = if last { 0 } else { zmq::SNDMORE };
        socket.send(payload, flags).map_err(zmq_err)?;
        Ok(())
    }
}

impl Publisher for BoundPublisher {
    fn send(&self, msg_type_id: u32, msg: &(dyn std::any::Any + Send)) -> PsResult<()> {
        self.send_multipart(msg_type_id, msg, MultipartFlags::FIRST | MultipartFlags::LAST)
    }

    fn send_multipart(
        &self,
        msg_type_id: u32,
        msg: &(dyn std::any::Any + Send),
        flags: MultipartFlags,
    ) -> PsResult<()> {
        delay_first_send_for_late_joiners();

        let first = flags.contains(MultipartFlags::FIRST);
        let last = flags.contains(MultipartFlags::LAST);
        let (header, payload) = self.encode(msg_type_id, msg)?;

        if first && last {
            let socket = self.parent.socket.lock();
            return Self::send_pair(&socket, &header, &payload, true);
        }

        let mut mp = self.mp.lock();
        if first {
            if mp.in_progress {
                return Err(PsError::IllegalState(
                    "multipart send already in progress on this publisher".into(),
                ));
            }
            mp.in_progress = true;
            mp.parts.clear();
            mp.parts.push((header, payload));
            return Ok(());
        }

        if !mp.in_progress {
            return Err(PsError::IllegalState(
                "received a PART/LAST message without a preceding FIRST".into(),
            ));
        }
        mp.parts.push((header, payload));

        if last {
            let parts = std::mem::take(&mut mp.parts);
            mp.in_progress = false;
            drop(mp);
            let socket = self.parent.socket.lock();
            let n = parts.len();
            for (i, (h, p)) in parts.into_iter().enumerate() {
                Self::send_pair(&socket, &h, &p, i + 1 == n)?;
            }
        }
        Ok(())
    }
}

/// Owns the bound `PUB` socket and bundle-scoped publisher handles for one
/// `ScopeTopicKey`. Implements [`psa_core::TopicPublicationHandle`].
pub struct TopicPublication {
    shared: Arc<PublicationShared>,
    serializer: Arc<dyn Serializer>,
    endpoints: Mutex<Vec<Endpoint>>,
    bound: Mutex<HashMap<u64, Arc<BoundPublisher>>>,
    stopped: AtomicBool,
}

impl TopicPublication {
    pub fn new(
        socket: zmq::Socket,
        url: String,
        serializer: Arc<dyn Serializer>,
        initial_endpoint: Endpoint,
    ) -> Self {
        TopicPublication {
            shared: Arc::new(PublicationShared {
                socket: Mutex::new(socket),
                url,
            }),
            serializer,
            endpoints: Mutex::new(vec![initial_endpoint]),
            bound: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

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
            parent: self.shared.clone(),
            topic: topic.to_string(),
            msg_types: Mutex::new(msg_types),
            mp: Mutex::new(MpState {
                in_progress: false,
                parts: Vec::new(),
            }),
            get_count: AtomicUsize::new(1),
        });
        bound.insert(bundle_id, publisher.clone());
        Ok(publisher as Arc<dyn Publisher>)
    }

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
        self.shared.url.clone()
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
    }
}

//! `TopicSubscription`: the ZMQ receive side for one `ScopeTopicKey` (or the
//! wildcard key), §4.3. A single thread owns the `SUB` socket; non-blocking
//! receives poll at `PSA_ZMQ_RECEIVE_TIMEOUT_MICROSEC` intervals rather than
//! blocking indefinitely, the way `zmq_recv_thread_func` sleeps on `EAGAIN`
//! instead of using a blocking `recv`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use psa_core::TopicSubscriptionHandle;
use pubsub_types::{version_compatible, Endpoint, PsResult, Serializer, SerializerMap, Subscriber};

use crate::socket::zmq_err;
use crate::wire;

struct SubscriberEntry {
    ep: Endpoint,
    subscriber: Arc<dyn Subscriber>,
    msg_types: SerializerMap,
    initialized: bool,
    usage_count: u32,
}

struct SharedState {
    socket: zmq::Socket,
    connected: Vec<String>,
    pending_connects: VecDeque<String>,
    pending_disconnects: VecDeque<String>,
    subscribers: Vec<SubscriberEntry>,
}

pub struct TopicSubscription {
    serializer: Arc<dyn Serializer>,
    state: Arc<Mutex<SharedState>>,
    receive_timeout: Duration,
    running: Arc<AtomicBool>,
    thread: StdMutex<Option<JoinHandle<()>>>,
}

impl TopicSubscription {
    pub fn new(
        socket: zmq::Socket,
        serializer: Arc<dyn Serializer>,
        receive_timeout: Duration,
    ) -> PsResult<Self> {
        Ok(TopicSubscription {
            serializer,
            state: Arc::new(Mutex::new(SharedState {
                socket,
                connected: Vec::new(),
                pending_connects: VecDeque::new(),
                pending_disconnects: VecDeque::new(),
                subscribers: Vec::new(),
            })),
            receive_timeout,
            running: Arc::new(AtomicBool::new(false)),
            thread: StdMutex::new(None),
        })
    }

    fn drain_pending(state: &mut SharedState) {
        while let Some(url) = state.pending_connects.pop_front() {
            if state.connected.contains(&url) {
                continue;
            }
            match state.socket.connect(&url) {
                Ok(()) => state.connected.push(url),
                Err(e) => tracing::warn!(url, error = %e, "psa-zmq: connect failed"),
            }
        }
        while let Some(url) = state.pending_disconnects.pop_front() {
            if let Some(pos) = state.connected.iter().position(|u| u == &url) {
                if let Err(e) = state.socket.disconnect(&url) {
                    tracing::warn!(url, error = %e, "psa-zmq: disconnect failed");
                }
                state.connected.remove(pos);
            }
        }
    }

    /// Receives one logical message (a sequence of header/payload frame
    /// pairs glued by ZMQ's `more` flag) without blocking. Returns `None`
    /// on `EAGAIN` (nothing currently available).
    fn try_recv_message(state: &SharedState) -> PsResult<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        let header = match state.socket.recv_bytes(zmq::DONTWAIT) {
            Ok(b) => b,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(zmq_err(e)),
        };
        if !state.socket.get_rcvmore().map_err(zmq_err)? {
            tracing::warn!("psa-zmq: received header frame without a payload frame");
            return Ok(None);
        }
        let payload = state.socket.recv_bytes(0).map_err(zmq_err)?;
        let mut pairs = vec![(header, payload)];

        while state.socket.get_rcvmore().map_err(zmq_err)? {
            let h = state.socket.recv_bytes(0).map_err(zmq_err)?;
            if !state.socket.get_rcvmore().map_err(zmq_err)? {
                tracing::warn!("psa-zmq: multipart stream ended mid header/payload pair");
                break;
            }
            let p = state.socket.recv_bytes(0).map_err(zmq_err)?;
            pairs.push((h, p));
        }
        Ok(Some(pairs))
    }

    fn run(state: Arc<Mutex<SharedState>>, running: Arc<AtomicBool>, receive_timeout: Duration) {
        while running.load(Ordering::SeqCst) {
            let message = {
                let mut s = state.lock();
                Self::drain_pending(&mut s);
                Self::try_recv_message(&s)
            };
            match message {
                Ok(Some(pairs)) => Self::dispatch(&state, pairs),
                Ok(None) => std::thread::sleep(receive_timeout),
                Err(e) => {
                    tracing::warn!(error = %e, "psa-zmq: recv error on topic subscription socket");
                    std::thread::sleep(receive_timeout);
                }
            }
        }
    }

    fn dispatch(state: &Arc<Mutex<SharedState>>, pairs: Vec<(Vec<u8>, Vec<u8>)>) {
        let (primary_header_bytes, primary_payload) = &pairs[0];
        let primary_header = match wire::parse_header(primary_header_bytes) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "psa-zmq: dropping malformed header frame");
                return;
            }
        };

        let mut s = state.lock();
        for entry in &mut s.subscribers {
            if !entry.initialized {
                if let Err(e) = entry.subscriber.init() {
                    tracing::warn!(error = %e, "psa-zmq: subscriber init failed");
                    continue;
                }
                entry.initialized = true;
            }
            let Some(msg_entry) = entry.msg_types.get(primary_header.msg_type_id) else {
                continue;
            };
            if !version_compatible(primary_header.version, msg_entry.msg_version) {
                tracing::warn!(
                    msg_type_id = primary_header.msg_type_id,
                    sender = ?primary_header.version,
                    receiver = ?msg_entry.msg_version,
                    "psa-zmq: incompatible message version, dropping"
                );
                continue;
            }
            let msg_inst = match (msg_entry.deserialize)(primary_payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "psa-zmq: deserialize failed");
                    continue;
                }
            };
            let msg_name = msg_entry.msg_name.clone();
            let mut release = false;
            if let Err(e) = entry
                .subscriber
                .receive(&msg_name, primary_header.msg_type_id, msg_inst, &mut release)
            {
                tracing::warn!(error = %e, "psa-zmq: subscriber.receive failed");
            }
            // Additional parts beyond the primary: offered via get_multipart
            // for transports that preserve intra-message ordering. Parts
            // whose type this subscriber doesn't know are skipped.
            for (header_bytes, _payload) in &pairs[1..] {
                if let Ok(part_header) = wire::parse_header(header_bytes) {
                    let _ = entry.subscriber.get_multipart(part_header.msg_type_id, false);
                }
            }
        }
    }
}

impl TopicSubscriptionHandle for TopicSubscription {
    /// Mirrors `psa_udpmc_subscriber_entry_t.usageCount`: the same
    /// subscriber endpoint registering more than once bumps a refcount
    /// instead of creating a second dispatch entry, so a later
    /// `remove_subscriber` doesn't silently stop delivering to a subscriber
    /// still otherwise in use.
    fn add_subscriber(&self, ep: Endpoint, subscriber: Arc<dyn Subscriber>) {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .subscribers
            .iter_mut()
            .find(|e| e.ep.endpoint_id() == ep.endpoint_id())
        {
            existing.usage_count += 1;
            return;
        }

        let bundle_id = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            use std::hash::{Hash, Hasher};
            ep.endpoint_id().hash(&mut hasher);
            hasher.finish()
        };
        let msg_types = match self.serializer.create_serializer_map(bundle_id) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "psa-zmq: could not build serializer map for subscriber");
                SerializerMap::new()
            }
        };
        state.subscribers.push(SubscriberEntry {
            ep,
            subscriber,
            msg_types,
            initialized: false,
            usage_count: 1,
        });
    }

    fn remove_subscriber(&self, ep: &Endpoint) {
        let mut state = self.state.lock();
        let Some(existing) = state
            .subscribers
            .iter_mut()
            .find(|e| e.ep.endpoint_id() == ep.endpoint_id())
        else {
            return;
        };
        existing.usage_count -= 1;
        if existing.usage_count == 0 {
            state.subscribers.retain(|e| e.ep.endpoint_id() != ep.endpoint_id());
        }
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn enqueue_connect(&self, url: &str) {
        self.state.lock().pending_connects.push_back(url.to_string());
    }

    fn enqueue_disconnect(&self, url: &str) {
        self.state
            .lock()
            .pending_disconnects
            .push_back(url.to_string());
    }

    fn start(&self) -> PsResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.clone();
        let running = self.running.clone();
        let receive_timeout = self.receive_timeout;
        let handle = std::thread::spawn(move || {
            Self::run(state, running, receive_timeout);
        });
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubsub_types::{EndpointType, MsgEntry, SerializerMap};

    struct NullSerializer;
    impl Serializer for NullSerializer {
        fn serializer_type(&self) -> &str {
            "json"
        }
        fn create_serializer_map(&self, _bundle_id: u64) -> PsResult<SerializerMap> {
            let mut map = SerializerMap::new();
            map.insert(
                1,
                MsgEntry {
                    msg_name: "probe".into(),
                    msg_version: (1, 0),
                    serialize: Box::new(|_| Ok(Vec::new())),
                    deserialize: Box::new(|_| Ok(Box::new(()))),
                    free_msg: Box::new(|_| {}),
                },
            );
            Ok(map)
        }
    }

    struct NullSubscriber;
    impl Subscriber for NullSubscriber {
        fn receive(
            &self,
            _msg_name: &str,
            _msg_type_id: u32,
            _msg_inst: Box<dyn std::any::Any + Send>,
            _release: &mut bool,
        ) -> PsResult<()> {
            Ok(())
        }
    }

    fn subscription() -> TopicSubscription {
        let ctx = zmq::Context::new();
        let socket = crate::socket::open_sub_socket(&ctx, b"").unwrap();
        TopicSubscription::new(socket, Arc::new(NullSerializer), Duration::from_micros(1000)).unwrap()
    }

    #[test]
    fn repeated_add_subscriber_increments_usage_count_not_entry_count() {
        let sub = subscription();
        let ep = Endpoint::new("fw-1", "s", "t", "sub-1", EndpointType::Subscriber);

        sub.add_subscriber(ep.clone(), Arc::new(NullSubscriber));
        sub.add_subscriber(ep.clone(), Arc::new(NullSubscriber));
        assert_eq!(sub.subscriber_count(), 1);
        assert_eq!(sub.state.lock().subscribers[0].usage_count, 2);
    }

    #[test]
    fn remove_subscriber_only_drops_entry_once_usage_count_reaches_zero() {
        let sub = subscription();
        let ep = Endpoint::new("fw-1", "s", "t", "sub-1", EndpointType::Subscriber);

        sub.add_subscriber(ep.clone(), Arc::new(NullSubscriber));
        sub.add_subscriber(ep.clone(), Arc::new(NullSubscriber));
        sub.remove_subscriber(&ep);
        assert_eq!(sub.subscriber_count(), 1, "one reference remains");

        sub.remove_subscriber(&ep);
        assert_eq!(sub.subscriber_count(), 0);
    }
}

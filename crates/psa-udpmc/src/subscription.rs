//! `TopicSubscription`: the UDP-MC receive side for one `ScopeTopicKey` (or
//! the wildcard key), §4.3. A single thread owns an epoll set and the
//! sockets joined to each connected publisher; control-plane calls only
//! enqueue connect/disconnect requests the thread drains between waits,
//! since mutating an epoll set concurrently with a blocked `epoll_wait` on
//! another thread is unsafe.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use large_udp::LargeUdp;
use psa_core::TopicSubscriptionHandle;
use pubsub_types::{version_compatible, Endpoint, PsError, PsResult, Serializer, SerializerMap, Subscriber};

use crate::socket;
use crate::wire;

const MAX_EPOLL_EVENTS: usize = 10;
const EPOLL_TIMEOUT_MS: i32 = 250;

struct SubscriberEntry {
    ep: Endpoint,
    subscriber: Arc<dyn Subscriber>,
    msg_types: SerializerMap,
    initialized: bool,
    usage_count: u32,
}

struct Peer {
    fd: RawFd,
    url: String,
}

struct SharedState {
    epoll_fd: RawFd,
    peers: HashMap<String, Peer>,
    pending_connects: VecDeque<String>,
    pending_disconnects: VecDeque<String>,
    subscribers: Vec<SubscriberEntry>,
}

/// Owns the epoll set, connected peer sockets and registered subscriber
/// collaborators for one `ScopeTopicKey`. Implements
/// [`psa_core::TopicSubscriptionHandle`].
pub struct TopicSubscription {
    interface_ip: Ipv4Addr,
    serializer: Arc<dyn Serializer>,
    state: Arc<Mutex<SharedState>>,
    large_udp: Arc<LargeUdp>,
    running: Arc<AtomicBool>,
    thread: StdMutex<Option<JoinHandle<()>>>,
}

impl TopicSubscription {
    pub fn new(interface_ip: Ipv4Addr, serializer: Arc<dyn Serializer>) -> PsResult<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(PsError::from(std::io::Error::last_os_error()));
        }
        Ok(TopicSubscription {
            interface_ip,
            serializer,
            state: Arc::new(Mutex::new(SharedState {
                epoll_fd,
                peers: HashMap::new(),
                pending_connects: VecDeque::new(),
                pending_disconnects: VecDeque::new(),
                subscribers: Vec::new(),
            })),
            large_udp: Arc::new(LargeUdp::create(16)),
            running: Arc::new(AtomicBool::new(false)),
            thread: StdMutex::new(None),
        })
    }

    fn drain_pending(state: &mut SharedState, interface_ip: Ipv4Addr) {
        while let Some(url) = state.pending_connects.pop_front() {
            if state.peers.contains_key(&url) {
                continue;
            }
            let addr = match socket::parse_udp_url(&url) {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(url, error = %e, "psa-udpmc: cannot connect, malformed url");
                    continue;
                }
            };
            match socket::open_recv_socket(*addr.ip(), addr.port(), interface_ip) {
                Ok(fd) => {
                    let mut ev = libc::epoll_event {
                        events: libc::EPOLLIN as u32,
                        u64: fd as u64,
                    };
                    let rc = unsafe {
                        libc::epoll_ctl(state.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev)
                    };
                    if rc < 0 {
                        tracing::warn!(url, "psa-udpmc: epoll_ctl add failed");
                        unsafe { libc::close(fd) };
                        continue;
                    }
                    state.peers.insert(url.clone(), Peer { fd, url });
                }
                Err(e) => {
                    tracing::warn!(url, error = %e, "psa-udpmc: failed to open recv socket");
                }
            }
        }
        while let Some(url) = state.pending_disconnects.pop_front() {
            if let Some(peer) = state.peers.remove(&url) {
                unsafe {
                    libc::epoll_ctl(state.epoll_fd, libc::EPOLL_CTL_DEL, peer.fd, std::ptr::null_mut());
                    libc::close(peer.fd);
                }
            }
        }
    }

    fn run(
        state: Arc<Mutex<SharedState>>,
        large_udp: Arc<LargeUdp>,
        running: Arc<AtomicBool>,
        interface_ip: Ipv4Addr,
    ) {
        let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS] = unsafe { mem::zeroed() };
        while running.load(Ordering::SeqCst) {
            let epoll_fd = {
                let mut s = state.lock();
                Self::drain_pending(&mut s, interface_ip);
                s.epoll_fd
            };

            let n = unsafe {
                libc::epoll_wait(epoll_fd, events.as_mut_ptr(), MAX_EPOLL_EVENTS as i32, EPOLL_TIMEOUT_MS)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(error = %err, "psa-udpmc: epoll_wait failed");
                continue;
            }

            for ev in &events[0..n as usize] {
                let fd = ev.u64 as RawFd;
                loop {
                    match large_udp.data_available(fd) {
                        Ok(Some((idx, _size))) => {
                            let buf = match large_udp.read(idx) {
                                Ok(b) => b,
                                Err(e) => {
                                    tracing::warn!(error = %e, "psa-udpmc: failed to claim reassembled message");
                                    break;
                                }
                            };
                            Self::dispatch(&state, &buf);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "psa-udpmc: recv error on topic subscription socket");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(state: &Arc<Mutex<SharedState>>, buf: &[u8]) {
        let (header, payload) = match wire::unframe(buf) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "psa-udpmc: dropping malformed frame");
                return;
            }
        };

        let mut s = state.lock();
        for entry in &mut s.subscribers {
            if !entry.initialized {
                if let Err(e) = entry.subscriber.init() {
                    tracing::warn!(error = %e, "psa-udpmc: subscriber init failed");
                    continue;
                }
                entry.initialized = true;
            }
            let Some(msg_entry) = entry.msg_types.get(header.msg_type_id) else {
                continue;
            };
            if !version_compatible(header.version, msg_entry.msg_version) {
                tracing::warn!(
                    msg_type_id = header.msg_type_id,
                    sender = ?header.version,
                    receiver = ?msg_entry.msg_version,
                    "psa-udpmc: incompatible message version, dropping"
                );
                continue;
            }
            let msg_inst = match (msg_entry.deserialize)(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "psa-udpmc: deserialize failed");
                    continue;
                }
            };
            let msg_name = msg_entry.msg_name.clone();
            let mut release = false;
            if let Err(e) = entry.subscriber.receive(&msg_name, header.msg_type_id, msg_inst, &mut release) {
                tracing::warn!(error = %e, "psa-udpmc: subscriber.receive failed");
            }
        }
    }
}

impl TopicSubscriptionHandle for TopicSubscription {
    /// Mirrors `psa_udpmc_subscriber_entry_t.usageCount`: the same
    /// subscriber endpoint registering more than once (e.g. re-discovered
    /// after a framework restart racing with removal) bumps a refcount
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
                tracing::warn!(error = %e, "psa-udpmc: could not build serializer map for subscriber");
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
        let large_udp = self.large_udp.clone();
        let running = self.running.clone();
        let interface_ip = self.interface_ip;
        let handle = std::thread::spawn(move || {
            Self::run(state, large_udp, running, interface_ip);
        });
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut s = self.state.lock();
        for (_, peer) in s.peers.drain() {
            unsafe {
                libc::epoll_ctl(s.epoll_fd, libc::EPOLL_CTL_DEL, peer.fd, std::ptr::null_mut());
                libc::close(peer.fd);
            }
        }
        unsafe {
            libc::close(s.epoll_fd);
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
        TopicSubscription::new("127.0.0.1".parse().unwrap(), Arc::new(NullSerializer)).unwrap()
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

//! End-to-end coverage of the UDP multicast transport driven through a
//! real `PsaControlPlane`: a publisher endpoint, a subscriber endpoint, and
//! actual multicast sockets bound to the loopback interface.
//!
//! `PSA_INTERFACE=lo` mirrors spec.md §8 scenario 1's literal setup; these
//! tests share one process, so they also share `psa_udpmc`'s process-wide
//! delay-first-send `Once` — the first send anywhere in the binary pays
//! the 2s late-joiner delay once, which the timeouts below allow for.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use psa_core::{MatchScoring, PsaControlPlane};
use pubsub_types::{
    msg_type_id_for_name, Endpoint, EndpointType, MsgEntry, PsError, PsResult, PsaUdpMcConfig,
    Serializer, SerializerMap, Subscriber,
};

const MSG_NAME: &str = "bytes";

struct BytesSerializer;

impl Serializer for BytesSerializer {
    fn serializer_type(&self) -> &str {
        "bytes"
    }

    fn create_serializer_map(&self, _bundle_id: u64) -> PsResult<SerializerMap> {
        let mut map = SerializerMap::new();
        map.insert(
            msg_type_id_for_name(MSG_NAME),
            MsgEntry {
                msg_name: MSG_NAME.to_string(),
                msg_version: (1, 0),
                serialize: Box::new(|msg: &(dyn Any + Send)| {
                    msg.downcast_ref::<Vec<u8>>()
                        .cloned()
                        .ok_or_else(|| PsError::IllegalArgument("expected Vec<u8>".into()))
                }),
                deserialize: Box::new(|bytes: &[u8]| Ok(Box::new(bytes.to_vec()) as Box<dyn Any + Send>)),
                free_msg: Box::new(|_msg| {}),
            },
        );
        Ok(map)
    }
}

struct RecordingSubscriber {
    received: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSubscriber {
    fn new() -> Arc<Self> {
        Arc::new(RecordingSubscriber {
            received: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

impl Subscriber for RecordingSubscriber {
    fn receive(
        &self,
        _msg_name: &str,
        _msg_type_id: u32,
        msg_inst: Box<dyn Any + Send>,
        release: &mut bool,
    ) -> PsResult<()> {
        if let Ok(bytes) = msg_inst.downcast::<Vec<u8>>() {
            self.received.lock().unwrap().push(*bytes);
        }
        *release = false;
        Ok(())
    }
}

fn new_plane() -> Arc<PsaControlPlane> {
    unsafe {
        std::env::set_var("PSA_INTERFACE", "lo");
        std::env::set_var("PSA_MC_PREFIX", "224.100");
    }
    let cfg = PsaUdpMcConfig::default();
    let scoring = MatchScoring {
        default_score: cfg.default_score,
        qos_sample_score: cfg.qos_sample_score,
        qos_control_score: cfg.qos_control_score,
    };
    let transport = Arc::new(psa_udpmc::UdpMcTransportFactory::new(cfg));
    let plane = Arc::new(PsaControlPlane::new(
        "test-framework",
        psa_udpmc::ADMIN_TYPE,
        scoring,
        transport,
    ));
    plane
        .serializer_added(Arc::new(BytesSerializer))
        .expect("registering the serializer cannot fail");
    plane
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// spec.md §8 scenario 1: publisher registered, subscriber registered,
/// one send, subscriber records exactly that one payload.
#[test]
fn udpmc_happy_path_delivers_one_message() {
    let plane = new_plane();
    let key = pubsub_types::ScopeTopicKey::new("s", "t");

    let pub_ep = Endpoint::new("test-framework", "s", "t", "pub-1", EndpointType::Publisher);
    plane.add_publication(pub_ep).expect("publication starts");

    let subscriber = RecordingSubscriber::new();
    let sub_ep = Endpoint::new("test-framework", "s", "t", "sub-1", EndpointType::Subscriber);
    plane
        .add_subscription(sub_ep, subscriber.clone())
        .expect("subscription starts");

    let publisher = plane
        .publication_handle(&key)
        .expect("publication is live")
        .publisher_for(1, "t")
        .expect("bundle-scoped publisher handle");

    let payload = b"hello".to_vec();
    publisher
        .send(msg_type_id_for_name(MSG_NAME), &payload)
        .expect("send succeeds");

    wait_for(Duration::from_secs(5), || !subscriber.snapshot().is_empty());

    let received = subscriber.snapshot();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], b"hello");
}

/// spec.md §8 scenario 3: a message far larger than one UDP datagram is
/// chunked by `LargeUdp` on the way out and reassembled byte-for-byte on
/// the way in.
#[test]
fn udpmc_reassembles_an_oversized_message() {
    let plane = new_plane();
    let key = pubsub_types::ScopeTopicKey::new("s", "big");

    let pub_ep = Endpoint::new("test-framework", "s", "big", "pub-2", EndpointType::Publisher);
    plane.add_publication(pub_ep).expect("publication starts");

    let subscriber = RecordingSubscriber::new();
    let sub_ep = Endpoint::new("test-framework", "s", "big", "sub-2", EndpointType::Subscriber);
    plane
        .add_subscription(sub_ep, subscriber.clone())
        .expect("subscription starts");

    let publisher = plane
        .publication_handle(&key)
        .expect("publication is live")
        .publisher_for(1, "big")
        .expect("bundle-scoped publisher handle");

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    publisher
        .send(msg_type_id_for_name(MSG_NAME), &payload)
        .expect("send succeeds");

    wait_for(Duration::from_secs(5), || !subscriber.snapshot().is_empty());

    let received = subscriber.snapshot();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].len(), 100_000);
    assert_eq!(received[0], payload);
}

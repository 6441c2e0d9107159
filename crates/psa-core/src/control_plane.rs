use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pubsub_types::{
    keys, Endpoint, EndpointType, Publisher, PsError, PsResult, ScopeTopicKey, Serializer, Subscriber,
};

use crate::transport::{TopicPublicationHandle, TopicSubscriptionHandle, TransportFactory};

const QOS_ATTRIBUTE_KEY: &str = "attribute.qos";
const QOS_TYPE_SAMPLE: &str = "sample";
const QOS_TYPE_CONTROL: &str = "control";

const PSA_ADMIN_FULL_MATCH_SCORE: f64 = 200.0;
const SERIALIZER_FULL_MATCH_SCORE: f64 = 100.0;

/// Scoring knobs for `matchEndpoint`, read by each transport admin from its
/// own environment-driven config and handed to the shared control plane.
#[derive(Debug, Clone, Copy)]
pub struct MatchScoring {
    pub default_score: f64,
    pub qos_sample_score: f64,
    pub qos_control_score: f64,
}

struct PublicationEntry {
    endpoints: Vec<Endpoint>,
    handle: Arc<dyn TopicPublicationHandle>,
    serializer_type: String,
}

struct SubscriptionEntry {
    handle: Arc<dyn TopicSubscriptionHandle>,
    serializer_type: String,
}

/// Transport-agnostic bookkeeping for one publish/subscribe admin instance:
/// who is publishing and subscribing to which scope/topic, which of those
/// are still waiting on a serializer, and the wildcard ("any") subscriber.
///
/// One control plane backs one transport (UDP-MC, ZMQ, ...); the transport
/// supplies its send/receive primitives through a [`TransportFactory`].
pub struct PsaControlPlane {
    framework_uuid: String,
    admin_type: String,
    scoring: MatchScoring,
    transport: Arc<dyn TransportFactory>,

    local_publications: Mutex<HashMap<ScopeTopicKey, PublicationEntry>>,
    external_publications: Mutex<HashMap<ScopeTopicKey, Vec<Endpoint>>>,
    subscriptions: Mutex<HashMap<ScopeTopicKey, SubscriptionEntry>>,
    pending_subscriptions: Mutex<HashMap<ScopeTopicKey, Vec<(Endpoint, Arc<dyn Subscriber>)>>>,

    no_serializer_subscriptions: Mutex<Vec<(Endpoint, Arc<dyn Subscriber>)>>,
    no_serializer_publications: Mutex<Vec<Endpoint>>,
    serializer_list: Mutex<Vec<Arc<dyn Serializer>>>,
}

impl PsaControlPlane {
    pub fn new(
        framework_uuid: &str,
        admin_type: &str,
        scoring: MatchScoring,
        transport: Arc<dyn TransportFactory>,
    ) -> Self {
        PsaControlPlane {
            framework_uuid: framework_uuid.to_string(),
            admin_type: admin_type.to_string(),
            scoring,
            transport,
            local_publications: Mutex::new(HashMap::new()),
            external_publications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            pending_subscriptions: Mutex::new(HashMap::new()),
            no_serializer_subscriptions: Mutex::new(Vec::new()),
            no_serializer_publications: Mutex::new(Vec::new()),
            serializer_list: Mutex::new(Vec::new()),
        }
    }

    fn best_serializer(&self, ep: &Endpoint) -> Option<(Arc<dyn Serializer>, String)> {
        let wanted = ep.serializer_type();
        let list = self.serializer_list.lock();
        if let Some(wanted) = wanted {
            list.iter()
                .find(|s| s.serializer_type() == wanted)
                .map(|s| (s.clone(), s.serializer_type().to_string()))
        } else {
            list.first().map(|s| (s.clone(), s.serializer_type().to_string()))
        }
    }

    /// Collects every publisher URL currently known on any key, local and
    /// external, for the wildcard subscriber.
    fn all_known_publisher_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        for entry in self.local_publications.lock().values() {
            urls.push(entry.handle.url());
        }
        for eps in self.external_publications.lock().values() {
            for ep in eps {
                if let Some(url) = ep.url() {
                    urls.push(url.to_string());
                }
            }
        }
        urls
    }

    fn known_publisher_urls_for_key(&self, key: &ScopeTopicKey) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(entry) = self.local_publications.lock().get(key) {
            urls.push(entry.handle.url());
        }
        if let Some(eps) = self.external_publications.lock().get(key) {
            for ep in eps {
                if let Some(url) = ep.url() {
                    urls.push(url.to_string());
                }
            }
        }
        urls
    }

    pub fn add_subscription(&self, ep: Endpoint, subscriber: Arc<dyn Subscriber>) -> PsResult<()> {
        if ep.is_wildcard() {
            return self.add_wildcard_subscription(ep, subscriber);
        }

        let key = ep.key();

        if self.known_publisher_urls_for_key(&key).is_empty() {
            self.pending_subscriptions
                .lock()
                .entry(key)
                .or_default()
                .push((ep, subscriber));
            return Ok(());
        }

        {
            let subs = self.subscriptions.lock();
            if let Some(entry) = subs.get(&key) {
                entry.handle.add_subscriber(ep, subscriber);
                return Ok(());
            }
        }

        let Some((serializer, serializer_type)) = self.best_serializer(&ep) else {
            self.no_serializer_subscriptions.lock().push((ep, subscriber));
            return Ok(());
        };

        let handle = self.transport.create_subscription(&key, serializer)?;
        for url in self.known_publisher_urls_for_key(&key) {
            handle.enqueue_connect(&url);
        }
        handle.add_subscriber(ep, subscriber);
        handle.start()?;

        self.subscriptions.lock().insert(
            key,
            SubscriptionEntry {
                handle,
                serializer_type,
            },
        );
        Ok(())
    }

    fn add_wildcard_subscription(
        &self,
        ep: Endpoint,
        subscriber: Arc<dyn Subscriber>,
    ) -> PsResult<()> {
        let key = ScopeTopicKey::wildcard();

        {
            let subs = self.subscriptions.lock();
            if let Some(entry) = subs.get(&key) {
                entry.handle.add_subscriber(ep, subscriber);
                return Ok(());
            }
        }

        let Some((serializer, serializer_type)) = self.best_serializer(&ep) else {
            self.no_serializer_subscriptions.lock().push((ep, subscriber));
            return Ok(());
        };

        let handle = self.transport.create_subscription(&key, serializer)?;
        for url in self.all_known_publisher_urls() {
            handle.enqueue_connect(&url);
        }
        handle.add_subscriber(ep, subscriber);
        handle.start()?;

        self.subscriptions.lock().insert(
            key,
            SubscriptionEntry {
                handle,
                serializer_type,
            },
        );
        Ok(())
    }

    pub fn remove_subscription(&self, ep: &Endpoint) -> PsResult<()> {
        let key = ep.key();

        if let Some(mut list) = self.pending_subscriptions.lock().remove(&key) {
            list.retain(|(e, _)| e.endpoint_id() != ep.endpoint_id());
            if !list.is_empty() {
                self.pending_subscriptions.lock().insert(key.clone(), list);
            }
        }

        self.no_serializer_subscriptions
            .lock()
            .retain(|(e, _)| e.endpoint_id() != ep.endpoint_id());

        if let Some(entry) = self.subscriptions.lock().get(&key) {
            entry.handle.remove_subscriber(ep);
        }
        Ok(())
    }

    pub fn add_publication(&self, mut ep: Endpoint) -> PsResult<Endpoint> {
        let key = ep.key();
        let is_own_framework = ep.framework_uuid() == self.framework_uuid;

        if is_own_framework && ep.url().is_none() {
            let Some((serializer, serializer_type)) = self.best_serializer(&ep) else {
                self.no_serializer_publications.lock().push(ep.clone());
                return Ok(ep);
            };

            let mut publications = self.local_publications.lock();
            if let Some(entry) = publications.get_mut(&key) {
                entry.handle.add_publisher_endpoint(ep.clone());
                ep.set(keys::ENDPOINT_URL, &entry.handle.url());
                ep.set(keys::SERIALIZER_TYPE, &entry.serializer_type);
                entry.endpoints.push(ep.clone());
            } else {
                let (handle, stamped) = self
                    .transport
                    .create_publication(&key, &ep, serializer, &serializer_type)?;
                ep = stamped;
                publications.insert(
                    key.clone(),
                    PublicationEntry {
                        endpoints: vec![ep.clone()],
                        handle,
                        serializer_type,
                    },
                );
            }
        } else {
            self.external_publications
                .lock()
                .entry(key.clone())
                .or_default()
                .push(ep.clone());
        }

        if let Some(pending) = self.pending_subscriptions.lock().remove(&key) {
            for (sub_ep, subscriber) in pending {
                self.add_subscription(sub_ep, subscriber)?;
            }
        }

        let url = self
            .known_publisher_urls_for_key(&key)
            .into_iter()
            .last()
            .unwrap_or_default();
        if let Some(entry) = self.subscriptions.lock().get(&key) {
            entry.handle.enqueue_connect(&url);
        }
        if let Some(entry) = self.subscriptions.lock().get(&ScopeTopicKey::wildcard()) {
            entry.handle.enqueue_connect(&url);
        }

        Ok(ep)
    }

    pub fn remove_publication(&self, ep: &Endpoint) -> PsResult<()> {
        let key = ep.key();
        let mut last_referrer = false;

        let mut locals = self.local_publications.lock();
        if let Some(entry) = locals.get_mut(&key) {
            entry.handle.remove_publisher_endpoint(ep);
            entry.endpoints.retain(|e| e.endpoint_id() != ep.endpoint_id());
            if entry.handle.publisher_endpoint_count() == 0 {
                last_referrer = true;
                locals.remove(&key);
            }
        }
        drop(locals);

        let mut externals = self.external_publications.lock();
        if let Some(list) = externals.get_mut(&key) {
            list.retain(|e| e.endpoint_id() != ep.endpoint_id());
            if list.is_empty() {
                externals.remove(&key);
                last_referrer = true;
            }
        }
        drop(externals);

        if last_referrer {
            let Some(url) = ep.url() else {
                return Ok(());
            };
            if let Some(entry) = self.subscriptions.lock().get(&key) {
                entry.handle.enqueue_disconnect(url);
            }
            if let Some(entry) = self.subscriptions.lock().get(&ScopeTopicKey::wildcard()) {
                entry.handle.enqueue_disconnect(url);
            }
        }
        Ok(())
    }

    /// The live receive-side handle for `key`, if a subscription has
    /// actually been materialized (as opposed to still pending a publisher
    /// or serializer). A deployer uses this to enqueue a static connect
    /// address (§C.1) once bootstrap has wired the topic up.
    pub fn subscription_handle(&self, key: &ScopeTopicKey) -> Option<Arc<dyn TopicSubscriptionHandle>> {
        self.subscriptions.lock().get(key).map(|entry| entry.handle.clone())
    }

    /// The live send-side handle for `key`, once a publication has been
    /// materialized, for obtaining a bundle-scoped [`pubsub_types::Publisher`].
    pub fn publication_handle(&self, key: &ScopeTopicKey) -> Option<Arc<dyn TopicPublicationHandle>> {
        self.local_publications.lock().get(key).map(|entry| entry.handle.clone())
    }

    pub fn match_endpoint(&self, ep: &Endpoint) -> f64 {
        let admin_matches = match ep.admin_type() {
            Some(requested) => requested == self.admin_type,
            None => true,
        };
        if !admin_matches {
            return self.scoring.default_score;
        }

        let serializer_matches = {
            let list = self.serializer_list.lock();
            match ep.serializer_type() {
                Some(wanted) => list.iter().any(|s| s.serializer_type() == wanted),
                None => !list.is_empty(),
            }
        };
        if !serializer_matches {
            return self.scoring.default_score;
        }

        let mut score = PSA_ADMIN_FULL_MATCH_SCORE + SERIALIZER_FULL_MATCH_SCORE;
        match ep.get(QOS_ATTRIBUTE_KEY).map(String::as_str) {
            Some(QOS_TYPE_SAMPLE) => score += self.scoring.qos_sample_score,
            Some(QOS_TYPE_CONTROL) => score += self.scoring.qos_control_score,
            _ => {}
        }
        score
    }

    pub fn serializer_added(&self, serializer: Arc<dyn Serializer>) -> PsResult<()> {
        self.serializer_list.lock().push(serializer);

        let pending_subs = std::mem::take(&mut *self.no_serializer_subscriptions.lock());
        let mut still_pending_subs = Vec::new();
        for (ep, subscriber) in pending_subs {
            if self.best_serializer(&ep).is_some() {
                self.add_subscription(ep, subscriber)?;
            } else {
                still_pending_subs.push((ep, subscriber));
            }
        }
        *self.no_serializer_subscriptions.lock() = still_pending_subs;

        let pending_pubs = std::mem::take(&mut *self.no_serializer_publications.lock());
        let mut still_pending_pubs = Vec::new();
        for ep in pending_pubs {
            if self.best_serializer(&ep).is_some() {
                self.add_publication(ep)?;
            } else {
                still_pending_pubs.push(ep);
            }
        }
        *self.no_serializer_publications.lock() = still_pending_pubs;

        Ok(())
    }

    pub fn serializer_removed(&self, serializer_type: &str) {
        let mut subs = self.subscriptions.lock();
        let stale_sub_keys: Vec<ScopeTopicKey> = subs
            .iter()
            .filter(|(_, e)| e.serializer_type == serializer_type)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_sub_keys {
            if let Some(entry) = subs.remove(&key) {
                entry.handle.stop();
                tracing::info!(?key, "psa-core: serializer removed, subscription torn down");
            }
        }
        drop(subs);

        let mut pubs = self.local_publications.lock();
        let stale_pub_keys: Vec<ScopeTopicKey> = pubs
            .iter()
            .filter(|(_, e)| e.serializer_type == serializer_type)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_pub_keys {
            if let Some(entry) = pubs.remove(&key) {
                entry.handle.stop();
                for ep in entry.endpoints {
                    self.no_serializer_publications.lock().push(ep);
                }
                tracing::info!(?key, "psa-core: serializer removed, publication torn down");
            }
        }
    }

    pub fn ensure_admin_type_matches(&self, ep: &Endpoint) -> PsResult<()> {
        match ep.admin_type() {
            Some(requested) if requested != self.admin_type => Err(PsError::IllegalArgument(format!(
                "endpoint requests admin type {requested}, this admin is {}",
                self.admin_type
            ))),
            _ => Ok(()),
        }
    }
}

/// Dispatches an endpoint to `add_subscription`/`add_publication` based on
/// its declared direction, matching the generic service-tracker entry point
/// transports expose to the framework. `subscriber` is only consulted for
/// subscriber-typed endpoints; pass any placeholder for a publisher one.
pub fn add_endpoint(
    plane: &PsaControlPlane,
    ep: Endpoint,
    subscriber: Option<Arc<dyn Subscriber>>,
) -> PsResult<Option<Endpoint>> {
    match ep.endpoint_type() {
        EndpointType::Subscriber => {
            let subscriber = subscriber.ok_or_else(|| {
                PsError::IllegalArgument("subscriber endpoint requires a Subscriber".into())
            })?;
            plane.add_subscription(ep, subscriber)?;
            Ok(None)
        }
        EndpointType::Publisher => Ok(Some(plane.add_publication(ep)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TopicPublicationHandle, TopicSubscriptionHandle, TransportFactory};
    use pubsub_types::{MsgEntry, SerializerMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

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

    struct FakePublication {
        url: String,
        endpoints: StdMutex<Vec<Endpoint>>,
    }
    impl TopicPublicationHandle for FakePublication {
        fn url(&self) -> String {
            self.url.clone()
        }
        fn add_publisher_endpoint(&self, ep: Endpoint) {
            self.endpoints.lock().unwrap().push(ep);
        }
        fn remove_publisher_endpoint(&self, ep: &Endpoint) {
            self.endpoints
                .lock()
                .unwrap()
                .retain(|e| e.endpoint_id() != ep.endpoint_id());
        }
        fn publisher_endpoint_count(&self) -> usize {
            self.endpoints.lock().unwrap().len()
        }
        fn publisher_for(&self, _bundle_id: u64, _topic: &str) -> PsResult<Arc<dyn Publisher>> {
            Err(PsError::IllegalState("FakePublication has no publisher handles".into()))
        }
        fn stop(&self) {}
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

    #[derive(Default)]
    struct FakeSubscription {
        subscribers: StdMutex<Vec<Endpoint>>,
        connects: StdMutex<Vec<String>>,
        disconnects: StdMutex<Vec<String>>,
        started: AtomicUsize,
    }
    impl TopicSubscriptionHandle for FakeSubscription {
        fn add_subscriber(&self, ep: Endpoint, _subscriber: Arc<dyn Subscriber>) {
            self.subscribers.lock().unwrap().push(ep);
        }
        fn remove_subscriber(&self, ep: &Endpoint) {
            self.subscribers
                .lock()
                .unwrap()
                .retain(|e| e.endpoint_id() != ep.endpoint_id());
        }
        fn subscriber_count(&self) -> usize {
            self.subscribers.lock().unwrap().len()
        }
        fn enqueue_connect(&self, url: &str) {
            self.connects.lock().unwrap().push(url.to_string());
        }
        fn enqueue_disconnect(&self, url: &str) {
            self.disconnects.lock().unwrap().push(url.to_string());
        }
        fn start(&self) -> PsResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) {}
    }

    struct FakeTransport {
        next_port: AtomicUsize,
        subs: StdMutex<Vec<Arc<FakeSubscription>>>,
    }
    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                next_port: AtomicUsize::new(9000),
                subs: StdMutex::new(Vec::new()),
            }
        }
    }
    impl TransportFactory for FakeTransport {
        fn admin_type(&self) -> &str {
            "pubsub.test"
        }
        fn create_publication(
            &self,
            _key: &ScopeTopicKey,
            ep: &Endpoint,
            _serializer: Arc<dyn Serializer>,
            serializer_type: &str,
        ) -> PsResult<(Arc<dyn TopicPublicationHandle>, Endpoint)> {
            let port = self.next_port.fetch_add(1, Ordering::SeqCst);
            let url = format!("fake://127.0.0.1:{port}");
            let mut stamped = ep.clone();
            stamped.set(keys::ENDPOINT_URL, &url);
            stamped.set(keys::SERIALIZER_TYPE, serializer_type);
            Ok((
                Arc::new(FakePublication {
                    url,
                    endpoints: StdMutex::new(vec![stamped.clone()]),
                }),
                stamped,
            ))
        }
        fn create_subscription(
            &self,
            _key: &ScopeTopicKey,
            _serializer: Arc<dyn Serializer>,
        ) -> PsResult<Arc<dyn TopicSubscriptionHandle>> {
            let sub = Arc::new(FakeSubscription::default());
            self.subs.lock().unwrap().push(sub.clone());
            Ok(sub)
        }
    }

    fn plane() -> (PsaControlPlane, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let plane = PsaControlPlane::new(
            "fw-1",
            "pubsub.test",
            MatchScoring {
                default_score: 50.0,
                qos_sample_score: 70.0,
                qos_control_score: 30.0,
            },
            transport.clone(),
        );
        (plane, transport)
    }

    #[test]
    fn subscription_without_publisher_is_pending() {
        let (plane, _t) = plane();
        let sub_ep = Endpoint::new("fw-1", "s", "t", "sub-1", EndpointType::Subscriber);
        plane
            .add_subscription(sub_ep, Arc::new(NullSubscriber))
            .unwrap();
        assert!(plane
            .pending_subscriptions
            .lock()
            .contains_key(&ScopeTopicKey::new("s", "t")));
    }

    #[test]
    fn publication_drains_pending_subscription() {
        let (plane, _t) = plane();
        plane.serializer_added(Arc::new(NullSerializer)).unwrap();

        let sub_ep = Endpoint::new("fw-1", "s", "t", "sub-1", EndpointType::Subscriber);
        plane
            .add_subscription(sub_ep, Arc::new(NullSubscriber))
            .unwrap();
        assert!(!plane.subscriptions.lock().contains_key(&ScopeTopicKey::new("s", "t")));

        let pub_ep = Endpoint::new("fw-1", "s", "t", "pub-1", EndpointType::Publisher);
        plane.add_publication(pub_ep).unwrap();

        assert!(plane.subscriptions.lock().contains_key(&ScopeTopicKey::new("s", "t")));
        assert!(!plane
            .pending_subscriptions
            .lock()
            .contains_key(&ScopeTopicKey::new("s", "t")));
    }

    #[test]
    fn repeated_publication_by_same_endpoint_id_stays_single_entry() {
        let (plane, _t) = plane();
        plane.serializer_added(Arc::new(NullSerializer)).unwrap();
        let ep = Endpoint::new("fw-1", "s", "t", "pub-1", EndpointType::Publisher);
        let stamped = plane.add_publication(ep.clone()).unwrap();
        let again = plane.add_publication(stamped.clone()).unwrap();
        assert_eq!(stamped.url(), again.url());
    }

    #[test]
    fn no_serializer_pending_migrates_once_serializer_registers() {
        let (plane, _t) = plane();
        let sub_ep = Endpoint::new("fw-1", "s", "t", "sub-1", EndpointType::Subscriber);
        let pub_ep = Endpoint::new("fw-1", "s", "t", "pub-1", EndpointType::Publisher);
        plane.add_publication(pub_ep).unwrap();
        plane
            .add_subscription(sub_ep, Arc::new(NullSubscriber))
            .unwrap();
        assert_eq!(plane.no_serializer_subscriptions.lock().len(), 1);

        plane.serializer_added(Arc::new(NullSerializer)).unwrap();
        assert_eq!(plane.no_serializer_subscriptions.lock().len(), 0);
        assert!(plane.subscriptions.lock().contains_key(&ScopeTopicKey::new("s", "t")));
    }

    #[test]
    fn match_endpoint_scores_full_match_with_qos_tiebreak() {
        let (plane, _t) = plane();
        plane.serializer_added(Arc::new(NullSerializer)).unwrap();
        let mut ep = Endpoint::new("fw-1", "s", "t", "pub-1", EndpointType::Publisher);
        ep.set("attribute.qos", "sample");
        assert_eq!(plane.match_endpoint(&ep), 200.0 + 100.0 + 70.0);
    }

    #[test]
    fn match_endpoint_falls_back_to_default_on_admin_type_mismatch() {
        let (plane, _t) = plane();
        plane.serializer_added(Arc::new(NullSerializer)).unwrap();
        let mut ep = Endpoint::new("fw-1", "s", "t", "pub-1", EndpointType::Publisher);
        ep.set(keys::ADMIN_TYPE, "pubsub.other");
        assert_eq!(plane.match_endpoint(&ep), 50.0);
    }
}

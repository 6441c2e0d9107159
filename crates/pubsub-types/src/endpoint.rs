use crate::error::{PsError, PsResult};
use crate::keys;
use std::collections::BTreeMap;
use std::fmt;

/// Which side of a topic stream an [`Endpoint`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Publisher,
    Subscriber,
}

impl EndpointType {
    fn as_str(self) -> &'static str {
        match self {
            EndpointType::Publisher => keys::ENDPOINT_TYPE_PUBLISHER,
            EndpointType::Subscriber => keys::ENDPOINT_TYPE_SUBSCRIBER,
        }
    }

    fn parse(s: &str) -> PsResult<Self> {
        match s {
            v if v == keys::ENDPOINT_TYPE_PUBLISHER => Ok(EndpointType::Publisher),
            v if v == keys::ENDPOINT_TYPE_SUBSCRIBER => Ok(EndpointType::Subscriber),
            other => Err(PsError::BundleException(format!(
                "unknown endpoint.type '{other}'"
            ))),
        }
    }
}

/// `scope ":" topic`, the composite key used for wiring throughout the PSA.
///
/// Two endpoints are equivalent for wiring purposes iff their keys and
/// endpoint UUIDs match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeTopicKey(String);

impl ScopeTopicKey {
    pub fn new(scope: &str, topic: &str) -> Self {
        ScopeTopicKey(format!("{scope}:{topic}"))
    }

    /// The key shared by every wildcard subscription on a PSA.
    pub fn wildcard() -> Self {
        // The wildcard has no meaningful scope; Celix's pubsub_endpoint uses
        // an empty scope component for it.
        ScopeTopicKey::new("", keys::ANY_TOPIC)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The topic component, split back out of `scope:topic`. ZMQ's
    /// transport needs this on its own to build the wire header and the
    /// subscription's byte-prefix filter; UDP-MC derives its multicast
    /// group from the interface instead and never needs it.
    pub fn topic(&self) -> &str {
        self.0.split_once(':').map(|(_, topic)| topic).unwrap_or(&self.0)
    }
}

impl fmt::Display for ScopeTopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bag of immutable string properties describing one end of a topic
/// stream, cloned into the PSA's structures on registration/discovery and
/// released when the last reference drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    properties: BTreeMap<String, String>,
}

impl Endpoint {
    /// Builds a publisher/subscriber endpoint from its required fields,
    /// filling in the required property keys.
    pub fn new(
        framework_uuid: &str,
        scope: &str,
        topic: &str,
        endpoint_id: &str,
        endpoint_type: EndpointType,
    ) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(keys::FRAMEWORK_UUID.to_string(), framework_uuid.to_string());
        properties.insert(keys::TOPIC_SCOPE.to_string(), scope.to_string());
        properties.insert(keys::TOPIC_NAME.to_string(), topic.to_string());
        properties.insert(keys::ENDPOINT_ID.to_string(), endpoint_id.to_string());
        properties.insert(
            keys::ENDPOINT_TYPE.to_string(),
            endpoint_type.as_str().to_string(),
        );
        Endpoint { properties }
    }

    /// Round-trips a property bag discovered over the wire/registry back
    /// into an `Endpoint`, validating the required keys are present.
    ///
    /// `properties(create_from_properties(E.properties)) == E.properties`
    /// for any endpoint `E` produced by this crate.
    pub fn create_from_properties(properties: BTreeMap<String, String>) -> PsResult<Self> {
        for required in [
            keys::FRAMEWORK_UUID,
            keys::TOPIC_SCOPE,
            keys::TOPIC_NAME,
            keys::ENDPOINT_ID,
            keys::ENDPOINT_TYPE,
        ] {
            if !properties.contains_key(required) {
                return Err(PsError::BundleException(format!(
                    "missing mandatory endpoint property '{required}'"
                )));
            }
        }
        // Validate, but keep the original string representation verbatim so
        // round-tripping is exact even for forward-compatible values.
        EndpointType::parse(&properties[keys::ENDPOINT_TYPE])?;
        Ok(Endpoint { properties })
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn framework_uuid(&self) -> &str {
        &self.properties[keys::FRAMEWORK_UUID]
    }

    pub fn scope(&self) -> &str {
        &self.properties[keys::TOPIC_SCOPE]
    }

    pub fn topic(&self) -> &str {
        &self.properties[keys::TOPIC_NAME]
    }

    pub fn endpoint_id(&self) -> &str {
        &self.properties[keys::ENDPOINT_ID]
    }

    pub fn endpoint_type(&self) -> EndpointType {
        EndpointType::parse(&self.properties[keys::ENDPOINT_TYPE])
            .expect("validated in create_from_properties/new")
    }

    pub fn admin_type(&self) -> Option<&str> {
        self.get(keys::ADMIN_TYPE)
    }

    pub fn serializer_type(&self) -> Option<&str> {
        self.get(keys::SERIALIZER_TYPE)
    }

    pub fn url(&self) -> Option<&str> {
        self.get(keys::ENDPOINT_URL)
    }

    pub fn is_wildcard(&self) -> bool {
        self.topic() == keys::ANY_TOPIC
    }

    pub fn key(&self) -> ScopeTopicKey {
        if self.is_wildcard() {
            ScopeTopicKey::wildcard()
        } else {
            ScopeTopicKey::new(self.scope(), self.topic())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Endpoint {
        Endpoint::new("fw-1", "s", "t", "ep-1", EndpointType::Publisher)
    }

    #[test]
    fn properties_round_trip() {
        let ep = sample();
        let round_tripped =
            Endpoint::create_from_properties(ep.properties().clone()).expect("valid");
        assert_eq!(round_tripped.properties(), ep.properties());
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let mut props = sample().properties().clone();
        props.remove(keys::ENDPOINT_ID);
        assert!(Endpoint::create_from_properties(props).is_err());
    }

    #[test]
    fn key_combines_scope_and_topic() {
        let ep = sample();
        assert_eq!(ep.key().as_str(), "s:t");
    }

    #[test]
    fn key_topic_splits_out_scope() {
        assert_eq!(ScopeTopicKey::new("s", "t").topic(), "t");
        assert_eq!(ScopeTopicKey::wildcard().topic(), keys::ANY_TOPIC);
    }

    #[test]
    fn wildcard_topic_uses_wildcard_key() {
        let ep = Endpoint::new("fw-1", "ignored", "any", "ep-2", EndpointType::Subscriber);
        assert_eq!(ep.key(), ScopeTopicKey::wildcard());
    }
}

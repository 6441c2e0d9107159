//! Static topic bootstrap configuration.
//!
//! TOML is the sole config source for *which topics to start*; everything
//! about *how* a transport behaves still comes from its own `PSA_*`/
//! `CELIX_RSA_SHM_*` environment variables (`pubsub_types::config`) — a real
//! OSGi framework drives registration dynamically and never needed this
//! file at all; a standalone binary needs something to bootstrap from.
//!
//! Default config path: `/etc/pubsub-admin/topics.toml`.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    UdpMc,
    Zmq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Subscriber,
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub scope: String,
    pub topic: String,
    pub transport: TransportKind,
    pub role: Role,
    /// §C.1: connect straight to these peers instead of waiting for
    /// discovery to enqueue a publisher's URL.
    pub static_connect_addresses: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub topics: Vec<TopicConfig>,
    /// Abstract-socket name to bind an `RsaShmServer` under, if this
    /// deployment also exposes a shared-memory RPC service. `None` skips
    /// starting one.
    pub shm_server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBootstrap {
    schema_version: Option<u32>,
    topics: Option<Vec<RawTopic>>,
    shm_server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTopic {
    scope: Option<String>,
    topic: Option<String>,
    transport: Option<TransportKind>,
    role: Option<Role>,
    #[serde(default)]
    static_connect_addresses: Vec<String>,
}

pub fn load_config() -> Result<BootstrapConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/pubsub-admin/topics.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<BootstrapConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<BootstrapConfig, ConfigError> {
    let raw: RawBootstrap = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.unwrap_or(1);
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_topics = raw.topics.unwrap_or_default();
    let mut topics = Vec::with_capacity(raw_topics.len());
    for (i, t) in raw_topics.into_iter().enumerate() {
        let scope = t.scope.unwrap_or_else(|| "default".to_string());
        let topic = t
            .topic
            .ok_or_else(|| ConfigError::MissingField(format!("topics[{i}].topic")))?;
        let transport = t
            .transport
            .ok_or_else(|| ConfigError::MissingField(format!("topics[{i}].transport")))?;
        let role = t
            .role
            .ok_or_else(|| ConfigError::MissingField(format!("topics[{i}].role")))?;
        topics.push(TopicConfig {
            scope,
            topic,
            transport,
            role,
            static_connect_addresses: t.static_connect_addresses,
        });
    }

    Ok(BootstrapConfig {
        topics,
        shm_server_name: raw.shm_server_name,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(String),
    #[error("invalid TOML: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_bootstrap_file() {
        let toml = r#"
            schema_version = 1

            [[topics]]
            scope = "default"
            topic = "telemetry"
            transport = "udp_mc"
            role = "publisher"

            [[topics]]
            scope = "default"
            topic = "telemetry"
            transport = "udp_mc"
            role = "subscriber"
            static_connect_addresses = ["239.1.2.3:49200"]
        "#;
        let cfg = load_config_from_str(toml).expect("valid config");
        assert_eq!(cfg.topics.len(), 2);
        assert_eq!(cfg.topics[0].transport, TransportKind::UdpMc);
        assert_eq!(cfg.topics[1].role, Role::Subscriber);
        assert_eq!(cfg.topics[1].static_connect_addresses, vec!["239.1.2.3:49200"]);
    }

    #[test]
    fn missing_topic_field_is_rejected() {
        let toml = r#"
            [[topics]]
            scope = "default"
            transport = "udp_mc"
            role = "publisher"
        "#;
        assert!(load_config_from_str(toml).is_err());
    }

    #[test]
    fn empty_topics_list_is_allowed() {
        let cfg = load_config_from_str("schema_version = 1").expect("valid config");
        assert!(cfg.topics.is_empty());
    }

    #[test]
    fn loads_from_a_real_file_on_disk() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().expect("create temp file");
        write!(
            f,
            r#"
            schema_version = 1
            shm_server_name = "example-rpc"

            [[topics]]
            topic = "telemetry"
            transport = "zmq"
            role = "publisher"
            "#
        )
        .expect("write config");

        let cfg = load_config_from_path(f.path()).expect("valid config file");
        assert_eq!(cfg.shm_server_name.as_deref(), Some("example-rpc"));
        assert_eq!(cfg.topics[0].transport, TransportKind::Zmq);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = load_config_from_path(Path::new("/nonexistent/pubsub-admin-test.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}

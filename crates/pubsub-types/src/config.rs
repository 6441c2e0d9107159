//! Environment-driven configuration shared by every transport admin.
//!
//! Every key is optional; unset keys fall back to the defaults documented
//! next to each field. There is no TOML layer here (unlike the higher-level
//! demo service) because these values are sourced from the framework's own
//! bundle properties in the original system, which this crate models as
//! process environment variables.

use std::env;

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// UDP-MC / ZMQ transport configuration (`PSA_*` keys).
#[derive(Debug, Clone)]
pub struct PsaUdpMcConfig {
    pub ip: Option<String>,
    pub interface: Option<String>,
    pub mc_prefix: String,
    pub verbose: bool,
    pub zmq_base_port: u16,
    pub zmq_max_port: u16,
    pub zmq_receive_timeout_micros: u64,
    pub nr_zmq_threads: u8,
    pub qos_sample_score: f64,
    pub qos_control_score: f64,
    pub default_score: f64,
}

impl Default for PsaUdpMcConfig {
    fn default() -> Self {
        PsaUdpMcConfig {
            ip: env_string("PSA_IP"),
            interface: env_string("PSA_INTERFACE"),
            mc_prefix: env_string("PSA_MC_PREFIX").unwrap_or_else(|| "224.100".to_string()),
            verbose: env_string("PSA_UDPMC_VERBOSE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            zmq_base_port: env_u16("PSA_ZMQ_BASE_PORT", 49152),
            zmq_max_port: env_u16("PSA_ZMQ_MAX_PORT", 65000),
            zmq_receive_timeout_micros: env_u64("PSA_ZMQ_RECEIVE_TIMEOUT_MICROSEC", 1000),
            nr_zmq_threads: env_string("PSA_NR_ZMQ_THREADS")
                .and_then(|v| v.parse::<u8>().ok())
                .filter(|n| (1..=49).contains(n))
                .unwrap_or(1),
            qos_sample_score: env_f64("PSA_UDPMC_QOS_SAMPLE_SCORE", 70.0),
            qos_control_score: env_f64("PSA_UDPMC_QOS_CONTROL_SCORE", 30.0),
            default_score: env_f64("PSA_UDPMC_DEFAULT_SCORE", 50.0),
        }
    }
}

/// Shared-memory RPC configuration (`CELIX_RSA_SHM_*` keys).
#[derive(Debug, Clone)]
pub struct RsaShmConfig {
    pub pool_size: usize,
    pub msg_timeout: std::time::Duration,
    pub max_concurrent_invocations: u32,
}

impl Default for RsaShmConfig {
    fn default() -> Self {
        let pool_size = env_u32("CELIX_RSA_SHM_POOL_SIZE", 262_144).max(8192) as usize;
        let timeout_s = env_u64("CELIX_RSA_SHM_MSG_TIMEOUT", 30);
        RsaShmConfig {
            pool_size,
            msg_timeout: std::time::Duration::from_secs(timeout_s),
            max_concurrent_invocations: env_u32("CELIX_RSA_SHM_MAX_CONCURRENT_INVOCATIONS_NUM", 32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Clear any leaked env vars from other tests in the same process.
        for key in [
            "PSA_MC_PREFIX",
            "PSA_ZMQ_BASE_PORT",
            "PSA_ZMQ_MAX_PORT",
            "CELIX_RSA_SHM_POOL_SIZE",
        ] {
            unsafe { env::remove_var(key) };
        }
        let cfg = PsaUdpMcConfig::default();
        assert_eq!(cfg.mc_prefix, "224.100");
        assert_eq!(cfg.zmq_base_port, 49152);
        assert_eq!(cfg.zmq_max_port, 65000);

        let shm = RsaShmConfig::default();
        assert_eq!(shm.pool_size, 262_144);
        assert_eq!(shm.msg_timeout, std::time::Duration::from_secs(30));
    }

    #[test]
    fn pool_size_has_a_floor() {
        unsafe { env::set_var("CELIX_RSA_SHM_POOL_SIZE", "100") };
        let shm = RsaShmConfig::default();
        assert_eq!(shm.pool_size, 8192);
        unsafe { env::remove_var("CELIX_RSA_SHM_POOL_SIZE") };
    }
}

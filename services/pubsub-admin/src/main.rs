// pubsub-admin: loads a static topic bootstrap file, wires a PsaControlPlane
// to the configured transports, and runs until signalled.

mod config;
mod serializer;
mod subscriber;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use psa_core::{MatchScoring, PsaControlPlane};
use pubsub_types::{Endpoint, EndpointType, PsaUdpMcConfig, RsaShmConfig, ScopeTopicKey};
use rsa_shm::{RsaShmServer, ShmRequestHandler};
use tracing::{error, info, warn};

use config::{BootstrapConfig, Role, TopicConfig, TransportKind};
use serializer::BytesSerializer;
use subscriber::LoggingSubscriber;

#[derive(Parser, Debug)]
#[command(name = "pubsub-admin", about = "Publish/subscribe admin core")]
struct Cli {
    /// Path to the static topic bootstrap TOML file.
    #[arg(long, default_value = "/etc/pubsub-admin/topics.toml")]
    config: std::path::PathBuf,
}

struct EchoShmHandler;
impl ShmRequestHandler for EchoShmHandler {
    fn receive(&self, _metadata: &[u8], request: &[u8]) -> rsa_shm::ShmResult<Vec<u8>> {
        Ok(request.to_vec())
    }
}

fn scoring_from(cfg: &PsaUdpMcConfig) -> MatchScoring {
    MatchScoring {
        default_score: cfg.default_score,
        qos_sample_score: cfg.qos_sample_score,
        qos_control_score: cfg.qos_control_score,
    }
}

/// Builds the one `PsaControlPlane` a topic's transport kind needs, creating
/// it lazily and reusing it for every later topic on the same transport.
fn plane_for<'a>(
    kind: TransportKind,
    framework_uuid: &str,
    udpmc_plane: &'a mut Option<Arc<PsaControlPlane>>,
    zmq_plane: &'a mut Option<Arc<PsaControlPlane>>,
) -> Arc<PsaControlPlane> {
    match kind {
        TransportKind::UdpMc => udpmc_plane
            .get_or_insert_with(|| {
                let cfg = PsaUdpMcConfig::default();
                let scoring = scoring_from(&cfg);
                let transport = Arc::new(psa_udpmc::UdpMcTransportFactory::new(cfg));
                let plane = Arc::new(PsaControlPlane::new(
                    framework_uuid,
                    psa_udpmc::ADMIN_TYPE,
                    scoring,
                    transport,
                ));
                plane
                    .serializer_added(Arc::new(BytesSerializer))
                    .expect("registering the bootstrap serializer cannot fail");
                plane
            })
            .clone(),
        TransportKind::Zmq => zmq_plane
            .get_or_insert_with(|| {
                let cfg = PsaUdpMcConfig::default();
                let scoring = scoring_from(&cfg);
                let advertise_host = cfg
                    .ip
                    .clone()
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                let transport = Arc::new(psa_zmq::ZmqTransportFactory::new(cfg, advertise_host));
                let plane = Arc::new(PsaControlPlane::new(
                    framework_uuid,
                    psa_zmq::ADMIN_TYPE,
                    scoring,
                    transport,
                ));
                plane
                    .serializer_added(Arc::new(BytesSerializer))
                    .expect("registering the bootstrap serializer cannot fail");
                plane
            })
            .clone(),
    }
}

fn start_topic(
    topic: &TopicConfig,
    framework_uuid: &str,
    udpmc_plane: &mut Option<Arc<PsaControlPlane>>,
    zmq_plane: &mut Option<Arc<PsaControlPlane>>,
) {
    let plane = plane_for(topic.transport, framework_uuid, udpmc_plane, zmq_plane);
    let key = ScopeTopicKey::new(&topic.scope, &topic.topic);
    let endpoint_id = uuid::Uuid::new_v4().to_string();

    match topic.role {
        Role::Publisher => {
            let ep = Endpoint::new(
                framework_uuid,
                &topic.scope,
                &topic.topic,
                &endpoint_id,
                EndpointType::Publisher,
            );
            match plane.add_publication(ep) {
                Ok(stamped) => info!(
                    scope = %topic.scope, topic = %topic.topic,
                    url = ?stamped.url(), "pubsub-admin: publication started"
                ),
                Err(e) => error!(scope = %topic.scope, topic = %topic.topic, error = %e,
                    "pubsub-admin: failed to start publication"),
            }
        }
        Role::Subscriber => {
            let ep = Endpoint::new(
                framework_uuid,
                &topic.scope,
                &topic.topic,
                &endpoint_id,
                EndpointType::Subscriber,
            );
            let subscriber = Arc::new(LoggingSubscriber::new(key.clone()));
            if let Err(e) = plane.add_subscription(ep, subscriber) {
                error!(scope = %topic.scope, topic = %topic.topic, error = %e,
                    "pubsub-admin: failed to start subscription");
                return;
            }
            info!(scope = %topic.scope, topic = %topic.topic, "pubsub-admin: subscription started");

            if !topic.static_connect_addresses.is_empty() {
                if let Some(handle) = plane.subscription_handle(&key) {
                    for addr in &topic.static_connect_addresses {
                        handle.enqueue_connect(addr);
                        info!(topic = %topic.topic, peer = %addr,
                            "pubsub-admin: enqueued static connect address");
                    }
                } else {
                    // add_subscription queued this one pending a serializer/publisher;
                    // the static address is lost until the subscription actually
                    // materializes, which this bootstrap binary doesn't retry.
                    warn!(topic = %topic.topic,
                        "pubsub-admin: subscription not yet live, static connect addresses dropped");
                }
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "pubsub-admin starting");

    let bootstrap: BootstrapConfig = match config::load_config_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "failed to load bootstrap config");
            std::process::exit(1);
        }
    };

    let framework_uuid = uuid::Uuid::new_v4().to_string();
    let mut udpmc_plane: Option<Arc<PsaControlPlane>> = None;
    let mut zmq_plane: Option<Arc<PsaControlPlane>> = None;

    for topic in &bootstrap.topics {
        start_topic(topic, &framework_uuid, &mut udpmc_plane, &mut zmq_plane);
    }

    let _shm_server = bootstrap.shm_server_name.as_deref().map(|name| {
        let shm_cfg = RsaShmConfig::default();
        info!(server_name = name, "pubsub-admin: starting shared-memory RPC server");
        RsaShmServer::bind(
            name,
            num_cpus_fallback(),
            shm_cfg.max_concurrent_invocations,
            Arc::new(EchoShmHandler),
        )
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to start rsa-shm server");
            std::process::exit(1);
        })
    });

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || {
        info!("pubsub-admin: shutdown signal received");
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("failed to install signal handler");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(250));
    }

    if let Some(plane) = &udpmc_plane {
        stop_all(plane, &bootstrap);
    }
    if let Some(plane) = &zmq_plane {
        stop_all(plane, &bootstrap);
    }
    info!("pubsub-admin: shut down cleanly");
}

fn stop_all(plane: &PsaControlPlane, bootstrap: &BootstrapConfig) {
    for topic in &bootstrap.topics {
        let key = ScopeTopicKey::new(&topic.scope, &topic.topic);
        match topic.role {
            Role::Publisher => {
                if let Some(handle) = plane.publication_handle(&key) {
                    handle.stop();
                }
            }
            Role::Subscriber => {
                if let Some(handle) = plane.subscription_handle(&key) {
                    handle.stop();
                }
            }
        }
    }
}

/// Worker-thread count for the shared-memory RPC server's dispatch pool.
/// No `num_cpus` dependency in this workspace — a small fixed pool is
/// enough for a bootstrap binary and keeps the dependency list honest.
fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

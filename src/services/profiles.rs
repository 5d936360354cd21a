//! Container specs for each service family.
//!
//! Every renderer starts from the family environment and then layers the
//! caller's environment on top, so caller keys win.

use crate::domain::{ContainerSpec, Credentials, PortBinding, ServiceKind, ServiceOptions};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

pub const REPLICA_SET_NAME: &str = "rs0";
pub const KAFKA_INTERNAL_PORT: u16 = 29092;

/// One member of the three-node replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaNode {
    pub suffix: &'static str,
    pub alias: &'static str,
}

/// Master first.
pub const REPLICA_NODES: [ReplicaNode; 3] = [
    ReplicaNode {
        suffix: "m1",
        alias: "master",
    },
    ReplicaNode {
        suffix: "rs2",
        alias: "rs2",
    },
    ReplicaNode {
        suffix: "rs3",
        alias: "rs3",
    },
];

impl ReplicaNode {
    pub fn container_name(&self, base: &str) -> String {
        format!("{base}-{}", self.suffix)
    }
}

/// Everything the launcher needs to start one container and wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub spec: ContainerSpec,
    pub container_port: u16,
    pub startup_timeout: Duration,
    pub log: bool,
    pub credentials: Option<Credentials>,
}

fn base_spec(opts: &ServiceOptions, name: String) -> ContainerSpec {
    let mut spec = ContainerSpec::new(name, opts.image());
    spec.networks = opts.networks().to_vec();
    spec.auto_remove = opts.auto_remove();
    spec
}

fn published(opts: &ServiceOptions) -> PortBinding {
    let container = opts.kind().container_port();
    match opts.port() {
        Some(host) => PortBinding::fixed(host, container),
        None => PortBinding::dynamic(container),
    }
}

fn layered_env(
    family: Vec<(&'static str, String)>,
    opts: &ServiceOptions,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = family
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    env.extend(opts.env().iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn request(opts: &ServiceOptions, spec: ContainerSpec) -> LaunchRequest {
    LaunchRequest {
        spec,
        container_port: opts.kind().container_port(),
        startup_timeout: opts.startup_timeout(),
        log: opts.log(),
        credentials: opts.credentials().cloned(),
    }
}

pub fn cache(opts: &ServiceOptions) -> LaunchRequest {
    let mut spec = base_spec(opts, opts.name().to_string());
    spec.ports = vec![published(opts)];
    spec.env = layered_env(Vec::new(), opts);

    if let Some(credentials) = opts.credentials() {
        spec.cmd = vec![
            "redis-server".into(),
            "--requirepass".into(),
            credentials.password.clone(),
        ];
    }

    request(opts, spec)
}

pub fn database(opts: &ServiceOptions) -> LaunchRequest {
    let mut spec = base_spec(opts, opts.name().to_string());
    spec.ports = vec![published(opts)];

    // The image only accepts a root password together with a root user.
    let mut family = Vec::new();
    if let Some(credentials) = opts.credentials() {
        match credentials.user.as_deref().filter(|user| !user.is_empty()) {
            Some(user) => {
                family.push(("MONGO_INITDB_ROOT_USERNAME", user.to_string()));
                family.push(("MONGO_INITDB_ROOT_PASSWORD", credentials.password.clone()));
            }
            None => warn!(
                container = %opts.name(),
                "Database password given without a user, starting without auth"
            ),
        }
    }
    spec.env = layered_env(family, opts);

    request(opts, spec)
}

/// A replica-set member on `network`. Members publish the database port on a
/// runtime-assigned host port and never carry credentials.
pub fn replica_node(opts: &ServiceOptions, node: &ReplicaNode, network: &str) -> LaunchRequest {
    let mut spec = base_spec(opts, node.container_name(opts.name()));
    spec.networks = std::iter::once(network.to_string())
        .chain(opts.networks().iter().filter(|n| *n != network).cloned())
        .collect();
    spec.hostname = Some(node.alias.to_string());
    spec.network_aliases = vec![node.alias.to_string()];
    spec.ports = vec![PortBinding::dynamic(ServiceKind::Mongo.container_port())];
    spec.env = layered_env(Vec::new(), opts);
    spec.cmd = vec![
        "--replSet".into(),
        REPLICA_SET_NAME.into(),
        "--bind_ip".into(),
        format!("localhost,{}", node.alias),
    ];

    let mut req = request(opts, spec);
    req.credentials = None;
    req
}

pub fn zookeeper(opts: &ServiceOptions) -> LaunchRequest {
    let mut spec = base_spec(opts, opts.name().to_string());
    spec.hostname = Some(opts.name().to_string());
    spec.ports = vec![published(opts)];
    spec.env = layered_env(
        vec![
            (
                "ZOOKEEPER_CLIENT_PORT",
                ServiceKind::Zookeeper.container_port().to_string(),
            ),
            ("ZOOKEEPER_TICK_TIME", "2000".to_string()),
        ],
        opts,
    );

    request(opts, spec)
}

/// The broker, reachable by other containers as `<name>:29092` and from the
/// host as `localhost:<host_port>`.
pub fn kafka(opts: &ServiceOptions, zookeeper_name: &str, host_port: u16) -> LaunchRequest {
    let name = opts.name().to_string();
    let mut spec = base_spec(opts, name.clone());
    spec.hostname = Some(name.clone());
    spec.ports = vec![PortBinding::fixed(
        host_port,
        ServiceKind::Kafka.container_port(),
    )];
    spec.env = layered_env(
        vec![
            ("KAFKA_BROKER_ID", "1".to_string()),
            (
                "KAFKA_ZOOKEEPER_CONNECT",
                format!(
                    "{zookeeper_name}:{}",
                    ServiceKind::Zookeeper.container_port()
                ),
            ),
            (
                "KAFKA_LISTENER_SECURITY_PROTOCOL_MAP",
                "PLAINTEXT:PLAINTEXT,PLAINTEXT_HOST:PLAINTEXT".to_string(),
            ),
            ("KAFKA_INTER_BROKER_LISTENER_NAME", "PLAINTEXT".to_string()),
            ("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", "1".to_string()),
            (
                "KAFKA_LISTENERS",
                format!(
                    "PLAINTEXT://0.0.0.0:{KAFKA_INTERNAL_PORT},PLAINTEXT_HOST://0.0.0.0:{}",
                    ServiceKind::Kafka.container_port()
                ),
            ),
            (
                "KAFKA_ADVERTISED_LISTENERS",
                format!(
                    "PLAINTEXT://{name}:{KAFKA_INTERNAL_PORT},PLAINTEXT_HOST://localhost:{host_port}"
                ),
            ),
        ],
        opts,
    );

    request(opts, spec)
}

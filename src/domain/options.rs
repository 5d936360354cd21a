//! Per-family service configuration.
//!
//! Options are assembled with [`ServiceOptionsBuilder`]: setters apply in
//! call order and the last call for a field wins. Setters never fail;
//! out-of-range values are replaced by the family default in `build()`.

use super::Credentials;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_TAG: &str = "latest";
const CONFLUENT_TAG: &str = "7.6.1";
const DEFAULT_PROTOCOL_VERSION: &str = "3.6.1";
const DEFAULT_CACHE_DB: i64 = 1;

/// Service families the crate knows how to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Redis,
    Mongo,
    Zookeeper,
    Kafka,
}

impl ServiceKind {
    pub fn image(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Mongo => "mongo",
            Self::Zookeeper => "confluentinc/cp-zookeeper",
            Self::Kafka => "confluentinc/cp-kafka",
        }
    }

    pub fn default_tag(&self) -> &'static str {
        match self {
            Self::Redis | Self::Mongo => DEFAULT_TAG,
            Self::Zookeeper | Self::Kafka => CONFLUENT_TAG,
        }
    }

    /// Port the service listens on inside its container.
    pub fn container_port(&self) -> u16 {
        match self {
            Self::Redis => 6379,
            Self::Mongo => 27017,
            Self::Zookeeper => 2181,
            Self::Kafka => 9092,
        }
    }

    /// Host port used when the caller does not choose one. `None` means the
    /// port is not pinned: the runtime (or the broker launcher) picks it.
    pub fn default_host_port(&self) -> Option<u16> {
        match self {
            Self::Redis => Some(6379),
            Self::Mongo => Some(27017),
            Self::Zookeeper | Self::Kafka => None,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Redis => Duration::from_secs(60),
            Self::Mongo => Duration::from_secs(5 * 60),
            Self::Zookeeper | Self::Kafka => Duration::from_secs(2 * 60),
        }
    }

    fn name_prefix(&self, replica_set: bool) -> &'static str {
        match self {
            Self::Mongo if replica_set => "mongo-replicaset",
            Self::Redis => "redis",
            Self::Mongo => "mongo",
            Self::Zookeeper => "zookeeper",
            Self::Kafka => "kafka",
        }
    }
}

/// Short random suffix for generated container and network names.
pub fn unique_suffix() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostPort {
    Default,
    Requested(i64),
    Dynamic,
}

/// Fully resolved configuration for one service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    kind: ServiceKind,
    image_tag: String,
    name: String,
    port: Option<u16>,
    env: BTreeMap<String, String>,
    startup_timeout: Duration,
    networks: Vec<String>,
    auto_remove: bool,
    log: bool,
    replica_set: bool,
    credentials: Option<Credentials>,
    db_index: i64,
}

impl ServiceOptions {
    pub fn builder(kind: ServiceKind) -> ServiceOptionsBuilder {
        ServiceOptionsBuilder::new(kind)
    }

    pub fn redis() -> ServiceOptionsBuilder {
        Self::builder(ServiceKind::Redis)
    }

    pub fn mongo() -> ServiceOptionsBuilder {
        Self::builder(ServiceKind::Mongo)
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn image_tag(&self) -> &str {
        &self.image_tag
    }

    /// `<image>:<tag>`
    pub fn image(&self) -> String {
        format!("{}:{}", self.kind.image(), self.image_tag)
    }

    /// Container name; the base name of the three nodes for a replica set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host port to publish the service port on; `None` leaves it to the runtime.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn networks(&self) -> &[String] {
        &self.networks
    }

    pub fn auto_remove(&self) -> bool {
        self.auto_remove
    }

    pub fn log(&self) -> bool {
        self.log
    }

    pub fn replica_set(&self) -> bool {
        self.replica_set
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn db_index(&self) -> i64 {
        self.db_index
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptionsBuilder {
    kind: ServiceKind,
    image_tag: Option<String>,
    name: Option<String>,
    port: HostPort,
    env: BTreeMap<String, String>,
    startup_timeout: Option<Duration>,
    networks: Vec<String>,
    auto_remove: bool,
    log: bool,
    replica_set: bool,
    credentials: Option<Credentials>,
    db_index: i64,
}

impl ServiceOptionsBuilder {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            image_tag: None,
            name: None,
            port: HostPort::Default,
            env: BTreeMap::new(),
            startup_timeout: None,
            networks: Vec::new(),
            auto_remove: true,
            log: false,
            replica_set: false,
            credentials: None,
            db_index: DEFAULT_CACHE_DB,
        }
    }

    pub fn image_tag(mut self, tag: impl Into<String>) -> Self {
        self.image_tag = Some(tag.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Host port to publish on. Values outside `1..=65535` fall back to the
    /// family default.
    pub fn port(mut self, port: i64) -> Self {
        self.port = HostPort::Requested(port);
        self
    }

    /// The name set so far, if any. Unnamed options get a generated name at
    /// `build()`.
    pub fn configured_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.trim().is_empty())
    }

    /// Let the runtime choose the host port.
    pub fn dynamic_port(mut self) -> Self {
        self.port = HostPort::Dynamic;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Replaces the whole environment.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replaces the list of networks to attach to.
    pub fn networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks = networks.into_iter().map(Into::into).collect();
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.networks.push(network.into());
        self
    }

    pub fn auto_remove(mut self, enabled: bool) -> Self {
        self.auto_remove = enabled;
        self
    }

    pub fn log(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    pub fn replica_set(mut self, enabled: bool) -> Self {
        self.replica_set = enabled;
        self
    }

    /// Root user credentials for the database.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: Some(user.into()),
            password: password.into(),
        });
        self
    }

    /// Password-only authentication, as the cache uses.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: None,
            password: password.into(),
        });
        self
    }

    pub fn db_index(mut self, index: i64) -> Self {
        self.db_index = index;
        self
    }

    pub fn build(self) -> ServiceOptions {
        let kind = self.kind;

        let image_tag = self
            .image_tag
            .filter(|tag| !tag.trim().is_empty())
            .unwrap_or_else(|| kind.default_tag().to_string());

        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                format!("{}-{}", kind.name_prefix(self.replica_set), unique_suffix())
            });

        let port = match self.port {
            HostPort::Default => kind.default_host_port(),
            HostPort::Dynamic => None,
            HostPort::Requested(raw) => u16::try_from(raw)
                .ok()
                .filter(|port| *port > 0)
                .or_else(|| kind.default_host_port()),
        };

        let startup_timeout = self
            .startup_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| kind.default_timeout());

        let credentials = self
            .credentials
            .filter(|credentials| !credentials.password.is_empty());

        ServiceOptions {
            kind,
            image_tag,
            name,
            port,
            env: self.env,
            startup_timeout,
            networks: self.networks,
            auto_remove: self.auto_remove,
            log: self.log,
            replica_set: self.replica_set,
            credentials,
            db_index: if self.db_index < 0 {
                DEFAULT_CACHE_DB
            } else {
                self.db_index
            },
        }
    }
}

/// Options for the broker and the coordination service it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    kafka: ServiceOptions,
    zookeeper: ServiceOptions,
    protocol_version: String,
}

impl BrokerOptions {
    pub fn builder() -> BrokerOptionsBuilder {
        BrokerOptionsBuilder::new()
    }

    pub fn kafka(&self) -> &ServiceOptions {
        &self.kafka
    }

    pub fn zookeeper(&self) -> &ServiceOptions {
        &self.zookeeper
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Networks shared by both containers.
    pub fn networks(&self) -> &[String] {
        self.kafka.networks()
    }
}

#[derive(Debug, Clone)]
pub struct BrokerOptionsBuilder {
    kafka: ServiceOptionsBuilder,
    zookeeper: ServiceOptionsBuilder,
    protocol_version: Option<String>,
}

impl Default for BrokerOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerOptionsBuilder {
    pub fn new() -> Self {
        Self {
            kafka: ServiceOptionsBuilder::new(ServiceKind::Kafka),
            zookeeper: ServiceOptionsBuilder::new(ServiceKind::Zookeeper),
            protocol_version: None,
        }
    }

    /// Broker and coordination container names set so far.
    pub fn configured_names(&self) -> Vec<&str> {
        [&self.kafka, &self.zookeeper]
            .into_iter()
            .filter_map(ServiceOptionsBuilder::configured_name)
            .collect()
    }

    pub fn kafka_name(mut self, name: impl Into<String>) -> Self {
        self.kafka = self.kafka.name(name);
        self
    }

    pub fn zookeeper_name(mut self, name: impl Into<String>) -> Self {
        self.zookeeper = self.zookeeper.name(name);
        self
    }

    pub fn kafka_image_tag(mut self, tag: impl Into<String>) -> Self {
        self.kafka = self.kafka.image_tag(tag);
        self
    }

    pub fn zookeeper_image_tag(mut self, tag: impl Into<String>) -> Self {
        self.zookeeper = self.zookeeper.image_tag(tag);
        self
    }

    /// Host port the broker is advertised on.
    pub fn port(mut self, port: i64) -> Self {
        self.kafka = self.kafka.port(port);
        self
    }

    pub fn kafka_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka = self.kafka.env_var(key, value);
        self
    }

    pub fn networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let networks: Vec<String> = networks.into_iter().map(Into::into).collect();
        self.kafka = self.kafka.networks(networks.clone());
        self.zookeeper = self.zookeeper.networks(networks);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.kafka = self.kafka.startup_timeout(timeout);
        self.zookeeper = self.zookeeper.startup_timeout(timeout);
        self
    }

    pub fn auto_remove(mut self, enabled: bool) -> Self {
        self.kafka = self.kafka.auto_remove(enabled);
        self.zookeeper = self.zookeeper.auto_remove(enabled);
        self
    }

    pub fn log(mut self, enabled: bool) -> Self {
        self.kafka = self.kafka.log(enabled);
        self.zookeeper = self.zookeeper.log(enabled);
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    pub fn build(self) -> BrokerOptions {
        BrokerOptions {
            kafka: self.kafka.build(),
            zookeeper: self.zookeeper.build(),
            protocol_version: self
                .protocol_version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
        }
    }
}

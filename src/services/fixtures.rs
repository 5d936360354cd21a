use super::gateway::RuntimeGateway;
use super::launcher::{Launcher, ServiceHandle, Terminate};
use super::network::{NetworkHandle, NetworkProvisioner};
use super::profiles;
use super::replica_set::{ReplicaSetHandle, ReplicaSetOrchestrator};
use crate::ctx::Ctx;
use crate::domain::{Addr, BrokerOptions, ContainerRuntime, Credentials, ServiceOptions};
use crate::error::{Error, Result};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BROKER_NETWORK_PREFIX: &str = "kafka";

/// Starts ready-to-use cache, database and broker fixtures.
///
/// Every `start_*` call either returns a fixture whose endpoint accepted a
/// connection or removes everything it created. Handles created before an
/// early return are dropped, which tears them down.
#[derive(Debug, Clone)]
pub struct Fixtures {
    launcher: Launcher,
    replica_sets: ReplicaSetOrchestrator,
}

impl Fixtures {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::from_launcher(Launcher::new(RuntimeGateway::new(runtime)))
    }

    pub fn from_launcher(launcher: Launcher) -> Self {
        Self {
            replica_sets: ReplicaSetOrchestrator::new(launcher.clone()),
            launcher,
        }
    }

    pub fn with_replica_sets(mut self, replica_sets: ReplicaSetOrchestrator) -> Self {
        self.replica_sets = replica_sets;
        self
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn gateway(&self) -> &RuntimeGateway {
        self.launcher.gateway()
    }

    pub fn start_cache(&self, ctx: &Ctx, opts: &ServiceOptions) -> Result<CacheFixture> {
        let service = self.launcher.start(ctx, profiles::cache(opts))?;
        self.connect(service.address())?;

        Ok(CacheFixture {
            password: opts.credentials().map(|c| c.password.clone()),
            db_index: opts.db_index(),
            service,
        })
    }

    /// A standalone database, or a three-node replica set when the options
    /// ask for one.
    pub fn start_database(&self, ctx: &Ctx, opts: &ServiceOptions) -> Result<DatabaseFixture> {
        if opts.replica_set() {
            let replica_set = self.replica_sets.start(ctx, opts)?;
            self.connect(replica_set.master().address())?;
            return Ok(DatabaseFixture::ReplicaSet(replica_set));
        }

        let service = self.launcher.start(ctx, profiles::database(opts))?;
        self.connect(service.address())?;
        Ok(DatabaseFixture::Standalone(service))
    }

    /// Coordination service first, then the broker, both on one network.
    pub fn start_broker(&self, ctx: &Ctx, opts: &BrokerOptions) -> Result<BrokerFixture> {
        let (network_name, network) = match opts.networks().first() {
            Some(name) => (name.clone(), None),
            None => {
                let handle = NetworkProvisioner::new(self.gateway().clone())
                    .create_unique(ctx, BROKER_NETWORK_PREFIX)?;
                (handle.name().to_string(), Some(handle))
            }
        };

        let mut zookeeper_request = profiles::zookeeper(opts.zookeeper());
        zookeeper_request.spec.networks = networks_with(&network_name, opts.networks());
        let zookeeper = self.launcher.start(ctx, zookeeper_request)?;

        let host_port = match opts.kafka().port() {
            Some(port) => port,
            None => free_port()?,
        };
        let mut kafka_request = profiles::kafka(opts.kafka(), zookeeper.name(), host_port);
        kafka_request.spec.networks = networks_with(&network_name, opts.networks());
        let kafka = self.launcher.start(ctx, kafka_request)?;

        self.connect(kafka.address())?;
        info!(
            broker = %kafka.name(),
            port = host_port,
            version = %opts.protocol_version(),
            "Broker ready"
        );

        Ok(BrokerFixture {
            brokers: vec![format!("localhost:{host_port}")],
            version: opts.protocol_version().to_string(),
            kafka,
            zookeeper,
            network,
            terminated: AtomicBool::new(false),
        })
    }

    fn connect(&self, addr: &Addr) -> Result<()> {
        self.gateway()
            .runtime()
            .ping(&addr.host, addr.port, CONNECT_TIMEOUT)
            .map_err(|err| match err {
                Error::Connect { .. } => err,
                other => Error::Connect {
                    address: addr.to_string(),
                    reason: other.to_string(),
                },
            })
    }
}

fn networks_with(first: &str, rest: &[String]) -> Vec<String> {
    std::iter::once(first.to_string())
        .chain(rest.iter().filter(|n| *n != first).cloned())
        .collect()
}

/// A host port nobody listens on right now.
fn free_port() -> Result<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| Error::command("allocate host port", e.to_string()))
}

/// Standalone key-value store.
#[derive(Debug)]
pub struct CacheFixture {
    service: ServiceHandle,
    password: Option<String>,
    db_index: i64,
}

impl CacheFixture {
    /// `host:port`
    pub fn address(&self) -> String {
        self.service.address().to_string()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn db_index(&self) -> i64 {
        self.db_index
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    pub fn container_names(&self) -> Vec<String> {
        vec![self.service.name().to_string()]
    }
}

impl Terminate for CacheFixture {
    fn terminate(&self) {
        self.service.terminate();
    }
}

#[derive(Debug)]
pub enum DatabaseFixture {
    Standalone(ServiceHandle),
    ReplicaSet(ReplicaSetHandle),
}

impl DatabaseFixture {
    /// Connection string of the standalone node or of the replica-set master.
    pub fn uri(&self) -> String {
        match self {
            Self::Standalone(service) => standalone_uri(service.credentials(), service.address()),
            Self::ReplicaSet(replica_set) => replica_set.master_uri(),
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        match self {
            Self::Standalone(service) => vec![service.name().to_string()],
            Self::ReplicaSet(replica_set) => replica_set.container_names(),
        }
    }

    pub fn replica_set(&self) -> Option<&ReplicaSetHandle> {
        match self {
            Self::ReplicaSet(replica_set) => Some(replica_set),
            Self::Standalone(_) => None,
        }
    }
}

impl Terminate for DatabaseFixture {
    fn terminate(&self) {
        match self {
            Self::Standalone(service) => service.terminate(),
            Self::ReplicaSet(replica_set) => replica_set.terminate(),
        }
    }
}

/// `mongodb://[user:password@]host:port/?connect=direct`
pub fn standalone_uri(credentials: Option<&Credentials>, addr: &Addr) -> String {
    let prefix = credentials.map(Credentials::uri_prefix).unwrap_or_default();
    format!("mongodb://{prefix}{addr}/?connect=direct")
}

/// Message broker with its coordination service.
#[derive(Debug)]
pub struct BrokerFixture {
    brokers: Vec<String>,
    version: String,
    kafka: ServiceHandle,
    zookeeper: ServiceHandle,
    network: Option<NetworkHandle>,
    terminated: AtomicBool,
}

impl BrokerFixture {
    /// Bootstrap addresses reachable from the host.
    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn kafka(&self) -> &ServiceHandle {
        &self.kafka
    }

    pub fn zookeeper(&self) -> &ServiceHandle {
        &self.zookeeper
    }

    pub fn container_names(&self) -> Vec<String> {
        vec![
            self.kafka.name().to_string(),
            self.zookeeper.name().to_string(),
        ]
    }
}

impl Terminate for BrokerFixture {
    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.kafka.terminate();
        self.zookeeper.terminate();
        if let Some(network) = &self.network {
            network.remove();
        }
    }
}

impl Drop for BrokerFixture {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceKind;
    use crate::services::gateway::RetryPolicy;
    use crate::test_support::MockRuntime;

    fn fixtures(mock: &Arc<MockRuntime>) -> Fixtures {
        let gateway = RuntimeGateway::with_retry(
            mock.clone(),
            RetryPolicy {
                attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        let launcher = Launcher::new(gateway).with_poll_interval(Duration::from_millis(1));
        let replica_sets = ReplicaSetOrchestrator::new(launcher.clone())
            .with_election_poll(3, Duration::from_millis(1));
        Fixtures::from_launcher(launcher).with_replica_sets(replica_sets)
    }

    #[test]
    fn test_cache_fixture_exposes_connection_details() {
        let mock = Arc::new(MockRuntime::new());
        let opts = ServiceOptions::redis()
            .name("t1")
            .port(6382)
            .password("secret")
            .db_index(3)
            .build();

        let cache = fixtures(&mock).start_cache(&Ctx::background(), &opts).unwrap();

        assert_eq!(cache.address(), "localhost:6382");
        assert_eq!(cache.password(), Some("secret"));
        assert_eq!(cache.db_index(), 3);
        assert!(mock.get_commands().contains(&"ping:localhost:6382".to_string()));

        cache.terminate();
        assert!(!mock.container_exists("t1"));
    }

    #[test]
    fn test_failed_ping_rolls_back_cache() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("ping");
        let opts = ServiceOptions::redis().name("t1").build();

        let err = fixtures(&mock)
            .start_cache(&Ctx::background(), &opts)
            .unwrap_err();

        assert!(matches!(err, Error::Connect { ref address, .. } if address == "localhost:6379"));
        assert!(!mock.container_exists("t1"));
    }

    #[test]
    fn test_standalone_database_uri() {
        let mock = Arc::new(MockRuntime::new());
        let opts = ServiceOptions::mongo()
            .name("db")
            .port(2189)
            .credentials("root", "pw")
            .build();

        let db = fixtures(&mock)
            .start_database(&Ctx::background(), &opts)
            .unwrap();

        assert_eq!(db.uri(), "mongodb://root:pw@localhost:2189/?connect=direct");
        assert!(db.replica_set().is_none());
    }

    #[test]
    fn test_replica_set_database() {
        let mock = Arc::new(MockRuntime::new());
        mock.script_replica_set("rs-a");
        let opts = ServiceOptions::mongo().replica_set(true).name("rs-a").build();

        let db = fixtures(&mock)
            .start_database(&Ctx::background(), &opts)
            .unwrap();

        assert_eq!(db.container_names(), vec!["rs-a-m1", "rs-a-rs2", "rs-a-rs3"]);
        assert!(db.uri().contains("replicaSet=rs0"));

        db.terminate();
        assert!(mock.container_names().is_empty());
    }

    #[test]
    fn test_broker_on_fresh_network() {
        let mock = Arc::new(MockRuntime::new());
        let opts = BrokerOptions::builder()
            .kafka_name("test-kafka")
            .zookeeper_name("test-zoo")
            .port(39092)
            .build();

        let broker = fixtures(&mock)
            .start_broker(&Ctx::background(), &opts)
            .unwrap();

        assert_eq!(broker.brokers(), &["localhost:39092".to_string()]);
        assert_eq!(broker.version(), "3.6.1");

        let kafka = mock.container("test-kafka").unwrap();
        let zoo = mock.container("test-zoo").unwrap();
        assert_eq!(kafka.spec.networks, zoo.spec.networks);
        assert!(kafka.spec.networks[0].starts_with("kafka-"));
        assert_eq!(kafka.spec.image, ServiceOptions::builder(ServiceKind::Kafka).build().image());

        drop(broker);
        assert!(mock.container_names().is_empty());
        assert!(mock.network_names().is_empty());
    }

    #[test]
    fn test_broker_failure_removes_coordination_service() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("run:test-kafka");
        let opts = BrokerOptions::builder()
            .kafka_name("test-kafka")
            .zookeeper_name("test-zoo")
            .build();

        let err = fixtures(&mock)
            .start_broker(&Ctx::background(), &opts)
            .unwrap_err();

        assert!(matches!(err, Error::RuntimeCommand { .. }));
        assert!(mock.container_names().is_empty());
        assert!(mock.network_names().is_empty());
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert!(free_port().unwrap() > 0);
    }
}

//! Multi-fixture provisioning with a sticky first error.
//!
//! A [`FixturePlan`] lists setup steps. Provisioning folds them in order;
//! once a step fails, every later step is reported as skipped and never
//! runs. Whatever was provisioned stays registered in the [`FixtureSet`]
//! until [`FixtureSet::close`] (or drop) tears it down.

use super::fixtures::{BrokerFixture, CacheFixture, DatabaseFixture, Fixtures};
use super::launcher::Terminate;
use super::network::{NetworkHandle, NetworkProvisioner};
use super::profiles::REPLICA_NODES;
use crate::ctx::Ctx;
use crate::domain::{BrokerOptions, BrokerOptionsBuilder, Role, ServiceOptions, ServiceOptionsBuilder};
use crate::error::{Error, Result};
use tracing::{debug, error, info, warn};

pub const DEFAULT_NETWORK: &str = "test-network";
pub const DEFAULT_CACHE: &str = "test-redis";
pub const DEFAULT_DATABASE: &str = "test-mongo";
pub const DEFAULT_BROKER: &str = "test-kafka";
pub const DEFAULT_COORDINATOR: &str = "test-zoo";
pub const DEFAULT_CACHE_PORT: i64 = 3890;
pub const DEFAULT_DATABASE_PORT: i64 = 2189;

/// Container and network names used by steps added without explicit options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureNames {
    pub network: String,
    pub cache: String,
    pub database: String,
    pub broker: String,
    pub coordinator: String,
}

impl Default for FixtureNames {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.into(),
            cache: DEFAULT_CACHE.into(),
            database: DEFAULT_DATABASE.into(),
            broker: DEFAULT_BROKER.into(),
            coordinator: DEFAULT_COORDINATOR.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Network(Option<String>),
    Cache(Option<ServiceOptionsBuilder>),
    Database(Option<ServiceOptionsBuilder>),
    ReplicatedDatabase(Option<ServiceOptionsBuilder>),
    Broker(Option<BrokerOptionsBuilder>),
}

impl Step {
    fn role(&self) -> Role {
        match self {
            Self::Network(_) => Role::Network,
            Self::Cache(_) => Role::Cache,
            Self::Database(_) | Self::ReplicatedDatabase(_) => Role::PrimaryStore,
            Self::Broker(_) => Role::Broker,
        }
    }
}

/// Ordered list of fixtures to provision.
#[derive(Debug, Clone, Default)]
pub struct FixturePlan {
    names: FixtureNames,
    steps: Vec<Step>,
}

impl FixturePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_names(mut self, names: FixtureNames) -> Self {
        self.names = names;
        self
    }

    pub fn names(&self) -> &FixtureNames {
        &self.names
    }

    /// Every container name the plan's steps will use, for sweeping
    /// leftovers of an earlier run. Steps whose names are generated at start
    /// contribute nothing.
    pub fn container_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for step in &self.steps {
            match step {
                Step::Network(_) => {}
                Step::Cache(None) => names.push(self.names.cache.clone()),
                Step::Database(None) => names.push(self.names.database.clone()),
                Step::ReplicatedDatabase(None) => {}
                Step::Broker(None) => {
                    names.push(self.names.broker.clone());
                    names.push(self.names.coordinator.clone());
                }
                Step::Cache(Some(options)) | Step::Database(Some(options)) => {
                    names.extend(options.configured_name().map(str::to_string));
                }
                Step::ReplicatedDatabase(Some(options)) => {
                    if let Some(base) = options.configured_name() {
                        names.extend(REPLICA_NODES.iter().map(|node| node.container_name(base)));
                    }
                }
                Step::Broker(Some(options)) => {
                    names.extend(options.configured_names().into_iter().map(str::to_string));
                }
            }
        }
        names
    }

    /// Roles of the steps, in execution order.
    pub fn roles(&self) -> Vec<Role> {
        self.steps.iter().map(Step::role).collect()
    }

    /// Bridge network that every later fixture joins.
    pub fn network(mut self) -> Self {
        self.steps.push(Step::Network(None));
        self
    }

    pub fn network_named(mut self, name: impl Into<String>) -> Self {
        self.steps.push(Step::Network(Some(name.into())));
        self
    }

    pub fn cache(mut self) -> Self {
        self.steps.push(Step::Cache(None));
        self
    }

    pub fn cache_with(mut self, options: ServiceOptionsBuilder) -> Self {
        self.steps.push(Step::Cache(Some(options)));
        self
    }

    pub fn database(mut self) -> Self {
        self.steps.push(Step::Database(None));
        self
    }

    pub fn database_with(mut self, options: ServiceOptionsBuilder) -> Self {
        self.steps.push(Step::Database(Some(options)));
        self
    }

    pub fn replicated_database(mut self) -> Self {
        self.steps.push(Step::ReplicatedDatabase(None));
        self
    }

    pub fn replicated_database_with(mut self, options: ServiceOptionsBuilder) -> Self {
        self.steps
            .push(Step::ReplicatedDatabase(Some(options.replica_set(true))));
        self
    }

    pub fn broker(mut self) -> Self {
        self.steps.push(Step::Broker(None));
        self
    }

    pub fn broker_with(mut self, options: BrokerOptionsBuilder) -> Self {
        self.steps.push(Step::Broker(Some(options)));
        self
    }

    pub fn provision(self, ctx: &Ctx, fixtures: Fixtures) -> FixtureSet {
        let mut set = FixtureSet::new(fixtures);
        set.extend(ctx, self);
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Provisioned,
    Failed(Error),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub role: Role,
    pub status: StepStatus,
}

#[derive(Debug)]
enum Provisioned {
    Cache(CacheFixture),
    Database(DatabaseFixture),
    Broker(BrokerFixture),
}

impl Provisioned {
    fn teardown(&self) -> &dyn Terminate {
        match self {
            Self::Cache(cache) => cache,
            Self::Database(database) => database,
            Self::Broker(broker) => broker,
        }
    }

    fn container_names(&self) -> Vec<String> {
        match self {
            Self::Cache(cache) => cache.container_names(),
            Self::Database(database) => database.container_names(),
            Self::Broker(broker) => broker.container_names(),
        }
    }
}

#[derive(Debug)]
struct Registration {
    role: Role,
    container_names: Vec<String>,
    fixture: Provisioned,
}

/// Fixtures provisioned from one or more plans.
#[derive(Debug)]
pub struct FixtureSet {
    fixtures: Fixtures,
    networks: Vec<NetworkHandle>,
    registry: Vec<Registration>,
    error: Option<Error>,
    reports: Vec<StepReport>,
    closed: bool,
}

impl FixtureSet {
    pub fn new(fixtures: Fixtures) -> Self {
        Self {
            fixtures,
            networks: Vec::new(),
            registry: Vec::new(),
            error: None,
            reports: Vec::new(),
            closed: false,
        }
    }

    /// Runs the steps of `plan`. Does nothing once a step has failed or the
    /// set has been closed.
    pub fn extend(&mut self, ctx: &Ctx, plan: FixturePlan) {
        if self.closed {
            warn!("Fixture set already closed, ignoring plan");
            return;
        }
        if let Some(err) = &self.error {
            debug!(error = %err, "Fixture set already failed, ignoring plan");
            return;
        }

        let FixturePlan { names, steps } = plan;
        for step in steps {
            let role = step.role();

            if self.error.is_some() {
                debug!(role = %role, "Skipping step after earlier failure");
                self.reports.push(StepReport {
                    role,
                    status: StepStatus::Skipped,
                });
                continue;
            }

            match self.run_step(ctx, &names, step) {
                Ok(()) => {
                    info!(role = %role, "Fixture provisioned");
                    self.reports.push(StepReport {
                        role,
                        status: StepStatus::Provisioned,
                    });
                }
                Err(err) => {
                    error!(role = %role, error = %err, "Fixture setup failed");
                    self.reports.push(StepReport {
                        role,
                        status: StepStatus::Failed(err.clone()),
                    });
                    self.error = Some(Error::Setup {
                        role,
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    fn run_step(&mut self, ctx: &Ctx, names: &FixtureNames, step: Step) -> Result<()> {
        let role = step.role();
        let fixture = match step {
            Step::Network(name) => {
                let name = name.unwrap_or_else(|| names.network.clone());
                if self.network_name() != Some(name.as_str()) {
                    let handle =
                        NetworkProvisioner::new(self.fixtures.gateway().clone()).create(ctx, &name)?;
                    self.networks.push(handle);
                }
                return Ok(());
            }
            Step::Cache(options) => {
                let options = options.unwrap_or_else(|| {
                    ServiceOptions::redis()
                        .name(names.cache.clone())
                        .port(DEFAULT_CACHE_PORT)
                });
                let options = self.join_network(options).build();
                Provisioned::Cache(self.fixtures.start_cache(ctx, &options)?)
            }
            Step::Database(options) => {
                let options = options.unwrap_or_else(|| {
                    ServiceOptions::mongo()
                        .name(names.database.clone())
                        .port(DEFAULT_DATABASE_PORT)
                });
                let options = self.join_network(options).build();
                Provisioned::Database(self.fixtures.start_database(ctx, &options)?)
            }
            Step::ReplicatedDatabase(options) => {
                let options = options.unwrap_or_else(|| ServiceOptions::mongo().replica_set(true));
                let options = self.join_network(options).build();
                Provisioned::Database(self.fixtures.start_database(ctx, &options)?)
            }
            Step::Broker(options) => {
                let mut options = options.unwrap_or_else(|| {
                    BrokerOptions::builder()
                        .kafka_name(names.broker.clone())
                        .zookeeper_name(names.coordinator.clone())
                });
                if let Some(network) = self.network_name() {
                    options = options.networks([network]);
                }
                Provisioned::Broker(self.fixtures.start_broker(ctx, &options.build())?)
            }
        };

        self.registry.push(Registration {
            role,
            container_names: fixture.container_names(),
            fixture,
        });
        Ok(())
    }

    fn join_network(&self, options: ServiceOptionsBuilder) -> ServiceOptionsBuilder {
        match self.network_name() {
            Some(network) => options.networks([network]),
            None => options,
        }
    }

    /// The first failure, wrapped with the role of the step that failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.error.is_none() && !self.closed
    }

    pub fn reports(&self) -> &[StepReport] {
        &self.reports
    }

    /// Network every fixture joined, when the plan created one.
    pub fn network_name(&self) -> Option<&str> {
        self.networks.last().map(NetworkHandle::name)
    }

    pub fn roles(&self) -> Vec<Role> {
        self.registry.iter().map(|r| r.role).collect()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.registry
            .iter()
            .flat_map(|r| r.container_names.iter().cloned())
            .collect()
    }

    pub fn cache(&self) -> Option<&CacheFixture> {
        self.registry.iter().find_map(|r| match &r.fixture {
            Provisioned::Cache(cache) => Some(cache),
            _ => None,
        })
    }

    pub fn database(&self) -> Option<&DatabaseFixture> {
        self.registry.iter().find_map(|r| match &r.fixture {
            Provisioned::Database(database) => Some(database),
            _ => None,
        })
    }

    pub fn broker(&self) -> Option<&BrokerFixture> {
        self.registry.iter().find_map(|r| match &r.fixture {
            Provisioned::Broker(broker) => Some(broker),
            _ => None,
        })
    }

    /// Tears down every fixture, removes any registered container that is
    /// still around, then removes the networks. Runs once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.registry.is_empty() && self.networks.is_empty() {
            return;
        }
        info!(fixtures = self.registry.len(), "Closing fixture set");

        for registration in self.registry.iter().rev() {
            debug!(role = %registration.role, "Terminating fixture");
            registration.fixture.teardown().terminate();
        }

        let gateway = self.fixtures.gateway();
        for name in self.registry.iter().flat_map(|r| r.container_names.iter()) {
            match gateway.exists(name) {
                Ok(false) => {}
                Ok(true) => {
                    warn!(container = %name, "Container survived teardown, removing");
                    gateway.remove_forced(name);
                }
                Err(err) => {
                    warn!(container = %name, error = %err, "Could not check container, removing");
                    gateway.remove_forced(name);
                }
            }
        }
        self.registry.clear();

        while let Some(network) = self.networks.pop() {
            network.remove();
        }
    }

    /// The set itself when every step succeeded; otherwise closes it and
    /// returns the first failure.
    pub fn into_ready(mut self) -> Result<Self> {
        match self.error.clone() {
            Some(err) => {
                self.close();
                Err(err)
            }
            None => Ok(self),
        }
    }
}

impl Drop for FixtureSet {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::{RetryPolicy, RuntimeGateway};
    use crate::services::launcher::Launcher;
    use crate::test_support::MockRuntime;
    use std::sync::Arc;
    use std::time::Duration;

    fn fixtures(mock: &Arc<MockRuntime>) -> Fixtures {
        let gateway = RuntimeGateway::with_retry(
            mock.clone(),
            RetryPolicy {
                attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        Fixtures::from_launcher(Launcher::new(gateway).with_poll_interval(Duration::from_millis(1)))
    }

    #[test]
    fn test_default_names_and_ports() {
        let mock = Arc::new(MockRuntime::new());

        let set = FixturePlan::new()
            .network()
            .cache()
            .database()
            .provision(&Ctx::background(), fixtures(&mock));

        assert!(set.is_ready());
        assert_eq!(set.network_name(), Some("test-network"));
        assert_eq!(set.cache().unwrap().address(), "localhost:3890");
        assert_eq!(
            set.database().unwrap().uri(),
            "mongodb://localhost:2189/?connect=direct"
        );

        let redis = mock.container("test-redis").unwrap();
        assert_eq!(redis.spec.networks, vec!["test-network"]);
    }

    #[test]
    fn test_sticky_error_skips_remaining_steps() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("run:test-redis");

        let set = FixturePlan::new()
            .network()
            .cache()
            .broker()
            .provision(&Ctx::background(), fixtures(&mock));

        let err = set.error().unwrap();
        assert!(matches!(err, Error::Setup { role: Role::Cache, .. }));
        assert_eq!(
            set.reports().iter().map(|r| r.status.clone()).collect::<Vec<_>>()[2],
            StepStatus::Skipped
        );
        assert_eq!(mock.count_commands("run:test-kafka"), 0);
        assert_eq!(mock.count_commands("run:test-zoo"), 0);
    }

    #[test]
    fn test_extend_after_failure_is_noop() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("run:test-mongo");

        let mut set = FixturePlan::new()
            .cache()
            .database()
            .provision(&Ctx::background(), fixtures(&mock));
        let before = set.error().cloned();
        let roles = set.roles();

        set.extend(&Ctx::background(), FixturePlan::new().broker());

        assert_eq!(set.error().cloned(), before);
        assert_eq!(set.roles(), roles);
        assert_eq!(set.reports().len(), 2);
        assert_eq!(mock.count_commands("run:test-kafka"), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_complete() {
        let mock = Arc::new(MockRuntime::new());

        let mut set = FixturePlan::new()
            .network()
            .cache()
            .database()
            .provision(&Ctx::background(), fixtures(&mock));

        set.close();
        set.close();
        drop(set);

        assert!(mock.container_names().is_empty());
        assert!(!mock.has_network("test-network"));
        assert_eq!(mock.count_commands("remove:test-redis"), 1);
        assert_eq!(mock.count_commands("remove_network:test-network"), 1);
    }

    #[test]
    fn test_close_on_empty_set() {
        let mock = Arc::new(MockRuntime::new());
        let mut set = FixtureSet::new(fixtures(&mock));

        set.close();

        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn test_close_sweeps_containers_that_survived_teardown() {
        let mock = Arc::new(MockRuntime::new());

        let mut set = FixturePlan::new()
            .cache()
            .provision(&Ctx::background(), fixtures(&mock));
        mock.fail_times("remove:test-redis", 1);

        set.close();

        assert_eq!(mock.count_commands("remove:test-redis"), 2);
        assert!(!mock.container_exists("test-redis"));
    }

    #[test]
    fn test_into_ready_closes_on_failure() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("run:test-mongo");

        let result = FixturePlan::new()
            .network()
            .cache()
            .database()
            .provision(&Ctx::background(), fixtures(&mock))
            .into_ready();

        let err = result.unwrap_err();
        assert_eq!(err.root(), &Error::command("run:test-mongo", "Mock failure on: run:test-mongo"));
        assert!(mock.container_names().is_empty());
        assert!(mock.network_names().is_empty());
    }

    #[test]
    fn test_custom_names() {
        let mock = Arc::new(MockRuntime::new());
        let names = FixtureNames {
            cache: "it-redis".into(),
            ..FixtureNames::default()
        };

        let set = FixturePlan::new()
            .with_names(names)
            .cache()
            .provision(&Ctx::background(), fixtures(&mock));

        assert_eq!(set.container_names(), vec!["it-redis"]);
    }

    #[test]
    fn test_plan_names_follow_step_options() {
        let plan = FixturePlan::new()
            .network()
            .cache_with(ServiceOptions::redis().name("my-cache"))
            .database()
            .replicated_database_with(ServiceOptions::mongo().name("rs-q"))
            .replicated_database()
            .broker_with(BrokerOptions::builder().kafka_name("k1").zookeeper_name("z1"));

        assert_eq!(
            plan.container_names(),
            vec!["my-cache", "test-mongo", "rs-q-m1", "rs-q-rs2", "rs-q-rs3", "k1", "z1"]
        );
    }
}

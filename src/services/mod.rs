pub mod fixture_set;
pub mod fixtures;
pub mod gateway;
pub mod launcher;
pub mod log_collector;
pub mod network;
pub mod profiles;
pub mod replica_set;

pub use fixture_set::{FixtureNames, FixturePlan, FixtureSet, StepReport, StepStatus};
pub use fixtures::{BrokerFixture, CacheFixture, DatabaseFixture, Fixtures};
pub use gateway::{RetryPolicy, RuntimeGateway};
pub use launcher::{Launcher, ServiceHandle, Terminate};
pub use log_collector::LogCollector;
pub use network::{NetworkHandle, NetworkProvisioner};
pub use profiles::LaunchRequest;
pub use replica_set::{ElectionOutcome, ReplicaSetHandle, ReplicaSetOrchestrator, ReplicaSetStage};

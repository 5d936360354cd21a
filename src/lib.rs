//! Disposable service containers for integration tests.
//!
//! Start a single fixture through [`services::Fixtures`], or a whole set of
//! them through [`services::FixturePlan`]. Every handle tears its containers
//! down when terminated or dropped.

pub mod cli;
pub mod ctx;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;

// Make test_support available for integration tests
pub mod test_support;

pub use ctx::Ctx;
pub use domain::{
    BrokerOptions, ContainerRuntime, ContainerSpec, Role, ServiceKind, ServiceOptions,
};
pub use error::{Error, Result};
pub use infra::DockerAdapter;
pub use services::{
    BrokerFixture, CacheFixture, DatabaseFixture, ElectionOutcome, FixtureNames, FixturePlan,
    FixtureSet, Fixtures, ReplicaSetHandle, RuntimeGateway, Terminate,
};

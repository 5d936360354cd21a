use super::{ContainerSpec, ExecOutput, LogRecord, NetworkSpec};
use crate::ctx::Ctx;
use crate::error::Result;
use std::fmt::Debug;
use std::time::Duration;

/// Trait for container runtime operations
pub trait ContainerRuntime: Send + Sync + Debug {
    /// Check that the runtime binary answers
    fn is_available(&self) -> bool;

    /// Raw name reported by inspect, e.g. `"/redis"`. Not-found errors are
    /// classified with `not_found: true`.
    fn inspect_name(&self, name: &str) -> Result<String>;

    /// Whether the container exists and is running
    fn is_running(&self, name: &str) -> Result<bool>;

    /// Create and start a detached container
    fn run_container(&self, ctx: &Ctx, spec: &ContainerSpec) -> Result<()>;

    /// Host port the runtime mapped to `container_port`
    fn mapped_port(&self, name: &str, container_port: u16) -> Result<u16>;

    /// Host on which published ports are reachable
    fn host(&self) -> String;

    /// Whether the service inside the container listens on `container_port`
    /// and the published `host_port` accepts connections
    fn is_port_ready(&self, name: &str, host: &str, host_port: u16, container_port: u16) -> bool;

    /// Execute a command inside a running container
    fn exec(&self, ctx: &Ctx, name: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Force-remove a container
    fn remove_container(&self, name: &str) -> Result<()>;

    /// Create a network
    fn create_network(&self, ctx: &Ctx, spec: &NetworkSpec) -> Result<()>;

    fn network_exists(&self, name: &str) -> Result<bool>;

    /// Remove a network
    fn remove_network(&self, name: &str) -> Result<()>;

    /// Remove every network no container uses
    fn prune_networks(&self) -> Result<()>;

    /// Follow the combined output of a running container
    fn attach_logs(&self, name: &str) -> Result<Box<dyn LogStream>>;

    /// Open a connection to an exposed endpoint
    fn ping(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;
}

/// Interrupts a [`LogStream`] from another thread.
pub type Interrupter = Box<dyn Fn() + Send + Sync>;

/// Blocking source of container output records.
pub trait LogStream: Send {
    /// Blocks until the next record; `None` once the stream has ended.
    fn next_record(&mut self) -> Option<LogRecord>;

    /// Handle that ends the stream, unblocking a pending `next_record`.
    fn interrupter(&self) -> Interrupter;
}

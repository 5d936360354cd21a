use super::gateway::RuntimeGateway;
use crate::ctx::Ctx;
use crate::domain::NetworkSpec;
use crate::domain::options::unique_suffix;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates the bridge networks fixtures talk over.
#[derive(Debug, Clone)]
pub struct NetworkProvisioner {
    gateway: RuntimeGateway,
}

impl NetworkProvisioner {
    pub fn new(gateway: RuntimeGateway) -> Self {
        Self { gateway }
    }

    /// Creates an attachable bridge network called `name`. A network that
    /// already exists under that name is adopted.
    pub fn create(&self, ctx: &Ctx, name: &str) -> Result<NetworkHandle> {
        let wrap = |err: Error| match err {
            Error::Cancelled { .. } => err,
            other => Error::NetworkCreate {
                network: name.to_string(),
                reason: other.to_string(),
            },
        };

        let runtime = self.gateway.runtime();
        if runtime.network_exists(name).map_err(wrap)? {
            debug!(network = %name, "Adopting existing network");
        } else {
            let bounded = ctx.with_timeout(CREATE_TIMEOUT);
            runtime
                .create_network(&bounded, &NetworkSpec::bridge(name))
                .map_err(wrap)?;
            info!(network = %name, "Network created");
        }

        Ok(NetworkHandle {
            name: name.to_string(),
            gateway: self.gateway.clone(),
            removed: AtomicBool::new(false),
        })
    }

    /// Creates a network named `<prefix>-<random suffix>`.
    pub fn create_unique(&self, ctx: &Ctx, prefix: &str) -> Result<NetworkHandle> {
        self.create(ctx, &format!("{prefix}-{}", unique_suffix()))
    }
}

/// A provisioned network. Removed once, on [`remove`](Self::remove) or drop.
#[derive(Debug)]
pub struct NetworkHandle {
    name: String,
    gateway: RuntimeGateway,
    removed: AtomicBool,
}

impl NetworkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gateway.remove_network(&self.name);
    }
}

impl Drop for NetworkHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;
    use std::sync::Arc;

    fn provisioner(mock: &Arc<MockRuntime>) -> NetworkProvisioner {
        NetworkProvisioner::new(RuntimeGateway::new(mock.clone()))
    }

    #[test]
    fn test_create_and_remove_once() {
        let mock = Arc::new(MockRuntime::new());
        let handle = provisioner(&mock)
            .create(&Ctx::background(), "test-network")
            .unwrap();

        assert!(mock.has_network("test-network"));

        handle.remove();
        handle.remove();
        drop(handle);

        assert!(!mock.has_network("test-network"));
        assert_eq!(mock.count_commands("remove_network:test-network"), 1);
    }

    #[test]
    fn test_existing_network_is_adopted() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_network("shared");

        let handle = provisioner(&mock)
            .create(&Ctx::background(), "shared")
            .unwrap();

        assert_eq!(handle.name(), "shared");
        assert_eq!(mock.count_commands("create_network:shared"), 0);
    }

    #[test]
    fn test_create_failure_is_wrapped() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("create_network");

        let err = provisioner(&mock)
            .create(&Ctx::background(), "net")
            .unwrap_err();

        assert!(matches!(err, Error::NetworkCreate { ref network, .. } if network == "net"));
    }

    #[test]
    fn test_cancelled_context_is_not_wrapped() {
        let mock = Arc::new(MockRuntime::new());
        let ctx = Ctx::background();
        ctx.cancel();

        let err = provisioner(&mock).create(&ctx, "net").unwrap_err();

        assert!(err.is_cancelled());
        assert!(!mock.has_network("net"));
    }

    #[test]
    fn test_create_unique_appends_suffix() {
        let mock = Arc::new(MockRuntime::new());
        let handle = provisioner(&mock)
            .create_unique(&Ctx::background(), "mongo-replicaset")
            .unwrap();

        assert!(handle.name().starts_with("mongo-replicaset-"));
        assert!(mock.has_network(handle.name()));
    }
}

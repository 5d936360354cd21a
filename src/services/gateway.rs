use crate::domain::ContainerRuntime;
use crate::error::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often and how patiently best-effort removals are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Existence checks and best-effort removal on top of the raw runtime.
#[derive(Debug, Clone)]
pub struct RuntimeGateway {
    runtime: Arc<dyn ContainerRuntime>,
    retry: RetryPolicy,
}

impl RuntimeGateway {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_retry(runtime, RetryPolicy::default())
    }

    pub fn with_retry(runtime: Arc<dyn ContainerRuntime>, retry: RetryPolicy) -> Self {
        Self { runtime, retry }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether a container called `name` exists, running or not.
    pub fn exists(&self, name: &str) -> Result<bool> {
        match self.runtime.inspect_name(name) {
            Ok(raw) => Ok(inspected_name(&raw) == format!("/{name}")),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Removes the container, retrying per the policy. A container that is
    /// already gone counts as removed. Never fails.
    pub fn remove_forced(&self, name: &str) {
        let attempts = self.retry.attempts.max(1);

        for attempt in 1..=attempts {
            match self.runtime.remove_container(name) {
                Ok(()) => {
                    debug!(container = %name, "Container removed");
                    return;
                }
                Err(err) if err.is_not_found() => {
                    debug!(container = %name, "Container already gone");
                    return;
                }
                Err(err) => {
                    warn!(
                        container = %name,
                        attempt,
                        attempts,
                        error = %err,
                        "Failed to remove container"
                    );
                    if attempt < attempts {
                        thread::sleep(self.retry.backoff);
                    }
                }
            }
        }

        warn!(container = %name, "Giving up on container removal");
    }

    pub fn remove_network(&self, name: &str) {
        match self.runtime.remove_network(name) {
            Ok(()) => debug!(network = %name, "Network removed"),
            Err(err) if err.is_not_found() => debug!(network = %name, "Network already gone"),
            Err(err) => warn!(network = %name, error = %err, "Failed to remove network"),
        }
    }

    pub fn prune_networks(&self) {
        if let Err(err) = self.runtime.prune_networks() {
            warn!(error = %err, "Failed to prune networks");
        }
    }

    /// Clears leftovers of an earlier run: prunes unused networks, then
    /// force-removes every named container.
    pub fn drop_containers<S: AsRef<str>>(&self, names: &[S]) {
        if names.is_empty() {
            return;
        }

        info!(count = names.len(), "Dropping leftover containers");
        self.prune_networks();
        for name in names {
            self.remove_forced(name.as_ref());
        }
    }
}

fn inspected_name(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '"' || c == '\'')
}

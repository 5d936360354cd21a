use super::gateway::RuntimeGateway;
use super::log_collector::LogCollector;
use super::profiles::LaunchRequest;
use crate::ctx::Ctx;
use crate::domain::{Addr, Credentials};
use crate::error::{Error, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Something that owns runtime resources and can release them.
/// Implementations must tolerate repeated calls.
pub trait Terminate: Send + Sync {
    fn terminate(&self);
}

/// Starts one container and blocks until its service port accepts
/// connections.
#[derive(Debug, Clone)]
pub struct Launcher {
    gateway: RuntimeGateway,
    poll_interval: Duration,
}

impl Launcher {
    pub fn new(gateway: RuntimeGateway) -> Self {
        Self {
            gateway,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn gateway(&self) -> &RuntimeGateway {
        &self.gateway
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Runs the container described by `request` and waits for it. When the
    /// wait fails the container is force-removed before the error is
    /// returned. A failed `run` leaves any container already holding the
    /// name untouched.
    pub fn start(&self, ctx: &Ctx, request: LaunchRequest) -> Result<ServiceHandle> {
        let name = request.spec.name.clone();
        info!(container = %name, image = %request.spec.image, "Starting container");

        if let Err(err) = self.gateway.runtime().run_container(ctx, &request.spec) {
            error!(container = %name, error = %err, "Container could not be created");
            return Err(err);
        }

        match self.await_ready(ctx, &request) {
            Ok(handle) => {
                info!(container = %name, address = %handle.address(), "Container ready");
                Ok(handle)
            }
            Err(err) => {
                error!(container = %name, error = %err, "Container failed to start");
                self.gateway.remove_forced(&name);
                Err(err)
            }
        }
    }

    fn await_ready(&self, ctx: &Ctx, request: &LaunchRequest) -> Result<ServiceHandle> {
        let runtime = self.gateway.runtime();
        let name = &request.spec.name;

        let host = runtime.host();
        let port = runtime.mapped_port(name, request.container_port)?;
        self.wait_for_port(
            ctx,
            name,
            &host,
            port,
            request.container_port,
            request.startup_timeout,
        )?;

        let collector = if request.log {
            let mut collector = LogCollector::start(ctx, runtime.as_ref(), name)?;
            collector.forward_to_tracing();
            Some(collector)
        } else {
            None
        };

        Ok(ServiceHandle {
            name: name.clone(),
            address: Addr { host, port },
            credentials: request.credentials.clone(),
            gateway: self.gateway.clone(),
            collector: Mutex::new(collector),
            terminated: AtomicBool::new(false),
        })
    }

    /// Polls until `container_port` is listening inside `name` and reachable
    /// on `host:host_port`. Fails fast when the container stops running and
    /// with [`Error::StartupTimeout`] once `timeout` has elapsed.
    pub fn wait_for_port(
        &self,
        ctx: &Ctx,
        name: &str,
        host: &str,
        host_port: u16,
        container_port: u16,
        timeout: Duration,
    ) -> Result<()> {
        let runtime = self.gateway.runtime();
        let started = Instant::now();

        loop {
            ctx.check()?;

            if runtime.is_port_ready(name, host, host_port, container_port) {
                debug!(container = %name, port = host_port, elapsed = ?started.elapsed(), "Port open");
                return Ok(());
            }

            if !runtime.is_running(name)? {
                return Err(Error::command(
                    format!("start {name}"),
                    format!("container stopped before port {container_port} opened"),
                ));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::StartupTimeout {
                    container: name.to_string(),
                    port: host_port,
                    timeout,
                });
            }

            ctx.sleep(self.poll_interval.min(timeout - elapsed))?;
        }
    }
}

/// A running single-container service.
#[derive(Debug)]
pub struct ServiceHandle {
    name: String,
    address: Addr,
    credentials: Option<Credentials>,
    gateway: RuntimeGateway,
    collector: Mutex<Option<LogCollector>>,
    terminated: AtomicBool,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Addr {
        &self.address
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl Terminate for ServiceHandle {
    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let collector = match self.collector.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut collector) = collector {
            collector.stop();
        }

        info!(container = %self.name, "Terminating container");
        self.gateway.remove_forced(&self.name);
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

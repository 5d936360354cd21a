use crate::ctx::Ctx;
use crate::domain::{
    ContainerRuntime, ContainerSpec, ExecOutput, Interrupter, LogRecord, LogSource, LogStream,
    NetworkSpec,
};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const FIRST_DYNAMIC_PORT: u16 = 40000;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone)]
struct ExecResponse {
    container: String,
    needle: String,
    output: String,
}

type LogFeeds = Arc<Mutex<HashMap<String, Sender<LogRecord>>>>;

/// In-memory container runtime. Records every call as `op:name` and lets
/// tests inject failures, exec output and log lines.
#[derive(Debug)]
pub struct MockRuntime {
    containers: RwLock<HashMap<String, MockContainer>>,
    networks: RwLock<HashSet<String>>,
    commands: RwLock<Vec<String>>,
    failures: RwLock<HashMap<String, Option<usize>>>,
    exec_responses: RwLock<Vec<ExecResponse>>,
    unready: RwLock<HashSet<String>>,
    log_feeds: LogFeeds,
    next_port: AtomicU16,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashSet::new()),
            commands: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            exec_responses: RwLock::new(Vec::new()),
            unready: RwLock::new(HashSet::new()),
            log_feeds: Arc::new(Mutex::new(HashMap::new())),
            next_port: AtomicU16::new(FIRST_DYNAMIC_PORT),
        }
    }

    /// Seeds a container as if an earlier run had left it behind.
    pub fn add_container(&self, name: &str, running: bool) {
        self.containers.write().unwrap().insert(
            name.to_string(),
            MockContainer {
                spec: ContainerSpec::new(name, "leftover:latest"),
                running,
                host_port: None,
            },
        );
    }

    pub fn add_network(&self, name: &str) {
        self.networks.write().unwrap().insert(name.to_string());
    }

    /// Makes `operation` fail on every call. `operation` is either a bare
    /// operation (`"run"`) or scoped to one object (`"run:rs-a-rs3"`).
    pub fn set_fail_on(&self, operation: &str) {
        self.failures
            .write()
            .unwrap()
            .insert(operation.to_string(), None);
    }

    /// Makes `operation` fail on its next `times` calls only.
    pub fn fail_times(&self, operation: &str, times: usize) {
        self.failures
            .write()
            .unwrap()
            .insert(operation.to_string(), Some(times));
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn count_commands(&self, command: &str) -> usize {
        self.commands
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    pub fn container_exists(&self, name: &str) -> bool {
        self.containers.read().unwrap().contains_key(name)
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.containers.read().unwrap().get(name).cloned()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.networks.read().unwrap().contains(name)
    }

    pub fn network_names(&self) -> Vec<String> {
        self.networks.read().unwrap().iter().cloned().collect()
    }

    /// Output returned by `exec` in `container` when the joined command
    /// contains `needle`.
    pub fn set_exec_response(&self, container: &str, needle: &str, output: &str) {
        self.exec_responses.write().unwrap().push(ExecResponse {
            container: container.to_string(),
            needle: needle.to_string(),
            output: output.to_string(),
        });
    }

    /// Scripts a healthy replica-set bootstrap for nodes named after `base`.
    pub fn script_replica_set(&self, base: &str) {
        let master = format!("{base}-m1");
        self.set_exec_response(&master, "rs.initiate", "{ ok: 1 }");
        self.set_exec_response(&master, "rs.isMaster", "{ ismaster: true, setName: 'rs0' }");
        self.set_exec_response(&format!("{base}-rs3"), "rs.status", "stateStr: 'PRIMARY'");
    }

    /// The container's port never reports ready.
    pub fn never_ready(&self, name: &str) {
        self.unready.write().unwrap().insert(name.to_string());
    }

    /// Simulates the container exiting on its own.
    pub fn stop_container(&self, name: &str) {
        if let Some(container) = self.containers.write().unwrap().get_mut(name) {
            container.running = false;
        }
    }

    /// Delivers a line to an attached log stream. Returns false when nothing
    /// is attached to `name`.
    pub fn push_log(&self, name: &str, source: LogSource, line: &str) -> bool {
        let feeds = self.log_feeds.lock().unwrap();
        feeds
            .get(name)
            .is_some_and(|tx| tx.send(LogRecord::new(source, line)).is_ok())
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str, name: &str) -> Result<()> {
        let mut failures = self.failures.write().unwrap();
        let scoped = format!("{operation}:{name}");

        for key in [scoped.as_str(), operation] {
            let Some(remaining) = failures.get_mut(key) else {
                continue;
            };
            match remaining {
                None => return Err(Error::command(key, format!("Mock failure on: {key}"))),
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(Error::command(key, format!("Mock failure on: {key}")));
                }
            }
        }
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for MockRuntime {
    fn is_available(&self) -> bool {
        self.record_command("version");
        true
    }

    fn inspect_name(&self, name: &str) -> Result<String> {
        self.record_command(&format!("inspect:{name}"));
        self.check_fail("inspect", name)?;

        if self.container_exists(name) {
            Ok(format!("\"/{name}\"\n"))
        } else {
            Err(Error::not_found(
                format!("inspect {name}"),
                format!("Error: No such object: {name}"),
            ))
        }
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        self.record_command(&format!("is_running:{name}"));
        self.check_fail("is_running", name)?;

        Ok(self
            .containers
            .read()
            .unwrap()
            .get(name)
            .is_some_and(|c| c.running))
    }

    fn run_container(&self, ctx: &Ctx, spec: &ContainerSpec) -> Result<()> {
        self.record_command(&format!("run:{}", spec.name));
        ctx.check()?;
        self.check_fail("run", &spec.name)?;

        let mut containers = self.containers.write().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(Error::command(
                format!("run {}", spec.name),
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }

        let host_port = spec.ports.first().map(|binding| {
            binding
                .host
                .unwrap_or_else(|| self.next_port.fetch_add(1, Ordering::SeqCst))
        });

        containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: true,
                host_port,
            },
        );
        Ok(())
    }

    fn mapped_port(&self, name: &str, container_port: u16) -> Result<u16> {
        self.record_command(&format!("mapped_port:{name}"));
        self.check_fail("mapped_port", name)?;

        let containers = self.containers.read().unwrap();
        let container = containers.get(name).ok_or_else(|| {
            Error::not_found(format!("port {name}"), format!("Error: No such container: {name}"))
        })?;

        let published = container
            .spec
            .ports
            .iter()
            .any(|binding| binding.container == container_port);

        match (published, container.host_port) {
            (true, Some(port)) => Ok(port),
            _ => Err(Error::command(
                format!("port {name} {container_port}"),
                format!("no public port '{container_port}/tcp' published for {name}"),
            )),
        }
    }

    fn host(&self) -> String {
        "localhost".to_string()
    }

    fn is_port_ready(&self, name: &str, _host: &str, _host_port: u16, _container_port: u16) -> bool {
        self.record_command(&format!("port_ready:{name}"));
        let running = self
            .containers
            .read()
            .unwrap()
            .get(name)
            .is_some_and(|c| c.running);
        running && !self.unready.read().unwrap().contains(name)
    }

    fn exec(&self, ctx: &Ctx, name: &str, cmd: &[String]) -> Result<ExecOutput> {
        self.record_command(&format!("exec:{name}"));
        ctx.check()?;
        self.check_fail("exec", name)?;

        let running = self
            .containers
            .read()
            .unwrap()
            .get(name)
            .is_some_and(|c| c.running);
        if !running {
            return Err(Error::command(
                format!("exec {name}"),
                format!("container {name} is not running"),
            ));
        }

        let joined = cmd.join(" ");
        let output = self
            .exec_responses
            .read()
            .unwrap()
            .iter()
            .find(|r| r.container == name && joined.contains(&r.needle))
            .map(|r| r.output.clone())
            .unwrap_or_default();

        Ok(ExecOutput {
            exit_code: 0,
            output,
        })
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.record_command(&format!("remove:{name}"));
        self.check_fail("remove", name)?;

        self.log_feeds.lock().unwrap().remove(name);
        match self.containers.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(
                format!("rm -f {name}"),
                format!("Error: No such container: {name}"),
            )),
        }
    }

    fn create_network(&self, ctx: &Ctx, spec: &NetworkSpec) -> Result<()> {
        self.record_command(&format!("create_network:{}", spec.name));
        ctx.check()?;
        self.check_fail("create_network", &spec.name)?;

        if !self.networks.write().unwrap().insert(spec.name.clone()) {
            return Err(Error::command(
                format!("network create {}", spec.name),
                format!("network with name {} already exists", spec.name),
            ));
        }
        Ok(())
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        self.record_command(&format!("network_exists:{name}"));
        self.check_fail("network_exists", name)?;
        Ok(self.has_network(name))
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.record_command(&format!("remove_network:{name}"));
        self.check_fail("remove_network", name)?;

        if self.networks.write().unwrap().remove(name) {
            Ok(())
        } else {
            Err(Error::not_found(
                format!("network rm {name}"),
                format!("Error: No such network: {name}"),
            ))
        }
    }

    fn prune_networks(&self) -> Result<()> {
        self.record_command("prune_networks");
        self.check_fail("prune_networks", "")?;
        Ok(())
    }

    fn attach_logs(&self, name: &str) -> Result<Box<dyn LogStream>> {
        self.record_command(&format!("attach_logs:{name}"));
        self.check_fail("attach_logs", name)?;

        let (tx, rx) = mpsc::channel();
        self.log_feeds.lock().unwrap().insert(name.to_string(), tx);

        Ok(Box::new(MockLogStream {
            name: name.to_string(),
            rx,
            feeds: Arc::clone(&self.log_feeds),
        }))
    }

    fn ping(&self, host: &str, port: u16, _timeout: Duration) -> Result<()> {
        self.record_command(&format!("ping:{host}:{port}"));
        self.check_fail("ping", &port.to_string())
    }
}

struct MockLogStream {
    name: String,
    rx: Receiver<LogRecord>,
    feeds: LogFeeds,
}

impl LogStream for MockLogStream {
    fn next_record(&mut self) -> Option<LogRecord> {
        self.rx.recv().ok()
    }

    fn interrupter(&self) -> Interrupter {
        let feeds = Arc::clone(&self.feeds);
        let name = self.name.clone();
        Box::new(move || {
            feeds.lock().unwrap().remove(&name);
        })
    }
}

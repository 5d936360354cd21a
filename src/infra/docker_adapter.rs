use crate::ctx::Ctx;
use crate::domain::{
    ContainerRuntime, ContainerSpec, ExecOutput, Interrupter, LogRecord, LogSource, LogStream,
    NetworkSpec,
};
use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const CHILD_POLL: Duration = Duration::from_millis(50);
const LOG_LINE_BUFFER: usize = 256;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(windows)]
const DEFAULT_BINARY: &str = "docker.exe";
#[cfg(not(windows))]
const DEFAULT_BINARY: &str = "docker";

/// [`ContainerRuntime`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerAdapter {
    binary: String,
}

impl DockerAdapter {
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_BINARY)
    }

    /// Uses another docker-compatible client, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    /// Runs to completion and returns stdout, failing on a non-zero exit.
    fn docker(&self, args: &[String]) -> Result<String> {
        let output = self.docker_output(args)?;
        ensure_success(&output, &self.describe(args))
    }

    fn docker_output(&self, args: &[String]) -> Result<Output> {
        let described = self.describe(args);
        debug!(command = %described, "Running runtime command");

        self.command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::command(described, e.to_string()))
    }

    /// Like [`docker_output`](Self::docker_output) but kills the client once
    /// `ctx` is cancelled or its deadline passes.
    fn docker_bounded(&self, ctx: &Ctx, args: &[String]) -> Result<Output> {
        ctx.check()?;
        let described = self.describe(args);
        debug!(command = %described, "Running runtime command");

        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command(described.clone(), e.to_string()))?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(Error::command(described, e.to_string())),
            }
            if let Err(err) = ctx.check() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
            thread::sleep(CHILD_POLL);
        };

        Ok(Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    fn connect_network(&self, ctx: &Ctx, network: &str, container: &str) -> Result<()> {
        let args = strings(["network", "connect", network, container]);
        let output = self.docker_bounded(ctx, &args)?;
        ensure_success(&output, &self.describe(&args)).map(|_| ())
    }
}

impl Default for DockerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerAdapter {
    fn is_available(&self) -> bool {
        self.docker_output(&strings(["version"]))
            .map(|out| {
                out.status.success() && String::from_utf8_lossy(&out.stdout).contains("Version")
            })
            .unwrap_or(false)
    }

    fn inspect_name(&self, name: &str) -> Result<String> {
        self.docker(&strings(["inspect", "--format={{.Name}}", name]))
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        match self.docker(&strings(["inspect", "--format={{.State.Running}}", name])) {
            Ok(out) => Ok(out.trim() == "true"),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn run_container(&self, ctx: &Ctx, spec: &ContainerSpec) -> Result<()> {
        let args = run_args(spec);
        let output = self.docker_bounded(ctx, &args)?;
        ensure_success(&output, &self.describe(&args))?;

        for network in spec.networks.iter().skip(1) {
            if let Err(err) = self.connect_network(ctx, network, &spec.name) {
                // Created by this call, so it is ours to remove.
                if let Err(cleanup) = self.remove_container(&spec.name) {
                    warn!(container = %spec.name, error = %cleanup, "Failed to remove half-started container");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn mapped_port(&self, name: &str, container_port: u16) -> Result<u16> {
        let target = format!("{container_port}/tcp");
        let args = strings(["port", name, target.as_str()]);
        let out = self.docker(&args)?;

        parse_mapped_port(&out).ok_or_else(|| {
            Error::command(
                self.describe(&args),
                format!("unexpected port mapping output: {}", out.trim()),
            )
        })
    }

    fn host(&self) -> String {
        host_from_docker_host(std::env::var("DOCKER_HOST").ok().as_deref())
    }

    fn is_port_ready(&self, name: &str, host: &str, host_port: u16, container_port: u16) -> bool {
        if self.ping(host, host_port, PROBE_TIMEOUT).is_err() {
            return false;
        }

        let probe = strings(["sh", "-c", listening_probe(container_port).as_str()]);
        match self.exec(&Ctx::background().with_timeout(PROBE_TIMEOUT * 4), name, &probe) {
            Ok(out) => out.exit_code == 0,
            Err(err) => {
                debug!(container = %name, error = %err, "Internal port probe unavailable");
                true
            }
        }
    }

    fn exec(&self, ctx: &Ctx, name: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut args = strings(["exec", name]);
        args.extend(cmd.iter().cloned());

        let output = self.docker_bounded(ctx, &args)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found_message(&stderr) {
            return Err(Error::not_found(self.describe(&args), stderr.trim()));
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&stderr);

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        self.docker(&strings(["rm", "-f", name])).map(|_| ())
    }

    fn create_network(&self, ctx: &Ctx, spec: &NetworkSpec) -> Result<()> {
        let mut args = strings(["network", "create", "--driver", spec.driver.as_str()]);
        if spec.attachable {
            args.push("--attachable".into());
        }
        args.push(spec.name.clone());

        let output = self.docker_bounded(ctx, &args)?;
        ensure_success(&output, &self.describe(&args)).map(|_| ())
    }

    fn network_exists(&self, name: &str) -> Result<bool> {
        match self.docker(&strings(["network", "inspect", name])) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.docker(&strings(["network", "rm", name])).map(|_| ())
    }

    fn prune_networks(&self) -> Result<()> {
        self.docker(&strings(["network", "prune", "-f"])).map(|_| ())
    }

    fn attach_logs(&self, name: &str) -> Result<Box<dyn LogStream>> {
        let args = strings(["logs", "--follow", "--timestamps", name]);
        let attach_error = |reason: String| Error::Attach {
            container: name.to_string(),
            reason,
        };

        let mut child = self
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| attach_error(e.to_string()))?;

        let (tx, rx) = mpsc::sync_channel(LOG_LINE_BUFFER);
        match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => {
                forward_lines(stdout, LogSource::Stdout, tx.clone());
                forward_lines(stderr, LogSource::Stderr, tx);
            }
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(attach_error("output pipes unavailable".into()));
            }
        }

        Ok(Box::new(DockerLogStream {
            rx,
            child: Arc::new(Mutex::new(child)),
        }))
    }

    fn ping(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let address = format!("{host}:{port}");
        let connect_error = |reason: String| Error::Connect {
            address: address.clone(),
            reason,
        };

        let candidates = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_error(e.to_string()))?;

        let mut last_error = String::from("no addresses resolved");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(connect_error(last_error))
    }
}

/// Output of `docker logs --follow`. Ends when the client process exits or
/// is killed through the interrupter.
struct DockerLogStream {
    rx: Receiver<LogRecord>,
    child: Arc<Mutex<Child>>,
}

impl LogStream for DockerLogStream {
    fn next_record(&mut self) -> Option<LogRecord> {
        self.rx.recv().ok()
    }

    fn interrupter(&self) -> Interrupter {
        let child = Arc::clone(&self.child);
        Box::new(move || {
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        })
    }
}

impl Drop for DockerLogStream {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn forward_lines<R>(reader: R, source: LogSource, tx: SyncSender<LogRecord>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(reader).split(b'\n') {
            let Ok(mut line) = line else { break };
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if tx.send(LogRecord::from_timestamped(source, &line)).is_err() {
                break;
            }
        }
    });
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default()
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn ensure_success(output: &Output, command: &str) -> Result<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = failure_reason(output.status, &stderr);
    if is_not_found_message(&stderr) {
        Err(Error::not_found(command, reason))
    } else {
        Err(Error::command(command, reason))
    }
}

fn failure_reason(status: ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {status}")
    } else {
        stderr.to_string()
    }
}

fn is_not_found_message(stderr: &str) -> bool {
    stderr.contains("No such") || stderr.contains("not found")
}

fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(["run", "-d", "--name", spec.name.as_str()]);

    if let Some(hostname) = &spec.hostname {
        args.push("--hostname".into());
        args.push(hostname.clone());
    }

    if let Some(network) = spec.networks.first() {
        args.push("--network".into());
        args.push(network.clone());
        for alias in &spec.network_aliases {
            args.push("--network-alias".into());
            args.push(alias.clone());
        }
    }

    if spec.auto_remove {
        args.push("--rm".into());
    }

    for port in &spec.ports {
        args.push("-p".into());
        args.push(match port.host {
            Some(host) => format!("{host}:{}", port.container),
            None => port.container.to_string(),
        });
    }

    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

/// Host port from `docker port` output such as `0.0.0.0:49153`.
fn parse_mapped_port(output: &str) -> Option<u16> {
    output
        .lines()
        .next()?
        .trim()
        .rsplit(':')
        .next()?
        .parse()
        .ok()
}

fn host_from_docker_host(docker_host: Option<&str>) -> String {
    docker_host
        .and_then(|raw| raw.strip_prefix("tcp://"))
        .and_then(|rest| rest.split(':').next())
        .filter(|host| !host.is_empty())
        .unwrap_or("localhost")
        .to_string()
}

/// Shell test for a socket in LISTEN state (`0A`) on `port` inside the container.
fn listening_probe(port: u16) -> String {
    format!("grep -Eqsi ':{port:04X} [0-9A-F]+:0+ 0A' /proc/net/tcp /proc/net/tcp6")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PortBinding;

    #[test]
    fn test_run_args_for_replica_node() {
        let mut spec = ContainerSpec::new("rs-a-m1", "mongo:latest");
        spec.hostname = Some("master".into());
        spec.networks = vec!["rs-net".into(), "extra".into()];
        spec.network_aliases = vec!["master".into()];
        spec.auto_remove = true;
        spec.ports = vec![PortBinding::dynamic(27017)];
        spec.cmd = strings(["--replSet", "rs0"]);

        let args = run_args(&spec);

        assert_eq!(
            args,
            strings([
                "run",
                "-d",
                "--name",
                "rs-a-m1",
                "--hostname",
                "master",
                "--network",
                "rs-net",
                "--network-alias",
                "master",
                "--rm",
                "-p",
                "27017",
                "mongo:latest",
                "--replSet",
                "rs0",
            ])
        );
    }

    #[test]
    fn test_run_args_fixed_port_and_env() {
        let mut spec = ContainerSpec::new("t1", "redis:latest");
        spec.ports = vec![PortBinding::fixed(6382, 6379)];
        spec.env.insert("B".into(), "2".into());
        spec.env.insert("A".into(), "1".into());

        let args = run_args(&spec);
        let joined = args.join(" ");

        assert!(joined.contains("-p 6382:6379"));
        assert!(joined.contains("-e A=1 -e B=2"));
        assert!(!joined.contains("--rm"));
        assert!(!joined.contains("--network"));
    }

    #[test]
    fn test_parse_mapped_port() {
        assert_eq!(parse_mapped_port("0.0.0.0:49153\n[::]:49153\n"), Some(49153));
        assert_eq!(parse_mapped_port("[::]:6382"), Some(6382));
        assert_eq!(parse_mapped_port(""), None);
        assert_eq!(parse_mapped_port("garbage"), None);
    }

    #[test]
    fn test_host_from_docker_host() {
        assert_eq!(host_from_docker_host(None), "localhost");
        assert_eq!(host_from_docker_host(Some("unix:///var/run/docker.sock")), "localhost");
        assert_eq!(host_from_docker_host(Some("tcp://10.0.0.5:2375")), "10.0.0.5");
    }

    #[test]
    fn test_listening_probe_uses_hex_port() {
        assert!(listening_probe(6379).contains(":18EB "));
        assert!(listening_probe(27017).contains(":6989 "));
    }

    #[test]
    fn test_not_found_messages() {
        assert!(is_not_found_message("Error: No such object: t1"));
        assert!(is_not_found_message("Error response from daemon: network rs not found"));
        assert!(!is_not_found_message("permission denied"));
    }
}

//! Three-node replicated database bootstrap.
//!
//! Stages run strictly in order. A failure in any stage after the network is
//! ready tears down every node started so far, and the network when this
//! orchestrator created it, before the error is returned.

use super::launcher::{Launcher, ServiceHandle, Terminate};
use super::network::{NetworkHandle, NetworkProvisioner};
use super::profiles::{self, REPLICA_NODES, REPLICA_SET_NAME, ReplicaNode};
use crate::ctx::Ctx;
use crate::domain::{Addr, ExecOutput, ServiceKind, ServiceOptions};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NETWORK_PREFIX: &str = "mongo-replicaset";
const MASTER_TIMEOUT: Duration = Duration::from_secs(10);
const MASTER_INTERVAL: Duration = Duration::from_millis(500);
const ELECTION_ATTEMPTS: u32 = 60;
const ELECTION_INTERVAL: Duration = Duration::from_millis(500);

const INITIATED_MARKER: &str = "ok";
const MASTER_MARKER: &str = "ismaster: true";
const PRIMARY_MARKER: &str = "PRIMARY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSetStage {
    NetworkReady,
    NodesStarted,
    AddressesResolved,
    ReplicaSetInitiated,
    MasterVerified,
    PrimaryElected,
    Ready,
}

impl fmt::Display for ReplicaSetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NetworkReady => "network ready",
            Self::NodesStarted => "nodes started",
            Self::AddressesResolved => "addresses resolved",
            Self::ReplicaSetInitiated => "replica set initiated",
            Self::MasterVerified => "master verified",
            Self::PrimaryElected => "primary elected",
            Self::Ready => "ready",
        };
        f.write_str(label)
    }
}

/// Result of polling for a primary after the set was initiated. A pending
/// election does not fail the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Converged { attempts: u32 },
    Pending { attempts: u32 },
}

impl ElectionOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaSetOrchestrator {
    launcher: Launcher,
    master_timeout: Duration,
    master_interval: Duration,
    election_attempts: u32,
    election_interval: Duration,
}

impl ReplicaSetOrchestrator {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            master_timeout: MASTER_TIMEOUT,
            master_interval: MASTER_INTERVAL,
            election_attempts: ELECTION_ATTEMPTS,
            election_interval: ELECTION_INTERVAL,
        }
    }

    pub fn with_election_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.election_attempts = attempts.max(1);
        self.election_interval = interval;
        self
    }

    /// How long the master may take to report itself after `rs.initiate`,
    /// and how often it is asked.
    pub fn with_master_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.master_timeout = timeout;
        self.master_interval = interval;
        self
    }

    /// Starts the three nodes described by `opts` and joins them into the
    /// `rs0` replica set. `opts.name()` is the base name of the nodes.
    pub fn start(&self, ctx: &Ctx, opts: &ServiceOptions) -> Result<ReplicaSetHandle> {
        let base = opts.name().to_string();
        info!(replica_set = %base, "Bootstrapping replica set");
        if opts.credentials().is_some() {
            warn!(
                replica_set = %base,
                "Replica-set members run without auth, ignoring the configured credentials"
            );
        }

        let mut bootstrap = Bootstrap::default();
        match self.run_stages(ctx, opts, &base, &mut bootstrap) {
            Ok(election) => {
                stage(&base, ReplicaSetStage::Ready);
                Ok(bootstrap.finish(base, election))
            }
            Err(err) => {
                warn!(replica_set = %base, error = %err, "Replica set bootstrap failed, rolling back");
                bootstrap.rollback();
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        ctx: &Ctx,
        opts: &ServiceOptions,
        base: &str,
        bootstrap: &mut Bootstrap,
    ) -> Result<ElectionOutcome> {
        bootstrap.network_name = match opts.networks().first() {
            Some(network) => network.clone(),
            None => {
                let provisioner = NetworkProvisioner::new(self.launcher.gateway().clone());
                let handle = provisioner.create_unique(ctx, NETWORK_PREFIX)?;
                let name = handle.name().to_string();
                bootstrap.network = Some(handle);
                name
            }
        };
        stage(base, ReplicaSetStage::NetworkReady);

        for node in &REPLICA_NODES {
            let request = profiles::replica_node(opts, node, &bootstrap.network_name);
            let service = self.launcher.start(ctx, request)?;
            bootstrap.members.push(ReplicaMember {
                node: *node,
                service,
            });
        }
        stage(base, ReplicaSetStage::NodesStarted);

        for member in &bootstrap.members {
            debug!(container = %member.name(), address = %member.address(), "Node address");
        }
        stage(base, ReplicaSetStage::AddressesResolved);

        let master = master_name(bootstrap)?;
        self.initiate(ctx, base, &master)?;
        stage(base, ReplicaSetStage::ReplicaSetInitiated);

        self.verify_master(ctx, &master)?;
        stage(base, ReplicaSetStage::MasterVerified);

        let observer = REPLICA_NODES[2].container_name(base);
        let election = self.await_primary(ctx, &observer)?;
        stage(base, ReplicaSetStage::PrimaryElected);

        Ok(election)
    }

    fn exec_eval(&self, ctx: &Ctx, container: &str, script: &str) -> Result<ExecOutput> {
        let cmd = vec![
            "mongosh".to_string(),
            "--quiet".to_string(),
            "--eval".to_string(),
            script.to_string(),
        ];
        self.launcher.gateway().runtime().exec(ctx, container, &cmd)
    }

    fn initiate(&self, ctx: &Ctx, base: &str, master: &str) -> Result<()> {
        let fail = |reason: String| Error::ReplicaSetInit {
            replica_set: base.to_string(),
            reason,
        };

        let out = self
            .exec_eval(ctx, master, &initiate_script())
            .map_err(|err| passthrough_cancel(err, fail))?;

        if is_initiated(&out) {
            Ok(())
        } else {
            Err(fail(format!("unexpected output: {}", out.output.trim())))
        }
    }

    fn verify_master(&self, ctx: &Ctx, master: &str) -> Result<()> {
        let fail = |reason: String| Error::MasterVerification {
            container: master.to_string(),
            reason,
        };

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let out = self
                .exec_eval(ctx, master, "printjson(rs.isMaster())")
                .map_err(|err| passthrough_cancel(err, fail))?;
            if is_master(&out) {
                debug!(container = %master, attempts, "Master confirmed");
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.master_timeout {
                return Err(fail(format!(
                    "`{MASTER_MARKER}` not reported within {:?} ({attempts} attempts): {}",
                    self.master_timeout,
                    out.output.trim()
                )));
            }

            debug!(container = %master, attempt = attempts, "Master not confirmed yet");
            ctx.sleep(self.master_interval.min(self.master_timeout - elapsed))?;
        }
    }

    fn await_primary(&self, ctx: &Ctx, observer: &str) -> Result<ElectionOutcome> {
        for attempt in 1..=self.election_attempts {
            match self.exec_eval(ctx, observer, "printjson(rs.status())") {
                Ok(out) if has_primary(&out) => {
                    return Ok(ElectionOutcome::Converged { attempts: attempt });
                }
                Ok(_) => {}
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => debug!(container = %observer, error = %err, "Status query failed"),
            }

            if attempt < self.election_attempts {
                ctx.sleep(self.election_interval)?;
            }
        }

        warn!(
            container = %observer,
            attempts = self.election_attempts,
            "No primary elected yet, continuing"
        );
        Ok(ElectionOutcome::Pending {
            attempts: self.election_attempts,
        })
    }
}

fn stage(base: &str, stage: ReplicaSetStage) {
    info!(replica_set = %base, stage = %stage, "Replica set stage reached");
}

fn master_name(bootstrap: &Bootstrap) -> Result<String> {
    bootstrap
        .members
        .first()
        .map(|member| member.name().to_string())
        .ok_or_else(|| Error::command("replica set", "no nodes were started"))
}

fn passthrough_cancel(err: Error, wrap: impl Fn(String) -> Error) -> Error {
    if err.is_cancelled() {
        err
    } else {
        wrap(err.to_string())
    }
}

fn initiate_script() -> String {
    let port = ServiceKind::Mongo.container_port();
    let members = REPLICA_NODES
        .iter()
        .enumerate()
        .map(|(id, node)| format!("{{_id: {id}, host: \"{}:{port}\"}}", node.alias))
        .collect::<Vec<_>>()
        .join(", ");

    format!("printjson(rs.initiate({{_id: \"{REPLICA_SET_NAME}\", members: [{members}]}}))")
}

fn is_initiated(out: &ExecOutput) -> bool {
    out.contains(INITIATED_MARKER)
}

fn is_master(out: &ExecOutput) -> bool {
    out.contains(MASTER_MARKER)
}

fn has_primary(out: &ExecOutput) -> bool {
    out.contains(PRIMARY_MARKER)
}

/// Connection string for a replica-set member.
pub fn replica_set_uri(addr: &Addr) -> String {
    format!(
        "mongodb://{addr}/?connect=direct&retryWrites=true&w=majority&readPreference=primaryPreferred&replicaSet={REPLICA_SET_NAME}"
    )
}

#[derive(Debug, Default)]
struct Bootstrap {
    network_name: String,
    network: Option<NetworkHandle>,
    members: Vec<ReplicaMember>,
}

impl Bootstrap {
    fn rollback(self) {
        for member in &self.members {
            member.service.terminate();
        }
        if let Some(network) = &self.network {
            network.remove();
        }
    }

    fn finish(self, base: String, election: ElectionOutcome) -> ReplicaSetHandle {
        ReplicaSetHandle {
            base,
            network_name: self.network_name,
            network: self.network,
            members: self.members,
            election,
            terminated: AtomicBool::new(false),
        }
    }
}

#[derive(Debug)]
pub struct ReplicaMember {
    node: ReplicaNode,
    service: ServiceHandle,
}

impl ReplicaMember {
    pub fn alias(&self) -> &'static str {
        self.node.alias
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    pub fn address(&self) -> &Addr {
        self.service.address()
    }

    pub fn uri(&self) -> String {
        replica_set_uri(self.address())
    }
}

/// A running three-node replica set; the first member is the master.
#[derive(Debug)]
pub struct ReplicaSetHandle {
    base: String,
    network_name: String,
    network: Option<NetworkHandle>,
    members: Vec<ReplicaMember>,
    election: ElectionOutcome,
    terminated: AtomicBool,
}

impl ReplicaSetHandle {
    pub fn base_name(&self) -> &str {
        &self.base
    }

    pub fn replica_set_name(&self) -> &str {
        REPLICA_SET_NAME
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Whether the network was created for this replica set and will be
    /// removed with it.
    pub fn owns_network(&self) -> bool {
        self.network.is_some()
    }

    pub fn members(&self) -> &[ReplicaMember] {
        &self.members
    }

    pub fn master(&self) -> &ReplicaMember {
        &self.members[0]
    }

    pub fn master_uri(&self) -> String {
        self.master().uri()
    }

    pub fn node_uri(&self, index: usize) -> Option<String> {
        self.members.get(index).map(ReplicaMember::uri)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn election(&self) -> ElectionOutcome {
        self.election
    }
}

impl Terminate for ReplicaSetHandle {
    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(replica_set = %self.base, "Terminating replica set");
        for member in &self.members {
            member.service.terminate();
        }
        if let Some(network) = &self.network {
            network.remove();
        }
    }
}

impl Drop for ReplicaSetHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

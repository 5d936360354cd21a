mod maintenance;
mod up;

pub use maintenance::{DownArgs, StatusArgs};
pub use up::UpArgs;

use crate::domain::ContainerRuntime;
use crate::infra::DockerAdapter;
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "fixturebox",
    about = "Provision disposable service containers for integration tests",
    version
)]
pub struct Cli {
    /// Docker-compatible client binary (default: docker, or the fixture file's runtime.binary)
    #[arg(long, global = true, env = "FIXTUREBOX_RUNTIME")]
    pub runtime: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision the fixtures described by one or more fixture files
    Up(UpArgs),
    /// Force-remove containers and networks left behind
    Down(DownArgs),
    /// Report whether containers exist
    Status(StatusArgs),
    /// Remove networks no container uses
    Prune,
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Up(args) => up::run(args, cli.runtime.as_deref()),
        Command::Down(args) => maintenance::down(&connect(cli.runtime.as_deref())?, &args),
        Command::Status(args) => {
            maintenance::status(&connect(cli.runtime.as_deref())?, &args, &mut std::io::stdout())
        }
        Command::Prune => maintenance::prune(&connect(cli.runtime.as_deref())?),
    }
}

/// Opens the runtime client and checks that it answers.
pub(crate) fn connect(binary: Option<&str>) -> Result<Arc<dyn ContainerRuntime>> {
    let adapter = match binary {
        Some(binary) => DockerAdapter::with_binary(binary),
        None => DockerAdapter::new(),
    };

    if !adapter.is_available() {
        bail!(
            "container runtime `{}` is not available; is the daemon running?",
            adapter.binary()
        );
    }

    Ok(Arc::new(adapter))
}

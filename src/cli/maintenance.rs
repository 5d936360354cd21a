use crate::domain::ContainerRuntime;
use crate::services::RuntimeGateway;
use anyhow::Result;
use clap::Args;
use std::io::Write;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct DownArgs {
    /// Container to remove (repeatable)
    #[arg(long)]
    pub container: Vec<String>,
    /// Network to remove (repeatable)
    #[arg(long)]
    pub network: Vec<String>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Containers to look up
    #[arg(required = true)]
    pub names: Vec<String>,
}

pub(crate) fn down(runtime: &Arc<dyn ContainerRuntime>, args: &DownArgs) -> Result<()> {
    let gateway = RuntimeGateway::new(runtime.clone());

    for name in &args.container {
        gateway.remove_forced(name);
    }
    for name in &args.network {
        gateway.remove_network(name);
    }

    println!(
        "🧹 Removed {} container(s) and {} network(s)",
        args.container.len(),
        args.network.len()
    );
    Ok(())
}

pub(crate) fn status(
    runtime: &Arc<dyn ContainerRuntime>,
    args: &StatusArgs,
    out: &mut impl Write,
) -> Result<()> {
    let gateway = RuntimeGateway::new(runtime.clone());

    for name in &args.names {
        let state = if gateway.exists(name)? {
            if runtime.is_running(name)? {
                "running"
            } else {
                "stopped"
            }
        } else {
            "absent"
        };
        writeln!(out, "- {:<20} | {}", name, state)?;
    }
    Ok(())
}

pub(crate) fn prune(runtime: &Arc<dyn ContainerRuntime>) -> Result<()> {
    RuntimeGateway::new(runtime.clone()).prune_networks();
    println!("🧹 Unused networks pruned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    #[test]
    fn test_status_lists_each_container() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("up", true);
        mock.add_container("idle", false);
        let runtime: Arc<dyn ContainerRuntime> = mock;

        let mut out = Vec::new();
        status(
            &runtime,
            &StatusArgs {
                names: vec!["up".into(), "idle".into(), "gone".into()],
            },
            &mut out,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("up                   | running"));
        assert!(text.contains("idle                 | stopped"));
        assert!(text.contains("gone                 | absent"));
    }

    #[test]
    fn test_down_removes_containers_and_networks() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("test-redis", true);
        mock.add_network("test-network");
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        down(
            &runtime,
            &DownArgs {
                container: vec!["test-redis".into(), "never-created".into()],
                network: vec!["test-network".into()],
            },
        )
        .unwrap();

        assert!(!mock.container_exists("test-redis"));
        assert!(!mock.has_network("test-network"));
    }
}

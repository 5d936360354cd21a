use crate::ctx::Ctx;
use crate::domain::ContainerRuntime;
use crate::infra::config::{FixtureConfig, load_configs};
use crate::services::{ElectionOutcome, FixtureSet, Fixtures, Launcher, RuntimeGateway};
use anyhow::{Context, Result};
use clap::Args;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Fixture file (repeatable; later files override earlier ones)
    #[arg(long, short, env = "FIXTUREBOX_CONFIG", value_delimiter = ',', required = true)]
    pub config: Vec<PathBuf>,
    /// Remove leftover containers with the configured names first
    #[arg(long)]
    pub fresh: bool,
    /// Tear down right away instead of waiting for Enter
    #[arg(long)]
    pub no_wait: bool,
}

pub(crate) fn run(args: UpArgs, runtime: Option<&str>) -> Result<()> {
    let config = load_configs(&args.config)?;
    let runtime = super::connect(runtime.or(config.binary()))?;

    let stdin = io::stdin();
    provision(runtime, &config, &args, &mut stdin.lock(), &mut io::stdout())
}

pub(crate) fn provision(
    runtime: Arc<dyn ContainerRuntime>,
    config: &FixtureConfig,
    args: &UpArgs,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> Result<()> {
    let gateway = RuntimeGateway::with_retry(runtime, config.retry_policy());
    let plan = config.to_plan();
    if args.fresh {
        gateway.drop_containers(&plan.container_names());
    }

    let fixtures = Fixtures::from_launcher(Launcher::new(gateway));
    let mut set = plan
        .provision(&Ctx::background(), fixtures)
        .into_ready()
        .context("provisioning fixtures")?;

    print_endpoints(&set, out)?;

    if !args.no_wait {
        writeln!(out, "⏎  Press Enter to tear everything down")?;
        out.flush()?;
        let mut line = String::new();
        input.read_line(&mut line).context("reading from stdin")?;
    }

    info!("Tearing down fixtures");
    set.close();
    writeln!(out, "🧹 Fixtures removed")?;
    Ok(())
}

fn print_endpoints(set: &FixtureSet, out: &mut impl Write) -> Result<()> {
    writeln!(out, "✅ Fixtures ready")?;

    if let Some(network) = set.network_name() {
        writeln!(out, "- network  | {network}")?;
    }
    if let Some(cache) = set.cache() {
        writeln!(out, "- cache    | {} (db {})", cache.address(), cache.db_index())?;
    }
    if let Some(database) = set.database() {
        writeln!(out, "- database | {}", database.uri())?;
        if let Some(ElectionOutcome::Pending { attempts }) =
            database.replica_set().map(|rs| rs.election())
        {
            writeln!(out, "  ⚠️  no primary after {attempts} status checks")?;
        }
    }
    if let Some(broker) = set.broker() {
        writeln!(
            out,
            "- broker   | {} (protocol {})",
            broker.brokers().join(","),
            broker.version()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    fn args(no_wait: bool, fresh: bool) -> UpArgs {
        UpArgs {
            config: Vec::new(),
            fresh,
            no_wait,
        }
    }

    #[test]
    fn test_up_prints_endpoints_and_tears_down_after_enter() {
        let mock = Arc::new(MockRuntime::new());
        let config: FixtureConfig = toml::from_str(
            r#"
[runtime]
retry_backoff_ms = 0

[network]

[cache]
"#,
        )
        .unwrap();

        let mut input = io::Cursor::new(b"\n".to_vec());
        let mut out = Vec::new();
        provision(mock.clone(), &config, &args(false, false), &mut input, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("- network  | test-network"));
        assert!(text.contains("- cache    | localhost:3890 (db 1)"));
        assert!(mock.container_names().is_empty());
        assert!(mock.network_names().is_empty());
    }

    #[test]
    fn test_up_failure_is_reported_with_context() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_on("run:test-redis");
        let config: FixtureConfig = toml::from_str("[runtime]\nretry_backoff_ms = 0\n[cache]\n").unwrap();

        let mut out = Vec::new();
        let err = provision(
            mock.clone(),
            &config,
            &args(true, false),
            &mut io::empty(),
            &mut out,
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("provisioning fixtures"));
        assert!(mock.container_names().is_empty());
    }

    #[test]
    fn test_fresh_drops_leftovers_first() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("test-mongo", false);
        let config: FixtureConfig =
            toml::from_str("[runtime]\nretry_backoff_ms = 0\n[database]\n").unwrap();

        let mut out = Vec::new();
        provision(mock.clone(), &config, &args(true, true), &mut io::empty(), &mut out).unwrap();

        let commands = mock.get_commands();
        let removed = commands.iter().position(|c| c == "remove:test-mongo").unwrap();
        let started = commands.iter().position(|c| c == "run:test-mongo").unwrap();
        assert!(removed < started);
    }

    #[test]
    fn test_fresh_sweeps_names_set_in_sections() {
        let mock = Arc::new(MockRuntime::new());
        mock.add_container("custom-cache", true);
        mock.add_container("orders-m1", false);
        mock.script_replica_set("orders");
        let config: FixtureConfig = toml::from_str(
            r#"
[runtime]
retry_backoff_ms = 0

[cache]
name = "custom-cache"

[database]
name = "orders"
replica_set = true
"#,
        )
        .unwrap();

        let mut out = Vec::new();
        provision(mock.clone(), &config, &args(true, true), &mut io::empty(), &mut out).unwrap();

        let commands = mock.get_commands();
        for name in ["custom-cache", "orders-m1"] {
            let removed = commands.iter().position(|c| *c == format!("remove:{name}")).unwrap();
            let started = commands.iter().position(|c| *c == format!("run:{name}")).unwrap();
            assert!(removed < started, "{name} was not swept before start");
        }
    }

}

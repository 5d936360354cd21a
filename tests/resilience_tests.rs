use anyhow::Result;
use fixturebox::services::{
    ElectionOutcome, FixturePlan, Fixtures, Launcher, ReplicaSetOrchestrator, RetryPolicy,
    RuntimeGateway, Terminate,
};
use fixturebox::test_support::MockRuntime;
use fixturebox::{Ctx, Error, ServiceOptions};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn launcher(mock: &Arc<MockRuntime>, poll: Duration) -> Launcher {
    let gateway = RuntimeGateway::with_retry(
        mock.clone(),
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(5),
        },
    );
    Launcher::new(gateway).with_poll_interval(poll)
}

#[test]
fn test_port_wait_honours_tiny_timeout() -> Result<()> {
    let mock = Arc::new(MockRuntime::new());
    mock.never_ready("never-open");
    let fixtures = Fixtures::from_launcher(launcher(&mock, Duration::from_millis(250)));

    let opts = ServiceOptions::redis()
        .name("never-open")
        .startup_timeout(Duration::from_millis(1))
        .build();

    let start = Instant::now();
    let err = fixtures
        .start_cache(&Ctx::background(), &opts)
        .expect_err("port never opens");
    let elapsed = start.elapsed();

    assert!(matches!(err, Error::StartupTimeout { .. }));
    // The poll sleep is clamped to the remaining timeout.
    assert!(
        elapsed < Duration::from_millis(200),
        "port wait overshot its timeout: {elapsed:?}"
    );
    assert!(!mock.container_exists("never-open"));
    Ok(())
}

#[test]
fn test_election_poll_is_bounded() -> Result<()> {
    let mock = Arc::new(MockRuntime::new());
    mock.set_exec_response("slow-rs-m1", "rs.initiate", "{ ok: 1 }");
    mock.set_exec_response("slow-rs-m1", "rs.isMaster", "{ ismaster: true }");

    let orchestrator = ReplicaSetOrchestrator::new(launcher(&mock, Duration::from_millis(1)))
        .with_election_poll(10, Duration::from_millis(10));

    let start = Instant::now();
    let handle = orchestrator.start(
        &Ctx::background(),
        &ServiceOptions::mongo().replica_set(true).name("slow-rs").build(),
    )?;
    let elapsed = start.elapsed();

    assert_eq!(handle.election(), ElectionOutcome::Pending { attempts: 10 });
    assert!(elapsed >= Duration::from_millis(80), "poll ended early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "poll hung: {elapsed:?}");
    Ok(())
}

#[test]
fn test_cancel_during_election_rolls_everything_back() -> Result<()> {
    let mock = Arc::new(MockRuntime::new());
    mock.set_exec_response("cx-rs-m1", "rs.initiate", "{ ok: 1 }");
    mock.set_exec_response("cx-rs-m1", "rs.isMaster", "{ ismaster: true }");

    let orchestrator = ReplicaSetOrchestrator::new(launcher(&mock, Duration::from_millis(1)))
        .with_election_poll(1_000, Duration::from_millis(10));

    let ctx = Ctx::background();
    let canceller = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ctx.cancel();
        })
    };

    let err = orchestrator
        .start(
            &ctx,
            &ServiceOptions::mongo().replica_set(true).name("cx-rs").build(),
        )
        .expect_err("cancelled mid-poll");
    canceller.join().expect("canceller thread");

    assert!(err.is_cancelled());
    assert!(mock.container_names().is_empty());
    assert!(mock.network_names().is_empty());
    Ok(())
}

#[test]
fn test_deadline_applies_to_whole_plan() -> Result<()> {
    let mock = Arc::new(MockRuntime::new());
    mock.never_ready("test-mongo");
    let fixtures = Fixtures::from_launcher(launcher(&mock, Duration::from_millis(5)));

    let ctx = Ctx::background().with_timeout(Duration::from_millis(100));
    let set = FixturePlan::new()
        .network()
        .cache()
        .database()
        .broker()
        .provision(&ctx, fixtures);

    let err = set.error().cloned().expect("deadline hit");
    assert!(err.root().is_cancelled());
    assert_eq!(mock.count_commands("run:test-kafka"), 0);
    assert!(!mock.container_exists("test-mongo"));

    drop(set);
    assert!(mock.container_names().is_empty());
    Ok(())
}

#[test]
fn test_flaky_removal_is_retried_during_teardown() -> Result<()> {
    let mock = Arc::new(MockRuntime::new());
    let fixtures = Fixtures::from_launcher(launcher(&mock, Duration::from_millis(1)));

    let db = fixtures.start_database(
        &Ctx::background(),
        &ServiceOptions::mongo().name("flaky-db").build(),
    )?;
    mock.fail_times("remove:flaky-db", 2);

    db.terminate();

    assert_eq!(mock.count_commands("remove:flaky-db"), 3);
    assert!(!mock.container_exists("flaky-db"));
    Ok(())
}

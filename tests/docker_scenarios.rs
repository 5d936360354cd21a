//! Scenarios against a real Docker daemon. Run with
//! `cargo test --test docker_scenarios -- --ignored`.

use anyhow::Result;
use fixturebox::services::{Fixtures, RuntimeGateway, Terminate};
use fixturebox::{ContainerRuntime, Ctx, DockerAdapter, ServiceOptions};
use serial_test::serial;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

fn docker() -> Arc<dyn ContainerRuntime> {
    Arc::new(DockerAdapter::new())
}

#[test]
#[ignore = "requires a docker daemon"]
#[serial]
fn test_cache_on_fixed_port_comes_and_goes() -> Result<()> {
    let runtime = docker();
    let gateway = RuntimeGateway::new(runtime.clone());
    gateway.drop_containers(&["t1"]);

    let cache = Fixtures::new(runtime).start_cache(
        &Ctx::background(),
        &ServiceOptions::redis().name("t1").port(6382).build(),
    )?;

    assert_eq!(cache.service().port(), 6382);
    TcpStream::connect_timeout(&"127.0.0.1:6382".parse()?, Duration::from_secs(2))?;
    assert!(gateway.exists("t1")?);

    cache.terminate();
    assert!(!gateway.exists("t1")?);
    Ok(())
}

#[test]
#[ignore = "requires a docker daemon"]
#[serial]
fn test_replica_set_accepts_writes_and_cleans_up() -> Result<()> {
    let runtime = docker();
    let gateway = RuntimeGateway::new(runtime.clone());
    gateway.drop_containers(&["rs-a-m1", "rs-a-rs2", "rs-a-rs3"]);

    let ctx = Ctx::background().with_timeout(Duration::from_secs(180));
    let database = Fixtures::new(runtime.clone()).start_database(
        &ctx,
        &ServiceOptions::mongo().name("rs-a").replica_set(true).build(),
    )?;

    let names = database.container_names();
    assert_eq!(names, vec!["rs-a-m1", "rs-a-rs2", "rs-a-rs3"]);
    for name in &names {
        assert!(gateway.exists(name)?);
    }
    assert!(database.uri().contains("replicaSet=rs0"));

    let script = "db.fixtures.insertOne({k: 'v'}); printjson(db.fixtures.findOne({k: 'v'}).k)";
    let out = runtime.exec(
        &ctx,
        "rs-a-m1",
        &[
            "mongosh".to_string(),
            "--quiet".to_string(),
            "--eval".to_string(),
            script.to_string(),
        ],
    )?;
    assert!(out.contains("v"), "unexpected output: {}", out.output);

    database.terminate();
    for name in &names {
        assert!(!gateway.exists(name)?);
    }
    Ok(())
}

use crate::domain::{BrokerOptions, ServiceOptions, ServiceOptionsBuilder};
use crate::services::{FixtureNames, FixturePlan, RetryPolicy};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_NAME: &str = "fixturebox.toml";

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Docker-compatible client binary
    pub binary: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct NamesConfig {
    pub network: Option<String>,
    pub cache: Option<String>,
    pub database: Option<String>,
    pub broker: Option<String>,
    pub coordinator: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub enabled: Option<bool>,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    pub image_tag: Option<String>,
    pub port: Option<i64>,
    pub startup_timeout_secs: Option<u64>,
    pub log: Option<bool>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Cache only
    pub db_index: Option<i64>,
    /// Database only
    pub replica_set: Option<bool>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub enabled: Option<bool>,
    pub kafka_name: Option<String>,
    pub zookeeper_name: Option<String>,
    pub kafka_image_tag: Option<String>,
    pub zookeeper_image_tag: Option<String>,
    pub port: Option<i64>,
    pub startup_timeout_secs: Option<u64>,
    pub log: Option<bool>,
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Contents of a fixture file. A section that is present enables its step
/// unless it sets `enabled = false`.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct FixtureConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub names: NamesConfig,
    pub network: Option<NetworkConfig>,
    pub cache: Option<ServiceConfig>,
    pub database: Option<ServiceConfig>,
    pub broker: Option<BrokerConfig>,
}

fn overlay<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

fn overlay_section<T>(target: &mut Option<T>, value: Option<T>, merge: impl FnOnce(&mut T, T)) {
    match (target.as_mut(), value) {
        (Some(existing), Some(other)) => merge(existing, other),
        (None, Some(other)) => *target = Some(other),
        (_, None) => {}
    }
}

impl ServiceConfig {
    fn merge(&mut self, other: ServiceConfig) {
        overlay(&mut self.enabled, other.enabled);
        overlay(&mut self.name, other.name);
        overlay(&mut self.image_tag, other.image_tag);
        overlay(&mut self.port, other.port);
        overlay(&mut self.startup_timeout_secs, other.startup_timeout_secs);
        overlay(&mut self.log, other.log);
        overlay(&mut self.user, other.user);
        overlay(&mut self.password, other.password);
        overlay(&mut self.db_index, other.db_index);
        overlay(&mut self.replica_set, other.replica_set);
        self.env.extend(other.env);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    fn apply(&self, mut builder: ServiceOptionsBuilder) -> ServiceOptionsBuilder {
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(tag) = &self.image_tag {
            builder = builder.image_tag(tag.clone());
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(secs) = self.startup_timeout_secs {
            builder = builder.startup_timeout(Duration::from_secs(secs));
        }
        if let Some(log) = self.log {
            builder = builder.log(log);
        }
        if let Some(index) = self.db_index {
            builder = builder.db_index(index);
        }
        builder = match (&self.user, &self.password) {
            (Some(user), Some(password)) => builder.credentials(user.clone(), password.clone()),
            (None, Some(password)) => builder.password(password.clone()),
            _ => builder,
        };
        for (key, value) in &self.env {
            builder = builder.env_var(key.clone(), value.clone());
        }
        builder
    }
}

impl BrokerConfig {
    fn merge(&mut self, other: BrokerConfig) {
        overlay(&mut self.enabled, other.enabled);
        overlay(&mut self.kafka_name, other.kafka_name);
        overlay(&mut self.zookeeper_name, other.zookeeper_name);
        overlay(&mut self.kafka_image_tag, other.kafka_image_tag);
        overlay(&mut self.zookeeper_image_tag, other.zookeeper_image_tag);
        overlay(&mut self.port, other.port);
        overlay(&mut self.startup_timeout_secs, other.startup_timeout_secs);
        overlay(&mut self.log, other.log);
        overlay(&mut self.protocol_version, other.protocol_version);
        self.env.extend(other.env);
    }
}

impl FixtureConfig {
    /// Merges another config into self.
    /// Values from `other` overwrite values in `self` if present.
    pub fn merge(&mut self, other: FixtureConfig) {
        overlay(&mut self.runtime.binary, other.runtime.binary);
        overlay(&mut self.runtime.retry_attempts, other.runtime.retry_attempts);
        overlay(&mut self.runtime.retry_backoff_ms, other.runtime.retry_backoff_ms);

        overlay(&mut self.names.network, other.names.network);
        overlay(&mut self.names.cache, other.names.cache);
        overlay(&mut self.names.database, other.names.database);
        overlay(&mut self.names.broker, other.names.broker);
        overlay(&mut self.names.coordinator, other.names.coordinator);

        overlay_section(&mut self.network, other.network, |current, other| {
            overlay(&mut current.enabled, other.enabled);
            overlay(&mut current.name, other.name);
        });
        overlay_section(&mut self.cache, other.cache, ServiceConfig::merge);
        overlay_section(&mut self.database, other.database, ServiceConfig::merge);
        overlay_section(&mut self.broker, other.broker, BrokerConfig::merge);
    }

    pub fn binary(&self) -> Option<&str> {
        self.runtime.binary.as_deref()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let default = RetryPolicy::default();
        RetryPolicy {
            attempts: self.runtime.retry_attempts.unwrap_or(default.attempts),
            backoff: self
                .runtime
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(default.backoff),
        }
    }

    pub fn names(&self) -> FixtureNames {
        let defaults = FixtureNames::default();
        let network = self
            .network
            .as_ref()
            .and_then(|n| n.name.clone())
            .or_else(|| self.names.network.clone());

        FixtureNames {
            network: network.unwrap_or(defaults.network),
            cache: self.names.cache.clone().unwrap_or(defaults.cache),
            database: self.names.database.clone().unwrap_or(defaults.database),
            broker: self.names.broker.clone().unwrap_or(defaults.broker),
            coordinator: self.names.coordinator.clone().unwrap_or(defaults.coordinator),
        }
    }

    /// Steps in fixed order: network, cache, database, broker.
    pub fn to_plan(&self) -> FixturePlan {
        let names = self.names();
        let mut plan = FixturePlan::new().with_names(names.clone());

        if self.network.as_ref().is_some_and(|n| n.enabled.unwrap_or(true)) {
            plan = plan.network();
        }

        if let Some(cache) = self.cache.as_ref().filter(|c| c.is_enabled()) {
            let builder = ServiceOptions::redis()
                .name(names.cache.clone())
                .port(crate::services::fixture_set::DEFAULT_CACHE_PORT);
            plan = plan.cache_with(cache.apply(builder));
        }

        if let Some(database) = self.database.as_ref().filter(|d| d.is_enabled()) {
            if database.replica_set.unwrap_or(false) {
                plan = plan.replicated_database_with(database.apply(ServiceOptions::mongo()));
            } else {
                let builder = ServiceOptions::mongo()
                    .name(names.database.clone())
                    .port(crate::services::fixture_set::DEFAULT_DATABASE_PORT);
                plan = plan.database_with(database.apply(builder));
            }
        }

        if let Some(broker) = self.broker.as_ref().filter(|b| b.enabled.unwrap_or(true)) {
            let mut builder = BrokerOptions::builder()
                .kafka_name(broker.kafka_name.clone().unwrap_or(names.broker.clone()))
                .zookeeper_name(
                    broker
                        .zookeeper_name
                        .clone()
                        .unwrap_or(names.coordinator.clone()),
                );
            if let Some(tag) = &broker.kafka_image_tag {
                builder = builder.kafka_image_tag(tag.clone());
            }
            if let Some(tag) = &broker.zookeeper_image_tag {
                builder = builder.zookeeper_image_tag(tag.clone());
            }
            if let Some(port) = broker.port {
                builder = builder.port(port);
            }
            if let Some(secs) = broker.startup_timeout_secs {
                builder = builder.startup_timeout(Duration::from_secs(secs));
            }
            if let Some(log) = broker.log {
                builder = builder.log(log);
            }
            if let Some(version) = &broker.protocol_version {
                builder = builder.protocol_version(version.clone());
            }
            for (key, value) in &broker.env {
                builder = builder.kafka_env_var(key.clone(), value.clone());
            }
            plan = plan.broker_with(builder);
        }

        plan
    }
}

pub fn expand_path(raw: &Path) -> PathBuf {
    let raw = raw.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

pub fn load_config(path: &Path) -> Result<FixtureConfig> {
    let path = expand_path(path);
    if !path.exists() {
        bail!("fixture file not found: {:?}", path);
    }

    let content = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
    let config: FixtureConfig =
        toml::from_str(&content).with_context(|| format!("parsing {:?}", path))?;

    debug!(path = ?path, "Loaded fixture file");
    Ok(config)
}

/// Loads every file in order; later files override earlier ones.
pub fn load_configs(paths: &[PathBuf]) -> Result<FixtureConfig> {
    let mut config = FixtureConfig::default();
    for path in paths {
        config.merge(load_config(path)?);
    }
    Ok(config)
}

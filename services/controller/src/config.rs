use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetclass_api::AgentDeployment;
use fleetclass_reconcile::{
    Backoff, DEFAULT_ATTEMPT_DEADLINE, DEFAULT_MAX_COMMIT_ATTEMPTS, DEFAULT_MEMBER_TIMEOUT,
    DEFAULT_RESYNC_INTERVAL, DEFAULT_RETRY_AFTER,
};

use crate::controller::{ReconcilerConfig, WorkerConfig};
use crate::db::DbConfig;

pub const DEFAULT_AGENT_NAMESPACE: &str = "projectsveltos";
pub const DEFAULT_AGENT_IMAGE: &str = "projectsveltos/sveltos-agent:main";

#[derive(Debug, Clone)]
pub struct Config {
    pub health_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub resync_interval: Duration,
    pub member_timeout: Duration,
    pub attempt_deadline: Duration,
    pub max_commit_attempts: u32,
    pub concurrency: usize,
    pub agent_image: String,
    pub agent_namespace: String,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let health_addr = env_or("FLEETCLASS_HEALTH_ADDR", "127.0.0.1:8081")
            .parse()
            .context("FLEETCLASS_HEALTH_ADDR")?;

        let log_level = env_or("FLEETCLASS_LOG_LEVEL", "info");

        let dev_mode = std::env::var("FLEETCLASS_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            health_addr,
            log_level,
            dev_mode,
            resync_interval: env_secs("FLEETCLASS_RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_INTERVAL)?,
            member_timeout: env_secs("FLEETCLASS_MEMBER_TIMEOUT_SECS", DEFAULT_MEMBER_TIMEOUT)?,
            attempt_deadline: env_secs("FLEETCLASS_ATTEMPT_DEADLINE_SECS", DEFAULT_ATTEMPT_DEADLINE)?,
            max_commit_attempts: env_parse(
                "FLEETCLASS_MAX_COMMIT_ATTEMPTS",
                DEFAULT_MAX_COMMIT_ATTEMPTS,
            )?,
            concurrency: env_parse("FLEETCLASS_CONCURRENCY", 8)?,
            agent_image: env_or("FLEETCLASS_AGENT_IMAGE", DEFAULT_AGENT_IMAGE),
            agent_namespace: env_or("FLEETCLASS_AGENT_NAMESPACE", DEFAULT_AGENT_NAMESPACE),
            database: DbConfig::from_env(),
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            member_timeout: self.member_timeout,
            attempt_deadline: self.attempt_deadline,
            max_commit_attempts: self.max_commit_attempts,
            retry_after: DEFAULT_RETRY_AFTER,
            agent: AgentDeployment {
                namespace: self.agent_namespace.clone(),
                image: self.agent_image.clone(),
            },
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            resync_interval: self.resync_interval,
            concurrency: self.concurrency.max(1),
            backoff: Backoff::default(),
            ..WorkerConfig::default()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{key}={raw}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

//! Configuration for the scheduler service.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::IndexedRandom;

use crate::gate::SchedulerAction;

/// Path the master serves the scheduler API on.
const SCHEDULER_API_PATH: &str = "/api/v1/scheduler";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Coordinator behaviour.
    pub scheduler: SchedulerConfig,

    /// In-memory offer cache sizing.
    pub offer_cache: OfferCacheConfig,

    /// Startup state for the in-memory collaborators.
    pub seed: SeedConfig,
}

/// What the binary loads into its in-memory collaborators at startup.
#[derive(Debug, Clone, Default)]
pub struct SeedConfig {
    /// JSON array of task requests queued on the matcher.
    pub task_requests_file: Option<PathBuf>,

    /// Hosts that take no tasks.
    pub decommissioned_hosts: Vec<String>,

    /// Actions switched off from the start.
    pub disabled_actions: Vec<SchedulerAction>,
}

/// Settings that drive the coordinator.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Comma-separated `host:port` list of masters.
    pub master: String,

    /// Keep unused offers around instead of declining them.
    pub cache_offers: bool,

    /// Decline offers while status updates lag behind.
    pub delay_offers_for_status_delta: bool,

    /// Lag threshold for the above, in milliseconds.
    pub delay_when_delta_over_ms: u64,

    /// Maximum number of status updates held before subscription.
    pub max_queued_status_updates: usize,

    /// Inbound event buffer size requested from the transport.
    pub event_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            master: "127.0.0.1:5050".to_string(),
            cache_offers: true,
            delay_offers_for_status_delta: true,
            delay_when_delta_over_ms: 15_000,
            max_queued_status_updates: 10_000,
            event_buffer_size: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Configured master hosts, trimmed, empty entries dropped.
    pub fn masters(&self) -> Vec<&str> {
        self.master
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Subscribe URL for a randomly chosen master.
    ///
    /// Any master will do: a non-leader redirects to the leader.
    pub fn subscribe_url(&self) -> Option<String> {
        let masters = self.masters();
        let master = masters.choose(&mut rand::rng())?;
        Some(format!("http://{master}{SCHEDULER_API_PATH}"))
    }
}

/// Sizing for the in-memory offer cache.
#[derive(Debug, Clone)]
pub struct OfferCacheConfig {
    /// How long an offer may sit in the cache before it is declined.
    pub ttl: Duration,

    /// Upper bound on cached offers; the oldest is declined to make room.
    pub max_offers: usize,

    /// How often expired offers are swept.
    pub sweep_interval: Duration,
}

impl Default for OfferCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_offers: 125,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("LATTICE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            master: std::env::var("LATTICE_MASTER").unwrap_or(defaults.master),
            cache_offers: env_bool("LATTICE_CACHE_OFFERS", defaults.cache_offers),
            delay_offers_for_status_delta: env_bool(
                "LATTICE_DELAY_OFFERS_FOR_STATUS_DELTA",
                defaults.delay_offers_for_status_delta,
            ),
            delay_when_delta_over_ms: env_parse(
                "LATTICE_DELAY_WHEN_DELTA_OVER_MS",
                defaults.delay_when_delta_over_ms,
            )?,
            max_queued_status_updates: env_parse(
                "LATTICE_MAX_QUEUED_STATUS_UPDATES",
                defaults.max_queued_status_updates,
            )?,
            event_buffer_size: env_parse("LATTICE_EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
        };

        if scheduler.masters().is_empty() {
            anyhow::bail!("LATTICE_MASTER must name at least one master");
        }

        let cache_defaults = OfferCacheConfig::default();
        let offer_cache = OfferCacheConfig {
            ttl: Duration::from_millis(env_parse(
                "LATTICE_OFFER_CACHE_TTL_MS",
                cache_defaults.ttl.as_millis() as u64,
            )?),
            max_offers: env_parse("LATTICE_OFFER_CACHE_MAX_OFFERS", cache_defaults.max_offers)?,
            sweep_interval: Duration::from_secs(env_parse(
                "LATTICE_OFFER_CACHE_SWEEP_SECS",
                cache_defaults.sweep_interval.as_secs(),
            )?),
        };

        let seed = SeedConfig {
            task_requests_file: std::env::var_os("LATTICE_TASK_REQUESTS_FILE").map(PathBuf::from),
            decommissioned_hosts: env_list("LATTICE_DECOMMISSIONED_HOSTS"),
            disabled_actions: env_list("LATTICE_DISABLED_ACTIONS")
                .iter()
                .map(|name| name.parse::<SchedulerAction>())
                .collect::<Result<_, _>>()
                .context("invalid value for LATTICE_DISABLED_ACTIONS")?,
        };

        Ok(Self {
            log_level,
            scheduler,
            offer_cache,
            seed,
        })
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid value for {name}: '{value}'")),
        Err(_) => Ok(default),
    }
}

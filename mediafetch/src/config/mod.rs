//! Application configuration.
//!
//! Everything is read from environment variables (a `.env` file is loaded
//! first by the binary). `DATABASE_URL` keeps its conventional name; every
//! other variable is prefixed `MEDIAFETCH_`. Unset variables fall back to
//! defaults, malformed ones are an [`Error::Configuration`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::alert::{AlertSeverity, WebhookAlertConfig};
use crate::database::MaintenanceConfig;
use crate::delivery::{
    BreakerConfig, PipelineConfig, RateLimiterConfig, WorkerPoolConfig,
};
use crate::logging::LogOptions;
use crate::monitor::{DedupConfig, MonitorConfig};
use crate::platform::{BridgeConfig, HttpPayloadFetcherConfig};
use crate::registry::RegistryConfig;
use crate::{Error, Result};

const PREFIX: &str = "MEDIAFETCH_";

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:mediafetch.db?mode=rwc".to_string(),
            max_connections: 8,
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LogOptions,
    pub registry: RegistryConfig,
    pub monitor: MonitorConfig,
    pub dedup: DedupConfig,
    pub pipeline: PipelineConfig,
    pub workers: WorkerPoolConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub maintenance: MaintenanceConfig,
    pub payload_fetcher: HttpPayloadFetcherConfig,
    /// Platform adapter service; without it the monitor and workers stay off.
    pub bridge: Option<BridgeConfig>,
    pub webhook_alerts: Option<WebhookAlertConfig>,
}

/// Typed reads over a key lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(&format!("{PREFIX}{name}"))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let key = format!("{PREFIX}{name}");
        self.raw(&key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|e| Error::config(format!("{key}={v:?}: {e}")))
            })
            .transpose()
    }

    fn set<T>(&self, name: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(name)? {
            *target = value;
        }
        Ok(())
    }

    fn set_secs(&self, name: &str, target: &mut Duration) -> Result<()> {
        if let Some(secs) = self.parse::<u64>(name)? {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn flag(&self, name: &str) -> Option<bool> {
        self.string(name).map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(url) = env.raw("DATABASE_URL") {
            config.database.url = url;
        }
        env.set("DB_MAX_CONNECTIONS", &mut config.database.max_connections)?;

        if let Some(dir) = env.string("LOG_DIR") {
            config.logging.dir = PathBuf::from(dir);
        }
        if let Some(json) = env.flag("LOG_JSON") {
            config.logging.json = json;
        }
        env.set("LOG_RETENTION_DAYS", &mut config.logging.retention_days)?;

        let registry = &mut config.registry;
        env.set("CODE_LENGTH", &mut registry.code_length)?;
        env.set_secs("CODE_TTL_SECS", &mut registry.code_ttl)?;
        env.set("CODE_MAX_ATTEMPTS", &mut registry.max_attempts)?;
        env.set("CODE_MAX_OUTSTANDING", &mut registry.max_outstanding)?;

        env.set_secs("POLL_INTERVAL_SECS", &mut config.monitor.default_poll_interval)?;
        env.set_secs(
            "SUPERVISOR_INTERVAL_SECS",
            &mut config.monitor.supervisor_interval,
        )?;
        config.registry.default_poll_interval = config.monitor.default_poll_interval;

        env.set("DEDUP_CAPACITY", &mut config.dedup.capacity)?;
        env.set_secs("DEDUP_MAX_AGE_SECS", &mut config.dedup.max_age)?;

        let pipeline = &mut config.pipeline;
        env.set("MAX_RETRIES", &mut pipeline.retry.max_retries)?;
        env.set("RETRY_INITIAL_DELAY_MS", &mut pipeline.retry.initial_delay_ms)?;
        env.set("RETRY_MAX_DELAY_MS", &mut pipeline.retry.max_delay_ms)?;
        if let Some(jitter) = env.flag("RETRY_JITTER") {
            pipeline.retry.use_jitter = jitter;
        }
        env.set_secs("LEASE_SECS", &mut pipeline.lease)?;
        env.set("MAX_PAYLOAD_BYTES", &mut pipeline.transform.max_payload_bytes)?;
        env.set("CAPTION_LIMIT", &mut pipeline.transform.caption_limit)?;
        env.set(
            "BINDING_FAILURE_THRESHOLD",
            &mut pipeline.binding_failure_threshold,
        )?;
        config.payload_fetcher.max_payload_bytes = pipeline.transform.max_payload_bytes;
        env.set_secs(
            "PAYLOAD_TIMEOUT_SECS",
            &mut config.payload_fetcher.request_timeout,
        )?;

        env.set("WORKERS", &mut config.workers.max_workers)?;
        env.set_secs("JOB_TIMEOUT_SECS", &mut config.workers.job_timeout)?;

        env.set(
            "BREAKER_FAILURE_THRESHOLD",
            &mut config.breaker.failure_threshold,
        )?;
        env.set_secs("BREAKER_WINDOW_SECS", &mut config.breaker.failure_window)?;
        env.set_secs("BREAKER_COOLDOWN_SECS", &mut config.breaker.cooldown)?;

        env.set("RATE_LIMIT", &mut config.rate_limit.capacity)?;
        env.set_secs(
            "RATE_LIMIT_PERIOD_SECS",
            &mut config.rate_limit.refill_period,
        )?;

        env.set_secs(
            "MAINTENANCE_INTERVAL_SECS",
            &mut config.maintenance.interval,
        )?;
        if let Some(days) = env.parse::<u64>("TASK_RETENTION_DAYS")? {
            config.maintenance.task_retention = Duration::from_secs(days * 24 * 60 * 60);
        }

        if let Some(base_url) = env.string("BRIDGE_URL") {
            let mut bridge = BridgeConfig {
                base_url,
                token: env.string("BRIDGE_TOKEN"),
                ..Default::default()
            };
            env.set_secs("BRIDGE_TIMEOUT_SECS", &mut bridge.timeout)?;
            config.bridge = Some(bridge);
        }

        if let Some(url) = env.string("ALERT_WEBHOOK_URL") {
            config.webhook_alerts = Some(WebhookAlertConfig {
                url,
                token: env.string("ALERT_WEBHOOK_TOKEN"),
                min_severity: env
                    .parse::<AlertSeverity>("ALERT_MIN_SEVERITY")?
                    .unwrap_or(AlertSeverity::Warning),
                timeout_secs: env.parse("ALERT_WEBHOOK_TIMEOUT_SECS")?.unwrap_or(10),
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(Error::config("database pool needs at least one connection"));
        }
        if self.logging.retention_days < 1 {
            return Err(Error::config("log retention must be at least one day"));
        }
        self.registry.validate()?;
        self.monitor.validate()?;
        self.dedup.validate()?;
        self.workers.validate(self.pipeline.lease)?;
        self.rate_limit.validate()?;
        if self.breaker.failure_threshold == 0 || self.breaker.cooldown.is_zero() {
            return Err(Error::config(
                "breaker threshold and cooldown must be positive",
            ));
        }
        if self.pipeline.binding_failure_threshold == 0 {
            return Err(Error::config("binding failure threshold must be at least 1"));
        }
        if self.pipeline.transform.max_payload_bytes == 0 {
            return Err(Error::config("payload limit must be positive"));
        }
        if self.pipeline.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("backoff multiplier must be at least 1"));
        }
        Ok(())
    }
}

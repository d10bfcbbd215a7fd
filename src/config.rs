//! Engine Configuration
//!
//! Settings read once when the engine is built. Values come from built-in
//! defaults, an optional YAML file and `FLOWRUNNER_*` environment variables,
//! in that order.

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::execution::pool::PoolConfig;

pub const DEFAULT_QUEUE_SIZE: usize = 10;
pub const DEFAULT_MIN_POOL_SIZE: usize = 4;
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
pub const DEFAULT_THREAD_KEEP_ALIVE_MINUTES: u64 = 5;
pub const DEFAULT_ENGINE_URL: &str = "http://localhost:9001";
pub const DEFAULT_CONDITION_WAIT_SECS: f64 = 10.0;
pub const DEFAULT_POLLING_WAIT_SECS: f64 = 10.0;
pub const DEFAULT_QUERIER_WAIT_SECS: f64 = 2.0;
/// Resource manager queue for jobs whose task does not name one
pub const DEFAULT_QUEUE_NAME: &str = "high";
/// Job load for tasks that do not declare one
pub const DEFAULT_LOAD: u32 = 2;
/// Finished drivers kept in memory for inspection
pub const DEFAULT_FINISHED_RETENTION: usize = 100;

/// How the engine schedules driver work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// One pool worker per instance for its whole lifetime
    #[default]
    ThreadPool,
    /// Shared querier and task runner ordering work by priority
    Prioritized,
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadPool => write!(f, "thread_pool"),
            Self::Prioritized => write!(f, "prioritized"),
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "thread_pool" | "threadpool" => Ok(Self::ThreadPool),
            "prioritized" | "priority" => Ok(Self::Prioritized),
            other => Err(EngineError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: SchedulingStrategy,
    pub queue_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub thread_keep_alive_minutes: u64,
    pub unlimited_queue: bool,
    pub resource_manager_url: Option<String>,
    pub engine_url: String,
    pub condition_wait_secs: f64,
    pub polling_wait_secs: f64,
    pub querier_wait_secs: f64,
    /// Concurrent tasks allowed on the local runner
    pub local_slots: usize,
    pub default_queue_name: String,
    pub default_load: u32,
    /// Finished drivers the engine keeps tracking; older ones are dropped
    /// and served from the repository
    pub finished_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            thread_keep_alive_minutes: DEFAULT_THREAD_KEEP_ALIVE_MINUTES,
            unlimited_queue: false,
            resource_manager_url: None,
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            condition_wait_secs: DEFAULT_CONDITION_WAIT_SECS,
            polling_wait_secs: DEFAULT_POLLING_WAIT_SECS,
            querier_wait_secs: DEFAULT_QUERIER_WAIT_SECS,
            local_slots: num_cpus::get(),
            default_queue_name: DEFAULT_QUEUE_NAME.to_string(),
            default_load: DEFAULT_LOAD,
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

impl EngineConfig {
    /// Reads a YAML config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overrides fields from `FLOWRUNNER_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("FLOWRUNNER_STRATEGY") {
            self.strategy = v.parse()?;
        }
        if let Some(v) = lookup("FLOWRUNNER_QUEUE_SIZE") {
            self.queue_size = parse_var("FLOWRUNNER_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_MIN_POOL_SIZE") {
            self.min_pool_size = parse_var("FLOWRUNNER_MIN_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_MAX_POOL_SIZE") {
            self.max_pool_size = parse_var("FLOWRUNNER_MAX_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_THREAD_KEEP_ALIVE_MINUTES") {
            self.thread_keep_alive_minutes = parse_var("FLOWRUNNER_THREAD_KEEP_ALIVE_MINUTES", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_UNLIMITED_QUEUE") {
            self.unlimited_queue = parse_var("FLOWRUNNER_UNLIMITED_QUEUE", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_RESMGR_URL") {
            self.resource_manager_url = Some(v).filter(|url| !url.trim().is_empty());
        }
        if let Some(v) = lookup("FLOWRUNNER_ENGINE_URL") {
            self.engine_url = v;
        }
        if let Some(v) = lookup("FLOWRUNNER_PRECONDITION_WAIT_SECS") {
            self.condition_wait_secs = parse_var("FLOWRUNNER_PRECONDITION_WAIT_SECS", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_POLLING_WAIT_SECS") {
            self.polling_wait_secs = parse_var("FLOWRUNNER_POLLING_WAIT_SECS", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_QUERIER_WAIT_SECS") {
            self.querier_wait_secs = parse_var("FLOWRUNNER_QUERIER_WAIT_SECS", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_LOCAL_SLOTS") {
            self.local_slots = parse_var("FLOWRUNNER_LOCAL_SLOTS", &v)?;
        }
        if let Some(v) = lookup("FLOWRUNNER_FINISHED_RETENTION") {
            self.finished_retention = parse_var("FLOWRUNNER_FINISHED_RETENTION", &v)?;
        }
        Ok(())
    }

    /// Rejects inconsistent pool sizes and unusable waits.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(EngineError::Config("max_pool_size must be at least 1".to_string()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(EngineError::Config(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if !self.unlimited_queue && self.queue_size == 0 {
            return Err(EngineError::Config(
                "queue_size must be at least 1 for a bounded queue".to_string(),
            ));
        }
        if self.local_slots == 0 {
            return Err(EngineError::Config("local_slots must be at least 1".to_string()));
        }

        for (name, value) in [
            ("condition_wait_secs", self.condition_wait_secs),
            ("polling_wait_secs", self.polling_wait_secs),
            ("querier_wait_secs", self.querier_wait_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn condition_wait(&self) -> Duration {
        secs(self.condition_wait_secs)
    }

    pub fn polling_wait(&self) -> Duration {
        secs(self.polling_wait_secs)
    }

    pub fn querier_wait(&self) -> Duration {
        secs(self.querier_wait_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.thread_keep_alive_minutes.saturating_mul(60))
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_workers: self.min_pool_size,
            max_workers: self.max_pool_size,
            keep_alive: self.keep_alive(),
            queue_size: (!self.unlimited_queue).then_some(self.queue_size),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| {
        warn!("Invalid wait of {} seconds; using zero", value);
        Duration::ZERO
    })
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid value '{}' for {}", value, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.strategy, SchedulingStrategy::ThreadPool);
        assert_eq!(config.queue_size, 10);
        assert_eq!(config.min_pool_size, 4);
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.keep_alive(), Duration::from_secs(300));
        assert_eq!(config.condition_wait(), Duration::from_secs(10));
        assert_eq!(config.querier_wait(), Duration::from_secs(2));
        assert_eq!(config.default_queue_name, "high");
        assert_eq!(config.default_load, 2);
        assert_eq!(config.finished_retention, 100);
        assert!(config.local_slots >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "strategy: prioritized\nmax_pool_size: 3\nmin_pool_size: 1\ncondition_wait_secs: 0.05"
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.strategy, SchedulingStrategy::Prioritized);
        assert_eq!(config.max_pool_size, 3);
        assert_eq!(config.condition_wait(), Duration::from_millis(50));
        assert_eq!(config.queue_size, 10);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FLOWRUNNER_STRATEGY", "prioritized"),
            ("FLOWRUNNER_UNLIMITED_QUEUE", "true"),
            ("FLOWRUNNER_RESMGR_URL", "http://rm:9002"),
            ("FLOWRUNNER_PRECONDITION_WAIT_SECS", "0.5"),
            ("FLOWRUNNER_FINISHED_RETENTION", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.strategy, SchedulingStrategy::Prioritized);
        assert!(config.unlimited_queue);
        assert_eq!(config.resource_manager_url.as_deref(), Some("http://rm:9002"));
        assert_eq!(config.condition_wait_secs, 0.5);
        assert_eq!(config.finished_retention, 0);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "FLOWRUNNER_MAX_POOL_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inconsistent_pools() {
        let config = EngineConfig {
            max_pool_size: 0,
            min_pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            min_pool_size: 5,
            max_pool_size: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            queue_size: 0,
            unlimited_queue: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_waits() {
        let config = EngineConfig {
            polling_wait_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            querier_wait_secs: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("thread_pool".parse::<SchedulingStrategy>().unwrap(), SchedulingStrategy::ThreadPool);
        assert_eq!("Prioritized".parse::<SchedulingStrategy>().unwrap(), SchedulingStrategy::Prioritized);
        assert!("round_robin".parse::<SchedulingStrategy>().is_err());
        assert_eq!(SchedulingStrategy::Prioritized.to_string(), "prioritized");
    }

    #[test]
    fn test_pool_config() {
        let config = EngineConfig {
            unlimited_queue: true,
            ..Default::default()
        };
        assert_eq!(config.pool_config().queue_size, None);
        assert_eq!(EngineConfig::default().pool_config().queue_size, Some(10));
    }

    #[test]
    fn test_huge_keep_alive_saturates() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| {
                (key == "FLOWRUNNER_THREAD_KEEP_ALIVE_MINUTES").then(|| u64::MAX.to_string())
            })
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.keep_alive(), Duration::from_secs(u64::MAX));
        assert_eq!(config.pool_config().keep_alive, Duration::from_secs(u64::MAX));
    }
}

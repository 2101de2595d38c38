//! Application configuration loaded from the environment.
//!
//! `.env` is read first (via `dotenvy`), then every setting falls back to a
//! default when its variable is unset.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::database::sqlite_url_for;
use crate::pipeline::{ArtifactPurgeConfig, SchedulerConfig};
use crate::{Error, Result};

pub const ENV_HOME: &str = "MEDIA_FORGE_HOME";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_WORKERS: &str = "MEDIA_FORGE_WORKERS";
pub const ENV_DEVICE_WAITERS: &str = "MEDIA_FORGE_DEVICE_WAITERS";
pub const ENV_POLL_INTERVAL_MS: &str = "MEDIA_FORGE_POLL_INTERVAL_MS";
pub const ENV_STAGE_TIMEOUT_SECS: &str = "MEDIA_FORGE_STAGE_TIMEOUT_SECS";
pub const ENV_RESOURCE_RETRIES: &str = "MEDIA_FORGE_RESOURCE_RETRIES";
pub const ENV_PIPELINES: &str = "MEDIA_FORGE_PIPELINES";
pub const ENV_RUNNER: &str = "MEDIA_FORGE_RUNNER";
pub const ENV_ARTIFACT_RETENTION_HOURS: &str = "MEDIA_FORGE_ARTIFACT_RETENTION_HOURS";
pub const ENV_WATCHDOG_GRACE_SECS: &str = "MEDIA_FORGE_WATCHDOG_GRACE_SECS";
pub const ENV_LOG_DIR: &str = "MEDIA_FORGE_LOG_DIR";
pub const ENV_LOG_JSON: &str = "MEDIA_FORGE_LOG_JSON";
pub const ENV_LOG_FILTER: &str = "MEDIA_FORGE_LOG_FILTER";

const DEFAULT_HOME_DIR: &str = "media-forge";
const DATABASE_FILE: &str = "media-forge.db";

/// Directory layout under the data home.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub home: PathBuf,
}

impl PathsConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Promoted final outputs, one folder per pipeline kind.
    pub fn content_dir(&self) -> PathBuf {
        self.home.join("content")
    }

    /// Per-job intermediates.
    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("jobs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.home.join("tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn setting_dir(&self) -> PathBuf {
        self.home.join("setting")
    }

    pub fn database_path(&self) -> PathBuf {
        self.home.join(DATABASE_FILE)
    }

    /// Every directory the application writes to.
    pub fn all_dirs(&self) -> [PathBuf; 5] {
        [
            self.content_dir(),
            self.jobs_dir(),
            self.tmp_dir(),
            self.logs_dir(),
            self.setting_dir(),
        ]
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(DEFAULT_HOME_DIR))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinesConfig {
    /// Catalog file; the built-in catalog is used when unset.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    /// Overrides the runner program of every catalog stage.
    #[serde(default)]
    pub runner_program: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub log_dir: PathBuf,
    #[serde(default)]
    pub json_file: bool,
    /// Filter directive applied over `RUST_LOG` once logging is up.
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub database_url: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub purge: ArtifactPurgeConfig,
    pub pipelines: PipelinesConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Defaults rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let paths = PathsConfig::new(home);
        Self {
            database_url: sqlite_url_for(&paths.database_path()),
            logging: LoggingSettings {
                log_dir: paths.logs_dir(),
                json_file: false,
                filter: None,
            },
            paths,
            scheduler: SchedulerConfig::default(),
            purge: ArtifactPurgeConfig::default(),
            pipelines: PipelinesConfig {
                catalog_path: None,
                runner_program: None,
            },
        }
    }

    /// Load `.env`, then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let paths = match var(ENV_HOME) {
            Some(home) => PathsConfig::new(home),
            None => PathsConfig::default(),
        };
        let mut config = Self::with_home(paths.home);

        if let Some(url) = var(ENV_DATABASE_URL) {
            config.database_url = url;
        }
        if let Some(workers) = parse_var::<usize>(&var, ENV_WORKERS)? {
            if workers == 0 {
                return Err(Error::config(format!("{} must be at least 1", ENV_WORKERS)));
            }
            config.scheduler.max_workers = workers;
        }
        if let Some(waiters) = parse_var::<usize>(&var, ENV_DEVICE_WAITERS)? {
            config.scheduler.max_device_waiters = waiters;
        }
        if let Some(ms) = parse_var::<u64>(&var, ENV_POLL_INTERVAL_MS)? {
            config.scheduler.poll_interval_ms = ms;
        }
        if let Some(secs) = parse_var::<u64>(&var, ENV_STAGE_TIMEOUT_SECS)? {
            config.scheduler.default_stage_timeout_secs = secs;
        }
        if let Some(retries) = parse_var::<u32>(&var, ENV_RESOURCE_RETRIES)? {
            config.scheduler.resource_exhaustion_retries = retries;
        }
        if let Some(secs) = parse_var::<u64>(&var, ENV_WATCHDOG_GRACE_SECS)? {
            config.scheduler.watchdog_grace_secs = secs;
        }
        if let Some(hours) = parse_var::<u32>(&var, ENV_ARTIFACT_RETENTION_HOURS)? {
            config.purge.retention_hours = hours;
        }
        config.pipelines.catalog_path = var(ENV_PIPELINES).map(PathBuf::from);
        config.pipelines.runner_program = var(ENV_RUNNER);
        if let Some(dir) = var(ENV_LOG_DIR) {
            config.logging.log_dir = PathBuf::from(dir);
        }
        if let Some(json) = parse_var::<bool>(&var, ENV_LOG_JSON)? {
            config.logging.json_file = json;
        }
        config.logging.filter = var(ENV_LOG_FILTER);

        Ok(config)
    }

    /// Create the data home and its subdirectories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in self.paths.all_dirs() {
            crate::utils::fs::ensure_dir_all_sync(&dir)?;
        }
        crate::utils::fs::ensure_dir_all_sync(&self.logging.log_dir)
    }

    pub fn home(&self) -> &Path {
        &self.paths.home
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_from_home() {
        let config = AppConfig::from_lookup(lookup(&[(ENV_HOME, "/data/mf")])).unwrap();
        assert_eq!(config.paths.jobs_dir(), PathBuf::from("/data/mf/jobs"));
        assert_eq!(config.paths.content_dir(), PathBuf::from("/data/mf/content"));
        assert_eq!(config.logging.log_dir, PathBuf::from("/data/mf/logs"));
        assert_eq!(config.database_url, "sqlite:///data/mf/media-forge.db?mode=rwc");
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert!(config.pipelines.catalog_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            (ENV_HOME, "/data/mf"),
            (ENV_DATABASE_URL, "sqlite::memory:"),
            (ENV_WORKERS, "4"),
            (ENV_DEVICE_WAITERS, "1"),
            (ENV_RESOURCE_RETRIES, "2"),
            (ENV_STAGE_TIMEOUT_SECS, "600"),
            (ENV_ARTIFACT_RETENTION_HOURS, "0"),
            (ENV_PIPELINES, "/etc/mf/pipelines.json"),
            (ENV_LOG_JSON, "true"),
            (ENV_LOG_FILTER, "media_forge=debug"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.scheduler.max_workers, 4);
        assert_eq!(config.scheduler.max_in_flight(), 5);
        assert_eq!(config.scheduler.resource_exhaustion_retries, 2);
        assert_eq!(config.scheduler.default_stage_timeout_secs, 600);
        assert_eq!(config.purge.retention_hours, 0);
        assert_eq!(
            config.pipelines.catalog_path,
            Some(PathBuf::from("/etc/mf/pipelines.json"))
        );
        assert!(config.logging.json_file);
        assert_eq!(config.logging.filter.as_deref(), Some("media_forge=debug"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[(ENV_WORKERS, "many")])),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[(ENV_WORKERS, "0")])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_blank_values_ignored() {
        let config =
            AppConfig::from_lookup(lookup(&[(ENV_HOME, "/h"), (ENV_WORKERS, "  ")])).unwrap();
        assert_eq!(config.scheduler.max_workers, SchedulerConfig::default().max_workers);
    }
}

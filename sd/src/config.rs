//! solverd configuration types and loading

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Main solverd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Concurrency caps and wait estimation
    pub admission: AdmissionConfig,

    /// Input size and time limits
    pub limits: LimitsConfig,

    /// Worker progress relay settings
    pub worker: WorkerConfig,

    /// Scheduler loop settings
    pub scheduler: SchedulerConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Replica sizing for the capacity signal
    pub autoscale: AutoscaleConfig,

    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.admission.global_cap == 0 {
            return Err(eyre!("admission.global-cap must be at least 1"));
        }
        if self.admission.per_user_cap == 0 {
            return Err(eyre!("admission.per-user-cap must be at least 1"));
        }
        if self.limits.max_n == 0 {
            return Err(eyre!("limits.max-n must be at least 1"));
        }
        if self.autoscale.min_replicas > self.autoscale.max_replicas {
            return Err(eyre!(
                "autoscale.min-replicas ({}) exceeds autoscale.max-replicas ({})",
                self.autoscale.min_replicas,
                self.autoscale.max_replicas
            ));
        }
        if self.autoscale.tasks_per_worker == 0 {
            return Err(eyre!("autoscale.tasks-per-worker must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .solverd.yml
        let local_config = PathBuf::from(".solverd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/solverd/solverd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("solverd").join("solverd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Concurrency caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum tasks running at once across all users
    #[serde(rename = "global-cap")]
    pub global_cap: usize,

    /// Active tasks a single user may hold before new ones queue
    #[serde(rename = "per-user-cap")]
    pub per_user_cap: usize,

    /// Assumed task duration when no task has completed yet
    #[serde(rename = "fallback-avg-secs")]
    pub fallback_avg_secs: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_cap: 4,
            per_user_cap: 2,
            fallback_avg_secs: 60.0,
        }
    }
}

/// Input size and time limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted matrix dimension
    #[serde(rename = "max-n")]
    pub max_n: usize,

    /// Cooperative cancellation deadline
    #[serde(rename = "soft-time-limit-secs")]
    pub soft_time_limit_secs: u64,

    /// Extra time after the soft limit before the job is abandoned
    #[serde(rename = "hard-time-limit-grace-secs")]
    pub hard_time_limit_grace_secs: u64,
}

impl LimitsConfig {
    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs + self.hard_time_limit_grace_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_n: 1000,
            soft_time_limit_secs: 300,
            hard_time_limit_grace_secs: 60,
        }
    }
}

/// Worker progress relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Percentage points between progress log lines
    #[serde(rename = "progress-log-step")]
    pub progress_log_step: f64,

    /// Events buffered per subscriber before the oldest are dropped
    #[serde(rename = "bus-capacity")]
    pub bus_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            progress_log_step: 10.0,
            bus_capacity: 256,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the task store and artifacts
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/solverd on Linux)
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("solverd"))
            .unwrap_or_else(|| PathBuf::from(".solverd"));
        Self { data_dir }
    }
}

/// Replica sizing bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    #[serde(rename = "min-replicas")]
    pub min_replicas: usize,

    #[serde(rename = "max-replicas")]
    pub max_replicas: usize,

    /// Backlog one worker replica is expected to absorb
    #[serde(rename = "tasks-per-worker")]
    pub tasks_per_worker: usize,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            tasks_per_worker: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.admission.global_cap, 4);
        assert_eq!(config.admission.per_user_cap, 2);
        assert_eq!(config.limits.max_n, 1000);
        assert_eq!(config.limits.hard_limit(), Duration::from_secs(360));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
admission:
  global-cap: 8
  per-user-cap: 3
  fallback-avg-secs: 12.5

limits:
  max-n: 50
  soft-time-limit-secs: 10
  hard-time-limit-grace-secs: 5

storage:
  data-dir: /tmp/solverd-test

log-level: debug
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.admission.global_cap, 8);
        assert_eq!(config.admission.per_user_cap, 3);
        assert_eq!(config.admission.fallback_avg_secs, 12.5);
        assert_eq!(config.limits.max_n, 50);
        assert_eq!(config.limits.soft_limit(), Duration::from_secs(10));
        assert_eq!(config.storage.store_path(), PathBuf::from("/tmp/solverd-test/store"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
admission:
  global-cap: 1
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.admission.global_cap, 1);
        assert_eq!(config.admission.per_user_cap, 2);
        assert_eq!(config.worker.bus_capacity, 256);
        assert_eq!(config.autoscale.tasks_per_worker, 5);
        assert_eq!(config.scheduler.poll_interval_ms, 2000);
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = Config::default();
        config.admission.global_cap = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.autoscale.min_replicas = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("solverd.yml");
        std::fs::write(&path, "limits:\n  max-n: 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.limits.max_n, 7);

        let missing = temp.path().join("missing.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    #[serial]
    fn test_load_project_local_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".solverd.yml"), "admission:\n  global-cap: 9\n").unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp.path()).unwrap();
        let loaded = Config::load(None);
        std::env::set_current_dir(original).unwrap();

        assert_eq!(loaded.unwrap().admission.global_cap, 9);
    }
}

//! Runtime configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::filter::PathFilter;
use crate::runtime::ModuleId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default record pool budget per module
pub const DEFAULT_MODULE_MEMORY: usize = 2 * 1024 * 1024;

/// Default budget shared by all modules of a job
pub const DEFAULT_TOTAL_MEMORY: usize = 8 * 1024 * 1024;

/// Job-wide runtime configuration
///
/// # Example
/// ```
/// use rastro::config::RuntimeConfig;
///
/// let config = RuntimeConfig::from_toml_str(r#"
///     rank = 3
///     exclude_prefixes = ["/scratch/tmp/"]
///
///     [telemetry]
///     enabled = true
///     port = 5000
/// "#).unwrap();
/// assert_eq!(config.rank, 3);
/// assert_eq!(config.module_memory_bytes, 2 * 1024 * 1024);
/// assert_eq!(config.telemetry.connect_timeout_secs, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Rank of this process within the job
    pub rank: i64,

    pub job_id: u64,

    /// User id stamped on telemetry events; unset means the process owner
    pub uid: Option<u32>,

    /// Record pool budget granted to each module
    pub module_memory_bytes: usize,

    /// Cap on the sum of all module budgets
    pub total_memory_bytes: usize,

    /// Exclude the built-in system directories (`/etc/`, `/usr/`, ...)
    pub exclude_system: bool,

    /// Extra absolute prefixes never tracked
    pub exclude_prefixes: Vec<String>,

    /// Where the binary log is written at shutdown
    pub log_path: Option<PathBuf>,

    pub telemetry: TelemetryConfig,

    /// OpenTelemetry export of operation events (requires the `otlp` feature)
    pub otlp: Option<OtlpConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            job_id: 0,
            uid: None,
            module_memory_bytes: DEFAULT_MODULE_MEMORY,
            total_memory_bytes: DEFAULT_TOTAL_MEMORY,
            exclude_system: true,
            exclude_prefixes: Vec::new(),
            log_path: None,
            telemetry: TelemetryConfig::default(),
            otlp: None,
        }
    }
}

/// Streaming connector settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Upper bound on the connect wait per resolved address
    pub connect_timeout_secs: u64,
    /// Events buffered between the instrumented threads and the writer
    pub queue_capacity: usize,
    pub producer: String,
    pub exe: String,
    /// Modules whose operations are still tracked but never published
    pub disabled_modules: Vec<ModuleId>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 411,
            connect_timeout_secs: 5,
            queue_capacity: 4096,
            producer: "rastro".to_string(),
            exe: String::new(),
            disabled_modules: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    /// Whether events of `module` reach the sink
    pub fn publishes(&self, module: ModuleId) -> bool {
        !self.disabled_modules.contains(&module)
    }
}

/// Configuration for the OTLP sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// OTLP endpoint URL (e.g., "http://localhost:4317")
    pub endpoint: String,
    /// Service name for exported spans
    pub service_name: String,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// Exclusion policy described by this configuration
    pub fn path_filter(&self) -> PathFilter {
        let mut filter = if self.exclude_system {
            PathFilter::system()
        } else {
            PathFilter::none()
        };
        for prefix in &self.exclude_prefixes {
            filter.add_prefix(prefix.as_str());
        }
        filter
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.total_memory_bytes < self.module_memory_bytes {
            return Err(format!(
                "total_memory_bytes ({}) must be >= module_memory_bytes ({})",
                self.total_memory_bytes, self.module_memory_bytes
            ));
        }

        if let Some(prefix) = self.exclude_prefixes.iter().find(|p| !p.starts_with('/')) {
            return Err(format!("exclusion prefix must be absolute, got {:?}", prefix));
        }

        if self.telemetry.connect_timeout_secs == 0 {
            return Err("telemetry.connect_timeout_secs must be > 0".to_string());
        }

        if self.telemetry.queue_capacity == 0 {
            return Err("telemetry.queue_capacity must be > 0".to_string());
        }

        if self.telemetry.enabled && self.telemetry.host.is_empty() {
            return Err("telemetry.host must be set when telemetry is enabled".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.module_memory_bytes, DEFAULT_MODULE_MEMORY);
        assert!(config.exclude_system);
        assert!(!config.telemetry.enabled);
        assert_eq!(config.telemetry.connect_timeout_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            rank = 7
            job_id = 1234
            module_memory_bytes = 65536
            exclude_system = false
            exclude_prefixes = ["/scratch/tmp/"]
            log_path = "/tmp/job.rastro"

            [telemetry]
            enabled = true
            host = "monitor"
            port = 9000

            [otlp]
            endpoint = "http://localhost:4317"
            service_name = "sim"
            "#,
        )
        .unwrap();

        assert_eq!(config.rank, 7);
        assert_eq!(config.job_id, 1234);
        assert_eq!(config.module_memory_bytes, 65536);
        assert_eq!(config.telemetry.host, "monitor");
        assert_eq!(config.telemetry.queue_capacity, 4096);
        assert_eq!(config.otlp.as_ref().unwrap().service_name, "sim");

        let filter = config.path_filter();
        assert!(!filter.is_excluded("/etc/hosts"));
        assert!(filter.is_excluded("/scratch/tmp/a"));
    }

    #[test]
    fn test_disabled_modules_and_uid() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            uid = 1001

            [telemetry]
            disabled_modules = ["HDF5"]
            "#,
        )
        .unwrap();

        assert_eq!(config.uid, Some(1001));
        assert!(config.telemetry.publishes(ModuleId::Posix));
        assert!(!config.telemetry.publishes(ModuleId::Hdf5));

        let defaults = TelemetryConfig::default();
        assert!(ModuleId::ALL.iter().all(|m| defaults.publishes(*m)));
        assert!(RuntimeConfig::from_toml_str("[telemetry]\ndisabled_modules = [\"MPIIO\"]").is_err());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(RuntimeConfig::from_toml_str("rank = \"three\"").is_err());
    }

    #[test]
    fn test_validate_rejects_relative_prefix() {
        let config = RuntimeConfig {
            exclude_prefixes: vec!["tmp/".to_string()],
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_small_total() {
        let config = RuntimeConfig {
            module_memory_bytes: 100,
            total_memory_bytes: 10,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rastro.toml");
        fs::write(&path, "rank = 2\n").unwrap();
        assert_eq!(RuntimeConfig::from_file(&path).unwrap().rank, 2);
        assert!(RuntimeConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}

//! Configuration types for gpufleet

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::Backend;
use crate::error::{FleetError, FleetResult};
use crate::gpu::Worker;
use crate::model::ModelSpec;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Instance lifecycle configuration
    pub lifecycle: LifecycleConfig,
    /// Runtime configuration
    pub runtime: RuntimeConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> FleetResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| FleetError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between reconciliation passes per spec
    pub reconcile_interval_secs: u64,
    /// Attempts to re-plan when a reservation loses a race
    pub max_placement_attempts: u32,
    /// VRAM assumed for a spec without a `vram` hint
    #[serde(with = "memory_bytes")]
    pub default_vram: u64,
    /// RAM assumed for a spec without a `ram` hint
    #[serde(with = "memory_bytes")]
    pub default_ram: u64,
    /// Layer count assumed until analysis finds the real one
    pub default_total_layers: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            max_placement_attempts: 3,
            default_vram: 8 * 1024 * 1024 * 1024, // 8 GiB
            default_ram: 1024 * 1024 * 1024,
            default_total_layers: 33,
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Bounds and probing cadence for instance lifecycles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub download_timeout_secs: u64,
    pub analyze_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    /// Consecutive failed probes before a running instance is unreachable
    pub unreachable_threshold: u32,
    /// Delay before an automatic restart out of `error`
    pub restart_backoff_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 3600,
            analyze_timeout_secs: 300,
            start_timeout_secs: 600,
            health_check_interval_secs: 10,
            health_check_timeout_secs: 5,
            unreachable_threshold: 3,
            restart_backoff_secs: 10,
        }
    }
}

impl LifecycleConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Binary per backend name, e.g. `llama-box = "/opt/llama-box/llama-box"`
    pub backend_binaries: BTreeMap<String, PathBuf>,
    /// Base port for instance allocation
    pub worker_base_port: u16,
    /// Number of ports available from the base
    pub max_ports: u16,
    /// Path used by `/health` probes
    pub health_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend_binaries: BTreeMap::new(),
            worker_base_port: 40000,
            max_ports: 1024,
            health_path: "/health".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Configured binary for `backend`, falling back to its name on `PATH`
    pub fn binary_for(&self, backend: &Backend) -> PathBuf {
        self.backend_binaries
            .get(backend.as_str())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(backend.as_str()))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to model storage directory
    pub models_path: PathBuf,
    /// Maximum cache size in bytes
    #[serde(with = "memory_bytes")]
    pub max_cache_size: u64,
    /// Enable LRU eviction
    pub lru_eviction: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_path: PathBuf::from("/var/lib/gpufleet/models"),
            max_cache_size: 500 * 1024 * 1024 * 1024, // 500 GiB
            lru_eviction: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Fleet file: daemon settings, worker inventory and declared models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub daemon: DaemonConfig,
    pub workers: Vec<Worker>,
    pub models: Vec<ModelSpec>,
}

impl FleetConfig {
    pub fn from_file(path: &std::path::Path) -> FleetResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("Failed to read fleet file: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> FleetResult<Self> {
        toml::from_str(content)
            .map_err(|e| FleetError::Config(format!("Failed to parse fleet file: {}", e)))
    }
}

/// Parse a memory quantity: plain bytes (`"1048576"`), binary units
/// (`"16Gi"`, `"512Mi"`, `"1Ti"`, `"4Ki"`) or decimal units (`"8GB"`, `"500M"`).
pub fn parse_memory(input: &str) -> FleetResult<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| FleetError::Config(format!("invalid memory quantity '{}'", input)))?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "Ki" | "KiB" => 1 << 10,
        "Mi" | "MiB" => 1 << 20,
        "Gi" | "GiB" => 1 << 30,
        "Ti" | "TiB" => 1 << 40,
        "K" | "KB" | "k" => 1_000,
        "M" | "MB" => 1_000_000,
        "G" | "GB" => 1_000_000_000,
        "T" | "TB" => 1_000_000_000_000,
        other => {
            return Err(FleetError::Config(format!(
                "unknown memory unit '{}' in '{}'",
                other, input
            )))
        }
    };
    Ok((value * multiplier as f64).round() as u64)
}

/// Serde adapter accepting either an integer byte count or a human string.
pub mod memory_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Bytes(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Quantity::deserialize(deserializer)? {
            Quantity::Bytes(b) => Ok(b),
            Quantity::Text(s) => super::parse_memory(&s).map_err(serde::de::Error::custom),
        }
    }
}

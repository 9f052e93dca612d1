//! Engine configuration for scopeflow
//!
//! `EngineConfig` holds the settings that outlive any one session: whether
//! and how to bring up the compute device, logging, trend history depth and
//! defaults for newly created export nodes.
//!
//! # Location
//!
//! The file is TOML, stored in the platform configuration directory:
//! - **Linux**: `~/.config/scopeflow/engine.toml`
//! - **macOS**: `~/Library/Application Support/scopeflow/engine.toml`
//! - **Windows**: `%APPDATA%\scopeflow\engine.toml`
//!
//! A missing file yields the defaults.
//!
//! # Example
//!
//! ```ignore
//! use scopeflow::config::EngineConfig;
//!
//! let config = EngineConfig::load_or_default();
//! let mut graph = config.build_graph();
//! let export = config.add_filter(&mut graph, "VCD Export")?;
//! ```

use crate::accel::{ComputeDevice, DeviceCapabilities};
use crate::error::{Result, ScopeError};
use crate::pipeline::{registry, FilterGraph, NodeId, PipelineResult};
use crate::pipeline::trend::DEFAULT_TREND_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name under the platform config directory
pub const APP_DIR: &str = "scopeflow";

/// Config filename
pub const CONFIG_FILE: &str = "engine.toml";

/// Default log filter directive
pub const DEFAULT_LOG_FILTER: &str = "info,scopeflow=debug";

/// Default VCD export timescale, 1 ps
pub const DEFAULT_EXPORT_TIMESCALE_FS: i64 = 1000;

/// Get the scopeflow configuration directory
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR))
}

/// Get the default config file path
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Device ====================

/// Compute device settings
///
/// Capability fields left unset keep the device defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Offload filters to the compute device
    pub enabled: bool,
    pub push_descriptors: Option<bool>,
    pub int64_atomics: Option<bool>,
    pub float_atomics: Option<bool>,
    /// Device memory budget in bytes
    pub memory_budget: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push_descriptors: None,
            int64_atomics: None,
            float_atomics: None,
            memory_budget: None,
        }
    }
}

impl DeviceConfig {
    pub fn capabilities(&self) -> DeviceCapabilities {
        let base = DeviceCapabilities::default();
        DeviceCapabilities {
            push_descriptors: self.push_descriptors.unwrap_or(base.push_descriptors),
            int64_atomics: self.int64_atomics.unwrap_or(base.int64_atomics),
            float_atomics: self.float_atomics.unwrap_or(base.float_atomics),
            memory_budget: self.memory_budget.unwrap_or(base.memory_budget),
        }
    }
}

// ==================== Logging ====================

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Directory for daily rolling log files; none logs to stderr only
    pub directory: Option<PathBuf>,
    /// Log file name prefix
    pub file_prefix: String,
    /// Colored stderr output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: "scopeflow.log".to_string(),
            ansi: true,
        }
    }
}

// ==================== Export ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Timescale of new VCD export nodes, fs
    pub vcd_timescale_fs: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            vcd_timescale_fs: DEFAULT_EXPORT_TIMESCALE_FS,
        }
    }
}

// ==================== Engine Config ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
    /// History depth of scalar streams; zero disables trends
    pub trend_depth: usize,
    pub export: ExportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
            trend_depth: DEFAULT_TREND_DEPTH,
            export: ExportConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the default location
    pub fn load() -> Result<Self> {
        let path = config_path()
            .ok_or_else(|| ScopeError::Config("Could not determine config directory".to_string()))?;
        Self::load_from(path)
    }

    /// Load from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load engine config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScopeError::Config(format!("Failed to read config {:?}: {}", path, e)))?;
        Self::from_toml(&content).map_err(|e| e.with_context(format!("{:?}", path)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ScopeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ScopeError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Save to `path`, creating parent directories
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScopeError::Config(format!("Failed to create config directory: {}", e)))?;
        }
        std::fs::write(path, self.to_toml()?)
            .map_err(|e| ScopeError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.export.vcd_timescale_fs <= 0 {
            return Err(ScopeError::Config(format!(
                "export.vcd_timescale_fs must be positive, got {}",
                self.export.vcd_timescale_fs
            )));
        }
        if self.device.memory_budget == Some(0) {
            return Err(ScopeError::Config("device.memory_budget must be non-zero".to_string()));
        }
        Ok(())
    }

    /// An empty graph set up per this config
    pub fn build_graph(&self) -> FilterGraph {
        let mut graph = if self.device.enabled {
            FilterGraph::with_device(ComputeDevice::new(self.device.capabilities()))
        } else {
            tracing::info!("Compute device disabled, filters run on the CPU");
            FilterGraph::new()
        };
        graph.set_trend_depth(self.trend_depth);
        graph
    }

    /// Create a filter through the registry with configured defaults applied
    pub fn add_filter(&self, graph: &mut FilterGraph, protocol: &str) -> PipelineResult<NodeId> {
        let mut filter = registry::create_filter(protocol)?;
        if protocol == crate::filters::VcdExportFilter::PROTOCOL {
            filter
                .core_mut()
                .parameters
                .set("Timescale", self.export.vcd_timescale_fs)?;
        }
        Ok(graph.add_node(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert!(config.device.enabled);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
        assert_eq!(config.trend_depth, DEFAULT_TREND_DEPTH);
        assert_eq!(config.export.vcd_timescale_fs, 1000);
        assert_eq!(config.device.capabilities(), DeviceCapabilities::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
trend_depth = 64

[device]
float_atomics = false
memory_budget = 1048576
"#,
        )
        .unwrap();
        assert_eq!(config.trend_depth, 64);
        let caps = config.device.capabilities();
        assert!(!caps.float_atomics);
        assert!(caps.int64_atomics);
        assert_eq!(caps.memory_budget, 1 << 20);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_toml("[export]\nvcd_timescale_fs = 0\n").is_err());
        assert!(EngineConfig::from_toml("[device]\nmemory_budget = 0\n").is_err());
        assert!(EngineConfig::from_toml("trend_depth = \"lots\"").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = EngineConfig::default();
        config.logging.directory = Some(PathBuf::from("/var/log/scopeflow"));
        config.device.push_descriptors = Some(false);
        let again = EngineConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(config, again);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join(CONFIG_FILE);
        let mut config = EngineConfig::default();
        config.trend_depth = 0;
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_build_graph_honors_device_switch() {
        let mut config = EngineConfig::default();
        config.device.enabled = false;
        assert!(config.build_graph().device().is_none());
        config.device.enabled = true;
        config.device.int64_atomics = Some(false);
        let graph = config.build_graph();
        assert!(!graph.device().unwrap().capabilities().int64_atomics);
    }

    #[test]
    fn test_add_filter_applies_export_timescale() {
        let mut config = EngineConfig::default();
        config.export.vcd_timescale_fs = 1_000_000;
        let mut graph = config.build_graph();
        let id = config.add_filter(&mut graph, "VCD Export").unwrap();
        assert_eq!(graph.node(id).unwrap().core().parameters.int("Timescale"), 1_000_000);
        let other = config.add_filter(&mut graph, "FFT").unwrap();
        assert!(graph.node(other).unwrap().core().parameters.get("Timescale").is_none());
    }
}

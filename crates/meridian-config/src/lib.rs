//! Configuration management for the Meridian satellite
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`MERIDIAN_*` prefix, highest precedence)
//! 2. `meridian.local.toml` (gitignored, local overrides)
//! 3. `meridian.toml` (git-tracked, project config)
//! 4. Built-in defaults (lowest precedence)
//!
//! Every component keeps its own plain config struct with defaults; this
//! crate only aggregates them into one satellite-wide document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use meridian_audit::AuditConfig;
use meridian_exit::ExitConfig;
use meridian_gc::GcConfig;
use meridian_metabase::LoopConfig;
use meridian_orders::OrdersConfig;
use meridian_overlay::OverlayConfig;
use meridian_repair::RepairConfig;
use meridian_reputation::ReputationConfig;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Full satellite configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    pub overlay: OverlayConfig,
    pub reputation: ReputationConfig,
    pub segment_loop: LoopConfig,
    pub orders: OrdersConfig,
    pub audit: AuditConfig,
    pub repair: RepairConfig,
    pub gc: GcConfig,
    pub exit: ExitConfig,
}

/// Configuration loader with multi-source merging.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "MERIDIAN".to_string(),
        }
    }

    /// Sets the directory holding `meridian.toml`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: `MERIDIAN`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> Result<SatelliteConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults.
        let defaults = SatelliteConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Project config (meridian.toml).
        let project_file = self.project_dir.join("meridian.toml");
        if project_file.exists() {
            builder = builder.add_source(
                config::File::from(project_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Local overrides (meridian.local.toml).
        let local_file = self.project_dir.join("meridian.local.toml");
        if local_file.exists() {
            builder = builder.add_source(
                config::File::from(local_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Environment (MERIDIAN_AUDIT__RESERVOIR_SLOTS=5).
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_any_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = ConfigLoader::new()
            .with_project_dir(temp.path())
            .load()
            .unwrap();

        assert_eq!(config.audit.reservoir_slots, 3);
        assert!(config.overlay.distinct_subnets);
    }

    #[test]
    fn project_file_overrides_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("meridian.toml"),
            "[audit]\nreservoir_slots = 7\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_project_dir(temp.path())
            .load()
            .unwrap();
        assert_eq!(config.audit.reservoir_slots, 7);
        // Untouched sections keep their defaults.
        assert_eq!(config.exit.max_failures_per_piece, 5);
    }

    #[test]
    fn local_file_wins_over_project_file() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("meridian.toml"),
            "[gc]\nconcurrent_sends = 2\n",
        )
        .unwrap();
        std::fs::write(
            temp.path().join("meridian.local.toml"),
            "[gc]\nconcurrent_sends = 9\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_project_dir(temp.path())
            .load()
            .unwrap();
        assert_eq!(config.gc.concurrent_sends, 9);
    }
}

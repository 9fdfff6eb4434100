use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::orchestration::balancer::BalancerConfig;
use crate::orchestration::decomposer::DecomposeOptions;
use crate::orchestration::engine::ExecutionOptions;
use crate::orchestration::selector::{ScoreWeights, SelectionCriteria, SelectionStrategy};
use crate::{Error, Result};

/// Defaults for direct selector calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: SelectionStrategy,
    pub weights: ScoreWeights,
}

/// Engine-wide settings, read from `~/.federation/federation.toml`.
///
/// Every field has a default, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FederationConfig {
    pub selection: SelectionConfig,
    pub balancer: BalancerConfig,
    pub execution: ExecutionOptions,
    pub decomposition: DecomposeOptions,
}

impl FederationConfig {
    pub fn federation_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".federation"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::federation_dir()?.join("federation.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            strategy = %config.selection.strategy,
            routing = %config.balancer.routing,
            retry_attempts = config.execution.retry_attempts,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.selection.weights.validate()?;
        self.balancer.validate()?;
        self.execution.validate()?;
        if self.decomposition.max_subtasks == 0 {
            return Err(Error::Validation(
                "decomposition.max_subtasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Empty criteria carrying the configured strategy and weights.
    pub fn selection_criteria(&self) -> SelectionCriteria {
        SelectionCriteria::new(self.selection.strategy).with_weights(self.selection.weights)
    }
}

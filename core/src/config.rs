//! Coordinator configuration.
//!
//! ```toml
//! hold_allreduce = true
//! training_precision = "f16"
//! master_precision = "f32"
//! collector_rank = 0
//! max_grad_norm = 1.0
//! ```

use crate::error::{Result, ShardError};
use crate::tensor::Precision;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for a [`ShardedModule`](crate::distributed::sharded::ShardedModule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Defer the gradient all-reduce until an explicit flush.
    pub hold_allreduce: bool,
    pub training_precision: Precision,
    pub master_precision: Precision,
    /// Rank that assembles global state and writes checkpoint files.
    pub collector_rank: usize,
    /// Clip the global gradient norm to this value in `step`, if set.
    pub max_grad_norm: Option<f32>,
    /// Broadcast every owner's initial weights to its replicas at construction.
    pub sync_params_on_init: bool,
    /// Tolerance for comparing optimizer-state tensors in
    /// [`ShardedModule::state_matches`](crate::distributed::ShardedModule::state_matches).
    pub state_tolerance: f32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            hold_allreduce: false,
            training_precision: Precision::F32,
            master_precision: Precision::F32,
            collector_rank: 0,
            max_grad_norm: None,
            sync_params_on_init: true,
            state_tolerance: 1e-3,
        }
    }
}

impl ShardConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading shard configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_hold_allreduce(mut self, hold: bool) -> Self {
        self.hold_allreduce = hold;
        self
    }

    pub fn with_training_precision(mut self, precision: Precision) -> Self {
        self.training_precision = precision;
        self
    }

    pub fn with_master_precision(mut self, precision: Precision) -> Self {
        self.master_precision = precision;
        self
    }

    pub fn with_collector_rank(mut self, rank: usize) -> Self {
        self.collector_rank = rank;
        self
    }

    pub fn with_max_grad_norm(mut self, max_norm: f32) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    pub fn with_sync_params_on_init(mut self, sync: bool) -> Self {
        self.sync_params_on_init = sync;
        self
    }

    /// Validates the configuration for a world of `world_size` ranks.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if world_size == 0 {
            return Err(ShardError::Config("world size must be at least 1".into()));
        }
        if self.collector_rank >= world_size {
            return Err(ShardError::InvalidRank {
                rank: self.collector_rank,
                world_size,
            });
        }
        if !self.master_precision.can_hold(self.training_precision) {
            return Err(ShardError::PrecisionDowngrade {
                master: self.master_precision.to_string(),
                training: self.training_precision.to_string(),
            });
        }
        if let Some(max) = self.max_grad_norm {
            if !(max.is_finite() && max > 0.0) {
                return Err(ShardError::Config(format!(
                    "max_grad_norm must be positive and finite, got {}",
                    max
                )));
            }
        }
        if self.state_tolerance.is_nan() || self.state_tolerance < 0.0 {
            return Err(ShardError::Config("state_tolerance must be non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        let config = ShardConfig::default();
        assert!(config.validate(1).is_ok());
        assert_eq!(config.state_tolerance, 1e-3);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ShardConfig::from_toml_str(
            r#"
            hold_allreduce = true
            training_precision = "f16"
            max_grad_norm = 1.0
            "#,
        )
        .unwrap();
        assert!(config.hold_allreduce);
        assert_eq!(config.training_precision, Precision::F16);
        assert_eq!(config.master_precision, Precision::F32);
        assert_eq!(config.max_grad_norm, Some(1.0));
        assert!(config.validate(2).is_ok());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        assert!(matches!(
            ShardConfig::from_toml_str("collector_rank = \"zero\""),
            Err(ShardError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_collector_outside_world() {
        let config = ShardConfig::default().with_collector_rank(2);
        assert!(matches!(
            config.validate(2),
            Err(ShardError::InvalidRank { rank: 2, world_size: 2 })
        ));
    }

    #[test]
    fn test_validate_rejects_narrow_master() {
        let config = ShardConfig::default()
            .with_training_precision(Precision::F16)
            .with_master_precision(Precision::Bf16);
        assert!(matches!(
            config.validate(1),
            Err(ShardError::PrecisionDowngrade { .. })
        ));
    }
}

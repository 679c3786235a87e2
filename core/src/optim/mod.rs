//! Optimizers and parameter groups.
//!
//! Optimizers here are stateless functions of `(hyperparameters, param, grad,
//! previous record)`: the state itself lives in a
//! [`LocalOptimizerStateStore`], so it can be gathered into a checkpoint and
//! scattered back without the optimizer's involvement.

pub mod adamw;
pub mod sgd;
pub mod state;

pub use adamw::AdamW;
pub use sgd::Sgd;
pub use state::{LocalOptimizerStateStore, OptimizerRecord, ScalarValue, StateValue};

use crate::distributed::registry::ParameterId;
use crate::error::{Result, ShardError};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Named hyperparameters of a group (`lr`, `beta1`, ...).
pub type Hyperparameters = BTreeMap<String, ScalarValue>;

/// A trait for optimizers (e.g., SGD, AdamW).
///
/// Optimizers update master weights in place based on the reduced gradient.
pub trait Optimizer {
    /// Hyperparameters used for keys a group does not set.
    fn default_hyperparameters(&self) -> Hyperparameters;

    /// Applies one update to `param` and returns the new record.
    ///
    /// `record` is the previous state for this parameter, or `None` on the
    /// first step.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `param` and `grad` disagree, and
    /// `MissingHyperparameter` if neither the group nor the defaults carry a
    /// required key.
    fn update(
        &self,
        hyper: &Hyperparameters,
        param: &mut Tensor,
        grad: &Tensor,
        record: Option<&OptimizerRecord>,
    ) -> Result<OptimizerRecord>;
}

/// Reads a hyperparameter as `f32`.
pub fn hyper_f32(hyper: &Hyperparameters, key: &str) -> Result<f32> {
    hyper
        .get(key)
        .map(|v| v.as_f64() as f32)
        .ok_or_else(|| ShardError::MissingHyperparameter(key.to_string()))
}

/// Fetches a state tensor from the previous record, or zeros on the first step.
pub(crate) fn state_or_zeros(record: Option<&OptimizerRecord>, key: &str, shape: &[usize]) -> Result<Tensor> {
    match record.and_then(|r| r.tensor(key)) {
        Some(t) if t.shape() == shape => Ok(t.clone()),
        Some(t) => Err(ShardError::ShapeMismatch {
            context: format!("optimizer state {}", key),
            expected: shape.to_vec(),
            got: t.shape().to_vec(),
        }),
        None => Ok(Tensor::zeros(shape)),
    }
}

pub(crate) fn check_shapes(param: &Tensor, grad: &Tensor) -> Result<()> {
    if param.shape() != grad.shape() {
        return Err(ShardError::ShapeMismatch {
            context: "optimizer update".to_string(),
            expected: param.shape().to_vec(),
            got: grad.shape().to_vec(),
        });
    }
    Ok(())
}

/// A set of parameters sharing hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub hyperparameters: Hyperparameters,
    pub params: Vec<ParameterId>,
}

impl ParamGroup {
    pub fn new(params: Vec<ParameterId>) -> Self {
        Self {
            hyperparameters: Hyperparameters::new(),
            params,
        }
    }

    pub fn with_hyperparameter(mut self, key: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.hyperparameters.insert(key.into(), value.into());
        self
    }

    /// `lr`, if set.
    pub fn learning_rate(&self) -> Option<f64> {
        self.hyperparameters.get("lr").map(ScalarValue::as_f64)
    }
}

/// Ordered parameter groups; every parameter belongs to at most one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGroups {
    groups: Vec<ParamGroup>,
    index: HashMap<ParameterId, usize>,
}

impl ParamGroups {
    /// # Errors
    ///
    /// Returns `GroupStructureMismatch` if a parameter appears in two groups
    /// (or twice in one).
    pub fn new(groups: Vec<ParamGroup>) -> Result<Self> {
        let mut index = HashMap::new();
        for (g, group) in groups.iter().enumerate() {
            for id in &group.params {
                if let Some(prev) = index.insert(id.clone(), g) {
                    return Err(ShardError::GroupStructureMismatch(format!(
                        "parameter {} appears in group {} and group {}",
                        id, prev, g
                    )));
                }
            }
        }
        Ok(Self { groups, index })
    }

    /// The group index and group holding `id`.
    pub fn group_of(&self, id: &ParameterId) -> Option<(usize, &ParamGroup)> {
        self.index.get(id).map(|&g| (g, &self.groups[g]))
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group hyperparameters over `defaults`.
    pub fn effective_hyperparameters(&self, group: usize, defaults: &Hyperparameters) -> Hyperparameters {
        let mut merged = defaults.clone();
        if let Some(g) = self.groups.get(group) {
            merged.extend(g.hyperparameters.iter().map(|(k, v)| (k.clone(), *v)));
        }
        merged
    }
}

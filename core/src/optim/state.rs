//! Per-rank optimizer state.
//!
//! Each rank keeps one [`OptimizerRecord`] per parameter it owns. Nothing here
//! communicates; [`GlobalStateAssembler`](crate::checkpoint::assembler::GlobalStateAssembler)
//! turns the per-rank stores into a single checkpointable view and back.

use crate::distributed::registry::{ParamShardRegistry, ParameterId};
use crate::error::{Result, ShardError};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// A scalar optimizer or hyperparameter value.
///
/// Scalars compare exactly, including `Float`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarValue {
    /// Numeric view; `Bool` maps to 0 or 1.
    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::Int(v) => v as f64,
            ScalarValue::Float(v) => v,
            ScalarValue::Bool(v) => f64::from(u8::from(v)),
        }
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

/// One named entry of an optimizer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Tensor(Tensor),
    Scalar(ScalarValue),
}

impl StateValue {
    /// Tensors compare within `tolerance`; scalars compare exactly; mixed
    /// variants never match.
    pub fn approx_eq(&self, other: &StateValue, tolerance: f32) -> bool {
        match (self, other) {
            (StateValue::Tensor(a), StateValue::Tensor(b)) => a.approx_eq(b, tolerance),
            (StateValue::Scalar(a), StateValue::Scalar(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StateValue::Tensor(t) => Some(t),
            StateValue::Scalar(_) => None,
        }
    }
}

/// Optimizer state for one parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRecord {
    /// Number of updates applied so far.
    pub step: u64,
    pub values: BTreeMap<String, StateValue>,
}

impl OptimizerRecord {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            values: BTreeMap::new(),
        }
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.values.insert(name.into(), StateValue::Tensor(tensor));
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: ScalarValue) -> Self {
        self.values.insert(name.into(), StateValue::Scalar(value));
        self
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name).and_then(StateValue::as_tensor)
    }

    /// Same step, same keys, and every value equal under [`StateValue::approx_eq`].
    pub fn approx_eq(&self, other: &OptimizerRecord, tolerance: f32) -> bool {
        self.step == other.step
            && self.values.len() == other.values.len()
            && self.values.iter().all(|(k, v)| {
                other
                    .values
                    .get(k)
                    .is_some_and(|o| v.approx_eq(o, tolerance))
            })
    }
}

/// Optimizer records for the parameters this rank owns.
#[derive(Debug, Default)]
pub struct LocalOptimizerStateStore {
    rank: usize,
    records: HashMap<ParameterId, OptimizerRecord>,
    anomalies: u64,
}

impl LocalOptimizerStateStore {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            records: HashMap::new(),
            anomalies: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// # Errors
    ///
    /// Returns `Uninitialized` if the optimizer has not stepped for `id` yet.
    /// Callers usually treat this as "no state", not as a failure.
    pub fn get(&self, id: &ParameterId) -> Result<&OptimizerRecord> {
        self.records
            .get(id)
            .ok_or_else(|| ShardError::Uninitialized(id.clone()))
    }

    /// Stores `record` for `id`, overwriting any previous one.
    ///
    /// A step counter that does not advance is logged and counted but accepted.
    pub fn put(&mut self, id: ParameterId, record: OptimizerRecord) {
        if let Some(previous) = self.records.get(&id) {
            if record.step <= previous.step {
                warn!(
                    param = %id,
                    rank = self.rank,
                    previous = previous.step,
                    new = record.step,
                    "optimizer step counter did not advance"
                );
                self.anomalies += 1;
            }
        }
        self.records.insert(id, record);
    }

    /// Locally owned records in registry order. Parameters without a record
    /// yet are skipped.
    pub fn all_local_records<'a>(
        &'a self,
        registry: &'a ParamShardRegistry,
    ) -> impl Iterator<Item = (&'a ParameterId, &'a OptimizerRecord)> + 'a {
        registry
            .local_ids(self.rank)
            .filter_map(move |id| self.records.get(id).map(|r| (id, r)))
    }

    pub fn contains(&self, id: &ParameterId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of soft anomalies observed by [`put`](Self::put).
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

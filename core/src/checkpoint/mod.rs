//! Checkpointing and Serialization.
//!
//! A checkpoint is two independent `safetensors` files:
//!
//! - the **parameter blob**: one `F32` tensor per [`ParameterId`], plus an
//!   `__order__` metadata entry restoring registry order;
//! - the **optimizer-state blob**: every state tensor stored as
//!   `state.{index}.{key}`, with steps, scalars and parameter groups in a JSON
//!   `__layout__` metadata entry.
//!
//! Assembly across ranks lives in [`assembler`].

pub mod assembler;

pub use assembler::{GlobalCheckpointState, GlobalStateAssembler, ParameterEntry};

use crate::distributed::registry::ParameterId;
use crate::error::{Result, ShardError};
use crate::optim::{OptimizerRecord, ParamGroup, ScalarValue, StateValue};
use crate::tensor::Tensor;
use indexmap::IndexMap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// File name of the parameter blob inside a checkpoint directory.
pub const PARAMETERS_FILE: &str = "model.safetensors";
/// File name of the optimizer-state blob inside a checkpoint directory.
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";

const ORDER_KEY: &str = "__order__";
const LAYOUT_KEY: &str = "__layout__";

#[derive(Debug, Serialize, Deserialize)]
struct ParamLayout {
    id: ParameterId,
    shape: Vec<usize>,
    step: Option<u64>,
    scalars: BTreeMap<String, ScalarValue>,
    tensor_keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateLayout {
    params: Vec<ParamLayout>,
    groups: Vec<ParamGroup>,
}

fn to_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn tensor_from_view(name: &str, view: &TensorView<'_>) -> Result<Tensor> {
    if view.dtype() != Dtype::F32 {
        return Err(ShardError::Serialization(format!(
            "tensor {} has dtype {:?}, expected F32",
            name,
            view.dtype()
        )));
    }
    let data = view
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Tensor::new(data, view.shape().to_vec())
}

/// Writes `tensors` with `metadata`. Byte buffers are owned here so the views
/// can borrow them.
fn write_blob(path: &Path, tensors: Vec<(String, &Tensor)>, metadata: HashMap<String, String>) -> Result<()> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .into_iter()
        .map(|(name, t)| (name, t.shape().to_vec(), to_bytes(t.data())))
        .collect();

    let mut views = HashMap::new();
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
        views.insert(name.clone(), view);
    }

    safetensors::serialize_to_file(&views, Some(metadata), path)?;
    Ok(())
}

fn read_metadata_entry(bytes: &[u8], key: &str) -> Result<Option<String>> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    Ok(metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(key).cloned()))
}

/// Saves parameter values, preserving their order.
pub fn save_parameters<P: AsRef<Path>>(path: P, params: &IndexMap<ParameterId, Tensor>) -> Result<()> {
    let order: Vec<&str> = params.keys().map(ParameterId::as_str).collect();
    let mut metadata = HashMap::new();
    metadata.insert(ORDER_KEY.to_string(), serde_json::to_string(&order)?);

    let tensors = params.iter().map(|(id, t)| (id.to_string(), t)).collect();
    write_blob(path.as_ref(), tensors, metadata)?;
    info!(path = %path.as_ref().display(), params = params.len(), "saved parameter blob");
    Ok(())
}

/// Loads a parameter blob written by [`save_parameters`].
///
/// Files without an `__order__` entry load in name order.
pub fn load_parameters<P: AsRef<Path>>(path: P) -> Result<IndexMap<ParameterId, Tensor>> {
    let bytes = std::fs::read(path.as_ref())?;
    parameters_from_bytes(&bytes)
}

/// Decodes a parameter blob already read into memory.
pub fn parameters_from_bytes(bytes: &[u8]) -> Result<IndexMap<ParameterId, Tensor>> {
    let safetensors = SafeTensors::deserialize(bytes)?;
    let order: Vec<String> = match read_metadata_entry(bytes, ORDER_KEY)? {
        Some(json) => serde_json::from_str(&json)?,
        None => {
            let mut names: Vec<String> = safetensors.names().into_iter().map(str::to_string).collect();
            names.sort();
            names
        }
    };

    let mut params = IndexMap::with_capacity(order.len());
    for name in order {
        let view = safetensors.tensor(&name)?;
        let tensor = tensor_from_view(&name, &view)?;
        params.insert(ParameterId::new(name), tensor);
    }
    Ok(params)
}

/// Saves an assembled optimizer state.
pub fn save_optimizer_state<P: AsRef<Path>>(path: P, state: &GlobalCheckpointState) -> Result<()> {
    let mut layout = StateLayout {
        params: Vec::with_capacity(state.len()),
        groups: state.groups.clone(),
    };
    let mut tensors = Vec::new();

    for (index, (id, entry)) in state.params.iter().enumerate() {
        let mut param = ParamLayout {
            id: id.clone(),
            shape: entry.shape.clone(),
            step: entry.record.as_ref().map(|r| r.step),
            scalars: BTreeMap::new(),
            tensor_keys: Vec::new(),
        };
        if let Some(record) = &entry.record {
            for (key, value) in &record.values {
                match value {
                    StateValue::Tensor(t) => {
                        tensors.push((format!("state.{}.{}", index, key), t));
                        param.tensor_keys.push(key.clone());
                    }
                    StateValue::Scalar(s) => {
                        param.scalars.insert(key.clone(), *s);
                    }
                }
            }
        }
        layout.params.push(param);
    }

    let mut metadata = HashMap::new();
    metadata.insert(LAYOUT_KEY.to_string(), serde_json::to_string(&layout)?);
    let count = tensors.len();
    write_blob(path.as_ref(), tensors, metadata)?;
    info!(
        path = %path.as_ref().display(),
        params = state.len(),
        tensors = count,
        "saved optimizer-state blob"
    );
    Ok(())
}

/// Loads an optimizer-state blob written by [`save_optimizer_state`].
pub fn load_optimizer_state<P: AsRef<Path>>(path: P) -> Result<GlobalCheckpointState> {
    let bytes = std::fs::read(path.as_ref())?;
    optimizer_state_from_bytes(&bytes)
}

/// Decodes an optimizer-state blob already read into memory.
pub fn optimizer_state_from_bytes(bytes: &[u8]) -> Result<GlobalCheckpointState> {
    let safetensors = SafeTensors::deserialize(bytes)?;
    let json = read_metadata_entry(bytes, LAYOUT_KEY)?
        .ok_or_else(|| ShardError::Serialization(format!("optimizer-state blob has no {} entry", LAYOUT_KEY)))?;
    let layout: StateLayout = serde_json::from_str(&json)?;

    let mut params = IndexMap::with_capacity(layout.params.len());
    for (index, param) in layout.params.into_iter().enumerate() {
        let record = match param.step {
            None => None,
            Some(step) => {
                let mut record = OptimizerRecord::new(step);
                for (key, value) in param.scalars {
                    record.values.insert(key, StateValue::Scalar(value));
                }
                for key in param.tensor_keys {
                    let name = format!("state.{}.{}", index, key);
                    let view = safetensors.tensor(&name)?;
                    record
                        .values
                        .insert(key, StateValue::Tensor(tensor_from_view(&name, &view)?));
                }
                Some(record)
            }
        };
        params.insert(
            param.id,
            ParameterEntry {
                shape: param.shape,
                record,
            },
        );
    }

    Ok(GlobalCheckpointState {
        params,
        groups: layout.groups,
    })
}

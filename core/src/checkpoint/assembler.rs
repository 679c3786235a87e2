//! Local ⇄ global optimizer-state assembly.
//!
//! `gather` turns the per-rank [`LocalOptimizerStateStore`]s into one
//! rank-independent [`GlobalCheckpointState`]; `scatter` turns it back into the
//! local store of any rank under any registry with the same parameter ids and
//! group structure.
//!
//! Gathering is collective. Every rank sends its owned entries to the
//! collector, the collector merges and validates, then broadcasts the outcome.
//! Every rank therefore returns the same state or the same error; a rank never
//! waits on a collector that already gave up.

use crate::amp::MasterWeightBridge;
use crate::distributed::backend::{decode, encode, CollectiveBackend};
use crate::distributed::registry::{ParamShardRegistry, ParameterId};
use crate::error::{Result, ShardError};
use crate::optim::{LocalOptimizerStateStore, OptimizerRecord, ParamGroup, ParamGroups, StateValue};
use crate::tensor::Tensor;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// One parameter in the global view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub shape: Vec<usize>,
    /// `None` until the optimizer has stepped for this parameter.
    pub record: Option<OptimizerRecord>,
}

/// Rank-independent optimizer state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalCheckpointState {
    /// Every parameter, in registry order.
    pub params: IndexMap<ParameterId, ParameterEntry>,
    pub groups: Vec<ParamGroup>,
}

impl GlobalCheckpointState {
    pub fn record(&self, id: &ParameterId) -> Option<&OptimizerRecord> {
        self.params.get(id).and_then(|e| e.record.as_ref())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Same ids in the same order, same shapes, records equal within
    /// `tolerance`, and identical groups.
    pub fn approx_eq(&self, other: &GlobalCheckpointState, tolerance: f32) -> bool {
        self.groups == other.groups
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|((ia, a), (ib, b))| {
                    ia == ib
                        && a.shape == b.shape
                        && match (&a.record, &b.record) {
                            (Some(ra), Some(rb)) => ra.approx_eq(rb, tolerance),
                            (None, None) => true,
                            _ => false,
                        }
                })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Contribution {
    rank: usize,
    entries: Vec<(ParameterId, ParameterEntry)>,
    groups: Vec<ParamGroup>,
}

/// A collector-side failure in a form every rank can decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum AssemblyFailure {
    OwnershipConflict {
        id: ParameterId,
        first: usize,
        second: usize,
    },
    GroupHyperparameterMismatch {
        group: usize,
        rank: usize,
    },
    GroupStructureMismatch(String),
    MissingParameter(ParameterId),
    UnexpectedParameter(ParameterId),
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    Other(String),
}

impl From<&ShardError> for AssemblyFailure {
    fn from(err: &ShardError) -> Self {
        match err {
            ShardError::OwnershipConflict { id, first, second } => AssemblyFailure::OwnershipConflict {
                id: id.clone(),
                first: *first,
                second: *second,
            },
            ShardError::GroupHyperparameterMismatch { group, rank } => {
                AssemblyFailure::GroupHyperparameterMismatch {
                    group: *group,
                    rank: *rank,
                }
            }
            ShardError::GroupStructureMismatch(msg) => AssemblyFailure::GroupStructureMismatch(msg.clone()),
            ShardError::MissingParameter(id) => AssemblyFailure::MissingParameter(id.clone()),
            ShardError::UnexpectedParameter(id) => AssemblyFailure::UnexpectedParameter(id.clone()),
            ShardError::ShapeMismatch { context, expected, got } => AssemblyFailure::ShapeMismatch {
                context: context.clone(),
                expected: expected.clone(),
                got: got.clone(),
            },
            other => AssemblyFailure::Other(other.to_string()),
        }
    }
}

impl From<AssemblyFailure> for ShardError {
    fn from(failure: AssemblyFailure) -> Self {
        match failure {
            AssemblyFailure::OwnershipConflict { id, first, second } => {
                ShardError::OwnershipConflict { id, first, second }
            }
            AssemblyFailure::GroupHyperparameterMismatch { group, rank } => {
                ShardError::GroupHyperparameterMismatch { group, rank }
            }
            AssemblyFailure::GroupStructureMismatch(msg) => ShardError::GroupStructureMismatch(msg),
            AssemblyFailure::MissingParameter(id) => ShardError::MissingParameter(id),
            AssemblyFailure::UnexpectedParameter(id) => ShardError::UnexpectedParameter(id),
            AssemblyFailure::ShapeMismatch { context, expected, got } => {
                ShardError::ShapeMismatch { context, expected, got }
            }
            AssemblyFailure::Other(msg) => ShardError::Communication(format!("collector failed: {}", msg)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Outcome<T> {
    Done(T),
    Failed(AssemblyFailure),
}

/// Broadcasts the collector's result so every rank returns the same thing.
///
/// The collector passes `Some(result)`, every other rank `None`.
fn settle<B, T>(backend: &B, collector: usize, result: Option<Result<T>>) -> Result<T>
where
    B: CollectiveBackend + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let payload = match result {
        Some(result) => {
            let outcome = match result {
                Ok(value) => Outcome::Done(value),
                Err(err) => Outcome::Failed(AssemblyFailure::from(&err)),
            };
            Some(encode(&outcome)?)
        }
        None => None,
    };
    let bytes = backend.broadcast(payload, collector)?;
    match decode::<Outcome<T>>(&bytes)? {
        Outcome::Done(value) => Ok(value),
        Outcome::Failed(failure) => Err(failure.into()),
    }
}

/// Gathers and scatters optimizer state and parameter values.
#[derive(Debug, Clone, Copy)]
pub struct GlobalStateAssembler {
    collector: usize,
}

impl Default for GlobalStateAssembler {
    fn default() -> Self {
        Self { collector: 0 }
    }
}

impl GlobalStateAssembler {
    pub fn new(collector: usize) -> Self {
        Self { collector }
    }

    pub fn collector(&self) -> usize {
        self.collector
    }

    /// Assembles the global optimizer state. Collective over all ranks.
    ///
    /// # Errors
    ///
    /// - `OwnershipConflict` if two ranks contribute the same id, or a rank
    ///   contributes an id it does not own.
    /// - `GroupHyperparameterMismatch` / `GroupStructureMismatch` if ranks
    ///   disagree on group metadata.
    /// - `Communication` / `Serialization` from the transport.
    pub fn gather<B: CollectiveBackend + ?Sized>(
        &self,
        store: &LocalOptimizerStateStore,
        registry: &ParamShardRegistry,
        groups: &ParamGroups,
        backend: &B,
    ) -> Result<GlobalCheckpointState> {
        let rank = backend.rank();
        let entries = registry
            .local_ids(rank)
            .map(|id| {
                Ok((
                    id.clone(),
                    ParameterEntry {
                        shape: registry.shape_of(id)?.to_vec(),
                        record: store.get(id).ok().cloned(),
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let contribution = Contribution {
            rank,
            entries,
            groups: groups.groups().to_vec(),
        };
        debug!(rank, entries = contribution.entries.len(), "contributing optimizer state");

        let gathered = backend.gather_to_root(encode(&contribution)?, self.collector)?;
        let result = gathered.map(|payloads| merge(payloads, registry));
        let state = settle(backend, self.collector, result)?;
        if rank == self.collector {
            info!(params = state.len(), groups = state.groups.len(), "optimizer state assembled");
        }
        Ok(state)
    }

    /// Rebuilds this rank's local store and groups from a global state.
    ///
    /// `groups` is the layout of the optimizer being restored; it must match
    /// the checkpoint's group count and member order. Hyperparameters come from
    /// the checkpoint.
    ///
    /// # Errors
    ///
    /// - `MissingParameter` for a registry id absent from `state`.
    /// - `UnexpectedParameter` for a `state` id unknown to the registry.
    /// - `ShapeMismatch` if a stored shape or state tensor disagrees.
    /// - `GroupStructureMismatch` if the group layout differs.
    pub fn scatter(
        &self,
        state: &GlobalCheckpointState,
        registry: &ParamShardRegistry,
        groups: &ParamGroups,
        rank: usize,
    ) -> Result<(LocalOptimizerStateStore, ParamGroups)> {
        check_ids(state.params.keys(), registry)?;

        let mut store = LocalOptimizerStateStore::new(rank);
        for id in registry.all_ids() {
            let entry = &state.params[id];
            let shape = registry.shape_of(id)?;
            if entry.shape.as_slice() != shape {
                return Err(ShardError::ShapeMismatch {
                    context: id.to_string(),
                    expected: shape.to_vec(),
                    got: entry.shape.clone(),
                });
            }
            let Some(record) = &entry.record else {
                continue;
            };
            for (key, value) in &record.values {
                if let StateValue::Tensor(t) = value {
                    if t.shape() != shape {
                        return Err(ShardError::ShapeMismatch {
                            context: format!("{}.{}", id, key),
                            expected: shape.to_vec(),
                            got: t.shape().to_vec(),
                        });
                    }
                }
            }
            if registry.is_owned_by(id, rank) {
                store.put(id.clone(), record.clone());
            }
        }

        check_group_structure(&state.groups, groups.groups())?;
        let restored = ParamGroups::new(state.groups.clone())?;
        debug!(rank, records = store.len(), "optimizer state scattered");
        Ok((store, restored))
    }

    /// Collects every parameter's master value, in registry order. Collective.
    pub fn gather_parameters<B: CollectiveBackend + ?Sized>(
        &self,
        bridge: &MasterWeightBridge,
        registry: &ParamShardRegistry,
        backend: &B,
    ) -> Result<IndexMap<ParameterId, Tensor>> {
        let rank = backend.rank();
        let owned = registry
            .local_ids(rank)
            .map(|id| Ok((id.clone(), bridge.master_of(id)?.clone())))
            .collect::<Result<Vec<(ParameterId, Tensor)>>>()?;

        let gathered = backend.gather_to_root(encode(&(rank, owned))?, self.collector)?;
        let result = gathered.map(|payloads| merge_parameters(payloads, registry));
        settle(backend, self.collector, result)
    }

    /// Restores masters of owned parameters and training weights of replicas.
    ///
    /// Purely local; every rank is expected to receive the same `params`.
    pub fn scatter_parameters(
        &self,
        params: &IndexMap<ParameterId, Tensor>,
        bridge: &mut MasterWeightBridge,
        registry: &ParamShardRegistry,
    ) -> Result<()> {
        check_ids(params.keys(), registry)?;
        for id in registry.all_ids() {
            let value = &params[id];
            let shape = registry.shape_of(id)?;
            if value.shape() != shape {
                return Err(ShardError::ShapeMismatch {
                    context: id.to_string(),
                    expected: shape.to_vec(),
                    got: value.shape().to_vec(),
                });
            }
        }

        let rank = bridge.rank();
        for id in registry.replicated_ids(rank) {
            if bridge.has_master(id) {
                bridge.load_master(id, &params[id])?;
            } else {
                bridge.set_training(id, &params[id])?;
            }
        }
        Ok(())
    }
}

/// Missing ids are reported before unexpected ones.
fn check_ids<'a>(ids: impl Iterator<Item = &'a ParameterId>, registry: &ParamShardRegistry) -> Result<()> {
    let ids: HashSet<&ParameterId> = ids.collect();
    if let Some(missing) = registry.all_ids().find(|id| !ids.contains(id)) {
        return Err(ShardError::MissingParameter(missing.clone()));
    }
    if let Some(extra) = ids.into_iter().find(|id| !registry.contains(id)) {
        return Err(ShardError::UnexpectedParameter(extra.clone()));
    }
    Ok(())
}

fn check_group_structure(stored: &[ParamGroup], local: &[ParamGroup]) -> Result<()> {
    if stored.len() != local.len() {
        return Err(ShardError::GroupStructureMismatch(format!(
            "checkpoint has {} groups, optimizer has {}",
            stored.len(),
            local.len()
        )));
    }
    for (g, (a, b)) in stored.iter().zip(local).enumerate() {
        if a.params != b.params {
            return Err(ShardError::GroupStructureMismatch(format!(
                "group {} members differ: checkpoint {:?}, optimizer {:?}",
                g,
                a.params.iter().map(ParameterId::as_str).collect::<Vec<_>>(),
                b.params.iter().map(ParameterId::as_str).collect::<Vec<_>>()
            )));
        }
    }
    Ok(())
}

/// A rank may only contribute registered ids it owns, at the registered shape.
fn check_contribution(id: &ParameterId, shape: &[usize], rank: usize, registry: &ParamShardRegistry) -> Result<()> {
    let owner = registry
        .owner_of(id)
        .map_err(|_| ShardError::UnexpectedParameter(id.clone()))?;
    if owner.rank != rank {
        return Err(ShardError::OwnershipConflict {
            id: id.clone(),
            first: owner.rank,
            second: rank,
        });
    }
    let expected = registry.shape_of(id)?;
    if shape != expected {
        return Err(ShardError::ShapeMismatch {
            context: format!("{} from rank {}", id, rank),
            expected: expected.to_vec(),
            got: shape.to_vec(),
        });
    }
    Ok(())
}

/// Collector side of `gather`.
fn merge(payloads: Vec<Vec<u8>>, registry: &ParamShardRegistry) -> Result<GlobalCheckpointState> {
    let contributions = payloads
        .iter()
        .map(|p| decode::<Contribution>(p))
        .collect::<Result<Vec<_>>>()?;

    let mut merged: IndexMap<ParameterId, (usize, ParameterEntry)> = IndexMap::new();
    for c in &contributions {
        for (id, entry) in &c.entries {
            check_contribution(id, &entry.shape, c.rank, registry)?;
            if let Some((first, _)) = merged.get(id) {
                return Err(ShardError::OwnershipConflict {
                    id: id.clone(),
                    first: *first,
                    second: c.rank,
                });
            }
            merged.insert(id.clone(), (c.rank, entry.clone()));
        }
    }

    let mut params = IndexMap::with_capacity(merged.len());
    for id in registry.all_ids() {
        let (_, entry) = merged
            .swap_remove(id)
            .ok_or_else(|| ShardError::MissingParameter(id.clone()))?;
        params.insert(id.clone(), entry);
    }

    Ok(GlobalCheckpointState {
        params,
        groups: reconcile_groups(&contributions, registry)?,
    })
}

/// Picks the authoritative group list and checks every rank agrees with it.
///
/// The authority is the rank owning the first parameter of group 0.
fn reconcile_groups(contributions: &[Contribution], registry: &ParamShardRegistry) -> Result<Vec<ParamGroup>> {
    let Some(first) = contributions.first() else {
        return Ok(Vec::new());
    };
    let source_rank = first
        .groups
        .first()
        .and_then(|g| g.params.first())
        .and_then(|id| registry.owner_of(id).ok())
        .map_or(first.rank, |o| o.rank);
    let source = contributions
        .iter()
        .find(|c| c.rank == source_rank)
        .unwrap_or(first);

    for c in contributions {
        if c.groups.len() != source.groups.len() {
            return Err(ShardError::GroupStructureMismatch(format!(
                "rank {} has {} groups, rank {} has {}",
                c.rank,
                c.groups.len(),
                source.rank,
                source.groups.len()
            )));
        }
        for (g, (mine, theirs)) in c.groups.iter().zip(&source.groups).enumerate() {
            if mine.params != theirs.params {
                return Err(ShardError::GroupStructureMismatch(format!(
                    "group {} members differ between rank {} and rank {}",
                    g, c.rank, source.rank
                )));
            }
            if mine.hyperparameters != theirs.hyperparameters {
                return Err(ShardError::GroupHyperparameterMismatch { group: g, rank: c.rank });
            }
        }
    }
    Ok(source.groups.clone())
}

fn merge_parameters(payloads: Vec<Vec<u8>>, registry: &ParamShardRegistry) -> Result<IndexMap<ParameterId, Tensor>> {
    let mut merged: IndexMap<ParameterId, (usize, Tensor)> = IndexMap::new();
    for payload in &payloads {
        let (rank, owned): (usize, Vec<(ParameterId, Tensor)>) = decode(payload)?;
        for (id, value) in owned {
            check_contribution(&id, value.shape(), rank, registry)?;
            if let Some((first, _)) = merged.get(&id) {
                return Err(ShardError::OwnershipConflict {
                    id,
                    first: *first,
                    second: rank,
                });
            }
            merged.insert(id, (rank, value));
        }
    }
    let mut params = IndexMap::with_capacity(merged.len());
    for id in registry.all_ids() {
        let (_, value) = merged
            .swap_remove(id)
            .ok_or_else(|| ShardError::MissingParameter(id.clone()))?;
        params.insert(id.clone(), value);
    }
    Ok(params)
}

//! The sharded module: what a training loop talks to.
//!
//! A `ShardedModule` wires one rank's registry, master-weight bridge, gradient
//! coordinator, optimizer state and assembler together behind the backend. A
//! typical iteration:
//!
//! ```text
//! for micro_batch in batch {
//!     forward / backward           (reads training_weight, produces grads)
//!     accumulate_gradient(id, g)   (per parameter)
//! }
//! finish_backward()                (or flush() when held)
//! step(&mut scaler)                (unscale, agree on overflow, clip, update, sync)
//! ```
//!
//! Every method documented as *collective* must be called by all ranks in the
//! same order.

use super::backend::{all_ranks, decode, encode, CollectiveBackend};
use super::coordinator::{GradientAllreduceCoordinator, Phase};
use super::registry::{ParamShardRegistry, ParameterId};
use crate::amp::{LossScaler, MasterWeightBridge};
use crate::checkpoint::{self, GlobalCheckpointState, GlobalStateAssembler};
use crate::config::ShardConfig;
use crate::error::{Result, ShardError};
use crate::optim::{LocalOptimizerStateStore, Optimizer, OptimizerRecord, ParamGroups};
use crate::tensor::{Tensor, TrainingTensor};
use indexmap::IndexMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// What `step` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Masters were updated and replicas received the new weights.
    Applied,
    /// Some rank saw an overflow; no parameter changed.
    SkippedOverflow,
}

/// One rank's view of a sharded model and its optimizer.
pub struct ShardedModule<B: CollectiveBackend, O: Optimizer> {
    backend: B,
    config: ShardConfig,
    registry: ParamShardRegistry,
    bridge: MasterWeightBridge,
    coordinator: GradientAllreduceCoordinator,
    store: LocalOptimizerStateStore,
    optimizer: O,
    groups: ParamGroups,
    assembler: GlobalStateAssembler,
    owned: Vec<ParameterId>,
    /// Agreed overflow verdict once the current reduced gradients are unscaled.
    overflow: Option<bool>,
    clipped: bool,
    /// Reduced gradients not yet consumed by `step`.
    pending: bool,
}

impl<B: CollectiveBackend, O: Optimizer> ShardedModule<B, O> {
    /// Builds this rank's module. Collective when `sync_params_on_init` is set.
    ///
    /// `initial` must hold a value for every parameter replicated on this rank.
    /// Training weights are stored in `config.training_precision`; owners then
    /// attach `config.master_precision` masters.
    ///
    /// # Errors
    ///
    /// - `Config` / `InvalidRank` / `PrecisionDowngrade` from config validation
    ///   or a registry built for another world size.
    /// - `MissingParameter` / `ShapeMismatch` for bad initial values.
    /// - `UnknownParameter` if a group names an unregistered id.
    pub fn new(
        backend: B,
        registry: ParamShardRegistry,
        initial: &IndexMap<ParameterId, Tensor>,
        optimizer: O,
        groups: ParamGroups,
        config: ShardConfig,
    ) -> Result<Self> {
        let rank = backend.rank();
        let world_size = backend.world_size();
        config.validate(world_size)?;
        if registry.world_size() != world_size {
            return Err(ShardError::Config(format!(
                "registry was built for {} ranks, backend has {}",
                registry.world_size(),
                world_size
            )));
        }
        for group in groups.groups() {
            if let Some(id) = group.params.iter().find(|id| !registry.contains(id)) {
                return Err(ShardError::UnknownParameter(id.clone()));
            }
        }

        let mut bridge = MasterWeightBridge::new(rank);
        for id in registry.replicated_ids(rank) {
            let value = initial
                .get(id)
                .ok_or_else(|| ShardError::MissingParameter(id.clone()))?;
            let shape = registry.shape_of(id)?;
            if value.shape() != shape {
                return Err(ShardError::ShapeMismatch {
                    context: id.to_string(),
                    expected: shape.to_vec(),
                    got: value.shape().to_vec(),
                });
            }
            bridge.insert_training(id.clone(), TrainingTensor::from_tensor(value, config.training_precision))?;
        }

        let mut coordinator = GradientAllreduceCoordinator::new(&registry, rank)?;
        coordinator.set_hold(config.hold_allreduce);

        let owned: Vec<ParameterId> = registry.local_ids(rank).cloned().collect();
        let mut module = Self {
            assembler: GlobalStateAssembler::new(config.collector_rank),
            store: LocalOptimizerStateStore::new(rank),
            backend,
            config,
            registry,
            bridge,
            coordinator,
            optimizer,
            groups,
            owned,
            overflow: None,
            clipped: false,
            pending: false,
        };

        if module.config.sync_params_on_init {
            module.broadcast_owned_weights()?;
        }
        for id in &module.owned {
            module
                .bridge
                .attach_master(id, module.config.master_precision, &module.registry)?;
        }
        info!(
            rank,
            world_size,
            owned = module.owned.len(),
            replicated = module.registry.replicated_ids(rank).count(),
            "sharded module ready"
        );
        Ok(module)
    }

    /// Adds a backward-pass gradient for `id`.
    pub fn accumulate_gradient(&mut self, id: &ParameterId, grad: &Tensor) -> Result<()> {
        self.coordinator.accumulate(id, grad)
    }

    /// Ends a backward pass; reduces unless held. Collective unless held.
    pub fn finish_backward(&mut self) -> Result<bool> {
        let flushed = self.coordinator.finish_backward(&self.backend)?;
        if flushed {
            self.reset_iteration(true);
        }
        Ok(flushed)
    }

    /// Reduces all gradient buffers now. Collective.
    pub fn flush(&mut self) -> Result<()> {
        self.coordinator.flush(&self.backend)?;
        self.reset_iteration(true);
        Ok(())
    }

    pub fn set_hold(&mut self, hold: bool) {
        self.coordinator.set_hold(hold);
    }

    pub fn is_held(&self) -> bool {
        self.coordinator.is_held()
    }

    /// Divides reduced gradients by the loss scale and agrees on overflow
    /// across all ranks. Collective. Idempotent until the next reduction.
    ///
    /// Returns `true` if any rank found an overflow.
    pub fn unscale_gradients(&mut self, scaler: &dyn LossScaler) -> Result<bool> {
        self.require_reduced()?;
        if let Some(overflow) = self.overflow {
            return Ok(overflow);
        }

        let inv = 1.0 / scaler.loss_scale();
        let mut local_overflow = false;
        let ids: Vec<ParameterId> = self.registry.replicated_ids(self.rank()).cloned().collect();
        for id in &ids {
            let grad = self.coordinator.gradient_mut(id)?;
            grad.scale(inv);
            local_overflow |= scaler.found_overflow(grad);
        }

        let mut flag = [if local_overflow { 1.0 } else { 0.0 }];
        self.backend
            .all_reduce_max(&mut flag, &all_ranks(self.world_size()))?;
        let overflow = flag[0] > 0.0;
        if overflow {
            debug!(rank = self.rank(), local_overflow, "gradient overflow detected");
        }
        self.overflow = Some(overflow);
        Ok(overflow)
    }

    /// Scales gradients so their global L2 norm is at most `max_norm`.
    /// Collective.
    ///
    /// Gradients are unscaled first (see
    /// [`unscale_gradients`](Self::unscale_gradients)), so `max_norm` and the
    /// returned norm are in unscaled units. Every parameter is counted once,
    /// by its owner. Returns the norm before clipping. A non-finite norm
    /// leaves the gradients untouched.
    pub fn clip_grad_norm(&mut self, scaler: &dyn LossScaler, max_norm: f32) -> Result<f32> {
        self.unscale_gradients(scaler)?;
        let mut local = 0.0f64;
        for id in &self.owned {
            local += self.coordinator.gradient(id)?.sum_squares();
        }
        let mut total = [local as f32];
        self.backend
            .all_reduce_sum(&mut total, &all_ranks(self.world_size()))?;
        let norm = total[0].sqrt();

        if norm.is_finite() && norm > max_norm {
            let coef = max_norm / (norm + 1e-6);
            let ids: Vec<ParameterId> = self.registry.replicated_ids(self.rank()).cloned().collect();
            for id in &ids {
                self.coordinator.gradient_mut(id)?.scale(coef);
            }
            debug!(rank = self.rank(), norm, coef, "gradients clipped");
        }
        self.clipped = true;
        Ok(norm)
    }

    /// Runs one optimizer step. Collective.
    ///
    /// Unscales (if not done yet) and agrees on overflow. On overflow the
    /// scaler is told and nothing else changes. Otherwise gradients are clipped
    /// when `max_grad_norm` is configured and not already applied, owners
    /// update their masters and records, training weights are synced from the
    /// masters and broadcast to every replica.
    ///
    /// # Errors
    ///
    /// Returns `GradientsNotReduced` if no flush happened since the last
    /// contribution, or the last reduction was already consumed by a step.
    pub fn step(&mut self, scaler: &mut dyn LossScaler) -> Result<StepOutcome> {
        self.require_reduced()?;
        let overflow = self.unscale_gradients(&*scaler)?;
        if overflow {
            scaler.update(true);
            warn!(rank = self.rank(), scale = scaler.loss_scale(), "skipping step after overflow");
            self.reset_iteration(false);
            return Ok(StepOutcome::SkippedOverflow);
        }
        if let Some(max_norm) = self.config.max_grad_norm {
            if !self.clipped {
                self.clip_grad_norm(&*scaler, max_norm)?;
            }
        }

        let defaults = self.optimizer.default_hyperparameters();
        for i in 0..self.owned.len() {
            let id = self.owned[i].clone();
            let hyper = match self.groups.group_of(&id) {
                Some((g, _)) => self.groups.effective_hyperparameters(g, &defaults),
                None => defaults.clone(),
            };
            let grad = self.coordinator.gradient(&id)?;
            let previous = self.store.get(&id).ok();
            let master = self.bridge.master_mut(&id)?;
            let record = self.optimizer.update(&hyper, master, grad, previous)?;
            self.step_hook(&id, record)?;
        }

        let synced = self.bridge.sync_all()?;
        self.broadcast_owned_weights()?;
        scaler.update(false);
        debug!(rank = self.rank(), synced, "optimizer step applied");
        self.reset_iteration(false);
        Ok(StepOutcome::Applied)
    }

    /// Records the optimizer's new state for an owned parameter.
    ///
    /// # Errors
    ///
    /// Returns `NotOwner` for a parameter owned by another rank.
    pub fn step_hook(&mut self, id: &ParameterId, record: OptimizerRecord) -> Result<()> {
        let owner = self.registry.owner_of(id)?.rank;
        if owner != self.rank() {
            return Err(ShardError::NotOwner {
                id: id.clone(),
                owner,
                rank: self.rank(),
            });
        }
        self.store.put(id.clone(), record);
        Ok(())
    }

    /// Clears gradient buffers without reducing.
    pub fn zero_grad(&mut self) {
        self.coordinator.zero_grad();
        self.reset_iteration(false);
    }

    /// This rank's optimizer records.
    pub fn local_state(&self) -> &LocalOptimizerStateStore {
        &self.store
    }

    /// The assembled optimizer state, identical on every rank. Collective.
    pub fn global_state(&self) -> Result<GlobalCheckpointState> {
        self.assembler
            .gather(&self.store, &self.registry, &self.groups, &self.backend)
    }

    /// Gathers the optimizer state for a checkpoint. Collective.
    pub fn checkpoint_save(&self) -> Result<GlobalCheckpointState> {
        let state = self.global_state()?;
        info!(rank = self.rank(), params = state.len(), "optimizer state captured for checkpoint");
        Ok(state)
    }

    /// Replaces this rank's optimizer records and group hyperparameters with
    /// those in `state`. Local; every rank must pass the same state.
    pub fn checkpoint_load(&mut self, state: &GlobalCheckpointState) -> Result<()> {
        let (store, groups) = self
            .assembler
            .scatter(state, &self.registry, &self.groups, self.rank())?;
        info!(rank = self.rank(), records = store.len(), "optimizer state restored");
        self.store = store;
        self.groups = groups;
        Ok(())
    }

    /// Whether the assembled optimizer state matches `state` within
    /// `config.state_tolerance`. Collective.
    pub fn state_matches(&self, state: &GlobalCheckpointState) -> Result<bool> {
        Ok(self.global_state()?.approx_eq(state, self.config.state_tolerance))
    }

    /// Every parameter's master value, in registry order. Collective.
    pub fn parameter_state(&self) -> Result<IndexMap<ParameterId, Tensor>> {
        self.assembler
            .gather_parameters(&self.bridge, &self.registry, &self.backend)
    }

    /// Restores masters and training weights. Local; every rank must pass the
    /// same values.
    pub fn load_parameter_state(&mut self, params: &IndexMap<ParameterId, Tensor>) -> Result<()> {
        self.assembler
            .scatter_parameters(params, &mut self.bridge, &self.registry)
    }

    /// Writes `model.safetensors` and `optimizer.safetensors` into `dir` from
    /// the collector rank. Collective; every rank sees the collector's result.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let params = self.parameter_state()?;
        let state = self.global_state()?;

        let written = if self.is_collector() {
            let dir = dir.as_ref();
            let result = std::fs::create_dir_all(dir)
                .map_err(ShardError::from)
                .and_then(|_| checkpoint::save_parameters(dir.join(checkpoint::PARAMETERS_FILE), &params))
                .and_then(|_| checkpoint::save_optimizer_state(dir.join(checkpoint::OPTIMIZER_FILE), &state));
            Some(result)
        } else {
            None
        };
        self.share_status(written)?;
        Ok(())
    }

    /// Reads a checkpoint written by [`save_checkpoint`](Self::save_checkpoint)
    /// on the collector and restores every rank from it. Collective.
    ///
    /// The registry may describe a different world size than the one that
    /// saved, as long as parameter ids, shapes and group structure match.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let read = if self.is_collector() {
            let dir = dir.as_ref();
            Some(
                std::fs::read(dir.join(checkpoint::PARAMETERS_FILE))
                    .and_then(|p| Ok((p, std::fs::read(dir.join(checkpoint::OPTIMIZER_FILE))?)))
                    .map_err(ShardError::from),
            )
        } else {
            None
        };
        let (params_bytes, state_bytes) = match read {
            Some(Ok((params, state))) => {
                self.share_status(Some(Ok(())))?;
                (Some(params), Some(state))
            }
            Some(Err(e)) => return self.share_status(Some(Err(e))),
            None => {
                self.share_status(None)?;
                (None, None)
            }
        };

        let collector = self.config.collector_rank;
        let params_bytes = self.backend.broadcast(params_bytes, collector)?;
        let state_bytes = self.backend.broadcast(state_bytes, collector)?;

        let params = checkpoint::parameters_from_bytes(&params_bytes)?;
        let state = checkpoint::optimizer_state_from_bytes(&state_bytes)?;
        self.load_parameter_state(&params)?;
        self.checkpoint_load(&state)?;
        info!(rank = self.rank(), path = %dir.as_ref().display(), "checkpoint loaded");
        Ok(())
    }

    /// The weight the next forward pass should read, widened to `f32`.
    pub fn training_weight(&self, id: &ParameterId) -> Result<Tensor> {
        Ok(self.bridge.training_weight(id)?.to_tensor())
    }

    pub fn master_of(&self, id: &ParameterId) -> Result<&Tensor> {
        self.bridge.master_of(id)
    }

    pub fn gradient(&self, id: &ParameterId) -> Result<&Tensor> {
        self.coordinator.gradient(id)
    }

    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    pub fn flush_count(&self) -> u64 {
        self.coordinator.flush_count()
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    pub fn registry(&self) -> &ParamShardRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &ParamGroups {
        &self.groups
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Parameters owned by this rank, in registry order.
    pub fn owned_ids(&self) -> &[ParameterId] {
        &self.owned
    }

    fn is_collector(&self) -> bool {
        self.rank() == self.config.collector_rank
    }

    fn require_reduced(&self) -> Result<()> {
        if !(self.pending && self.coordinator.is_reduced()) {
            return Err(ShardError::GradientsNotReduced);
        }
        Ok(())
    }

    fn reset_iteration(&mut self, pending: bool) {
        self.overflow = None;
        self.clipped = false;
        self.pending = pending;
    }

    /// Sends each owner's current training weights to every other rank; ranks
    /// replicating a parameter overwrite their copy. One broadcast per rank
    /// that owns anything, in rank order.
    fn broadcast_owned_weights(&mut self) -> Result<()> {
        let rank = self.rank();
        for root in 0..self.world_size() {
            if self.registry.local_ids(root).next().is_none() {
                continue;
            }
            let payload = if root == rank {
                let weights = self
                    .owned
                    .iter()
                    .map(|id| Ok((id.clone(), self.bridge.training_weight(id)?.to_tensor())))
                    .collect::<Result<Vec<(ParameterId, Tensor)>>>()?;
                Some(encode(&weights)?)
            } else {
                None
            };
            let bytes = self.backend.broadcast(payload, root)?;
            if root == rank {
                continue;
            }
            let weights: Vec<(ParameterId, Tensor)> = decode(&bytes)?;
            for (id, value) in &weights {
                if self.registry.replicas_of(id)?.contains(&rank) {
                    self.bridge.set_training(id, value)?;
                }
            }
        }
        Ok(())
    }

    /// Shares the collector's status with every rank.
    ///
    /// The collector passes `Some(result)` and gets its own error back; other
    /// ranks pass `None` and get a `Communication` error if the collector failed.
    fn share_status(&self, status: Option<Result<()>>) -> Result<()> {
        let collector = self.config.collector_rank;
        match status {
            Some(result) => {
                let wire: std::result::Result<(), String> = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
                self.backend.broadcast(Some(encode(&wire)?), collector)?;
                result
            }
            None => {
                let bytes = self.backend.broadcast(None, collector)?;
                let wire: std::result::Result<(), String> = decode(&bytes)?;
                wire.map_err(|msg| ShardError::Communication(format!("collector rank {} failed: {}", collector, msg)))
            }
        }
    }
}

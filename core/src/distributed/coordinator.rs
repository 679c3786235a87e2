//! Grouped, deferrable gradient all-reduce.
//!
//! Each parameter replicated on this rank has a [`GradientBuffer`]. Backward
//! passes *add* into it; a flush reduces every buffer exactly once across its
//! replica group and divides by the group size, leaving the replica-mean
//! gradient in place for the optimizer.
//!
//! ```text
//!   Idle ──accumulate──▶ Accumulating ──flush──▶ Reducing ──done──▶ Idle
//!    ▲                                                               │
//!    └────────── next accumulate clears the reduced buffers ◀────────┘
//! ```
//!
//! While the coordinator is *held*, [`finish_backward`](GradientAllreduceCoordinator::finish_backward)
//! does not flush. That leaves room for micro-batch accumulation and for work
//! that has to run between backward and reduction.

use super::backend::CollectiveBackend;
use super::registry::{ParamShardRegistry, ParameterId};
use crate::error::{Result, ShardError};
use crate::tensor::Tensor;
use indexmap::IndexMap;
use tracing::{debug, warn};

/// Where the coordinator is in the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Reducing,
}

/// Locally accumulated gradient for one parameter.
#[derive(Debug, Clone)]
pub struct GradientBuffer {
    grad: Tensor,
    replicas: Vec<usize>,
    contributions: usize,
}

impl GradientBuffer {
    pub fn grad(&self) -> &Tensor {
        &self.grad
    }

    /// Contributions added since the buffer was last cleared.
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn replicas(&self) -> &[usize] {
        &self.replicas
    }
}

/// Batches gradient contributions and reduces them on flush.
#[derive(Debug)]
pub struct GradientAllreduceCoordinator {
    rank: usize,
    phase: Phase,
    hold: bool,
    reduced: bool,
    flushes: u64,
    buffers: IndexMap<ParameterId, GradientBuffer>,
}

impl GradientAllreduceCoordinator {
    /// Creates zeroed buffers for every parameter replicated on `rank`.
    pub fn new(registry: &ParamShardRegistry, rank: usize) -> Result<Self> {
        let mut buffers = IndexMap::new();
        for id in registry.replicated_ids(rank) {
            buffers.insert(
                id.clone(),
                GradientBuffer {
                    grad: Tensor::zeros(registry.shape_of(id)?),
                    replicas: registry.replicas_of(id)?.to_vec(),
                    contributions: 0,
                },
            );
        }
        Ok(Self {
            rank,
            phase: Phase::Idle,
            hold: false,
            reduced: false,
            flushes: 0,
            buffers,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Enables or disables deferred-flush mode.
    pub fn set_hold(&mut self, hold: bool) {
        self.hold = hold;
    }

    pub fn is_held(&self) -> bool {
        self.hold
    }

    /// `true` once a flush completed and no new contribution has arrived since.
    pub fn is_reduced(&self) -> bool {
        self.reduced
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Adds a backward-pass contribution for `id`.
    ///
    /// The first contribution after a completed reduction starts a new
    /// accumulation window and clears every buffer first.
    ///
    /// # Errors
    ///
    /// - `NotReplicated` if this rank holds no replica of `id`.
    /// - `ShapeMismatch` if `grad` does not have the parameter's shape.
    pub fn accumulate(&mut self, id: &ParameterId, grad: &Tensor) -> Result<()> {
        let Some(buffer) = self.buffers.get(id) else {
            return Err(ShardError::NotReplicated {
                id: id.clone(),
                rank: self.rank,
            });
        };
        if buffer.grad.shape() != grad.shape() {
            return Err(ShardError::ShapeMismatch {
                context: id.to_string(),
                expected: buffer.grad.shape().to_vec(),
                got: grad.shape().to_vec(),
            });
        }

        // A rejected contribution leaves the last reduction intact.
        if self.phase == Phase::Idle {
            if self.reduced {
                self.clear();
            }
            self.phase = Phase::Accumulating;
        }

        let buffer = self
            .buffers
            .get_mut(id)
            .ok_or_else(|| ShardError::UnknownParameter(id.clone()))?;
        buffer.grad.add_assign(grad)?;
        buffer.contributions += 1;
        Ok(())
    }

    /// Signals the end of a backward pass. Flushes unless held.
    ///
    /// Returns `true` if a reduction ran.
    pub fn finish_backward<B: CollectiveBackend + ?Sized>(&mut self, backend: &B) -> Result<bool> {
        if self.hold {
            debug!(rank = self.rank, "flush deferred while held");
            return Ok(false);
        }
        self.flush(backend)?;
        Ok(true)
    }

    /// Reduces every buffer across its replica group and averages it.
    ///
    /// Buffers are bucketed by replica group; each bucket is flattened in
    /// registry order and reduced with a single `all_reduce_sum`, so one flush
    /// issues exactly one reduction per distinct group. Buffers with no
    /// contribution take part with their zeros, keeping every rank's sequence of
    /// collectives identical.
    pub fn flush<B: CollectiveBackend + ?Sized>(&mut self, backend: &B) -> Result<()> {
        if self.phase == Phase::Idle && self.reduced {
            warn!(rank = self.rank, "flush without new contributions; re-reducing averaged gradients");
        }
        self.phase = Phase::Reducing;

        let mut buckets: IndexMap<Vec<usize>, Vec<ParameterId>> = IndexMap::new();
        for (id, buffer) in &self.buffers {
            buckets
                .entry(buffer.replicas.clone())
                .or_default()
                .push(id.clone());
        }

        for (group, ids) in &buckets {
            let mut flat: Vec<f32> = Vec::new();
            for id in ids {
                flat.extend_from_slice(self.buffers[id].grad.data());
            }

            debug!(
                rank = self.rank,
                ?group,
                params = ids.len(),
                elements = flat.len(),
                "reducing gradient bucket"
            );
            backend.all_reduce_sum(&mut flat, group)?;

            let inv = 1.0 / group.len() as f32;
            let mut offset = 0;
            for id in ids {
                let buffer = &mut self.buffers[id];
                let n = buffer.grad.numel();
                for (dst, &src) in buffer.grad.data_mut().iter_mut().zip(&flat[offset..offset + n]) {
                    *dst = src * inv;
                }
                offset += n;
            }
        }

        self.flushes += 1;
        self.reduced = true;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// The gradient buffer for `id`; zeros if nothing was produced yet.
    pub fn gradient(&self, id: &ParameterId) -> Result<&Tensor> {
        self.buffer(id).map(|b| &b.grad)
    }

    /// Mutable access for in-place unscaling and clipping.
    pub fn gradient_mut(&mut self, id: &ParameterId) -> Result<&mut Tensor> {
        let rank = self.rank;
        self.buffers
            .get_mut(id)
            .map(|b| &mut b.grad)
            .ok_or_else(|| ShardError::NotReplicated { id: id.clone(), rank })
    }

    pub fn buffer(&self, id: &ParameterId) -> Result<&GradientBuffer> {
        self.buffers.get(id).ok_or_else(|| ShardError::NotReplicated {
            id: id.clone(),
            rank: self.rank,
        })
    }

    /// Clears every buffer and returns to `Idle` without reducing.
    pub fn zero_grad(&mut self) {
        self.clear();
        self.reduced = false;
        self.phase = Phase::Idle;
    }

    fn clear(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.grad.fill_zero();
            buffer.contributions = 0;
        }
        self.reduced = false;
    }
}

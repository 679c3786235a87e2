//! Parameter ownership.
//!
//! The registry is the single source of truth for *who owns what*: which rank
//! holds the master weight and optimizer state of a parameter, where that
//! parameter sits in its owner's local list, its shape, and which ranks keep a
//! logical replica of it (and therefore average its gradient).
//!
//! Enumeration order is first-registration order on every rank. Checkpoint
//! restore rebuilds parameter groups by walking this order, so it must not
//! depend on hashing.

use crate::error::{Result, ShardError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, name-derived identity of a trainable tensor (e.g. `"fc1.weight"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterId(String);

impl ParameterId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParameterId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Where a parameter physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOwnership {
    /// Rank holding the master weight and optimizer state.
    pub rank: usize,
    /// Position within that rank's parameter list.
    pub local_index: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    ownership: ShardOwnership,
    shape: Vec<usize>,
    replicas: Vec<usize>,
}

/// Maps every [`ParameterId`] to its owner, shape and replica group.
///
/// Ownership is immutable once registered.
#[derive(Debug, Clone)]
pub struct ParamShardRegistry {
    world_size: usize,
    entries: IndexMap<ParameterId, Entry>,
    local_counts: Vec<usize>,
}

impl ParamShardRegistry {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            entries: IndexMap::new(),
            local_counts: vec![0; world_size],
        }
    }

    /// Registers `id` as owned by `owning_rank` and replicated on every rank.
    ///
    /// Re-registering with the same owner and shape is a no-op.
    ///
    /// # Errors
    ///
    /// - `DuplicateRegistration` if `id` is already owned by another rank.
    /// - `ShapeMismatch` if `id` is re-registered with another shape.
    /// - `InvalidRank` if `owning_rank >= world_size`.
    pub fn register(&mut self, id: ParameterId, owning_rank: usize, shape: &[usize]) -> Result<ShardOwnership> {
        let replicas = (0..self.world_size).collect();
        self.register_replicated(id, owning_rank, shape, replicas)
    }

    /// Registers `id` with an explicit replica group.
    ///
    /// `replicas` lists the ranks holding a logical copy of the parameter; it is
    /// sorted and deduplicated, and must contain `owning_rank`.
    pub fn register_replicated(
        &mut self,
        id: ParameterId,
        owning_rank: usize,
        shape: &[usize],
        mut replicas: Vec<usize>,
    ) -> Result<ShardOwnership> {
        self.check_rank(owning_rank)?;
        replicas.sort_unstable();
        replicas.dedup();
        for &r in &replicas {
            self.check_rank(r)?;
        }
        if !replicas.contains(&owning_rank) {
            return Err(ShardError::Config(format!(
                "replica group {:?} of {} does not contain its owner {}",
                replicas, id, owning_rank
            )));
        }

        if let Some(existing) = self.entries.get(&id) {
            if existing.ownership.rank != owning_rank {
                return Err(ShardError::DuplicateRegistration {
                    id,
                    existing: existing.ownership.rank,
                    requested: owning_rank,
                });
            }
            if existing.shape.as_slice() != shape {
                return Err(ShardError::ShapeMismatch {
                    context: id.to_string(),
                    expected: existing.shape.clone(),
                    got: shape.to_vec(),
                });
            }
            return Ok(existing.ownership);
        }

        let ownership = ShardOwnership {
            rank: owning_rank,
            local_index: self.local_counts[owning_rank],
        };
        self.local_counts[owning_rank] += 1;
        self.entries.insert(
            id,
            Entry {
                ownership,
                shape: shape.to_vec(),
                replicas,
            },
        );
        Ok(ownership)
    }

    /// # Errors
    ///
    /// Returns `UnknownParameter` if `id` was never registered.
    pub fn owner_of(&self, id: &ParameterId) -> Result<ShardOwnership> {
        Ok(self.entry(id)?.ownership)
    }

    pub fn shape_of(&self, id: &ParameterId) -> Result<&[usize]> {
        Ok(&self.entry(id)?.shape)
    }

    pub fn replicas_of(&self, id: &ParameterId) -> Result<&[usize]> {
        Ok(&self.entry(id)?.replicas)
    }

    pub fn contains(&self, id: &ParameterId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_owned_by(&self, id: &ParameterId, rank: usize) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.ownership.rank == rank)
    }

    /// All ids in first-registration order.
    pub fn all_ids(&self) -> impl Iterator<Item = &ParameterId> {
        self.entries.keys()
    }

    /// Ids owned by `rank`, in registry order (which is also local-index order).
    pub fn local_ids(&self, rank: usize) -> impl Iterator<Item = &ParameterId> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.ownership.rank == rank)
            .map(|(id, _)| id)
    }

    /// Ids whose replica group contains `rank`, in registry order.
    pub fn replicated_ids(&self, rank: usize) -> impl Iterator<Item = &ParameterId> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.replicas.contains(&rank))
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn entry(&self, id: &ParameterId) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| ShardError::UnknownParameter(id.clone()))
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size {
            return Err(ShardError::InvalidRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }
}

use crate::distributed::registry::{ParamShardRegistry, ParameterId};
use crate::error::{Result, ShardError};
use crate::tensor::{Precision, Tensor, TrainingTensor};
use indexmap::IndexMap;
use tracing::warn;

#[derive(Debug)]
struct TrainingSlot {
    weight: TrainingTensor,
    /// Master was mutated after the last sync.
    stale: bool,
}

#[derive(Debug)]
struct MasterSlot {
    value: Tensor,
    precision: Precision,
}

/// Pairs low-precision training weights with their higher-precision masters.
///
/// The bridge holds the training weight of every parameter replicated on this
/// rank, and a master weight only for parameters this rank owns. It never
/// communicates; replicas receive updated training weights through the
/// sharded module's broadcast.
///
/// # Ordering hazard
///
/// After the optimizer writes a master through [`master_mut`](Self::master_mut),
/// the training weight is stale until
/// [`sync_training_from_master`](Self::sync_training_from_master) runs.
/// [`training_weight`](Self::training_weight) refuses to hand out a stale weight,
/// which turns a missed sync into an error instead of a silently stale forward
/// pass.
#[derive(Debug)]
pub struct MasterWeightBridge {
    rank: usize,
    training: IndexMap<ParameterId, TrainingSlot>,
    masters: IndexMap<ParameterId, MasterSlot>,
}

impl MasterWeightBridge {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            training: IndexMap::new(),
            masters: IndexMap::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Installs the training weight for `id` on this rank.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::Config` if a training weight is already installed.
    pub fn insert_training(&mut self, id: ParameterId, weight: TrainingTensor) -> Result<()> {
        if self.training.contains_key(&id) {
            return Err(ShardError::Config(format!(
                "training weight for {} is already installed on rank {}",
                id, self.rank
            )));
        }
        self.training.insert(id, TrainingSlot { weight, stale: false });
        Ok(())
    }

    /// Creates the master for `id` by upcasting its training weight into `precision`.
    ///
    /// # Errors
    ///
    /// - `NotOwner` if this rank does not own `id`.
    /// - `UnknownParameter` if no training weight is installed.
    /// - `AlreadyAttached` on a second call for the same id.
    /// - `PrecisionDowngrade` if `precision` cannot hold the training precision.
    pub fn attach_master(
        &mut self,
        id: &ParameterId,
        precision: Precision,
        registry: &ParamShardRegistry,
    ) -> Result<&Tensor> {
        let owner = registry.owner_of(id)?.rank;
        if owner != self.rank {
            return Err(ShardError::NotOwner {
                id: id.clone(),
                owner,
                rank: self.rank,
            });
        }
        let slot = self
            .training
            .get(id)
            .ok_or_else(|| ShardError::UnknownParameter(id.clone()))?;
        if self.masters.contains_key(id) {
            return Err(ShardError::AlreadyAttached(id.clone()));
        }
        let training_precision = slot.weight.precision();
        if !precision.can_hold(training_precision) {
            return Err(ShardError::PrecisionDowngrade {
                master: precision.to_string(),
                training: training_precision.to_string(),
            });
        }

        let value = slot.weight.to_tensor();
        let entry = self
            .masters
            .entry(id.clone())
            .or_insert(MasterSlot { value, precision });
        Ok(&entry.value)
    }

    /// The master weight, for optimizer consumption.
    pub fn master_of(&self, id: &ParameterId) -> Result<&Tensor> {
        self.master_slot(id).map(|m| &m.value)
    }

    /// Mutable master access; marks the training weight stale until the next sync.
    pub fn master_mut(&mut self, id: &ParameterId) -> Result<&mut Tensor> {
        if !self.masters.contains_key(id) {
            return Err(self.missing_master(id));
        }
        if let Some(slot) = self.training.get_mut(id) {
            slot.stale = true;
        }
        self.masters
            .get_mut(id)
            .map(|m| &mut m.value)
            .ok_or_else(|| ShardError::NotAttached(id.clone()))
    }

    /// Downcasts the master into the training weight.
    ///
    /// Must run once per optimizer step, before the next forward pass reads the
    /// training weight. Syncing a weight that is not stale is harmless but logged.
    pub fn sync_training_from_master(&mut self, id: &ParameterId) -> Result<()> {
        let master = self
            .masters
            .get_mut(id)
            .ok_or_else(|| ShardError::NotAttached(id.clone()))?;
        let precision = master.precision;
        master
            .value
            .data_mut()
            .iter_mut()
            .for_each(|v| *v = precision.round(*v));

        let slot = self
            .training
            .get_mut(id)
            .ok_or_else(|| ShardError::UnknownParameter(id.clone()))?;
        if !slot.stale {
            warn!(param = %id, rank = self.rank, "training weight synced without a master update");
        }
        slot.weight.assign(&master.value)?;
        slot.stale = false;
        Ok(())
    }

    /// Syncs every stale training weight from its master.
    pub fn sync_all(&mut self) -> Result<usize> {
        let stale: Vec<ParameterId> = self
            .training
            .iter()
            .filter(|(id, s)| s.stale && self.masters.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.sync_training_from_master(id)?;
        }
        Ok(stale.len())
    }

    /// The training weight the next forward pass should read.
    ///
    /// # Errors
    ///
    /// Returns `StaleTrainingWeight` if the master changed since the last sync.
    pub fn training_weight(&self, id: &ParameterId) -> Result<&TrainingTensor> {
        let slot = self
            .training
            .get(id)
            .ok_or_else(|| ShardError::UnknownParameter(id.clone()))?;
        if slot.stale {
            return Err(ShardError::StaleTrainingWeight(id.clone()));
        }
        Ok(&slot.weight)
    }

    /// Overwrites a replica's training weight with values received from its owner.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyAttached` if this rank holds the master for `id`; owned
    /// weights change only through their master.
    pub fn set_training(&mut self, id: &ParameterId, values: &Tensor) -> Result<()> {
        if self.masters.contains_key(id) {
            return Err(ShardError::AlreadyAttached(id.clone()));
        }
        let slot = self
            .training
            .get_mut(id)
            .ok_or_else(|| ShardError::UnknownParameter(id.clone()))?;
        slot.weight.assign(values)?;
        slot.stale = false;
        Ok(())
    }

    /// Restores a master from a checkpoint and re-derives its training weight.
    pub fn load_master(&mut self, id: &ParameterId, value: &Tensor) -> Result<()> {
        let master = self
            .masters
            .get_mut(id)
            .ok_or_else(|| ShardError::NotAttached(id.clone()))?;
        if master.value.shape() != value.shape() {
            return Err(ShardError::ShapeMismatch {
                context: id.to_string(),
                expected: master.value.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        master.value = value.clone();
        if let Some(slot) = self.training.get_mut(id) {
            slot.stale = true;
        }
        self.sync_training_from_master(id)
    }

    pub fn has_master(&self, id: &ParameterId) -> bool {
        self.masters.contains_key(id)
    }

    /// Ids with an attached master, in attach order.
    pub fn master_ids(&self) -> impl Iterator<Item = &ParameterId> {
        self.masters.keys()
    }

    /// Ids with an installed training weight, in install order.
    pub fn training_ids(&self) -> impl Iterator<Item = &ParameterId> {
        self.training.keys()
    }

    fn master_slot(&self, id: &ParameterId) -> Result<&MasterSlot> {
        self.masters.get(id).ok_or_else(|| self.missing_master(id))
    }

    fn missing_master(&self, id: &ParameterId) -> ShardError {
        if self.training.contains_key(id) {
            ShardError::NotAttached(id.clone())
        } else {
            ShardError::UnknownParameter(id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MasterWeightBridge, ParamShardRegistry, ParameterId) {
        let mut registry = ParamShardRegistry::new(2);
        let id = ParameterId::new("fc1.weight");
        registry.register(id.clone(), 0, &[3]).unwrap();
        registry.register(ParameterId::new("fc2.weight"), 1, &[2]).unwrap();

        let mut bridge = MasterWeightBridge::new(0);
        let init = Tensor::new(vec![0.1, 0.2, 0.3], vec![3]).unwrap();
        bridge
            .insert_training(id.clone(), TrainingTensor::from_tensor(&init, Precision::F16))
            .unwrap();
        (bridge, registry, id)
    }

    #[test]
    fn test_attach_upcasts_training_weight() {
        let (mut bridge, registry, id) = setup();
        let master = bridge.attach_master(&id, Precision::F32, &registry).unwrap();
        assert_eq!(master.data()[0], Precision::F16.round(0.1));
    }

    #[test]
    fn test_attach_twice_fails() {
        let (mut bridge, registry, id) = setup();
        bridge.attach_master(&id, Precision::F32, &registry).unwrap();
        assert!(matches!(
            bridge.attach_master(&id, Precision::F32, &registry),
            Err(ShardError::AlreadyAttached(_))
        ));
    }

    #[test]
    fn test_attach_not_owner() {
        let (mut bridge, registry, _) = setup();
        let other = ParameterId::new("fc2.weight");
        bridge
            .insert_training(other.clone(), TrainingTensor::from_tensor(&Tensor::zeros(&[2]), Precision::F16))
            .unwrap();
        assert!(matches!(
            bridge.attach_master(&other, Precision::F32, &registry),
            Err(ShardError::NotOwner { owner: 1, rank: 0, .. })
        ));
    }

    #[test]
    fn test_attach_precision_downgrade() {
        let (mut bridge, registry, id) = setup();
        assert!(matches!(
            bridge.attach_master(&id, Precision::Bf16, &registry),
            Err(ShardError::PrecisionDowngrade { .. })
        ));
    }

    #[test]
    fn test_stale_until_synced() {
        let (mut bridge, registry, id) = setup();
        bridge.attach_master(&id, Precision::F32, &registry).unwrap();

        bridge.master_mut(&id).unwrap().data_mut()[0] = 0.5;
        assert!(matches!(
            bridge.training_weight(&id),
            Err(ShardError::StaleTrainingWeight(_))
        ));

        bridge.sync_training_from_master(&id).unwrap();
        let w = bridge.training_weight(&id).unwrap().to_tensor();
        assert_eq!(w.data()[0], 0.5);
    }

    #[test]
    fn test_sync_all_counts_stale() {
        let (mut bridge, registry, id) = setup();
        bridge.attach_master(&id, Precision::F32, &registry).unwrap();
        assert_eq!(bridge.sync_all().unwrap(), 0);
        bridge.master_mut(&id).unwrap().scale(2.0);
        assert_eq!(bridge.sync_all().unwrap(), 1);
    }

    #[test]
    fn test_set_training_rejected_for_owned() {
        let (mut bridge, registry, id) = setup();
        bridge.attach_master(&id, Precision::F32, &registry).unwrap();
        assert!(bridge.set_training(&id, &Tensor::zeros(&[3])).is_err());
    }

    #[test]
    fn test_master_of_before_attach() {
        let (bridge, _, id) = setup();
        assert!(matches!(bridge.master_of(&id), Err(ShardError::NotAttached(_))));
        assert!(matches!(
            bridge.master_of(&ParameterId::new("nope")),
            Err(ShardError::UnknownParameter(_))
        ));
    }
}

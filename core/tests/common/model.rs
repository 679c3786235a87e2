//! A two-layer linear model small enough to backprop by hand.
//!
//! `h = x · fc1.weight` (`[2] x [2, 3] -> [3]`), `y = h · fc2.weight`
//! (`[3] x [3, 2] -> [2]`), loss `0.5 * mean ||y - t||^2`.

use super::{id, values};
use indexmap::IndexMap;
use shardstate::amp::StaticLossScaler;
use shardstate::distributed::{CpuBackend, ParamShardRegistry, ParameterId, ShardedModule, StepOutcome};
use shardstate::optim::{AdamW, ParamGroup, ParamGroups};
use shardstate::tensor::{Precision, Tensor};
use shardstate::ShardConfig;

pub const LOSS_SCALE: f32 = 16.0;

pub type Sample = ([f32; 2], [f32; 2]);

pub static SAMPLES: [Sample; 4] = [
    ([0.5, -1.2], [0.3, 0.8]),
    ([1.1, 0.4], [-0.6, 0.2]),
    ([-0.7, 0.9], [0.9, -0.4]),
    ([0.3, 1.5], [0.1, 0.7]),
];

pub fn fc1() -> ParameterId {
    id("fc1.weight")
}

pub fn fc2() -> ParameterId {
    id("fc2.weight")
}

pub fn initial_weights() -> IndexMap<ParameterId, Tensor> {
    values(&[
        (
            "fc1.weight",
            Tensor::new(vec![0.21, -0.35, 0.47, 0.12, 0.58, -0.26], vec![2, 3]).unwrap(),
        ),
        (
            "fc2.weight",
            Tensor::new(vec![0.33, -0.18, -0.41, 0.27, 0.15, 0.52], vec![3, 2]).unwrap(),
        ),
    ])
}

/// fc1 is owned by rank 0, fc2 by the last rank; both replicated everywhere.
pub fn registry(world_size: usize) -> ParamShardRegistry {
    let mut registry = ParamShardRegistry::new(world_size);
    registry.register(fc1(), 0, &[2, 3]).unwrap();
    registry.register(fc2(), world_size - 1, &[3, 2]).unwrap();
    registry
}

pub fn groups() -> ParamGroups {
    ParamGroups::new(vec![
        ParamGroup::new(vec![fc1()]).with_hyperparameter("lr", 0.01),
        ParamGroup::new(vec![fc2()]).with_hyperparameter("lr", 0.001),
    ])
    .unwrap()
}

pub fn config() -> ShardConfig {
    ShardConfig::default()
        .with_training_precision(Precision::F16)
        .with_max_grad_norm(1.0)
}

pub fn build(
    backend: CpuBackend,
    registry: ParamShardRegistry,
    initial: &IndexMap<ParameterId, Tensor>,
) -> ShardedModule<CpuBackend, AdamW> {
    ShardedModule::new(backend, registry, initial, AdamW::new(0.01), groups(), config()).unwrap()
}

/// This rank's slice of [`SAMPLES`].
pub fn shard_of(rank: usize, world_size: usize) -> &'static [Sample] {
    let per_rank = SAMPLES.len() / world_size;
    &SAMPLES[rank * per_rank..(rank + 1) * per_rank]
}

/// Loss-scaled gradients of the mean loss over `samples`.
pub fn backward(w1: &Tensor, w2: &Tensor, samples: &[Sample], scale: f32) -> (Tensor, Tensor) {
    let (w1, w2) = (w1.data(), w2.data());
    let mut g1 = vec![0.0f32; 6];
    let mut g2 = vec![0.0f32; 6];
    let n = samples.len() as f32;

    for (x, t) in samples {
        let h: Vec<f32> = (0..3).map(|j| x[0] * w1[j] + x[1] * w1[3 + j]).collect();
        let y: Vec<f32> = (0..2)
            .map(|k| (0..3).map(|j| h[j] * w2[j * 2 + k]).sum())
            .collect();
        let dy: Vec<f32> = (0..2).map(|k| scale * (y[k] - t[k]) / n).collect();

        for j in 0..3 {
            for k in 0..2 {
                g2[j * 2 + k] += h[j] * dy[k];
            }
        }
        let dh: Vec<f32> = (0..3)
            .map(|j| (0..2).map(|k| w2[j * 2 + k] * dy[k]).sum())
            .collect();
        for i in 0..2 {
            for j in 0..3 {
                g1[i * 3 + j] += x[i] * dh[j];
            }
        }
    }
    (
        Tensor::new(g1, vec![2, 3]).unwrap(),
        Tensor::new(g2, vec![3, 2]).unwrap(),
    )
}

/// Runs `iterations` forward/backward/step rounds on this rank's data shard.
pub fn train(module: &mut ShardedModule<CpuBackend, AdamW>, iterations: usize) {
    let samples = shard_of(module.rank(), module.world_size());
    let mut scaler = StaticLossScaler::new(LOSS_SCALE);
    for _ in 0..iterations {
        let w1 = module.training_weight(&fc1()).unwrap();
        let w2 = module.training_weight(&fc2()).unwrap();
        let (g1, g2) = backward(&w1, &w2, samples, LOSS_SCALE);
        module.accumulate_gradient(&fc1(), &g1).unwrap();
        module.accumulate_gradient(&fc2(), &g2).unwrap();
        assert!(module.finish_backward().unwrap());
        assert_eq!(module.step(&mut scaler).unwrap(), StepOutcome::Applied);
    }
}

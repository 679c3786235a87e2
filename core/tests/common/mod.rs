#![allow(dead_code)]

pub mod model;

use indexmap::IndexMap;
use shardstate::distributed::{CpuBackend, ParameterId};
use shardstate::tensor::Tensor;
use std::thread;

/// Runs `f` once per rank, each on its own thread over a fresh channel mesh,
/// and returns the per-rank results in rank order.
///
/// A panicking rank drops its backend, so peers blocked on it fail instead of
/// hanging; the panic is then re-raised here.
pub fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(CpuBackend) -> T + Sync,
{
    let backends = CpuBackend::mesh(world_size);
    thread::scope(|s| {
        let handles: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                let f = &f;
                s.spawn(move || f(backend))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

pub fn id(name: &str) -> ParameterId {
    ParameterId::new(name)
}

pub fn tensor(data: &[f32], shape: &[usize]) -> Tensor {
    Tensor::new(data.to_vec(), shape.to_vec()).unwrap()
}

pub fn assert_close(actual: &Tensor, expected: &Tensor, tolerance: f32, what: &str) {
    assert_eq!(actual.shape(), expected.shape(), "{}: shape", what);
    for (i, (a, e)) in actual.data().iter().zip(expected.data()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{}[{}]: expected {}, got {}",
            what,
            i,
            e,
            a
        );
    }
}

pub fn values(entries: &[(&str, Tensor)]) -> IndexMap<ParameterId, Tensor> {
    entries
        .iter()
        .map(|(name, t)| (ParameterId::new(*name), t.clone()))
        .collect()
}

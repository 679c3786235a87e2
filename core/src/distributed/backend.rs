use crate::error::{Result, ShardError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Abstraction for the process group the coordinator runs on.
///
/// Every method is a synchronous collective: all participating ranks must issue
/// the same call, in the same order, before any of them returns. A rank that
/// never arrives blocks the others indefinitely; there is no timeout at this
/// layer.
///
/// Implementations:
/// - [`CpuBackend`](super::cpu_backend::CpuBackend): one thread per rank over a
///   channel mesh, using Ring All-Reduce.
pub trait CollectiveBackend: Send {
    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Sums `buffer` element-wise across the ranks in `group`, in place.
    ///
    /// `group` must be sorted and contain the calling rank. Ranks outside the
    /// group do not participate.
    fn all_reduce_sum(&self, buffer: &mut [f32], group: &[usize]) -> Result<()>;

    /// Element-wise maximum of `buffer` across `group`, in place.
    fn all_reduce_max(&self, buffer: &mut [f32], group: &[usize]) -> Result<()>;

    /// Sends `payload` to `root`.
    ///
    /// Returns `Some(payloads)` indexed by source rank on `root`, `None` elsewhere.
    fn gather_to_root(&self, payload: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>>;

    /// Broadcasts the root's payload to every rank.
    ///
    /// `root` passes `Some(payload)`; every other rank passes `None`.
    fn broadcast(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>>;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<()> {
        let everyone = all_ranks(self.world_size());
        self.all_reduce_sum(&mut [0.0], &everyone)
    }
}

/// `[0, 1, ..., world_size - 1]`.
pub fn all_ranks(world_size: usize) -> Vec<usize> {
    (0..world_size).collect()
}

/// Encodes a value as CBOR for transport through `gather_to_root` / `broadcast`.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ShardError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ShardError::Serialization(e.to_string()))
}

use super::backend::CollectiveBackend;
use crate::error::{Result, ShardError};
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::trace;

/// Unit of data moved between ranks.
#[derive(Debug)]
enum Packet {
    Floats(Vec<f32>),
    Bytes(Vec<u8>),
}

/// A CPU collective backend with one thread per rank.
///
/// Ranks are wired as a full mesh of `crossbeam` channels: rank `r` holds a
/// sender to every rank and a receiver from every rank. Each ordered pair has
/// its own FIFO channel, so as long as every rank issues collectives in the
/// same order, messages never cross between operations.
///
/// All-reduce uses the **Ring All-Reduce** algorithm restricted to the calling
/// group: the ring is the group's members in ascending rank order.
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    senders: Vec<Sender<Packet>>,     // indexed by destination rank
    receivers: Vec<Receiver<Packet>>, // indexed by source rank
}

impl CpuBackend {
    /// Builds a fully connected mesh of `world_size` backends, one per rank.
    ///
    /// Move each backend into the thread that plays that rank.
    pub fn mesh(world_size: usize) -> Vec<CpuBackend> {
        // channels[src][dst]
        let mut senders: Vec<Vec<Sender<Packet>>> = Vec::with_capacity(world_size);
        let mut receivers: Vec<Vec<Receiver<Packet>>> = (0..world_size).map(|_| Vec::new()).collect();

        for _src in 0..world_size {
            let mut row = Vec::with_capacity(world_size);
            for dst_receivers in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                row.push(tx);
                dst_receivers.push(rx);
            }
            senders.push(row);
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| CpuBackend {
                rank,
                world_size,
                senders,
                receivers,
            })
            .collect()
    }

    fn send(&self, dst: usize, packet: Packet) -> Result<()> {
        self.senders[dst]
            .send(packet)
            .map_err(|_| ShardError::Communication(format!("rank {} is gone", dst)))
    }

    fn recv_floats(&self, src: usize) -> Result<Vec<f32>> {
        match self.recv(src)? {
            Packet::Floats(v) => Ok(v),
            Packet::Bytes(_) => Err(ShardError::Communication(format!(
                "rank {} sent bytes where a float chunk was expected; collective order diverged",
                src
            ))),
        }
    }

    fn recv_bytes(&self, src: usize) -> Result<Vec<u8>> {
        match self.recv(src)? {
            Packet::Bytes(v) => Ok(v),
            Packet::Floats(_) => Err(ShardError::Communication(format!(
                "rank {} sent a float chunk where bytes were expected; collective order diverged",
                src
            ))),
        }
    }

    fn recv(&self, src: usize) -> Result<Packet> {
        self.receivers[src]
            .recv()
            .map_err(|_| ShardError::Communication(format!("rank {} disconnected", src)))
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

    /// Ring All-Reduce over `group` with the element-wise combiner `op`.
    ///
    /// --- Phase 1: Scatter-Reduce ---
    /// The buffer is split into `n` chunks. In each of `n - 1` steps a member
    /// sends one chunk to its right neighbour and folds the chunk received from
    /// its left neighbour into its own copy. Afterwards every member holds one
    /// fully reduced chunk.
    ///
    /// --- Phase 2: All-Gather ---
    /// The reduced chunks travel once more around the ring and overwrite the
    /// local copies, so every member ends with bit-identical values.
    fn ring_reduce(&self, buffer: &mut [f32], group: &[usize], op: fn(f32, f32) -> f32) -> Result<()> {
        let n = group.len();
        let pos = group.iter().position(|&r| r == self.rank).ok_or_else(|| {
            ShardError::Communication(format!(
                "rank {} is not a member of group {:?}",
                self.rank, group
            ))
        })?;
        for &r in group {
            self.check_rank(r)?;
        }
        if n == 1 {
            return Ok(());
        }

        let left = group[(pos + n - 1) % n];
        let right = group[(pos + 1) % n];
        let total = buffer.len();
        let chunk_size = total.div_ceil(n);
        let bounds = |idx: usize| {
            let start = (idx * chunk_size).min(total);
            let end = (start + chunk_size).min(total);
            (start, end)
        };

        trace!(rank = self.rank, ?group, elements = total, "ring all-reduce");

        for step in 0..n - 1 {
            // Position p sends chunk (p - step) mod n and receives (p - step - 1) mod n.
            let send_idx = (pos + n - step % n) % n;
            let recv_idx = (pos + 2 * n - step % n - 1) % n;

            let (start, end) = bounds(send_idx);
            self.send(right, Packet::Floats(buffer[start..end].to_vec()))?;

            let recv_data = self.recv_floats(left)?;
            let (start, end) = bounds(recv_idx);
            if recv_data.len() != end - start {
                return Err(ShardError::Communication(format!(
                    "rank {} received a chunk of {} elements from rank {}, expected {}",
                    self.rank,
                    recv_data.len(),
                    left,
                    end - start
                )));
            }
            for (dst, val) in buffer[start..end].iter_mut().zip(recv_data) {
                *dst = op(*dst, val);
            }
        }

        for step in 0..n - 1 {
            let send_idx = (pos + 1 + n - step % n) % n;
            let recv_idx = (pos + n - step % n) % n;

            let (start, end) = bounds(send_idx);
            self.send(right, Packet::Floats(buffer[start..end].to_vec()))?;

            let recv_data = self.recv_floats(left)?;
            let (start, end) = bounds(recv_idx);
            if recv_data.len() != end - start {
                return Err(ShardError::Communication(format!(
                    "rank {} received a chunk of {} elements from rank {}, expected {}",
                    self.rank,
                    recv_data.len(),
                    left,
                    end - start
                )));
            }
            buffer[start..end].copy_from_slice(&recv_data);
        }

        Ok(())
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32], group: &[usize]) -> Result<()> {
        self.ring_reduce(buffer, group, |a, b| a + b)
    }

    fn all_reduce_max(&self, buffer: &mut [f32], group: &[usize]) -> Result<()> {
        self.ring_reduce(buffer, group, f32::max)
    }

    fn gather_to_root(&self, payload: Vec<u8>, root: usize) -> Result<Option<Vec<Vec<u8>>>> {
        self.check_rank(root)?;
        if self.rank != root {
            self.send(root, Packet::Bytes(payload))?;
            return Ok(None);
        }

        let mut own = Some(payload);
        let mut gathered = Vec::with_capacity(self.world_size);
        for src in 0..self.world_size {
            if src == self.rank {
                gathered.push(own.take().unwrap_or_default());
            } else {
                gathered.push(self.recv_bytes(src)?);
            }
        }
        Ok(Some(gathered))
    }

    fn broadcast(&self, payload: Option<Vec<u8>>, root: usize) -> Result<Vec<u8>> {
        self.check_rank(root)?;
        if self.rank != root {
            return self.recv_bytes(root);
        }

        let payload = payload.ok_or_else(|| {
            ShardError::Communication(format!("broadcast root {} supplied no payload", root))
        })?;
        for dst in 0..self.world_size {
            if dst != self.rank {
                self.send(dst, Packet::Bytes(payload.clone()))?;
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_mesh_properties() {
        let backends = CpuBackend::mesh(3);
        assert_eq!(backends.len(), 3);
        for (i, b) in backends.iter().enumerate() {
            assert_eq!(b.rank(), i);
            assert_eq!(b.world_size(), 3);
        }
    }

    #[test]
    fn test_single_rank_collectives_are_identity() {
        let backend = CpuBackend::mesh(1).pop().unwrap();
        let mut buf = [1.5, -2.0];
        backend.all_reduce_sum(&mut buf, &[0]).unwrap();
        assert_eq!(buf, [1.5, -2.0]);
        let gathered = backend.gather_to_root(vec![7], 0).unwrap().unwrap();
        assert_eq!(gathered, vec![vec![7]]);
        assert_eq!(backend.broadcast(Some(vec![9]), 0).unwrap(), vec![9]);
        backend.barrier().unwrap();
    }

    #[test]
    fn test_non_member_is_rejected() {
        let backend = CpuBackend::mesh(2).remove(0);
        let mut buf = [1.0];
        assert!(backend.all_reduce_sum(&mut buf, &[1]).is_err());
    }

    #[test]
    fn test_dropped_peer_reports_error() {
        let mut backends = CpuBackend::mesh(2);
        let peer = backends.pop().unwrap();
        let me = backends.pop().unwrap();
        drop(peer);
        let mut buf = [1.0, 2.0];
        let result = me.all_reduce_sum(&mut buf, &[0, 1]);
        assert!(matches!(result, Err(ShardError::Communication(_))));
    }

    #[test]
    fn test_ring_max_two_ranks() {
        let handles: Vec<_> = CpuBackend::mesh(2)
            .into_iter()
            .map(|backend| {
                thread::spawn(move || {
                    let r = backend.rank() as f32;
                    let mut buf = [r, 1.0 - r, 5.0];
                    backend.all_reduce_max(&mut buf, &[0, 1]).unwrap();
                    buf
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), [1.0, 1.0, 5.0]);
        }
    }
}

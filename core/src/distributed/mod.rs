//! # Sharded Training
//!
//! ZeRO-style sharding splits *ownership* of parameters across ranks while every
//! rank in a parameter's replica group still computes its gradient.
//!
//! ## Who holds what
//!
//! | State                     | Held by                          |
//! |---------------------------|----------------------------------|
//! | training weight (16-bit)  | every rank in the replica group  |
//! | gradient buffer           | every rank in the replica group  |
//! | master weight (`f32`)     | the owner only                   |
//! | optimizer record          | the owner only                   |
//!
//! After backward, gradients are averaged across each replica group
//! ([`coordinator`]). The owner then updates its master and optimizer record
//! and sends the new weight back to the replicas ([`sharded`]).
//!
//! ## Module Contents
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): the process-group interface.
//! *   [`CpuBackend`](cpu_backend::CpuBackend): one thread per rank, Ring All-Reduce over channels.
//! *   [`ParamShardRegistry`](registry::ParamShardRegistry): who owns what.
//! *   [`GradientAllreduceCoordinator`](coordinator::GradientAllreduceCoordinator): hold / flush.
//! *   [`ShardedModule`](sharded::ShardedModule): the facade a training loop drives.

pub mod backend;
pub mod coordinator;
pub mod cpu_backend;
pub mod registry;
pub mod sharded;

pub use backend::CollectiveBackend;
pub use coordinator::{GradientAllreduceCoordinator, Phase};
pub use cpu_backend::CpuBackend;
pub use registry::{ParamShardRegistry, ParameterId, ShardOwnership};
pub use sharded::{ShardedModule, StepOutcome};

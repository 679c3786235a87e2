//! # shardstate
//!
//! `shardstate` is the state coordinator for sharded (ZeRO-style) data-parallel training.
//!
//! It keeps per-rank gradients consistent with a single logical all-reduce no matter how
//! parameters are partitioned, pairs 16-bit training weights with `f32` master weights on
//! the owning rank, and converts optimizer state between its per-rank layout and a global,
//! rank-independent layout for checkpoints.
//!
//! ## Modules
//!
//! - [`distributed`]: collectives, ownership registry, gradient coordinator and the
//!   [`ShardedModule`](distributed::ShardedModule) facade.
//! - [`amp`]: master weights and loss scaling.
//! - [`optim`]: optimizers, parameter groups and per-rank optimizer state.
//! - [`checkpoint`]: global state assembly and the `safetensors` codec.
//! - [`mod@tensor`]: the dynamic-shape `f32` tensor and training precisions.
//!
//! ## Example
//!
//! ```rust
//! use indexmap::IndexMap;
//! use shardstate::amp::StaticLossScaler;
//! use shardstate::distributed::{CpuBackend, ParamShardRegistry, ParameterId, ShardedModule, StepOutcome};
//! use shardstate::optim::{ParamGroups, Sgd};
//! use shardstate::tensor::Tensor;
//! use shardstate::ShardConfig;
//!
//! let w = ParameterId::new("w");
//! let mut registry = ParamShardRegistry::new(1);
//! registry.register(w.clone(), 0, &[2]).unwrap();
//!
//! let mut initial = IndexMap::new();
//! initial.insert(w.clone(), Tensor::new(vec![1.0, 2.0], vec![2]).unwrap());
//!
//! let backend = CpuBackend::mesh(1).remove(0);
//! let mut module = ShardedModule::new(
//!     backend,
//!     registry,
//!     &initial,
//!     Sgd::new(0.5),
//!     ParamGroups::default(),
//!     ShardConfig::default(),
//! )
//! .unwrap();
//!
//! module.accumulate_gradient(&w, &Tensor::full(&[2], 1.0)).unwrap();
//! module.finish_backward().unwrap();
//! let outcome = module.step(&mut StaticLossScaler::new(1.0)).unwrap();
//! assert_eq!(outcome, StepOutcome::Applied);
//! assert_eq!(module.training_weight(&w).unwrap().data(), &[0.5, 1.5]);
//! ```

pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod optim;
pub mod tensor;

pub use config::ShardConfig;
pub use error::{Result, ShardError};
pub use tensor::{Precision, Tensor};

//! Mixed-precision support: master weights and the loss-scaling interface.
//!
//! Training weights are kept in a 16-bit format for the forward and backward
//! passes; the optimizer updates an `f32` master copy on the rank that owns the
//! parameter, and the result is rounded back down after every step.

pub mod master;
pub mod scaler;

pub use master::MasterWeightBridge;
pub use scaler::{DynamicLossScaler, LossScaler, StaticLossScaler};

//! Error taxonomy for the coordinator.
//!
//! Every variant is fatal to the current training process: they signal either a
//! construction-time programming error or a topology mismatch between save and
//! load. Soft anomalies (for example a non-increasing step counter) are logged
//! instead and never surface here.

use crate::distributed::registry::ParameterId;
use thiserror::Error;

/// Errors raised by the sharded-training state coordinator.
#[derive(Error, Debug)]
pub enum ShardError {
    /// A parameter was registered twice with different owners.
    #[error("parameter {id} is already owned by rank {existing}, cannot re-register it to rank {requested}")]
    DuplicateRegistration {
        id: ParameterId,
        existing: usize,
        requested: usize,
    },

    /// The parameter was never registered (or never installed on this rank).
    #[error("unknown parameter {0}")]
    UnknownParameter(ParameterId),

    /// `attach_master` was called twice for the same parameter.
    #[error("master weight already attached for {0}")]
    AlreadyAttached(ParameterId),

    /// A master weight was requested before it was attached.
    #[error("no master weight attached for {0}")]
    NotAttached(ParameterId),

    /// A rank tried to act on state owned by another rank.
    #[error("parameter {id} is owned by rank {owner}, not rank {rank}")]
    NotOwner {
        id: ParameterId,
        owner: usize,
        rank: usize,
    },

    /// A rank produced a gradient for a parameter it holds no replica of.
    #[error("parameter {id} has no replica on rank {rank}")]
    NotReplicated { id: ParameterId, rank: usize },

    /// Two ranks claimed the same parameter during a gather.
    #[error("ownership conflict for {id}: contributed by rank {first} and rank {second}")]
    OwnershipConflict {
        id: ParameterId,
        first: usize,
        second: usize,
    },

    /// Group hyperparameters replicated across ranks disagree.
    #[error("parameter group {group} on rank {rank} disagrees with the collected group metadata")]
    GroupHyperparameterMismatch { group: usize, rank: usize },

    /// The optimizer's group layout does not match the checkpoint's.
    #[error("parameter group structure mismatch: {0}")]
    GroupStructureMismatch(String),

    /// A parameter expected by the registry is absent from a checkpoint.
    #[error("parameter {0} is missing from the checkpoint state")]
    MissingParameter(ParameterId),

    /// A checkpoint carries a parameter the registry does not know.
    #[error("checkpoint state carries parameter {0} unknown to the registry")]
    UnexpectedParameter(ParameterId),

    /// Shapes disagree.
    #[error("shape mismatch for {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// The optimizer has not stepped for this parameter yet.
    #[error("optimizer state for {0} is uninitialized")]
    Uninitialized(ParameterId),

    /// The master was updated but the training weight was not synced from it.
    #[error("training weight {0} is stale: its master was updated without a sync")]
    StaleTrainingWeight(ParameterId),

    /// The requested master precision is narrower than the training precision.
    #[error("master precision {master} cannot hold training precision {training}")]
    PrecisionDowngrade { master: String, training: String },

    /// A rank index outside `0..world_size`.
    #[error("rank {rank} is outside world of size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A group lacks a hyperparameter the optimizer needs.
    #[error("missing hyperparameter {0}")]
    MissingHyperparameter(String),

    /// An optimizer step was requested before the gradients were reduced.
    #[error("gradients have not been reduced since the last backward pass")]
    GradientsNotReduced,

    /// The process group reported a failure.
    #[error("collective communication failed: {0}")]
    Communication(String),

    /// Encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while reading or writing a checkpoint.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, ShardError>;

impl From<serde_json::Error> for ShardError {
    fn from(e: serde_json::Error) -> Self {
        ShardError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ShardError {
    fn from(e: toml::de::Error) -> Self {
        ShardError::Config(e.to_string())
    }
}

impl From<safetensors::SafeTensorError> for ShardError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ShardError::Serialization(format!("safetensors: {:?}", e))
    }
}

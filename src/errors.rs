//! Error types for the on-the-fly learner.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a surrogate model.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The model has no fitted state yet (no refit since the last mutation).
    #[error("model has not been fitted")]
    Unfitted,

    /// Refit attempted with no sparse environments or no labels.
    #[error("training set is empty: {0}")]
    EmptyTrainingSet(String),

    /// A covariance matrix could not be factorized.
    #[error("factorization failed for {0}")]
    Factorization(&'static str),

    /// Record or atom reference outside the training set.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Configuration incompatible with the descriptor set.
    #[error("descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// Hyperparameter vector rejected (wrong length, non-positive, non-finite).
    #[error("invalid hyperparameters: {0}")]
    Hyperparameters(String),

    /// NaN or overflow in a derived quantity.
    #[error("numerical error: {0}")]
    Numerical(String),
}

/// Failures while writing or reading checkpoint artifacts.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint format error: {0}")]
    Format(String),
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Unified error type at the controller boundary.
#[derive(Error, Debug)]
pub enum OtfError {
    /// Eagerly detected inconsistency in the learner parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed configuration snapshot.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Ground-truth calculation failed or returned malformed output.
    #[error("oracle failed at step {step}")]
    Oracle {
        step: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The simulation engine failed to snapshot or reload.
    #[error("simulation engine failed")]
    Engine(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("model update failed")]
    Model(#[from] ModelError),

    #[error("checkpoint failed")]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtfError {
    pub fn config(message: impl Into<String>) -> Self {
        OtfError::Config(message.into())
    }

    pub fn oracle(step: u64, source: anyhow::Error) -> Self {
        OtfError::Oracle {
            step,
            source: source.into(),
        }
    }

    pub fn engine(source: anyhow::Error) -> Self {
        OtfError::Engine(source.into())
    }
}

/// Renders an error and its `source()` chain on one line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(cause) = cur {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        cur = cause.source();
    }
    out
}

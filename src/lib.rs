//! On-the-fly active learning of interatomic potentials.
//!
//! A controller runs alongside a stepping simulation, scores the per-atom uncertainty
//! of a sparse Gaussian-process surrogate, and queries a ground-truth oracle only when
//! the surrogate is not trustworthy. New labels are folded into the model, which is
//! checkpointed as a mapped potential for the engine to reload.

pub mod core;
pub mod engine;
pub mod errors;
pub mod interface;
pub mod io;
pub mod learner;
pub mod md;
pub mod model;

pub use errors::{CheckpointError, ModelError, OtfError};
pub use learner::controller::{OtfController, OtfControllerBuilder, StepOutcome};
pub use learner::params::LearnerParams;

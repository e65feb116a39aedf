use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::core::domain::{Configuration, Efs, Species};
use crate::io::extxyz;

/// Output of a ground-truth calculation.
/// Stress uses the model's convention, -(1/V) dE/dstrain, in [xx, xy, xz, yy, yz, zz].
pub type GroundTruth = Efs;

/// A generic interface for ground-truth calculators.
/// Implementations must be Thread-Safe (Sync).
pub trait Oracle: Send + Sync {
    /// Computes energy, forces and stress of a fixed configuration (no relaxation).
    fn compute(&self, config: &Configuration) -> Result<GroundTruth>;

    /// Returns the name of the engine (e.g., "GULP 6.1").
    fn name(&self) -> &str;
}

/// Maps a step index to an output file name.
pub type FileNamer = Box<dyn Fn(u64) -> PathBuf + Send>;

/// Wraps an [`Oracle`] with output validation and the optional audit dump of every
/// queried configuration. A failed dump is logged and does not fail the query.
pub struct OracleAdapter {
    oracle: Arc<dyn Oracle>,
    species: Vec<Species>,
    dump_name: Option<FileNamer>,
}

impl OracleAdapter {
    pub fn new(oracle: Arc<dyn Oracle>, species: Vec<Species>) -> Self {
        Self {
            oracle,
            species,
            dump_name: None,
        }
    }

    pub fn with_dump(mut self, namer: FileNamer) -> Self {
        self.dump_name = Some(namer);
        self
    }

    pub fn name(&self) -> &str {
        self.oracle.name()
    }

    /// Runs the oracle and checks the result has one finite force row per atom.
    pub fn query(&self, config: &Configuration, step: u64) -> Result<GroundTruth> {
        let truth = self.oracle.compute(config)?;

        if truth.forces.len() != config.len() {
            bail!(
                "{} returned {} force rows for {} atoms",
                self.oracle.name(),
                truth.forces.len(),
                config.len()
            );
        }
        if !truth.energy.is_finite()
            || truth.stress.iter().any(|s| !s.is_finite())
            || truth.forces.iter().any(|f| f.iter().any(|c| !c.is_finite()))
        {
            bail!("{} returned non-finite values", self.oracle.name());
        }

        if let Some(namer) = &self.dump_name {
            let path = namer(step);
            let frame = extxyz::Frame::new(config, &self.species).with_truth(&truth);
            if let Err(e) = extxyz::write_frame(&path, &frame) {
                log::warn!(target: "otf", "oracle dump {} failed: {:#}", path.display(), e);
            }
        }

        Ok(truth)
    }
}

use serde::{Deserialize, Serialize};

/// Per-species additive energy offsets.
///
/// The oracle's total energy is corrected by subtracting the summed offset of every
/// atom in the configuration. The table length must equal the species count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyCorrection {
    offsets: Vec<f64>,
}

impl EnergyCorrection {
    pub fn new(offsets: Vec<f64>) -> Self {
        Self { offsets }
    }

    pub fn zeros(n_species: usize) -> Self {
        Self {
            offsets: vec![0.0; n_species],
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    /// Total offset for a list of species labels. Unknown labels contribute nothing;
    /// the controller rejects them before this is reached.
    pub fn offset_for(&self, species: &[usize]) -> f64 {
        species
            .iter()
            .map(|&s| self.offsets.get(s).copied().unwrap_or(0.0))
            .sum()
    }

    pub fn apply(&self, energy: f64, species: &[usize]) -> f64 {
        energy - self.offset_for(species)
    }
}

/// Lennard-Jones parameters for one species pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairParams {
    pub epsilon: f64, // eV
    pub sigma: f64,   // Å
}

/// A flattened symmetric matrix of pair parameters.
/// Access is O(1) via `index = i * N + j`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairTable {
    num_species: usize,
    params: Vec<PairParams>,
}

impl PairTable {
    /// Builds the table from per-species parameters with Lorentz-Berthelot mixing.
    pub fn lorentz_berthelot(per_species: &[PairParams]) -> Self {
        let n = per_species.len();
        let mut params = Vec::with_capacity(n * n);

        for a in per_species {
            for b in per_species {
                params.push(PairParams {
                    epsilon: (a.epsilon * b.epsilon).sqrt(),
                    sigma: 0.5 * (a.sigma + b.sigma),
                });
            }
        }

        Self {
            num_species: n,
            params,
        }
    }

    pub fn num_species(&self) -> usize {
        self.num_species
    }

    #[inline(always)]
    pub fn get(&self, a: usize, b: usize) -> PairParams {
        // Species indices are validated against `num_species` by the caller.
        self.params[a * self.num_species + b]
    }
}

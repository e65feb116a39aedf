use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::errors::OtfError;

// --- Physics Types ---

/// Represents a single chemical element/species properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub symbol: String,
    pub atomic_number: u8,
    pub mass: f64,               // amu
    pub color_rgb: (u8, u8, u8), // For TUI visualization
}

impl Default for Species {
    fn default() -> Self {
        Self {
            symbol: "X".to_string(),
            atomic_number: 0,
            mass: 1.0,
            color_rgb: (255, 255, 255),
        }
    }
}

impl Species {
    pub fn new(symbol: &str, atomic_number: u8, mass: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            atomic_number,
            mass,
            ..Default::default()
        }
    }
}

/// Periodic cell. Columns of `vectors` are the lattice vectors a, b, c.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub vectors: Matrix3<f64>,
    pub inverse: Matrix3<f64>, // Precomputed for fractional conversion
}

impl Lattice {
    pub fn new(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>) -> Option<Self> {
        Self::from_matrix(Matrix3::from_columns(&[a, b, c]))
    }

    pub fn from_matrix(vectors: Matrix3<f64>) -> Option<Self> {
        let inverse = vectors.try_inverse()?;
        Some(Self { vectors, inverse })
    }

    pub fn cubic(edge: f64) -> Option<Self> {
        Self::from_matrix(Matrix3::from_diagonal_element(edge))
    }

    pub fn to_fractional(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.inverse * p.coords)
    }

    pub fn to_cartesian(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.vectors * p.coords)
    }

    pub fn volume(&self) -> f64 {
        self.vectors.determinant().abs()
    }

    /// Perpendicular heights of the cell along a, b and c.
    /// Used to decide how many periodic images a cutoff sphere touches.
    pub fn heights(&self) -> Vector3<f64> {
        let a = self.vectors.column(0).into_owned();
        let b = self.vectors.column(1).into_owned();
        let c = self.vectors.column(2).into_owned();
        let v = self.volume();
        Vector3::new(
            v / b.cross(&c).norm(),
            v / c.cross(&a).norm(),
            v / a.cross(&b).norm(),
        )
    }

    /// Applies a homogeneous deformation `(I + strain)` to the cell.
    pub fn deformed(&self, strain: &Matrix3<f64>) -> Option<Self> {
        Self::from_matrix((Matrix3::identity() + strain) * self.vectors)
    }
}

// --- Configuration ---

/// One simulation snapshot: positions, species labels, cell and interaction cutoff.
///
/// Immutable after construction; the constructor is the only place the
/// geometric invariants are checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    positions: Vec<Point3<f64>>,
    species: Vec<usize>,
    lattice: Lattice,
    cutoff: f64,
}

impl Configuration {
    pub fn new(
        positions: Vec<Point3<f64>>,
        species: Vec<usize>,
        lattice: Lattice,
        cutoff: f64,
    ) -> Result<Self, OtfError> {
        if positions.len() != species.len() {
            return Err(OtfError::InvalidConfiguration(format!(
                "{} positions but {} species labels",
                positions.len(),
                species.len()
            )));
        }
        if !(cutoff.is_finite() && cutoff > 0.0) {
            return Err(OtfError::InvalidConfiguration(format!(
                "cutoff must be positive, got {}",
                cutoff
            )));
        }
        if positions
            .iter()
            .any(|p| p.coords.iter().any(|c| !c.is_finite()))
        {
            return Err(OtfError::InvalidConfiguration(
                "non-finite atomic coordinates".to_string(),
            ));
        }
        if lattice.volume() < 1e-12 {
            return Err(OtfError::InvalidConfiguration(
                "degenerate periodic cell".to_string(),
            ));
        }
        Ok(Self {
            positions,
            species,
            lattice,
            cutoff,
        })
    }

    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    pub fn species(&self) -> &[usize] {
        &self.species
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Cubic fcc supercell of `cells^3` conventional cells. `basis_species` assigns a
    /// species to each of the four basis sites, e.g. `[0, 0, 1, 1]` for an L1_0 layering.
    pub fn fcc(
        lattice_constant: f64,
        cells: usize,
        basis_species: [usize; 4],
        cutoff: f64,
    ) -> Result<Self, OtfError> {
        const BASIS: [[f64; 3]; 4] = [[0.0, 0.0, 0.0], [0.5, 0.5, 0.0], [0.5, 0.0, 0.5], [0.0, 0.5, 0.5]];

        if cells == 0 {
            return Err(OtfError::InvalidConfiguration("fcc supercell needs at least one cell".to_string()));
        }
        let lattice = Lattice::cubic(lattice_constant * cells as f64).ok_or_else(|| {
            OtfError::InvalidConfiguration(format!("invalid lattice constant {}", lattice_constant))
        })?;

        let n = 4 * cells.pow(3);
        let mut positions = Vec::with_capacity(n);
        let mut species = Vec::with_capacity(n);
        for i in 0..cells {
            for j in 0..cells {
                for k in 0..cells {
                    for (site, b) in BASIS.iter().enumerate() {
                        positions.push(Point3::new(
                            (i as f64 + b[0]) * lattice_constant,
                            (j as f64 + b[1]) * lattice_constant,
                            (k as f64 + b[2]) * lattice_constant,
                        ));
                        species.push(basis_species[site]);
                    }
                }
            }
        }
        Self::new(positions, species, lattice, cutoff)
    }

    /// Largest species index present, if any.
    pub fn max_species(&self) -> Option<usize> {
        self.species.iter().copied().max()
    }

    /// Counts atoms per species, for a table of `n_species` entries.
    pub fn composition(&self, n_species: usize) -> Vec<usize> {
        let mut counts = vec![0; n_species];
        for &s in &self.species {
            if s < n_species {
                counts[s] += 1;
            }
        }
        counts
    }

    /// Returns a copy with every position and the cell deformed by `(I + strain)`.
    pub fn strained(&self, strain: &Matrix3<f64>) -> Result<Self, OtfError> {
        let lattice = self.lattice.deformed(strain).ok_or_else(|| {
            OtfError::InvalidConfiguration("strain produced a singular cell".to_string())
        })?;
        let map = Matrix3::identity() + strain;
        let positions = self
            .positions
            .iter()
            .map(|p| Point3::from(map * p.coords))
            .collect();
        Self::new(positions, self.species.clone(), lattice, self.cutoff)
    }

    /// Returns a copy with a single atom displaced.
    pub fn displaced(&self, atom: usize, delta: Vector3<f64>) -> Result<Self, OtfError> {
        let mut positions = self.positions.clone();
        let p = positions.get_mut(atom).ok_or_else(|| {
            OtfError::InvalidConfiguration(format!("atom index {} out of range", atom))
        })?;
        *p += delta;
        Self::new(positions, self.species.clone(), self.lattice.clone(), self.cutoff)
    }
}

// --- Labels ---

/// Symmetric stress in the order [xx, xy, xz, yy, yz, zz].
pub type Voigt = [f64; 6];

pub fn voigt_from_tensor(t: &Matrix3<f64>) -> Voigt {
    [
        t[(0, 0)],
        t[(0, 1)],
        t[(0, 2)],
        t[(1, 1)],
        t[(1, 2)],
        t[(2, 2)],
    ]
}

pub fn tensor_from_voigt(v: &Voigt) -> Matrix3<f64> {
    Matrix3::new(v[0], v[1], v[2], v[1], v[3], v[4], v[2], v[4], v[5])
}

/// Ground-truth labels attached to a training configuration.
/// A `None` label is excluded from the fit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Labels {
    pub energy: Option<f64>,
    pub forces: Option<Vec<Vector3<f64>>>,
    pub stress: Option<Voigt>,
}

impl Labels {
    pub fn is_empty(&self) -> bool {
        self.energy.is_none() && self.forces.is_none() && self.stress.is_none()
    }

    /// Number of scalar observations carried by these labels.
    pub fn count(&self) -> usize {
        self.energy.map_or(0, |_| 1)
            + self.forces.as_ref().map_or(0, |f| 3 * f.len())
            + self.stress.map_or(0, |_| 6)
    }
}

/// A labelled configuration. Never mutated once handed to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub configuration: Configuration,
    pub labels: Labels,
    pub step: u64,
}

impl TrainingRecord {
    pub fn new(configuration: Configuration, labels: Labels, step: u64) -> Self {
        Self {
            configuration,
            labels,
            step,
        }
    }
}

/// Energy, forces and stress of one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Efs {
    pub energy: f64,
    pub forces: Vec<Vector3<f64>>,
    pub stress: Voigt,
}

impl Efs {
    pub fn zeros(n_atoms: usize) -> Self {
        Self {
            energy: 0.0,
            forces: vec![Vector3::zeros(); n_atoms],
            stress: [0.0; 6],
        }
    }

    /// Flattened layout [E, F_0x, F_0y, F_0z, ..., S_xx, ..., S_zz].
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(1 + 3 * self.forces.len() + 6);
        out.push(self.energy);
        for f in &self.forces {
            out.extend_from_slice(&[f.x, f.y, f.z]);
        }
        out.extend_from_slice(&self.stress);
        out
    }

    /// Inverse of [`Efs::flatten`]. `None` if the length does not match `n_atoms`.
    pub fn from_flat(values: &[f64], n_atoms: usize) -> Option<Self> {
        if values.len() != 1 + 3 * n_atoms + 6 {
            return None;
        }
        let forces = values[1..1 + 3 * n_atoms]
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        let mut stress = [0.0; 6];
        stress.copy_from_slice(&values[1 + 3 * n_atoms..]);
        Some(Self {
            energy: values[0],
            forces,
            stress,
        })
    }
}

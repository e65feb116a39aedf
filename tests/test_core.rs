mod common;

use nalgebra::{Matrix3, Point3, Vector3};

use otf_learner::core::chemistry::{EnergyCorrection, PairParams, PairTable};
use otf_learner::core::domain::{tensor_from_voigt, voigt_from_tensor, Configuration, Efs, Lattice};
use otf_learner::core::spatial::{neighbor_lists, wrap_point};
use otf_learner::OtfError;

#[test]
fn test_configuration_validation() {
    let cell = Lattice::cubic(5.0).unwrap();
    let p = vec![Point3::origin(), Point3::new(1.0, 1.0, 1.0)];

    assert!(matches!(
        Configuration::new(p.clone(), vec![0], cell.clone(), 3.0),
        Err(OtfError::InvalidConfiguration(_))
    ));
    assert!(Configuration::new(p.clone(), vec![0, 0], cell.clone(), 0.0).is_err());
    assert!(Configuration::new(p.clone(), vec![0, 0], cell.clone(), f64::NAN).is_err());
    assert!(Configuration::new(
        vec![Point3::origin(), Point3::new(f64::INFINITY, 0.0, 0.0)],
        vec![0, 0],
        cell.clone(),
        3.0
    )
    .is_err());
    assert!(Lattice::from_matrix(Matrix3::zeros()).is_none());
    let from_vectors = Lattice::new(Vector3::x() * 5.0, Vector3::y() * 5.0, Vector3::z() * 5.0).unwrap();
    assert_eq!(from_vectors, cell);

    let ok = Configuration::new(p, vec![0, 1], cell, 3.0).unwrap();
    assert_eq!(ok.len(), 2);
    assert_eq!(ok.max_species(), Some(1));
    assert_eq!(ok.composition(3), vec![1, 1, 0]);
}

#[test]
fn test_fcc_builder() {
    let c = Configuration::fcc(4.0, 2, [0, 0, 1, 1], 3.5).unwrap();
    assert_eq!(c.len(), 32);
    assert_eq!(c.composition(2), vec![16, 16]);
    assert!((c.lattice().volume() - 512.0).abs() < 1e-9);
    assert!(Configuration::fcc(4.0, 0, [0; 4], 3.5).is_err());
}

#[test]
fn test_zero_energy_correction_is_identity() {
    let config = common::rattled_fcc(1, 0.05, 4.0);
    let zeros = EnergyCorrection::zeros(2);
    for energy in [-12.75, 0.0, 3.5e3] {
        assert_eq!(zeros.apply(energy, config.species()), energy);
    }
}

#[test]
fn test_energy_correction_sums_per_species() {
    let correction = EnergyCorrection::new(vec![-1.0, 0.25]);
    // Two atoms of each species.
    let offset = correction.offset_for(&[0, 0, 1, 1]);
    assert!((offset - (-1.5)).abs() < 1e-12);
    assert!((correction.apply(-10.0, &[0, 0, 1, 1]) - (-8.5)).abs() < 1e-12);
}

#[test]
fn test_lorentz_berthelot_mixing() {
    let table = PairTable::lorentz_berthelot(&[
        PairParams { epsilon: 0.01, sigma: 3.0 },
        PairParams { epsilon: 0.04, sigma: 4.0 },
    ]);
    assert_eq!(table.num_species(), 2);
    let mixed = table.get(0, 1);
    assert!((mixed.epsilon - 0.02).abs() < 1e-12);
    assert!((mixed.sigma - 3.5).abs() < 1e-12);
    assert_eq!(table.get(1, 0), mixed);
}

#[test]
fn test_neighbor_lists_fcc_shells() {
    let a = 4.0;
    // Nearest-neighbour distance a / sqrt(2); 12 neighbours in the first shell.
    let c = Configuration::fcc(a, 1, [0; 4], 3.0).unwrap();
    let lists = neighbor_lists(&c, 3.0);
    for list in &lists {
        assert_eq!(list.len(), 12);
        for nb in list {
            assert!((nb.distance - a / 2f64.sqrt()).abs() < 1e-9);
            assert!((nb.delta.norm() - nb.distance).abs() < 1e-12);
        }
    }

    // Second shell (distance a) adds 6 more; the cutoff exceeds the cell here.
    let lists = neighbor_lists(&c, 4.5);
    assert!(lists.iter().all(|l| l.len() == 18));
}

#[test]
fn test_neighbor_lists_symmetric_pairs() {
    let c = common::rattled_fcc(1, 0.1, 4.0);
    let lists = neighbor_lists(&c, 4.0);
    let total: usize = lists.iter().map(|l| l.len()).sum();
    assert_eq!(total % 2, 0);
    for (i, list) in lists.iter().enumerate() {
        for nb in list {
            let back = lists[nb.neighbor]
                .iter()
                .any(|m| m.neighbor == i && (m.delta + nb.delta).norm() < 1e-9);
            assert!(back, "pair {} -> {} has no reverse", i, nb.neighbor);
        }
    }
}

#[test]
fn test_wrap_point_into_cell() {
    let cell = Lattice::cubic(5.0).unwrap();
    let p = wrap_point(&Point3::new(-0.5, 5.5, 12.0), &cell);
    assert!((p - Point3::new(4.5, 0.5, 2.0)).norm() < 1e-12);
}

#[test]
fn test_voigt_and_flat_layout() {
    let t = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 5.0, 3.0, 5.0, 6.0);
    let v = voigt_from_tensor(&t);
    assert_eq!(v, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(tensor_from_voigt(&v), t);

    let efs = Efs {
        energy: -1.0,
        forces: vec![Vector3::new(0.1, 0.2, 0.3)],
        stress: v,
    };
    let flat = efs.flatten();
    assert_eq!(flat.len(), 1 + 3 + 6);
    assert_eq!(flat[0], -1.0);
    assert_eq!(&flat[1..4], &[0.1, 0.2, 0.3]);
    assert!(Efs::from_flat(&flat, 2).is_none());
    assert_eq!(Efs::from_flat(&flat, 1).unwrap().forces, efs.forces);
}

mod common;

use common::{argon_krypton, lj_argon_krypton, rattled_fcc, small_config, MockOracle};
use std::fs;
use std::sync::Arc;

use anyhow::Result;
use nalgebra::{Matrix3, Vector3};

use otf_learner::core::chemistry::PairParams;
use otf_learner::core::domain::{Configuration, Efs};
use otf_learner::engine::external::gulp::GulpOracle;
use otf_learner::engine::oracle::{GroundTruth, Oracle, OracleAdapter};
use otf_learner::engine::pair::LennardJones;

const GULP_OUTPUT: &str = "
  Components of energy :
  Interatomic potentials     =          -0.34567890 eV
  Total lattice energy       =         -12.34567890 eV
  Total lattice energy       =       -1191.1234     kJ/(mole unit cells)

  Final Cartesian derivatives :

--------------------------------------------------------------------------------
   No.  Atomic          x             y             z           Radius
        Label       (eV/Angs)     (eV/Angs)    (eV/Angs)      (eV/Angs)
--------------------------------------------------------------------------------
      1 Ar    c       0.100000     -0.200000      0.300000      0.000000
      2 Kr    c      -0.100000      0.200000     -0.300000      0.000000
--------------------------------------------------------------------------------

  Stress tensor :

              x             y             z
      -----------------------------------------------------------
       x       1.60217662    0.32043532    0.00000000
       y       0.32043532   -3.20435324    0.00000000
       z       0.00000000    0.00000000    0.80108831
      -----------------------------------------------------------
";

fn gulp() -> GulpOracle {
    GulpOracle::new("gulp", "lennard epsilon\nAr core Ar core 0.0103 3.405 0.0 8.0\n", argon_krypton()).unwrap()
}

#[test]
fn test_gulp_parses_single_point() {
    let truth = gulp().parse_output(GULP_OUTPUT, 2).unwrap();

    assert!((truth.energy + 12.3456789).abs() < 1e-12);
    assert_eq!(truth.forces.len(), 2);
    assert!((truth.forces[0] - Vector3::new(-0.1, 0.2, -0.3)).norm() < 1e-12);
    assert!((truth.forces[1] - Vector3::new(0.1, -0.2, 0.3)).norm() < 1e-12);

    // GPa -> eV/A^3, sign flipped to -(1/V) dE/dstrain.
    let expected = [-0.01, -0.002, 0.0, 0.02, 0.0, -0.005];
    for (got, want) in truth.stress.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-9, "stress {} vs {}", got, want);
    }
}

#[test]
fn test_gulp_rejects_incomplete_output() {
    let oracle = gulp();

    let err = oracle.parse_output(GULP_OUTPUT, 3).unwrap_err();
    assert!(format!("{:#}", err).contains("atom count mismatch"));

    let no_energy = GULP_OUTPUT.replace("Total lattice energy", "Total energy");
    assert!(oracle.parse_output(&no_energy, 2).is_err());

    let no_stress = GULP_OUTPUT.replace("Stress tensor", "Strain tensor");
    assert!(oracle.parse_output(&no_stress, 2).is_err());

    let collapsed = format!("{}\n  Interatomic distance too small\n", GULP_OUTPUT);
    let err = oracle.parse_output(&collapsed, 2).unwrap_err();
    assert!(err.to_string().contains("Geometric collapse"));
}

#[test]
fn test_lj_forces_and_stress_match_finite_differences() {
    let oracle = lj_argon_krypton();
    let config = rattled_fcc(2, 0.1, 4.5);
    let truth = oracle.compute(&config).unwrap();
    let energy = |c: &Configuration| oracle.compute(c).unwrap().energy;

    let h = 1e-5;
    for atom in [0, 7, 30] {
        for axis in 0..3 {
            let mut delta = Vector3::zeros();
            delta[axis] = h;
            let fd = -(energy(&config.displaced(atom, delta).unwrap())
                - energy(&config.displaced(atom, -delta).unwrap()))
                / (2.0 * h);
            let analytic = truth.forces[atom][axis];
            assert!((fd - analytic).abs() < 1e-6, "force {} {}: {} vs {}", atom, axis, fd, analytic);
        }
    }

    let volume = config.lattice().volume();
    for (voigt, (a, b)) in [(0, (0, 0)), (2, (0, 2)), (3, (1, 1)), (4, (1, 2))] {
        let mut strain = Matrix3::zeros();
        strain[(a, b)] = h;
        let fd = -(energy(&config.strained(&strain).unwrap()) - energy(&config.strained(&(-strain)).unwrap()))
            / (2.0 * h)
            / volume;
        let analytic = truth.stress[voigt];
        assert!((fd - analytic).abs() < 1e-8, "stress {}: {} vs {}", voigt, fd, analytic);
    }

    let net: Vector3<f64> = truth.forces.iter().sum();
    assert!(net.norm() < 1e-10);
}

#[test]
fn test_lj_perfect_crystal_is_force_free() {
    let oracle = LennardJones::new(&[PairParams { epsilon: 0.0103, sigma: 3.405 }], 6.0);
    let config = Configuration::fcc(5.26, 2, [0; 4], 4.0).unwrap();
    let truth = oracle.compute(&config).unwrap();

    assert!(truth.forces.iter().all(|f| f.norm() < 1e-10));
    let [xx, xy, xz, yy, yz, zz] = truth.stress;
    assert!((xx - yy).abs() < 1e-10 && (yy - zz).abs() < 1e-10);
    assert!(xy.abs() < 1e-10 && xz.abs() < 1e-10 && yz.abs() < 1e-10);
    assert!(truth.energy < 0.0);

    let mixed = Configuration::fcc(5.26, 1, [0, 0, 1, 1], 4.0).unwrap();
    assert!(oracle.compute(&mixed).is_err());
}

/// Oracle returning a fixed, possibly malformed, result.
struct FixedOracle(GroundTruth);

impl Oracle for FixedOracle {
    fn compute(&self, _config: &Configuration) -> Result<GroundTruth> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &str {
        "Fixed"
    }
}

#[test]
fn test_adapter_validates_shapes() {
    let config = small_config();

    let short = OracleAdapter::new(Arc::new(FixedOracle(Efs::zeros(3))), argon_krypton());
    let err = short.query(&config, 0).unwrap_err();
    assert!(err.to_string().contains("3 force rows for 4 atoms"));

    let mut nan = Efs::zeros(4);
    nan.stress[2] = f64::NAN;
    let bad = OracleAdapter::new(Arc::new(FixedOracle(nan)), argon_krypton());
    assert!(bad.query(&config, 0).is_err());

    let failing = OracleAdapter::new(Arc::new(MockOracle::failing()), argon_krypton());
    let err = failing.query(&config, 0).unwrap_err();
    assert!(err.to_string().contains("SCF did not converge"));
}

#[test]
fn test_adapter_dumps_queried_frames() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let oracle = Arc::new(MockOracle::new());
    let adapter = OracleAdapter::new(oracle.clone(), argon_krypton())
        .with_dump(Box::new(move |step| root.join(format!("oracle_{:06}.xyz", step))));

    let truth = adapter.query(&small_config(), 42).unwrap();
    assert_eq!(truth.energy, -6.0);
    assert_eq!(oracle.call_count(), 1);

    let text = fs::read_to_string(dir.path().join("oracle_000042.xyz")).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("4"));
    let header = lines.next().unwrap();
    assert!(header.starts_with("Lattice=\""));
    assert!(header.contains("Properties=species:S:1:pos:R:3:forces:R:3"));
    assert!(header.contains("energy=-6.000000000"));
    assert_eq!(lines.filter(|l| l.starts_with("Ar ")).count(), 4);
}

#[test]
fn test_adapter_survives_failed_dump() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();

    let adapter = OracleAdapter::new(Arc::new(MockOracle::new()), argon_krypton())
        .with_dump(Box::new(move |step| blocker.join("frames").join(format!("{}.xyz", step))));
    assert!(adapter.query(&small_config(), 1).is_ok());
}

#[test]
fn test_lj_rejects_collapsed_geometry() {
    let oracle = lj_argon_krypton();
    let config = small_config();
    let collapsed = config.displaced(1, Vector3::new(-1.3, -0.2, -0.1)).unwrap();
    let err = oracle.compute(&collapsed).unwrap_err();
    assert!(err.to_string().contains("overlap"));
}

#[test]
fn test_dump_writes_stress_in_reader_sign() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut truth = Efs::zeros(4);
    truth.stress = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    let adapter = OracleAdapter::new(Arc::new(FixedOracle(truth)), argon_krypton())
        .with_dump(Box::new(move |step| root.join(format!("{}.xyz", step))));
    let returned = adapter.query(&small_config(), 3).unwrap();
    assert_eq!(returned.stress, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let text = fs::read_to_string(dir.path().join("3.xyz")).unwrap();
    let header = text.lines().nth(1).unwrap();
    let start = header.find("stress=\"").unwrap() + "stress=\"".len();
    let end = start + header[start..].find('"').unwrap();
    let written: Vec<f64> = header[start..end]
        .split_whitespace()
        .map(|v| v.parse().unwrap())
        .collect();
    assert_eq!(written, vec![-1.0, -2.0, -3.0, -2.0, -4.0, -5.0, -3.0, -5.0, -6.0]);
}

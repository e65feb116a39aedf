mod common;

use common::{argon_krypton, labels_from, lj_argon_krypton, rattled_fcc};
use nalgebra::{Matrix3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use otf_learner::core::domain::{Configuration, Labels, TrainingRecord};
use otf_learner::model::descriptor::{DescriptorSet, RadialBasis};
use otf_learner::model::optimizer::{optimize_hyperparameters, OptimizerMethod, OptimizerSettings};
use otf_learner::model::sparse_gp::{Hyperparameters, SparseGp};
use otf_learner::model::SurrogateModel;
use otf_learner::ModelError;

const CUTOFF: f64 = 4.5;

fn empty_model() -> SparseGp {
    let descriptors =
        DescriptorSet::new(argon_krypton().len(), vec![RadialBasis::new(6, CUTOFF)]).unwrap();
    SparseGp::new(descriptors, Hyperparameters::default())
}

fn training_config() -> Configuration {
    rattled_fcc(1, 0.15, CUTOFF)
}

/// GP trained on one labelled frame, with every atom of it as a sparse point.
fn trained_model() -> SparseGp {
    let oracle = lj_argon_krypton();
    let config = training_config();
    let labels = labels_from(&oracle, &config);

    let mut model = empty_model();
    let record = model
        .add_training_record(TrainingRecord::new(config.clone(), labels, 0))
        .unwrap();
    let added = model.add_specific_environments(record, &[0, 1, 2, 3]).unwrap();
    assert_eq!(added, 4);
    model.refit().unwrap();
    model
}

#[test]
fn test_unfitted_and_empty_models() {
    let mut model = empty_model();
    let config = training_config();

    assert!(!model.is_fitted());
    assert!(matches!(model.predict_local_variances(&config), Err(ModelError::Unfitted)));
    assert!(matches!(model.predict_efs(&config), Err(ModelError::Unfitted)));
    assert!(matches!(model.export(), Err(ModelError::Unfitted)));
    assert!(matches!(model.refit(), Err(ModelError::EmptyTrainingSet(_))));

    // A record without sparse points still cannot be fitted.
    let labels = labels_from(&lj_argon_krypton(), &config);
    model.add_training_record(TrainingRecord::new(config, labels, 0)).unwrap();
    assert!(matches!(model.refit(), Err(ModelError::EmptyTrainingSet(_))));
}

#[test]
fn test_training_record_validation() {
    let mut model = empty_model();
    let config = training_config();
    let mut labels = labels_from(&lj_argon_krypton(), &config);

    let empty = TrainingRecord::new(config.clone(), Labels::default(), 0);
    assert!(model.add_training_record(empty).is_err());

    if let Some(forces) = labels.forces.as_mut() {
        forces.pop();
    }
    let short = TrainingRecord::new(config.clone(), labels.clone(), 0);
    assert!(matches!(
        model.add_training_record(short),
        Err(ModelError::InvalidReference(_))
    ));

    labels.forces = None;
    labels.energy = Some(f64::NAN);
    let nan = TrainingRecord::new(config.clone(), labels, 0);
    assert!(matches!(model.add_training_record(nan), Err(ModelError::Numerical(_))));

    // Descriptor cutoff larger than the configuration cutoff.
    let narrow = rattled_fcc(1, 0.15, 3.0);
    let narrow_labels = labels_from(&lj_argon_krypton(), &narrow);
    assert!(matches!(
        model.add_training_record(TrainingRecord::new(narrow, narrow_labels, 0)),
        Err(ModelError::DescriptorMismatch(_))
    ));

    assert!(model.training_records().is_empty());
}

#[test]
fn test_sparse_environment_selection() {
    let oracle = lj_argon_krypton();
    let mut model = empty_model();
    let config = training_config();
    let labels = labels_from(&oracle, &config);
    let record = model
        .add_training_record(TrainingRecord::new(config, labels, 0))
        .unwrap();

    assert_eq!(model.add_specific_environments(record, &[1, 2]).unwrap(), 2);
    // Duplicates are skipped.
    assert_eq!(model.add_specific_environments(record, &[2, 1, 3]).unwrap(), 1);
    assert_eq!(model.sparse_count(), 3);

    assert!(matches!(
        model.add_specific_environments(record, &[0, 9]),
        Err(ModelError::InvalidReference(_))
    ));
    assert!(matches!(
        model.add_specific_environments(5, &[0]),
        Err(ModelError::InvalidReference(_))
    ));
    assert_eq!(model.sparse_count(), 3);

    // Only atom 0 is still free; a larger request is capped.
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let picked = model.add_random_environments(record, 4, &mut rng).unwrap();
    assert_eq!(picked, vec![0]);
    assert_eq!(model.sparse_count(), 4);
    assert!(model.add_random_environments(record, 2, &mut rng).unwrap().is_empty());
}

#[test]
fn test_variance_vanishes_at_sparse_points() {
    let model = trained_model();
    let s2 = model.signal_std().powi(2);
    assert_eq!(model.params().signal, model.signal_std());
    let atoms: Vec<(usize, usize)> = model.sparse_environments().iter().map(|sp| (sp.record, sp.atom)).collect();
    assert_eq!(atoms, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);

    let at_sparse = model.predict_local_variances(&training_config()).unwrap();
    assert_eq!(at_sparse.len(), 4);
    for v in &at_sparse {
        assert!(v.abs() < 1e-5 * s2, "variance {} at a sparse point", v);
    }

    let away = model
        .predict_local_variances(&rattled_fcc(1, 0.45, CUTOFF))
        .unwrap();
    let max_away = away.iter().cloned().fold(0.0, f64::max);
    let max_sparse = at_sparse.iter().cloned().fold(0.0, f64::max);
    assert!(max_away > max_sparse);
    assert!(away.iter().all(|v| *v > -1e-8 && *v <= s2 * (1.0 + 1e-9)));
}

#[test]
fn test_predictions_are_consistent_derivatives() {
    let model = trained_model();
    let config = rattled_fcc(1, 0.25, CUTOFF);
    let prediction = model.predict_efs(&config).unwrap();
    let energy = |c: &Configuration| model.predict_efs(c).unwrap().mean.energy;

    let h = 1e-4;
    for atom in [0, 3] {
        for axis in 0..3 {
            let mut delta = Vector3::zeros();
            delta[axis] = h;
            let plus = energy(&config.displaced(atom, delta).unwrap());
            let minus = energy(&config.displaced(atom, -delta).unwrap());
            let fd = -(plus - minus) / (2.0 * h);
            let analytic = prediction.mean.forces[atom][axis];
            assert!(
                (fd - analytic).abs() < 1e-5 + 1e-4 * analytic.abs(),
                "force {} {}: fd {} vs {}",
                atom,
                axis,
                fd,
                analytic
            );
        }
    }

    let volume = config.lattice().volume();
    for (voigt, (a, b)) in [(0, (0, 0)), (1, (0, 1)), (5, (2, 2))] {
        let mut strain = Matrix3::zeros();
        strain[(a, b)] = h;
        let plus = energy(&config.strained(&strain).unwrap());
        let minus = energy(&config.strained(&(-strain)).unwrap());
        let fd = -(plus - minus) / (2.0 * h) / volume;
        let analytic = prediction.mean.stress[voigt];
        assert!(
            (fd - analytic).abs() < 1e-6 + 1e-4 * analytic.abs(),
            "stress {}: fd {} vs {}",
            voigt,
            fd,
            analytic
        );
    }

    let variances = prediction.variance.flatten();
    assert!(variances.iter().all(|v| v.is_finite() && *v > -1e-10));
    assert!(prediction.energy_std().is_finite());
    assert!(prediction.max_force_std() >= 0.0);
}

#[test]
fn test_likelihood_gradient_matches_finite_differences() {
    let mut model = trained_model();
    let base = model.hyperparameters();
    let lml = model.likelihood().unwrap();
    assert!(lml.value.is_finite());
    assert_eq!(lml.gradient.len(), base.len());

    for i in 0..base.len() {
        let step = base[i] * 1e-5;
        let mut at = |offset: f64| {
            let mut x = base.clone();
            x[i] += offset;
            model.set_hyperparameters(&x).unwrap();
            model.likelihood().unwrap().value
        };
        let fd = (at(step) - at(-step)) / (2.0 * step);
        let g = lml.gradient[i];
        assert!(
            (fd - g).abs() < 1e-3 * (1.0 + g.abs()),
            "{}: fd {} vs analytic {}",
            model.hyperparameter_names()[i],
            fd,
            g
        );
    }
}

#[test]
fn test_jitter_setting_invalidates_fit() {
    let model = trained_model();
    let reference = model.predict_local_variances(&training_config()).unwrap();

    let mut rejittered = model.clone().with_jitter(1e-6);
    assert!(!rejittered.is_fitted());
    rejittered.refit().unwrap();
    let variances = rejittered.predict_local_variances(&training_config()).unwrap();
    for (a, b) in reference.iter().zip(&variances) {
        assert!((a - b).abs() < 1e-3);
    }
}

#[test]
fn test_rejected_hyperparameters_leave_model_untouched() {
    let mut model = trained_model();
    let before = model.hyperparameters();
    let lml = model.likelihood().unwrap().value;

    assert!(model.set_hyperparameters(&[2.0, -0.1, 0.05, 0.005]).is_err());
    assert!(model.set_hyperparameters(&[2.0, 0.05, f64::NAN, 0.005]).is_err());
    assert!(model.set_hyperparameters(&[2.0, 0.05]).is_err());

    assert_eq!(model.hyperparameters(), before);
    assert!(model.is_fitted());
    assert_eq!(model.likelihood().unwrap().value, lml);
}

#[test]
fn test_optimizer_respects_bounds_and_never_worsens() {
    let bounds = vec![(0.5, 5.0), (1e-3, 0.5), (1e-3, 0.5), (1e-4, 0.1)];
    for method in [OptimizerMethod::ProjectedGradient, OptimizerMethod::NelderMead] {
        let mut model = trained_model();
        let settings = OptimizerSettings {
            method,
            max_iterations: 15,
            tolerance: 1e-6,
            bounds: Some(bounds.clone()),
        };
        let report = optimize_hyperparameters(&mut model, &settings).unwrap();

        assert!(
            report.likelihood_after >= report.likelihood_before - 1e-9,
            "{}: {} < {}",
            method,
            report.likelihood_after,
            report.likelihood_before
        );
        assert_eq!(model.hyperparameters(), report.hyperparameters);
        assert!(model.is_fitted());
        for (x, (lo, hi)) in report.hyperparameters.iter().zip(&bounds) {
            assert!(*x >= lo * (1.0 - 1e-12) && *x <= hi * (1.0 + 1e-12), "{} outside [{}, {}]", x, lo, hi);
        }
    }
}

#[test]
fn test_optimizer_rejects_bad_bounds() {
    let mut model = trained_model();
    let settings = OptimizerSettings {
        bounds: Some(vec![(1.0, 2.0)]),
        ..Default::default()
    };
    assert!(matches!(
        optimize_hyperparameters(&mut model, &settings),
        Err(ModelError::Hyperparameters(_))
    ));

    let inverted = OptimizerSettings {
        bounds: Some(vec![(2.0, 1.0), (1e-3, 1.0), (1e-3, 1.0), (1e-4, 1.0)]),
        ..Default::default()
    };
    assert!(optimize_hyperparameters(&mut model, &inverted).is_err());
    assert_eq!("nm".parse::<OptimizerMethod>().unwrap(), OptimizerMethod::NelderMead);
    assert!("simplex-ish".parse::<OptimizerMethod>().is_err());
}

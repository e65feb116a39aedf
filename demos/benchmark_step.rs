use otf_learner::core::chemistry::PairParams;
use otf_learner::core::domain::{Configuration, Species};
use otf_learner::engine::pair::LennardJones;
use otf_learner::learner::params::LearnerParams;
use otf_learner::learner::telemetry::MemoryTelemetry;
use otf_learner::md::verlet::VelocityVerlet;
use otf_learner::model::descriptor::{DescriptorSet, RadialBasis};
use otf_learner::model::sparse_gp::{Hyperparameters, SparseGp};
use otf_learner::OtfController;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let species = vec![Species::new("Ar", 18, 39.948)];
    let oracle = Arc::new(LennardJones::new(&[PairParams { epsilon: 0.0103, sigma: 3.405 }], 7.0));

    let initial = Configuration::fcc(5.26, 3, [0; 4], 5.0)?;
    let descriptors = DescriptorSet::new(1, vec![RadialBasis::new(8, 5.0)])?;
    let model = SparseGp::new(descriptors, Hyperparameters::default());

    let params = LearnerParams {
        model_path: dir.path().join("model.json"),
        log_path: None,
        ..Default::default()
    };
    let telemetry = MemoryTelemetry::new();
    let mut controller = OtfController::builder(model, oracle, species.clone())
        .params(params)
        .telemetry(telemetry.clone())
        .build()?;

    let mut engine = VelocityVerlet::new(&initial, &species, 2.0)?.with_temperature(40.0, 7)?;

    let start = Instant::now();
    for _ in 0..200 {
        controller.on_engine_step(&mut engine)?;
        engine.advance()?;
    }
    let duration = start.elapsed();

    println!(
        "200 steps of {} atoms took: {:?} ({} oracle calls, {} metric rows)",
        initial.len(),
        duration,
        controller.state().dft_calls,
        telemetry.len()
    );
    Ok(())
}

//! Strategy objects injected into the controller.

use crate::learner::controller::ControllerState;
use crate::md::Thermo;

/// Decides after an oracle call whether to re-optimize hyperparameters.
pub trait OptimizationSchedule: Send {
    fn should_optimize(&self, state: &ControllerState, thermo: Option<&Thermo>, step: u64) -> bool;
}

/// The default schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverOptimize;

impl OptimizationSchedule for NeverOptimize {
    fn should_optimize(&self, _: &ControllerState, _: Option<&Thermo>, _: u64) -> bool {
        false
    }
}

/// Optimizes on every `every`-th oracle call, optionally only up to `until` calls.
#[derive(Debug, Clone, Copy)]
pub struct EveryNCalls {
    pub every: u64,
    pub until: Option<u64>,
}

impl EveryNCalls {
    pub fn new(every: u64) -> Self {
        Self { every, until: None }
    }

    pub fn until(mut self, dft_calls: u64) -> Self {
        self.until = Some(dft_calls);
        self
    }
}

impl OptimizationSchedule for EveryNCalls {
    fn should_optimize(&self, state: &ControllerState, _: Option<&Thermo>, _: u64) -> bool {
        self.every > 0
            && state.dft_calls % self.every == 0
            && self.until.map_or(true, |limit| state.dft_calls <= limit)
    }
}

impl<F> OptimizationSchedule for F
where
    F: Fn(&ControllerState, Option<&Thermo>, u64) -> bool + Send,
{
    fn should_optimize(&self, state: &ControllerState, thermo: Option<&Thermo>, step: u64) -> bool {
        self(state, thermo, step)
    }
}

/// Called once after every successful model update and checkpoint.
pub trait PostUpdateHook: Send {
    fn after_update(&mut self, state: &ControllerState, step: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl PostUpdateHook for NoopHook {
    fn after_update(&mut self, _: &ControllerState, _: u64) {}
}

impl<F> PostUpdateHook for F
where
    F: FnMut(&ControllerState, u64) + Send,
{
    fn after_update(&mut self, state: &ControllerState, step: u64) {
        self(state, step)
    }
}

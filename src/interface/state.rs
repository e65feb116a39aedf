use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::core::domain::Configuration;
use crate::learner::params::LearnerParams;
use crate::learner::{LearnerEvent, StepMetrics};

// --- Constants ---
const HISTORY_CAPACITY: usize = 1000;
const LOG_CAPACITY: usize = 200;

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Dashboard,
    Analysis,
    StructureViewer,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Starting,
    Running,
    Paused,
    Finished,
    Error,
}

// --- Telemetry & Analytics ---

#[derive(Debug, Clone)]
pub struct Telemetry {
    // History queues for sparklines, keyed by MD step
    pub uncertainty_history: VecDeque<(u64, f64)>,
    pub force_mae_history: VecDeque<(u64, f64)>,
    pub temperature_history: VecDeque<(u64, f64)>,
    /// Steps on which the oracle was called.
    pub call_steps: VecDeque<u64>,

    pub max_uncertainty_seen: f64,
    pub latest: Option<StepMetrics>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            uncertainty_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            force_mae_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            temperature_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            call_steps: VecDeque::with_capacity(HISTORY_CAPACITY),
            max_uncertainty_seen: 0.0,
            latest: None,
        }
    }

    pub fn ingest(&mut self, metrics: &StepMetrics) {
        if let Some(u) = metrics.max_uncertainty.filter(|u| u.is_finite()) {
            push_bounded(&mut self.uncertainty_history, (metrics.step, u));
            self.max_uncertainty_seen = self.max_uncertainty_seen.max(u);
        }
        if let Some(fmae) = metrics.force_mae {
            push_bounded(&mut self.force_mae_history, (metrics.step, fmae));
        }
        if let Some(thermo) = metrics.thermo {
            push_bounded(&mut self.temperature_history, (metrics.step, thermo.temperature));
        }
        if metrics.called {
            push_bounded(&mut self.call_steps, metrics.step);
        }
        self.latest = Some(metrics.clone());
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T) {
    if queue.len() >= HISTORY_CAPACITY {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// Visualization state for the 3D viewer
#[derive(Debug, Clone)]
pub struct Viewport {
    pub azimuth: f64,
    pub elevation: f64,
    pub zoom: f64,
    pub auto_rotate: bool,
    pub last_tick: Instant,
}

impl Viewport {
    pub fn new() -> Self {
        Self {
            azimuth: 0.0,
            elevation: 0.3,
            zoom: 1.0,
            auto_rotate: true,
            last_tick: Instant::now(),
        }
    }

    pub fn tick(&mut self) {
        let now = Instant::now();
        if self.auto_rotate {
            let dt = now.duration_since(self.last_tick).as_secs_f64();
            self.azimuth += 0.5 * dt; // 0.5 rad/s
        }
        self.last_tick = now;
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest configuration with its per-atom uncertainty scores.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub configuration: Configuration,
    pub scores: Vec<f64>,
}

// --- The Master State ---

pub struct AppState {
    // System
    pub should_quit: bool,
    pub mode: AppMode,
    pub params: LearnerParams,
    pub species_symbols: Vec<String>,

    // Worker
    pub rx: Option<Receiver<LearnerEvent>>,
    pub worker_status: WorkerStatus,
    pause_flag: Option<Arc<AtomicBool>>,

    // Run data
    pub current_step: u64,
    pub dft_calls: u64,
    pub start_time: Instant,
    pub snapshot: Option<Snapshot>,
    pub failure: Option<String>,

    // Analytics
    pub telemetry: Telemetry,
    pub logs: VecDeque<String>,

    // UI
    pub viewport: Viewport,

    // Performance
    pub steps_per_second: f64,
    steps_counter: usize,
    last_rate_check: Instant,
}

impl AppState {
    pub fn new(params: LearnerParams, species_symbols: Vec<String>) -> Self {
        Self {
            should_quit: false,
            mode: AppMode::Dashboard,
            params,
            species_symbols,
            rx: None,
            worker_status: WorkerStatus::Idle,
            pause_flag: None,
            current_step: 0,
            dft_calls: 0,
            start_time: Instant::now(),
            snapshot: None,
            failure: None,
            telemetry: Telemetry::new(),
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            viewport: Viewport::new(),
            steps_per_second: 0.0,
            steps_counter: 0,
            last_rate_check: Instant::now(),
        }
    }

    pub fn set_channel(&mut self, rx: Receiver<LearnerEvent>) {
        self.rx = Some(rx);
        self.worker_status = WorkerStatus::Starting;
        self.start_time = Instant::now();
    }

    /// Shares the flag the worker polls between MD steps.
    pub fn set_pause_flag(&mut self, flag: Arc<AtomicBool>) {
        self.pause_flag = Some(flag);
    }

    pub fn tick(&mut self) {
        self.viewport.tick();
        self.calc_metrics();

        if let Some(rx) = self.rx.clone() {
            for _ in 0..100 {
                match rx.try_recv() {
                    Ok(evt) => self.handle_event(evt),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if self.worker_status != WorkerStatus::Error {
                            self.worker_status = WorkerStatus::Finished;
                        }
                        self.log("Worker disconnected.");
                        self.rx = None;
                        break;
                    }
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: LearnerEvent) {
        match event {
            LearnerEvent::Log(msg) => self.log(msg),

            LearnerEvent::Step(metrics) => {
                if self.worker_status != WorkerStatus::Paused {
                    self.worker_status = WorkerStatus::Running;
                }
                self.current_step = metrics.step;
                self.dft_calls = metrics.dft_calls;
                self.steps_counter += 1;
                self.telemetry.ingest(&metrics);
            }

            LearnerEvent::Structure { configuration, scores } => {
                self.snapshot = Some(Snapshot { configuration, scores });
            }

            LearnerEvent::Finished => {
                self.worker_status = WorkerStatus::Finished;
                self.log("Run finished.");
            }

            LearnerEvent::Failed(reason) => {
                self.worker_status = WorkerStatus::Error;
                self.log(format!("Run failed: {}", reason));
                self.failure = Some(reason);
            }
        }
    }

    /// Logs a message to the internal buffer.
    fn log(&mut self, msg: impl Into<String>) {
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(msg.into());
    }

    fn calc_metrics(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_rate_check);
        if elapsed >= Duration::from_secs(1) {
            self.steps_per_second = self.steps_counter as f64 / elapsed.as_secs_f64();
            self.steps_counter = 0;
            self.last_rate_check = now;
        }
    }

    /// Fraction of steps so far that required an oracle call.
    pub fn call_rate(&self) -> f64 {
        if self.current_step == 0 {
            return 0.0;
        }
        self.dft_calls as f64 / (self.current_step + 1) as f64
    }

    // --- Input Handling ---

    pub fn on_key(&mut self, key: char) {
        match key {
            'q' => self.should_quit = true,
            '1' => self.mode = AppMode::Dashboard,
            '2' => self.mode = AppMode::Analysis,
            '3' => self.mode = AppMode::StructureViewer,
            '?' | 'h' => self.mode = AppMode::Help,
            ' ' => self.toggle_pause(),
            'a' => self.viewport.auto_rotate = !self.viewport.auto_rotate,
            'r' => {
                self.viewport.azimuth = 0.0;
                self.viewport.zoom = 1.0;
            }
            '+' | '=' => self.viewport.zoom = (self.viewport.zoom * 1.2).min(8.0),
            '-' => self.viewport.zoom = (self.viewport.zoom / 1.2).max(0.2),
            _ => {}
        }
    }

    pub fn toggle_pause(&mut self) {
        let next = match self.worker_status {
            WorkerStatus::Running | WorkerStatus::Starting => WorkerStatus::Paused,
            WorkerStatus::Paused => WorkerStatus::Running,
            _ => return,
        };
        let paused = next == WorkerStatus::Paused;
        if let Some(flag) = &self.pause_flag {
            flag.store(paused, Ordering::Relaxed);
        }
        self.worker_status = next;
        self.log(if paused { "Paused." } else { "Resumed." });
    }
}

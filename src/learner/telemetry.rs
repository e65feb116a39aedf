//! Per-step metric sinks. The controller never depends on a sink succeeding.

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::learner::{LearnerEvent, StepMetrics};

pub trait TelemetrySink: Send {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()>;
}

/// Flat CSV row; histograms are not written.
#[derive(Serialize)]
struct CsvRow {
    step: u64,
    dft_calls: u64,
    max_uncertainty: Option<f64>,
    called: bool,
    max_f_uncertainty: Option<f64>,
    fmae: Option<f64>,
    emae: Option<f64>,
    n_added: Option<usize>,
    temperature: Option<f64>,
    pressure: Option<f64>,
    pot_eng: Option<f64>,
    volume: Option<f64>,
}

impl From<&StepMetrics> for CsvRow {
    fn from(m: &StepMetrics) -> Self {
        Self {
            step: m.step,
            dft_calls: m.dft_calls,
            max_uncertainty: m.max_uncertainty,
            called: m.called,
            max_f_uncertainty: m.max_force_uncertainty,
            fmae: m.force_mae,
            emae: m.energy_mae,
            n_added: m.n_added,
            temperature: m.thermo.map(|t| t.temperature),
            pressure: m.thermo.map(|t| t.pressure),
            pot_eng: m.thermo.map(|t| t.potential_energy),
            volume: m.thermo.map(|t| t.volume),
        }
    }
}

pub struct CsvTelemetry {
    writer: csv::Writer<File>,
}

impl CsvTelemetry {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating telemetry file {}", path.display()))?;
        Ok(Self { writer })
    }
}

impl TelemetrySink for CsvTelemetry {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.writer.serialize(CsvRow::from(metrics))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemoryTelemetry {
    records: Arc<Mutex<Vec<StepMetrics>>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StepMetrics> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.records.lock().push(metrics.clone());
        Ok(())
    }
}

/// Forwards metrics to the dashboard thread.
pub struct ChannelTelemetry {
    tx: Sender<LearnerEvent>,
}

impl ChannelTelemetry {
    pub fn new(tx: Sender<LearnerEvent>) -> Self {
        Self { tx }
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn record(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.tx
            .send(LearnerEvent::Step(metrics.clone()))
            .context("dashboard channel closed")
    }
}

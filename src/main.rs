use std::error::Error;
use std::io;
use std::panic;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Sender};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

use otf_learner::core::chemistry::PairParams;
use otf_learner::core::domain::{Configuration, Species};
use otf_learner::engine::external::gulp::GulpOracle;
use otf_learner::engine::oracle::Oracle;
use otf_learner::engine::pair::LennardJones;
use otf_learner::interface::logger::{self, ChannelLogger};
use otf_learner::interface::state::AppState;
use otf_learner::interface::ui;
use otf_learner::learner::telemetry::{ChannelTelemetry, CsvTelemetry};
use otf_learner::learner::LearnerEvent;
use otf_learner::md::verlet::VelocityVerlet;
use otf_learner::md::SimulationEngine;
use otf_learner::model::descriptor::{DescriptorSet, RadialBasis};
use otf_learner::model::sparse_gp::{Hyperparameters, SparseGp};
use otf_learner::model::SurrogateModel;
use otf_learner::{LearnerParams, OtfController};

// --- CLI Definitions ---

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "On-the-fly active learning of interatomic potentials", long_about = None)]
struct Args {
    /// JSON file with learner parameters; missing fields take defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of MD steps to run
    #[arg(short, long, default_value_t = 500)]
    steps: u64,

    /// Ground-truth oracle (lj, gulp)
    #[arg(short, long, default_value = "lj")]
    oracle: String,

    /// GULP executable used by the gulp oracle
    #[arg(long, default_value = "gulp")]
    gulp_bin: String,

    /// Number of worker threads for parallel kernel evaluation
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// fcc conventional cells per edge
    #[arg(long, default_value_t = 2)]
    cells: usize,

    /// Initial temperature (K)
    #[arg(long, default_value_t = 60.0)]
    temperature: f64,

    /// MD timestep (fs)
    #[arg(long, default_value_t = 2.0)]
    timestep: f64,

    /// Overrides the seed of the parameter file
    #[arg(long)]
    seed: Option<u64>,

    /// Resume from a resume artifact instead of bootstrapping
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Also write the final mapped potential here
    #[arg(long)]
    model_out: Option<PathBuf>,

    /// Per-step metrics as CSV
    #[arg(long)]
    telemetry: Option<PathBuf>,

    /// Directory for extended XYZ dumps of oracle calls and per-atom scores
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Run without the dashboard, logging to stderr
    #[arg(long)]
    headless: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

// --- Terminal Guard (RAII) ---

struct TuiContext {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
}

impl TuiContext {
    fn new() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
            .context("Failed to setup terminal alternate screen")?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend).context("Failed to create terminal backend")?;
        Ok(Self { terminal })
    }
}

impl Drop for TuiContext {
    fn drop(&mut self) {
        // Best-effort restoration of terminal state
        let _ = disable_raw_mode();
        let _ = execute!(
            self.terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        );
        let _ = self.terminal.show_cursor();
    }
}

// --- Initialization Helpers ---

fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // Forcefully restore terminal before printing panic
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture);
        original_hook(panic_info);
    }));
}

/// Descriptor cutoff of the default model (A).
const DESCRIPTOR_CUTOFF: f64 = 5.0;
/// Lennard-Jones cutoff of the default oracle (A).
const PAIR_CUTOFF: f64 = 7.0;

/// Default system: an Ar/Kr L1_0-layered fcc crystal.
struct SystemDefinition {
    species: Vec<Species>,
    pair_params: Vec<PairParams>,
    initial: Configuration,
}

fn create_default_system(args: &Args) -> Result<SystemDefinition> {
    let ar = Species {
        color_rgb: (0, 255, 255),
        ..Species::new("Ar", 18, 39.948)
    };
    let kr = Species {
        color_rgb: (255, 128, 0),
        ..Species::new("Kr", 36, 83.798)
    };
    let pair_params = vec![
        PairParams { epsilon: 0.010_3, sigma: 3.405 },
        PairParams { epsilon: 0.014_1, sigma: 3.650 },
    ];
    let initial = Configuration::fcc(5.6, args.cells, [0, 0, 1, 1], DESCRIPTOR_CUTOFF)?;

    Ok(SystemDefinition {
        species: vec![ar, kr],
        pair_params,
        initial,
    })
}

fn gulp_potential(pair_params: &[PairParams], species: &[Species]) -> String {
    let mut s = String::from("lennard epsilon\n");
    for (i, (a, pa)) in species.iter().zip(pair_params).enumerate() {
        for (b, pb) in species.iter().zip(pair_params).skip(i) {
            s.push_str(&format!(
                "{} core {} core {:.6} {:.6} 0.0 {:.1}\n",
                a.symbol,
                b.symbol,
                (pa.epsilon * pb.epsilon).sqrt(),
                0.5 * (pa.sigma + pb.sigma),
                PAIR_CUTOFF
            ));
        }
    }
    s
}

fn check_dependencies(executable: &str) -> Result<()> {
    // If GULP is not in PATH, spawning it fails.
    match Command::new(executable).arg("help").output() {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!(
            "Dependency Check Failed: '{}' executable not found in PATH.\n\
             The gulp oracle requires GULP for single-point calculations.\n\
             Install GULP, add it to your PATH, or run with --oracle lj.",
            executable
        )),
    }
}

fn build_oracle(args: &Args, system: &SystemDefinition) -> Result<Arc<dyn Oracle>> {
    match args.oracle.to_lowercase().as_str() {
        "lj" => Ok(Arc::new(LennardJones::new(&system.pair_params, PAIR_CUTOFF))),
        "gulp" => {
            check_dependencies(&args.gulp_bin)?;
            let potential = gulp_potential(&system.pair_params, &system.species);
            Ok(Arc::new(GulpOracle::new(&args.gulp_bin, &potential, system.species.clone())?))
        }
        other => Err(anyhow!("unknown oracle '{}', expected lj or gulp", other)),
    }
}

fn load_params(args: &Args) -> Result<LearnerParams> {
    let mut params = match &args.config {
        Some(path) => LearnerParams::load(path)?,
        None => LearnerParams::default(),
    };
    if let Some(seed) = args.seed {
        params.seed = seed;
    }
    if params.resume_path.is_none() {
        params.resume_path = Some(params.model_path.with_extension("resume.json"));
    }
    Ok(params)
}

/// Everything the worker thread needs, moved in at spawn.
struct RunContext {
    controller: OtfController<SparseGp>,
    engine: VelocityVerlet,
    steps: u64,
    model_out: Option<PathBuf>,
}

fn build_run(args: &Args, params: LearnerParams, events: Option<Sender<LearnerEvent>>) -> Result<RunContext> {
    let system = create_default_system(args)?;
    let oracle = build_oracle(args, &system)?;

    let descriptors = DescriptorSet::new(system.species.len(), vec![RadialBasis::new(8, DESCRIPTOR_CUTOFF)])?;
    let model = SparseGp::new(descriptors, Hyperparameters::default());

    let engine = VelocityVerlet::new(&system.initial, &system.species, args.timestep)?
        .with_temperature(args.temperature, params.seed)?;

    let mut builder = OtfController::builder(model, oracle, system.species.clone()).params(params);
    if let Some(path) = &args.resume {
        builder = builder.resume_from(path);
    }
    if let Some(tx) = events {
        builder = builder.telemetry(ChannelTelemetry::new(tx));
    }
    if let Some(path) = &args.telemetry {
        builder = builder.telemetry(CsvTelemetry::create(path)?);
    }
    if let Some(dir) = &args.dump_dir {
        let (oracle_dir, score_dir) = (dir.clone(), dir.clone());
        builder = builder
            .oracle_dump(Box::new(move |step| oracle_dir.join(format!("oracle_{:06}.xyz", step))))
            .uncertainty_dump(Box::new(move |step| score_dir.join(format!("uncertainty_{:06}.xyz", step))));
    }

    Ok(RunContext {
        controller: builder.build()?,
        engine,
        steps: args.steps,
        model_out: args.model_out.clone(),
    })
}

/// Drives controller and engine in lockstep until `steps` MD steps are done.
fn run_md(
    mut ctx: RunContext,
    events: Option<&Sender<LearnerEvent>>,
    paused: &AtomicBool,
    stop: &AtomicBool,
) -> Result<()> {
    for _ in 0..ctx.steps {
        while paused.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(50));
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let outcome = ctx.controller.on_engine_step(&mut ctx.engine)?;
        if let (Some(tx), Some(decision)) = (events, &outcome.decision) {
            let configuration = ctx.engine.snapshot()?;
            let _ = tx.send(LearnerEvent::Structure {
                configuration,
                scores: decision.scores.clone(),
            });
        }
        ctx.engine.advance()?;
    }

    if let Some(path) = &ctx.model_out {
        ctx.controller.save_model(path)?;
        log::info!("Final potential written to {}", path.display());
    }
    log::info!(
        "Run complete: {} oracle calls, {} sparse environments",
        ctx.controller.state().dft_calls,
        ctx.controller.model().sparse_count()
    );
    Ok(())
}

fn init_pool(threads: usize) {
    // Rayon's global pool can only be built once; a second build is harmless.
    let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
}

fn run_headless(args: &Args, params: LearnerParams) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(logger::parse_level(&args.log_level))
        .parse_default_env()
        .init();
    init_pool(args.threads);

    let ctx = build_run(args, params, None)?;
    let started = Instant::now();
    run_md(ctx, None, &AtomicBool::new(false), &AtomicBool::new(false))?;
    log::info!("Elapsed: {:.1} s", started.elapsed().as_secs_f64());
    Ok(())
}

fn run_dashboard(args: &Args, params: LearnerParams) -> Result<()> {
    let (tx, rx) = unbounded();
    let level = logger::parse_level(&args.log_level).to_level().unwrap_or(log::Level::Info);
    ChannelLogger::new(tx.clone(), level)
        .install()
        .map_err(|e| anyhow!("installing logger: {}", e))?;

    let symbols = create_default_system(args)?
        .species
        .iter()
        .map(|s| s.symbol.clone())
        .collect();

    let mut tui = TuiContext::new().context("Failed to initialize TUI")?;
    let mut app = AppState::new(params.clone(), symbols);
    app.set_channel(rx);

    let paused = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    app.set_pause_flag(paused.clone());

    // The controller is built on the worker, so a build failure shows up on the dashboard.
    let threads = args.threads;
    let worker_args = args.clone();
    let (worker_paused, worker_stop) = (paused.clone(), stop.clone());
    let handle = thread::Builder::new()
        .name("OTF-Worker".to_string())
        .spawn(move || {
            init_pool(threads);
            let result = build_run(&worker_args, params, Some(tx.clone()))
                .and_then(|ctx| run_md(ctx, Some(&tx), &worker_paused, &worker_stop));
            let _ = match result {
                Ok(()) => tx.send(LearnerEvent::Finished),
                Err(e) => tx.send(LearnerEvent::Failed(format!("{:#}", e))),
            };
        })?;

    // Event loop
    let tick_rate = Duration::from_millis(50); // 20 FPS
    let mut last_tick = Instant::now();

    while !app.should_quit {
        tui.terminal.draw(|f| ui::draw(f, &mut app))?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == event::KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char(c) => app.on_key(c),
                        KeyCode::Esc => app.should_quit = true,
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.tick();
            last_tick = Instant::now();
        }
    }

    // Let the worker finish its current step so checkpoints are never left half-written.
    stop.store(true, Ordering::Relaxed);
    paused.store(false, Ordering::Relaxed);
    drop(tui);
    if handle.join().is_err() {
        eprintln!("worker thread panicked");
    }
    if let Some(reason) = &app.failure {
        eprintln!("Run failed: {}", reason);
    }
    Ok(())
}

// --- Main ---

fn main() -> Result<(), Box<dyn Error>> {
    setup_panic_hook();
    let args = Args::parse();
    let params = load_params(&args)?;

    if args.headless {
        run_headless(&args, params)?;
    } else {
        run_dashboard(&args, params)?;
    }
    Ok(())
}

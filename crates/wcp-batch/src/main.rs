//! # wcp-batch
//!
//! Command-line batch analysis of whole-cell patch-clamp projects.
//!
//! ```bash
//! # Generate a synthetic project
//! wcp-batch simulate demo_project
//!
//! # Detect spikes of the "step" protocol and export tables
//! wcp-batch analyze demo_project step --analysis spike --out results
//!
//! # Review each detection from the terminal, with a custom threshold
//! wcp-batch analyze demo_project step -a spike --interactive --set spike.slope_threshold=25
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

use wcp_batch::{
    difference_file_name, subtract_protocols, write_rows, AnalysisKind, BatchRunner, BatchStats,
    BatchStatus, ChannelInspector, DirectoryTraceSource, InspectorHandle, ParameterRegistry,
    ProjectManifest, ResultStore, StopHandle, StoredTable, TraceSource,
};
use wcp_core::{CellId, ClampMode, Stimulus, TrialKey};
use wcp_processing::{
    accommodation, average_membrane_properties, average_mini_properties, average_spike_properties,
    firing_rates, rheobase, select_cells, AnalysisConfig, AnalysisContext, HeadlessInspector,
    Inspector, MembraneTestAnalyzer, MiniDetector, ResistanceLimit, SpikeDetector, TracingSink,
};
use wcp_simulation::{PatchSimulator, SimulationConfig, StepResponse};

/// File holding every stored result table of an output directory
const RESULTS_FILE: &str = "results.json";
/// Analysis configuration written next to simulated projects
const CONFIG_FILE: &str = "config.json";

/// wcp-batch - Patch-clamp signal detection and curve fitting
#[derive(Parser)]
#[command(name = "wcp-batch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AnalysisArg {
    /// Action potentials
    Spike,
    /// Miniature synaptic events
    Mini,
    /// Seal test passive properties
    SealTest,
    /// Subthreshold step passive properties and sag
    Subthreshold,
}

impl From<AnalysisArg> for AnalysisKind {
    fn from(arg: AnalysisArg) -> Self {
        match arg {
            AnalysisArg::Spike => AnalysisKind::Spike,
            AnalysisArg::Mini => AnalysisKind::Mini,
            AnalysisArg::SealTest => AnalysisKind::SealTest,
            AnalysisArg::Subthreshold => AnalysisKind::Subthreshold,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default analysis configuration
    Config {
        #[arg(value_name = "OUTPUT", default_value = "config.json")]
        output: PathBuf,

        /// Use the current-clamp preset
        #[arg(long)]
        current_clamp: bool,

        /// Override a parameter, e.g. spike.slope_threshold=25
        #[arg(long = "set", value_name = "ANALYZER.PARAM=VALUE")]
        set: Vec<String>,
    },

    /// Generate a synthetic project directory
    Simulate {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Number of cells
        #[arg(short = 'n', long, default_value = "3")]
        cells: u32,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Analyze one protocol of a project
    Analyze {
        /// Project directory
        #[arg(value_name = "DIR")]
        project: PathBuf,

        /// Protocol to analyze
        #[arg(value_name = "PROTOCOL")]
        protocol: String,

        #[arg(short, long, value_enum)]
        analysis: AnalysisArg,

        /// Analysis configuration (defaults to the project's config.json)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output directory for result tables
        #[arg(short, long, default_value = "results")]
        out: PathBuf,

        /// Keep only mini trials whose seal-test access resistance is below this (ohms)
        #[arg(long)]
        max_access: Option<f64>,

        /// Seal-test protocol used with --max-access
        #[arg(long)]
        seal_protocol: Option<String>,

        /// Override a parameter, e.g. mini.min_amp=2e-11
        #[arg(long = "set", value_name = "ANALYZER.PARAM=VALUE")]
        set: Vec<String>,

        /// Review detections and failed fits from the terminal
        #[arg(short, long)]
        interactive: bool,

        /// With --interactive, also review every fit
        #[arg(long)]
        review_fits: bool,
    },

    /// Steady-state difference of two protocols per cell and stimulus
    Subtract {
        #[arg(value_name = "DIR")]
        project: PathBuf,

        #[arg(value_name = "PROTOCOL0")]
        protocol0: String,

        #[arg(value_name = "PROTOCOL1")]
        protocol1: String,

        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(short, long, default_value = "results")]
        out: PathBuf,

        /// Restrict to these cells
        #[arg(long, value_delimiter = ',')]
        cells: Option<Vec<CellId>>,
    },
}

struct AnalyzeArgs {
    project: PathBuf,
    protocol: String,
    analysis: AnalysisArg,
    config: Option<PathBuf>,
    out: PathBuf,
    max_access: Option<f64>,
    seal_protocol: Option<String>,
    set: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Config { output, current_clamp, set } => {
            let preset = if current_clamp {
                AnalysisConfig::current_clamp()
            } else {
                AnalysisConfig::default()
            };
            let registry = ParameterRegistry::new(preset)?;
            apply_overrides(&registry, &set)?;
            fs::write(&output, registry.snapshot().to_json()?)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
        Commands::Simulate { dir, cells, seed } => {
            simulate(&dir, cells, seed)?;
        }
        Commands::Analyze {
            project,
            protocol,
            analysis,
            config,
            out,
            max_access,
            seal_protocol,
            set,
            interactive,
            review_fits,
        } => {
            let args = AnalyzeArgs {
                project,
                protocol,
                analysis,
                config,
                out,
                max_access,
                seal_protocol,
                set,
            };
            let mut reviewer = None;
            let inspector: Box<dyn Inspector + Send> = if interactive {
                let (inspector, handle) = ChannelInspector::pair(1);
                reviewer = Some(tokio::spawn(review_from_stdin(handle)));
                Box::new(inspector.with_fit_review(review_fits))
            } else {
                Box::new(HeadlessInspector)
            };
            let stop = StopHandle::new();
            let interrupt = tokio::spawn({
                let stop = stop.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, stopping after the current trial");
                        stop.stop();
                    }
                }
            });
            let result = tokio::task::spawn_blocking(move || analyze(args, stop, inspector)).await?;
            interrupt.abort();
            if let Some(reviewer) = reviewer {
                reviewer.abort();
            }
            result?;
        }
        Commands::Subtract {
            project,
            protocol0,
            protocol1,
            config,
            out,
            cells,
        } => {
            let source = open_project(&project)?;
            let config = load_config(config.as_deref(), &project)?;
            let rows = subtract_protocols(
                &source,
                &protocol0,
                &protocol1,
                &config.subthreshold,
                cells.as_deref(),
            )?;
            fs::create_dir_all(&out)?;
            let path = out.join(difference_file_name(&protocol0, &protocol1));
            write_rows(&rows, &path)?;
            println!("{} rows written to {}", rows.len(), path.display());
        }
    }

    Ok(())
}

/// Apply `analyzer.param=value` overrides in order
fn apply_overrides(registry: &ParameterRegistry, assignments: &[String]) -> Result<()> {
    for assignment in assignments {
        registry
            .assign(assignment)
            .with_context(|| format!("Invalid override '{}'", assignment))?;
        info!(%assignment, "parameter override");
    }
    Ok(())
}

/// Answer inspection requests from standard input. Closing the input
/// leaves the rest of the run to the default branches.
async fn review_from_stdin(mut handle: InspectorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(request) = handle.next_request().await {
        let answer = loop {
            eprintln!("{}", request.prompt());
            match lines.next_line().await {
                Ok(Some(line)) => match request.parse_answer(&line) {
                    Some(answer) => break Some(answer),
                    None => eprintln!("'{}' not understood", line.trim()),
                },
                Ok(None) | Err(_) => break None,
            }
        };
        let Some(answer) = answer else { break };
        if !handle.answer(answer).await {
            break;
        }
    }
}

fn open_project(dir: &Path) -> Result<DirectoryTraceSource> {
    DirectoryTraceSource::open(dir).with_context(|| format!("Failed to open project {}", dir.display()))
}

/// Explicit configuration file, else the project's, else the defaults
fn load_config(path: Option<&Path>, project: &Path) -> Result<AnalysisConfig> {
    let fallback = project.join(CONFIG_FILE);
    let path = match path {
        Some(path) => path.to_path_buf(),
        None if fallback.exists() => fallback,
        None => {
            info!("no configuration file, using defaults");
            return Ok(AnalysisConfig::default());
        }
    };
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = AnalysisConfig::from_json(&text)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    info!(config = %config.name, path = %path.display(), "loaded configuration");
    Ok(config)
}

fn analyze(args: AnalyzeArgs, stop: StopHandle, mut inspector: Box<dyn Inspector + Send>) -> Result<()> {
    let source = open_project(&args.project)?;
    let registry = ParameterRegistry::new(load_config(args.config.as_deref(), &args.project)?)?;
    apply_overrides(&registry, &args.set)?;
    let _guard = registry.begin_run()?;
    let config = registry.snapshot();

    let runner = BatchRunner::new(&source)
        .with_filters(config.filters.clone())
        .with_stop_handle(stop);
    let mut sink = TracingSink;
    let mut ctx = AnalysisContext::new(inspector.as_mut(), &mut sink);
    let protocol = args.protocol.as_str();

    let (table, status, stats): (StoredTable, BatchStatus, BatchStats) = match args.analysis {
        AnalysisArg::Spike => {
            let run = runner.run(&SpikeDetector::new(config.spike)?, protocol, &mut ctx)?;
            (StoredTable::Spike(run.table), run.status, run.stats)
        }
        AnalysisArg::Mini => {
            let run = runner.run(&MiniDetector::new(config.mini)?, protocol, &mut ctx)?;
            (StoredTable::Mini(run.table), run.status, run.stats)
        }
        AnalysisArg::SealTest => {
            let analyzer = MembraneTestAnalyzer::seal_test(config.seal_test)?;
            let run = runner.run(&analyzer, protocol, &mut ctx)?;
            (StoredTable::SealTest(run.table), run.status, run.stats)
        }
        AnalysisArg::Subthreshold => {
            let analyzer = MembraneTestAnalyzer::subthreshold(config.subthreshold)?;
            let run = runner.run(&analyzer, protocol, &mut ctx)?;
            (StoredTable::Subthreshold(run.table), run.status, run.stats)
        }
    };

    fs::create_dir_all(&args.out)?;
    let results_path = args.out.join(RESULTS_FILE);
    let mut store = ResultStore::load_or_default(&results_path)?;
    store.insert(table);
    store.save(&results_path)?;

    let kind = AnalysisKind::from(args.analysis);
    let mut written = store.export_csv(kind, protocol, &args.out)?;
    written.extend(export_aggregates(&store, kind, &args, &source)?);

    println!(
        "{:?}: {} of {} trials analyzed, {} failed, {} us per trial",
        status,
        stats.trials_processed,
        stats.trials_total,
        stats.trials_failed,
        stats.average_latency_us()
    );
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

/// Per-cell summary tables of the freshly stored protocol
fn export_aggregates(
    store: &ResultStore,
    kind: AnalysisKind,
    args: &AnalyzeArgs,
    source: &DirectoryTraceSource,
) -> Result<Vec<PathBuf>> {
    let protocol = args.protocol.as_str();
    let types = source.assigned_types();
    let selected = source.selected_cells();
    let path = |name: &str| args.out.join(format!("{}_{}.csv", name, protocol));
    let mut written = Vec::new();

    match kind {
        AnalysisKind::Spike => {
            if let Some(table) = store.spikes(protocol) {
                let cells = select_cells(&table.cells(), &selected, None);
                write_rows(&firing_rates(table, &cells, None, &types), &path("fr"))?;
                write_rows(&rheobase(table, &cells, &types), &path("rheo"))?;
                write_rows(
                    &average_spike_properties(table, &cells, [0.0, 0.0], [1, 2], &types),
                    &path("avg_ap"),
                )?;
                write_rows(&accommodation(table, &cells, 1, 5, &types), &path("acc"))?;
                written.extend(["fr", "rheo", "avg_ap", "acc"].map(path));
            }
        }
        AnalysisKind::Mini => {
            if let Some(table) = store.minis(protocol) {
                let cells = select_cells(&table.cells(), &selected, None);
                let seal = args.seal_protocol.as_deref().and_then(|p| store.seal_tests(p));
                let limit = args.max_access.map(ResistanceLimit::Access);
                let report = average_mini_properties(table, &cells, seal, limit, 0, &types);
                if limit.is_some() && !report.resistance_filter_applied {
                    warn!("no seal-test table found, access resistance filter ignored");
                }
                write_rows(&report.rows, &path("avg_mini"))?;
                written.push(path("avg_mini"));
            }
        }
        AnalysisKind::SealTest | AnalysisKind::Subthreshold => {
            let table = match kind {
                AnalysisKind::SealTest => store.seal_tests(protocol),
                _ => store.subthreshold(protocol),
            };
            if let Some(table) = table {
                let cells: BTreeSet<CellId> = select_cells(&table.cells(), &selected, None);
                let name = format!("avg_{}", kind.prefix());
                write_rows(&average_membrane_properties(table, &cells, [0.0, 0.0], &types), &path(&name))?;
                written.push(path(&name));
            }
        }
    }
    Ok(written)
}

/// Synthetic project: current steps with spikes, spontaneous minis, seal
/// tests and subthreshold steps with sag
fn simulate(dir: &Path, cells: u32, seed: u64) -> Result<()> {
    let mut manifest = ProjectManifest::new("simulated");
    for cell in 1..=cells {
        let label = if cell % 2 == 0 { "interneuron" } else { "pyramidal" };
        manifest.cell_types.insert(cell, label.to_string());
    }
    let mut source = DirectoryTraceSource::create(dir, manifest)?;

    let simulator = |noise_std: f64, duration: f64, offset: u64| {
        PatchSimulator::new(SimulationConfig {
            sample_rate: 20_000.0,
            duration,
            noise_std,
            seed: seed.wrapping_add(offset),
        })
    };

    for cell in 1..=cells {
        let mut trial = 0;
        let mut next = || {
            trial += 1;
            TrialKey::new(cell, trial)
        };
        let offset = u64::from(cell) * 100;

        let mut steps = simulator(2e-4, 1.0, offset)?;
        let rheobase = 80e-12 + f64::from(cell) * 20e-12;
        for k in 0..7 {
            let stimulus = Stimulus::new(0.1, 0.5, f64::from(k) * 50e-12);
            let trace = steps.current_step(stimulus, rheobase, 2e11)?;
            source.write_trace("step", next(), &trace)?;
        }

        let mut minis = simulator(2e-12, 5.0, offset + 1)?;
        for _ in 0..2 {
            let trace = minis.random_minis(4.0, -30e-12)?;
            source.write_trace("mini", next(), &trace)?;
        }

        let mut seal = simulator(1e-12, 0.3, offset + 2)?;
        let rs = 8e6 + f64::from(cell) * 4e6;
        for _ in 0..2 {
            let trace = seal.step_response(&StepResponse { rs, ..StepResponse::default() })?;
            source.write_trace("seal", next(), &trace)?;
        }

        let mut sub = simulator(1e-4, 1.0, offset + 3)?;
        for amplitude in [-50e-12, -25e-12] {
            let step = StepResponse {
                onset: 0.1,
                duration: 0.7,
                amplitude,
                sag: 0.15,
                ..StepResponse::current_clamp()
            };
            source.write_trace("sub", next(), &sub.step_response(&step)?)?;
        }
    }

    let mut config = AnalysisConfig::default();
    config.name = "simulated".to_string();
    config.subthreshold.clamp_mode = ClampMode::Current;
    let config_path = dir.join(CONFIG_FILE);
    fs::write(&config_path, config.to_json()?)?;

    info!(cells, protocols = ?source.protocols(), "simulated project written");
    println!("Project written to {}", dir.display());
    Ok(())
}

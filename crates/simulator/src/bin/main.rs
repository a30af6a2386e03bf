//! Pathcheck CLI
//!
//! Model-check or simulate one of the bundled protocols.
//!
//! # Example
//!
//! ```bash
//! # Exhaustive search over a 3-node flood, pruning duplicate states
//! pathcheck --test flood --nodes 3 --params mc.toml
//!
//! # 500 timed random walks of the ping ring
//! pathcheck --test ping --nodes 5 --mode timed --max-paths 500 --seed 42
//!
//! # Reproduce a failure
//! pathcheck --test flood --nodes 3 --replay error0.path --log-level debug
//! ```

use clap::Parser;
use pathcheck_simulation::{RunSummary, SimulationParams, SimulationRunner, TestRegistry};
use pathcheck_simulator::{default_registry, load_params, parse_mode, ConfigError, Overrides};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Pathcheck
///
/// Drives a simulated cluster through many event interleavings and checks
/// safety and liveness properties along every path.
#[derive(Parser, Debug)]
#[command(name = "pathcheck")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML parameter file
    #[arg(short = 'p', long)]
    params: Option<PathBuf>,

    /// Registered test to run
    #[arg(short = 't', long)]
    test: Option<String>,

    /// Number of nodes
    #[arg(short = 'n', long, default_value = "3")]
    nodes: u32,

    /// Event selection mode: model-check or timed
    #[arg(short = 'm', long)]
    mode: Option<String>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Path ceiling
    #[arg(long)]
    max_paths: Option<u64>,

    /// Step ceiling per path
    #[arg(long)]
    max_steps: Option<u64>,

    /// Replay the choices recorded in this path file
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "pathcheck_simulation=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// List registered tests and exit
    #[arg(long)]
    list: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = default_registry();
    if args.list {
        for (name, description) in registry.names() {
            println!("{name:<12} {description}");
        }
        return ExitCode::SUCCESS;
    }

    match run(&args, &registry) {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Simulation failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, registry: &TestRegistry) -> Result<RunSummary, ConfigError> {
    let test = args.test.as_deref().ok_or(ConfigError::MissingTest)?;
    let base = match &args.params {
        Some(path) => load_params(path)?,
        None => SimulationParams::default(),
    };

    let mut overrides = Overrides::default();
    if let Some(mode) = &args.mode {
        overrides = overrides.with_mode(parse_mode(mode)?);
    }
    if let Some(seed) = args.seed {
        overrides = overrides.with_seed(seed);
    }
    if let Some(max_paths) = args.max_paths {
        overrides = overrides.with_max_paths(max_paths);
    }
    if let Some(max_steps) = args.max_steps {
        overrides = overrides.with_max_steps(max_steps);
    }
    if let Some(file) = &args.replay {
        overrides = overrides.with_replay(file.clone());
    }
    let params = overrides.apply(base);

    info!(
        test,
        nodes = args.nodes,
        params = ?args.params,
        replay = ?args.replay,
        "Loaded configuration"
    );
    let mut runner = SimulationRunner::from_registry(params, registry, test, args.nodes)?;
    Ok(runner.run()?)
}

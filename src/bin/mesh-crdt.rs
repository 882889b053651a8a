use clap::{Parser, Subcommand};
use mesh_crdt::Config;
use mesh_crdt::simulation::{self, SimulationConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs replicas over a lossy in-memory mesh and checks convergence
    Simulate {
        #[arg(long, default_value_t = 3)]
        replicas: usize,
        #[arg(long, default_value_t = 200)]
        edits: usize,
        #[arg(long, default_value_t = 0.0)]
        drop_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        duplicate_rate: f64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        json: bool,
    },
    /// Prints the effective configuration
    Config,
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error: {err}");
                return ExitCode::from(2);
            }
        },
        None => Config::default(),
    };

    match cli.command {
        Commands::Simulate {
            replicas,
            edits,
            drop_rate,
            duplicate_rate,
            seed,
            json,
        } => simulate_command(
            &SimulationConfig {
                replicas,
                edits,
                drop_rate,
                duplicate_rate,
                seed,
            },
            &config,
            json,
        ),
        Commands::Config => config_command(&config),
    }
}

fn simulate_command(sim: &SimulationConfig, config: &Config, json: bool) -> ExitCode {
    if !(0.0..=1.0).contains(&sim.drop_rate) || !(0.0..=1.0).contains(&sim.duplicate_rate) {
        eprintln!("Error: rates must be between 0 and 1");
        return ExitCode::from(2);
    }

    let report = match simulation::run(sim, config) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(output) => println!("{output}"),
            Err(err) => {
                eprintln!("Error: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!(
            "{} replicas, {} edits, seed {}",
            report.replicas, report.edits, report.seed
        );
        println!(
            "delivered {}, dropped {}, duplicated {}",
            report.stats.delivered, report.stats.dropped, report.stats.duplicated
        );
        if report.converged {
            println!("converged: {} characters", report.length);
        } else {
            println!("DIVERGED");
        }
    }

    if report.converged {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn config_command(config: &Config) -> ExitCode {
    match config.to_json_pretty() {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};

use qnav::sim::{run_closed_loop, NavigationResult, ScenarioConfig};

const LONG_ABOUT: &str = "QNAV-SIM: A synthetic scenario runner for the qnav ECEF navigation filter.

This program synthesizes a GNSS-aided inertial navigation scenario and runs the
quaternion error-state filter closed-loop against it. The vehicle follows a
constant-velocity trajectory over a configured site; the IMU is sampled with
configurable noise and bias, and a frozen satellite constellation supplies
pseudorange and deltarange observations at a fixed epoch interval. The recorded
navigation solution (state estimate, covariance traces, and errors against the
synthetic truth) is written as CSV, one row per GNSS epoch.

Scenarios are described by a config file in JSON, YAML, or TOML (selected by
file extension); use the generate-config command to write a template with
baseline values. Every stochastic element is seeded, so a scenario re-runs
exactly.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = LONG_ABOUT)]
struct Cli {
    /// Command to execute
    #[command(subcommand)]
    command: Command,
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "simulate",
        about = "Run a closed-loop synthetic navigation scenario"
    )]
    Simulate(SimulateArgs),
    #[command(
        name = "generate-config",
        about = "Generate a template scenario configuration file"
    )]
    GenerateConfig(GenerateConfigArgs),
}

/// Arguments for the simulate command
#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Path to a scenario config file (json|yaml|yml|toml); defaults apply
    /// when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Output CSV file path for the navigation solution
    #[arg(short, long, value_parser)]
    output: PathBuf,
    /// Override the scenario duration in seconds
    #[arg(long)]
    duration: Option<f64>,
    /// Override the RNG seed
    #[arg(long)]
    seed: Option<u64>,
}

/// Arguments for the generate-config command
#[derive(Args, Clone, Debug)]
struct GenerateConfigArgs {
    /// Output file path for the generated config file.
    /// The file extension determines the format: .json, .yaml/.yml, or .toml
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

/// Initialize the logger with the specified configuration
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Validate output path and create parent directories if needed
fn validate_output_path(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match cli.command {
        Command::GenerateConfig(args) => {
            validate_output_path(&args.output)?;
            let config = ScenarioConfig::default();
            match config.to_file(&args.output) {
                Ok(_) => {
                    info!("Generated config file: {}", args.output.display());
                    println!("Generated config file: {}", args.output.display());
                }
                Err(e) => {
                    error!("Failed to write config file: {}", e);
                    return Err(e.into());
                }
            }
        }
        Command::Simulate(args) => {
            validate_output_path(&args.output)?;

            let mut config = if let Some(ref config_path) = args.config {
                ScenarioConfig::from_file(config_path)
                    .with_context(|| format!("reading config {}", config_path.display()))?
            } else {
                info!("No config supplied, using scenario defaults");
                ScenarioConfig::default()
            };
            if let Some(duration) = args.duration {
                config.duration_s = duration;
            }
            if let Some(seed) = args.seed {
                config.seed = seed;
            }

            info!(
                "Simulating {:.0} s at {:.0} Hz over ({:.4}, {:.4})",
                config.duration_s, config.imu_rate_hz, config.latitude_deg, config.longitude_deg
            );
            let results = run_closed_loop(&config).context("running closed-loop scenario")?;

            if let Some(last) = results.last() {
                info!(
                    "Final position error {:.2} m, velocity error {:.3} m/s, clock {:.1} m",
                    last.position_error_m, last.velocity_error_mps, last.clock_bias
                );
            }
            NavigationResult::to_csv(&results, &args.output)
                .with_context(|| format!("writing results to {}", args.output.display()))?;
            info!("Results written to {}", args.output.display());
            println!(
                "Wrote {} epochs to {}",
                results.len(),
                args.output.display()
            );
        }
    }
    Ok(())
}

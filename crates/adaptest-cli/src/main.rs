//! adaptest CLI — validate item banks, simulate adaptive exams, and monitor
//! calibration.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "adaptest", version, about = "IRT computerized adaptive testing engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate examinees taking adaptive exams against a catalog
    Simulate {
        /// Item catalog TOML (defaults to `catalog_path` from config)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Number of synthetic examinees
        #[arg(long, default_value = "100")]
        examinees: usize,

        /// Seed for abilities, responses, and selection
        #[arg(long)]
        seed: Option<u64>,

        /// Max concurrent sessions
        #[arg(long, default_value = "8")]
        parallelism: usize,

        /// Mean of the simulated ability distribution
        #[arg(long, default_value = "0.0", allow_negative_numbers = true)]
        ability_mean: f64,

        /// Standard deviation of the simulated ability distribution
        #[arg(long, default_value = "1.0")]
        ability_sd: f64,

        /// Response log to write (JSON Lines; defaults to `response_log_path`)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also write the full simulation report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compare catalog parameters against logged responses
    Calibrate {
        /// Item catalog TOML (defaults to `catalog_path` from config)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Response log (defaults to `response_log_path` from config)
        #[arg(long)]
        responses: Option<PathBuf>,

        /// Output format: text, json
        #[arg(long, default_value = "text")]
        format: String,

        /// Save the JSON report to this path
        #[arg(long)]
        output: Option<PathBuf>,

        /// Items listed in the text report's worst-offenders table
        #[arg(long, default_value = "10")]
        top: usize,

        /// Exit code 1 if any quality gate fails
        #[arg(long)]
        fail_on_gate: bool,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate item catalog TOML files
    Validate {
        /// Path to catalog file or directory
        #[arg(long)]
        catalog: PathBuf,
    },

    /// Create a starter config and sample catalog
    Init,
}

#[tokio::main]
async fn main() {
    let default_directive: Directive = "adaptest=info"
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_directive))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate {
            catalog,
            examinees,
            seed,
            parallelism,
            ability_mean,
            ability_sd,
            output,
            report,
            config,
        } => {
            commands::simulate::execute(commands::simulate::SimulateArgs {
                catalog,
                examinees,
                seed,
                parallelism,
                ability_mean,
                ability_sd,
                output,
                report,
                config,
            })
            .await
        }
        Commands::Calibrate {
            catalog,
            responses,
            format,
            output,
            top,
            fail_on_gate,
            config,
        } => {
            commands::calibrate::execute(
                catalog,
                responses,
                format,
                output,
                top,
                fail_on_gate,
                config,
            )
            .await
        }
        Commands::Validate { catalog } => commands::validate::execute(catalog),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vigil::commands::{run, scan, start, status, stop};
use vigil::telemetry::{self, LogFormat};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Process supervision and control plane", long_about = None)]
#[command(version)]
struct Cli {
    /// Control plane root holding vigil.toml and the run/, tmp/, logs/ directories
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane daemon (restarts it if already running)
    Start {
        /// Stay attached to the terminal instead of daemonizing
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the control plane daemon and every supervised service
    Stop,

    /// Show the daemon and per-service state
    Status,

    /// Supervise one service in the foreground
    Run {
        /// Service name as listed in vigil.toml
        service: String,
    },

    /// Print the file fingerprints the change detector sees for a directory
    Scan {
        /// Directory to fingerprint
        dir: PathBuf,

        /// Take watch and exclude settings from this service file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extension to include (repeatable), e.g. --ext .py
        #[arg(short, long = "ext")]
        extensions: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::initialise(LogFormat::from_env())?;

    match cli.command {
        Commands::Start { foreground } => start::execute(&cli.root, foreground),
        Commands::Stop => stop::execute(&cli.root),
        Commands::Status => status::execute(&cli.root),
        Commands::Run { service } => run::execute(&cli.root, &service),
        Commands::Scan {
            dir,
            config,
            extensions,
        } => scan::execute(&dir, config.as_deref(), &extensions),
    }
}

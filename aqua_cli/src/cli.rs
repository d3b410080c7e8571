//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "aqua", version, about = "Aquarium CO2 controller")]
pub struct Cli {
    /// Path to config TOML; built-in defaults are used when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log and report as JSON lines instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control loop until Ctrl-C
    Run {
        /// Drive the in-process device simulator instead of the serial port
        #[arg(long, action = ArgAction::SetTrue)]
        simulate: bool,
        /// Stop on its own after this many seconds
        #[arg(long, value_name = "SECONDS")]
        duration_s: Option<u64>,
    },
    /// Open the device, wait for one valid telemetry frame and report counters
    SelfCheck {
        #[arg(long, action = ArgAction::SetTrue)]
        simulate: bool,
        /// How long to wait for the first frame
        #[arg(long, value_name = "MS", default_value_t = 3000)]
        timeout_ms: u64,
    },
    /// Inspect and maintain the closing-episode dataset
    Dataset {
        #[command(subcommand)]
        cmd: DatasetCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum DatasetCmd {
    /// Row counts per split and schema version
    Stats,
    /// Write feature/label pairs of every usable row
    Dump {
        /// Output file; stdout when omitted
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = DumpFormat::Json)]
        format: DumpFormat,
    },
    /// Fit the linear trough predictor on the training split
    Train {
        /// Where to write the model; `[prediction] model` when omitted
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = 2000)]
        epochs: usize,
        #[arg(long, default_value_t = 0.002)]
        learning_rate: f64,
    },
    /// Merge rows exported from another installation
    Import {
        /// Dataset document to read rows from
        file: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum DumpFormat {
    Json,
    Csv,
}

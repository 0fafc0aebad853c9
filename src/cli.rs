//! CLI argument parsing for the rastro replay driver

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rastro")]
#[command(version)]
#[command(
    about = "Replay intercepted I/O calls through the record-tracking engine and write a binary job log",
    long_about = None
)]
pub struct Cli {
    /// JSON-lines stream of intercepted calls (one call object per line)
    #[arg(long = "calls", value_name = "FILE")]
    pub calls: PathBuf,

    /// Runtime configuration (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where to write the binary log (overrides `log_path` from the config)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Exclusion expression replacing the configured prefixes
    /// (e.g., -e exclude=system,/scratch/tmp/)
    #[arg(short = 'e', long = "expr", value_name = "EXPR")]
    pub exclude: Option<String>,

    /// Rank stamped on every record (overrides the config)
    #[arg(long = "rank", value_name = "RANK")]
    pub rank: Option<i64>,

    /// Job identifier written into the log header (overrides the config)
    #[arg(long = "job-id", value_name = "ID")]
    pub job_id: Option<u64>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

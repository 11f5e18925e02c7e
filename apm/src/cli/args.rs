//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "apm-demo",
    about = "Run synthetic workers under the APM agent and log every harvest",
    after_help = "\
EXAMPLES:
    RUST_LOG=info apm-demo --duration 30 --harvest-interval 5
    RUST_LOG=debug apm-demo --config agent.json --profile 10
    apm-demo --workers 8 --app-name checkout --duration 0"
)]
pub struct Args {
    /// Agent settings file (JSON); defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Application name, overriding the settings file
    #[arg(long)]
    pub app_name: Option<String>,

    /// Seconds between harvests, overriding the settings file
    #[arg(long, value_name = "SECS")]
    pub harvest_interval: Option<u64>,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "60")]
    pub duration: u64,

    /// Number of synthetic worker threads
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Queue a thread profiling session of N seconds (0 = none)
    #[arg(long, value_name = "SECS", default_value = "0")]
    pub profile: u64,
}

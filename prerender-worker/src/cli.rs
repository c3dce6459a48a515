//! CLI argument parsing definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "prerender-worker", author, version, about, long_about = None)]
pub struct Cli {
    /// Worker ID assigned by the pool
    #[arg(long, value_name = "ID", env = "PRERENDER_WORKER_ID", default_value = "standalone")]
    pub worker_id: String,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Directory that relative `html_file` paths resolve against
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

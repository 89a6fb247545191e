//! Command-line argument parsing.

use clap::Parser;

/// dommesh Node Daemon - keeps domain definitions in sync across a cluster
#[derive(Parser, Debug, Default)]
#[command(name = "dommesh-node")]
#[command(about = "dommesh Node Daemon - keeps domain definitions in sync across a cluster")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "DOMMESH_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Seconds between two periodic update passes
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Run one update pass over every domain and exit
    #[arg(long)]
    pub once: bool,

    /// Node name (defaults to the local hostname)
    #[arg(long)]
    pub node_name: Option<String>,
}

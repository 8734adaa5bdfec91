//! CLI argument parsing for GNSA

use std::path::PathBuf;

use clap::Parser;

/// GPU Node Selection Agent - per-node GPU memory scoring and node lifecycle actions
#[derive(Debug, Parser)]
#[command(name = "gnsa")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/gnsa/config.yaml")]
    pub config: PathBuf,

    /// Node name (overrides config)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Policy mode (MaxFreeMemory or MeanFreeMemory)
    #[arg(long, env = "MODE")]
    pub mode: Option<String>,

    /// Visible device mask ("all", "none", or a comma-separated index/UUID list)
    #[arg(long, env = "NVIDIA_VISIBLE_DEVICES")]
    pub visible_devices: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GNSA_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GNSA_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - log node actions but don't execute
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Sample and evaluate once, print the verdict and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

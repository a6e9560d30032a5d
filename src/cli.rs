//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// fabric-rpc — registry-driven protocol orchestration
#[derive(Parser, Debug)]
#[command(name = "fabric-rpcd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FABRIC_RPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override `registry.url` from the config file
    #[arg(long, env = "FABRIC_RPC_REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FABRIC_RPC_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FABRIC_RPC_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Disable the file-backed dynamic-configuration watcher
    #[arg(long)]
    pub no_dynamic_config: bool,
}

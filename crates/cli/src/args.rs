//! Command-line interface arguments for the harness binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    cmd::{genesis::GenesisCmd, keys::KeysCmd, proxy::ProxyCmd},
    config::{LogFormat, LogLevel},
};

#[derive(Parser, Clone, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Harness configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE", env = "HIVENET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, global = true, value_enum, env = "HIVENET_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Log format, overrides the configuration file
    #[arg(long, global = true, value_enum, env = "HIVENET_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build EL and CL genesis artifacts and the files clients start from
    Genesis(GenesisCmd),

    /// Derive validator keys and write their keystores
    Keys(KeysCmd),

    /// Run a standalone Engine API spoof proxy
    Proxy(ProxyCmd),
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Keys(KeysCmd::default())
    }
}

impl Args {
    pub fn new() -> Self {
        Args::parse()
    }
}

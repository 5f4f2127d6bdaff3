//! Harness configuration file.
//!
//! ```toml
//! [logging]
//! log_level = "debug"
//! log_format = "json"
//!
//! [runtime]
//! flavor = "multi_threaded"
//! worker_threads = 4
//!
//! [testnet]
//! validator_count = 64
//! ```

use std::{fmt, fs, io::Write, path::Path, str::FromStr};

use clap::ValueEnum;
use hivenet_testnet::Config as TestnetConfig;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Client verbosity (`HIVE_LOGLEVEL`) matching this level.
    pub fn client_verbosity(self) -> u8 {
        match self {
            LogLevel::Trace => 5,
            LogLevel::Debug => 4,
            LogLevel::Info => 3,
            LogLevel::Warn => 2,
            LogLevel::Error => 1,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum RuntimeConfig {
    SingleThreaded,
    /// `worker_threads = 0` lets tokio pick one per core.
    MultiThreaded {
        #[serde(default)]
        worker_threads: usize,
    },
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::MultiThreaded { worker_threads: 0 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
    pub testnet: TestnetConfig,
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| Error::Parse(e.to_string()))
    }
}

/// Load configuration from file
pub fn load_config(config_file: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(config_file).map_err(|_| Error::OpenFile(config_file.to_path_buf()))?;
    content.parse()
}

/// Save configuration to file
pub fn save_config(config_file: &Path, config: &Config) -> Result<(), Error> {
    save(config_file, toml::to_string_pretty(config).map_err(|e| Error::Serialize(e.to_string()))?.as_bytes())
}

/// Writes `data` to `path`, creating parent directories as needed.
pub fn save(path: &Path, data: &[u8]) -> Result<(), Error> {
    if let Some(parent_dir) = path.parent() {
        fs::create_dir_all(parent_dir).map_err(|_| Error::ParentDir(parent_dir.to_path_buf()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|_| Error::OpenFile(path.to_path_buf()))?;

    f.write_all(data).map_err(|_| Error::WriteFile(path.to_path_buf()))
}

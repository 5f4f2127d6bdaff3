use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing the files the commands work with.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Error opening file: {}", .0.display())]
    OpenFile(PathBuf),

    #[error("Error writing file: {}", .0.display())]
    WriteFile(PathBuf),

    #[error("Error creating parent directory: {}", .0.display())]
    ParentDir(PathBuf),

    #[error("Error parsing config: {0}")]
    Parse(String),

    #[error("Error serializing config: {0}")]
    Serialize(String),

    #[error("Invalid JWT secret in {}: {reason}", path.display())]
    JwtSecret { path: PathBuf, reason: String },
}

#![allow(missing_docs)]

use color_eyre::eyre;
use thiserror::Error;

/// Defines the specific error types for the execution client.
///
/// Functions throughout the crate return `eyre::Result`; these kinds are attached
/// at the point of failure so callers can match them with [`engine_error_code`]
/// or [`is_engine_error`].
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    JsonRpc { code: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Method not supported: {0}")]
    MethodNotSupported(String),
}

/// JSON-RPC error code returned by the EL, if the failure was one.
pub fn engine_error_code(report: &eyre::Report) -> Option<i64> {
    report.chain().find_map(|e| match e.downcast_ref::<ExecutionError>() {
        Some(ExecutionError::JsonRpc { code, .. }) => Some(*code),
        _ => None,
    })
}

/// True when the EL answered with the given JSON-RPC error code.
pub fn is_engine_error(report: &eyre::Report, code: i64) -> bool {
    engine_error_code(report) == Some(code)
}

pub fn is_timeout(report: &eyre::Report) -> bool {
    report.chain().any(|e| matches!(e.downcast_ref::<ExecutionError>(), Some(ExecutionError::Timeout(_))))
}

#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::aliases::{B256, Epoch, ValidatorIndex};

/// JSON-RPC code returned for a forkchoice state the EL considers inconsistent.
pub const INVALID_FORKCHOICE_STATE: i64 = -38002;
/// JSON-RPC code returned for malformed or out-of-fork payload attributes.
pub const INVALID_PAYLOAD_ATTRIBUTES: i64 = -38003;
/// JSON-RPC code returned when a method version does not match the fork.
pub const UNSUPPORTED_FORK: i64 = -38005;
pub const INTERNAL_ERROR: i64 = -32603;
pub const PARSE_ERROR: i64 = -32700;

/// Identifies where an error happened in a multi-node testnet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub node_index: Option<usize>,
    pub client_name: Option<String>,
    pub method: Option<String>,
}

impl ErrorContext {
    pub fn node(node_index: usize, client_name: impl Into<String>) -> Self {
        Self { node_index: Some(node_index), client_name: Some(client_name.into()), method: None }
    }

    /// Context for a client known only by its id, as the CL Mocker sees them.
    pub fn client(client_name: impl Into<String>) -> Self {
        Self { client_name: Some(client_name.into()), ..Self::default() }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(idx) = self.node_index {
            parts.push(format!("node={idx}"));
        }
        if let Some(name) = &self.client_name {
            parts.push(format!("client={name}"));
        }
        if let Some(method) = &self.method {
            parts.push(format!("method={method}"));
        }
        if parts.is_empty() { Ok(()) } else { write!(f, "[{}] ", parts.join(" ")) }
    }
}

/// Normalised failure kinds of the harness.
///
/// Functions throughout the workspace return `eyre::Result`; a `HarnessError`
/// is attached at the point of failure so tests and the scenario driver can
/// recover the kind with `downcast_ref`.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{0}configuration error: {1}")]
    ConfigError(ErrorContext, String),

    #[error("{0}client failed to start: {1}")]
    ClientStartupError(ErrorContext, String),

    #[error("{0}rpc timed out")]
    RpcTimeout(ErrorContext),

    #[error("{ctx}upstream rpc error (code {code}): {message}")]
    RpcUpstream { ctx: ErrorContext, code: i64, message: String },

    #[error("{ctx}unexpected payload status: expected {expected}, got {got}")]
    UnexpectedPayloadStatus { ctx: ErrorContext, expected: String, got: String },

    #[error("{ctx}hash mismatch: expected {expected}, got {got}")]
    HashMismatch { ctx: ErrorContext, expected: B256, got: B256 },

    #[error("{ctx}finality stalled: head epoch {head_epoch}, finalized epoch {finalized_epoch}")]
    FinalityStalled { ctx: ErrorContext, head_epoch: Epoch, finalized_epoch: Epoch },

    #[error("{0}chain divergence: {1}")]
    ChainDivergence(ErrorContext, String),

    #[error("{0}callback panicked: {1}")]
    CallbackPanic(ErrorContext, String),

    #[error("{0}jwt authentication failed: {1}")]
    JwtAuthError(ErrorContext, String),

    #[error("unknown validator index {0}")]
    UnknownValidatorIndex(ValidatorIndex),

    #[error("insufficient validators: need {required}, have {available}")]
    InsufficientValidators { required: u64, available: u64 },

    #[error("value overflows {0}")]
    Overflow(String),

    #[error("execution address must be 20 bytes, got {0}")]
    BadAddressLength(usize),

    #[error("no engine client matches the latest header {number} ({hash})")]
    NoEligibleProducer { number: u64, hash: B256 },

    #[error("{ctx}mix hash mismatch at block {number}: expected {expected}, got {got}")]
    MixHashMismatch { ctx: ErrorContext, number: u64, expected: B256, got: B256 },

    #[error("context cancelled")]
    CtxCancelled,
}

impl HarnessError {
    pub fn config(msg: impl Into<String>) -> Self {
        HarnessError::ConfigError(ErrorContext::default(), msg.into())
    }

    /// JSON-RPC code carried by upstream errors.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            HarnessError::RpcUpstream { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            HarnessError::ConfigError(ctx, _) |
            HarnessError::ClientStartupError(ctx, _) |
            HarnessError::RpcTimeout(ctx) |
            HarnessError::ChainDivergence(ctx, _) |
            HarnessError::CallbackPanic(ctx, _) |
            HarnessError::JwtAuthError(ctx, _) => Some(ctx),
            HarnessError::RpcUpstream { ctx, .. } |
            HarnessError::UnexpectedPayloadStatus { ctx, .. } |
            HarnessError::HashMismatch { ctx, .. } |
            HarnessError::FinalityStalled { ctx, .. } |
            HarnessError::MixHashMismatch { ctx, .. } => Some(ctx),
            _ => None,
        }
    }
}

/// Recovers the harness error kind from an `eyre::Report`, if any.
pub fn harness_error(report: &color_eyre::eyre::Report) -> Option<&HarnessError> {
    report
        .downcast_ref::<HarnessError>()
        .or_else(|| report.chain().find_map(|e| e.downcast_ref::<HarnessError>()))
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::{self, WrapErr};

    use super::*;

    #[test]
    fn context_is_rendered_in_message() {
        let err = HarnessError::RpcUpstream {
            ctx: ErrorContext::node(2, "geth").with_method("engine_newPayloadV3"),
            code: UNSUPPORTED_FORK,
            message: "unsupported fork".into(),
        };
        assert_eq!(
            err.to_string(),
            "[node=2 client=geth method=engine_newPayloadV3] upstream rpc error (code -38005): \
             unsupported fork"
        );
        assert_eq!(err.rpc_code(), Some(UNSUPPORTED_FORK));
    }

    #[test]
    fn kind_survives_wrapping() {
        let report: eyre::Report = HarnessError::CtxCancelled.into();
        let wrapped = Err::<(), _>(report).wrap_err("waiting for finality").unwrap_err();
        assert!(matches!(harness_error(&wrapped), Some(HarnessError::CtxCancelled)));
    }
}

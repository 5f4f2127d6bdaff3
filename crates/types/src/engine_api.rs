#![allow(missing_docs)]

//! Engine API response shapes.
//!
//! Requests reuse alloy's `ForkchoiceState`, `PayloadAttributes` and payload types; the
//! responses are modelled here so `INVALID_BLOCK_HASH` and partially filled statuses
//! from misbehaving clients still decode.

use std::fmt;

use alloy_rpc_types_engine::{BlobsBundleV1, ExecutionPayload, PayloadId};
use serde::{Deserialize, Serialize};

use crate::aliases::{B256, U256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadStatusKind {
    Valid,
    Invalid,
    Syncing,
    Accepted,
    InvalidBlockHash,
}

impl fmt::Display for PayloadStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayloadStatusKind::Valid => "VALID",
            PayloadStatusKind::Invalid => "INVALID",
            PayloadStatusKind::Syncing => "SYNCING",
            PayloadStatusKind::Accepted => "ACCEPTED",
            PayloadStatusKind::InvalidBlockHash => "INVALID_BLOCK_HASH",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStatusV1 {
    pub status: PayloadStatusKind,
    #[serde(default)]
    pub latest_valid_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
}

impl PayloadStatusV1 {
    pub fn new(status: PayloadStatusKind, latest_valid_hash: Option<B256>) -> Self {
        Self { status, latest_valid_hash, validation_error: None }
    }

    pub fn is_valid(&self) -> bool {
        self.status == PayloadStatusKind::Valid
    }

    pub fn is_syncing_or_accepted(&self) -> bool {
        matches!(self.status, PayloadStatusKind::Syncing | PayloadStatusKind::Accepted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceUpdatedResponse {
    pub payload_status: PayloadStatusV1,
    #[serde(default)]
    pub payload_id: Option<PayloadId>,
}

/// `engine_getPayloadVN` result normalised across versions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPayloadResponse {
    pub execution_payload: ExecutionPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_value: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobs_bundle: Option<BlobsBundleV1>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_override_builder: Option<bool>,
}

impl GetPayloadResponse {
    pub fn from_v1(payload: ExecutionPayload) -> Self {
        Self { execution_payload: payload, block_value: None, blobs_bundle: None,
            should_override_builder: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_invalid_block_hash_status() {
        let raw = r#"{"status":"INVALID_BLOCK_HASH","latestValidHash":null,"validationError":"bad hash"}"#;
        let status: PayloadStatusV1 = serde_json::from_str(raw).unwrap();
        assert_eq!(status.status, PayloadStatusKind::InvalidBlockHash);
        assert_eq!(status.latest_valid_hash, None);
        assert_eq!(status.validation_error.as_deref(), Some("bad hash"));
    }

    #[test]
    fn forkchoice_response_without_payload_id() {
        let raw = r#"{"payloadStatus":{"status":"SYNCING","latestValidHash":null}}"#;
        let resp: ForkchoiceUpdatedResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.payload_status.is_syncing_or_accepted());
        assert!(resp.payload_id.is_none());
    }
}

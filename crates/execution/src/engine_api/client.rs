#![allow(missing_docs)]
use std::{fmt, sync::Arc};

use alloy_rpc_types_engine::{ExecutionPayload, ExecutionPayloadV1, ForkchoiceState, PayloadAttributes, PayloadId};
use color_eyre::eyre;
use hivenet_types::{
    aliases::B256,
    engine_api::{ForkchoiceUpdatedResponse, GetPayloadResponse, PayloadStatusV1},
};
use serde_json::{Value, json};

use crate::{
    engine_api::{EngineCapabilities, capabilities::*},
    transport::{Transport, call},
};

/// Versioned Engine API calls over an authenticated transport.
///
/// The caller picks the method version; nothing here second-guesses it, so
/// tests can deliberately call a version that does not match the fork.
#[derive(Clone)]
pub struct EngineApiClient {
    transport: Arc<dyn Transport>,
}

impl EngineApiClient {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self { transport: Arc::new(transport) }
    }

    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// - head_block_hash: the block hash of the head of the chain
    /// - safe_block_hash: the most recent "safe" block (can be same as head)
    /// - finalized_block_hash: the highest finalized block (can be 0x0 before finality)
    pub async fn forkchoice_updated(
        &self,
        version: u8,
        state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> eyre::Result<ForkchoiceUpdatedResponse> {
        let method = forkchoice_updated_method(version)?;
        call(self.transport.as_ref(), method, (state, payload_attributes), ENGINE_FORKCHOICE_UPDATED_TIMEOUT)
            .await
    }

    /// Params are `[payload]` for V1/V2 and `[payload, versioned_hashes, parent_beacon_root]` for V3.
    pub async fn new_payload(
        &self,
        version: u8,
        payload: &ExecutionPayload,
        versioned_hashes: Option<Vec<B256>>,
        parent_beacon_block_root: Option<B256>,
    ) -> eyre::Result<PayloadStatusV1> {
        let method = new_payload_method(version)?;
        let params = new_payload_params(version, payload, versioned_hashes, parent_beacon_block_root)?;
        call(self.transport.as_ref(), method, params, ENGINE_NEW_PAYLOAD_TIMEOUT).await
    }

    pub async fn get_payload(&self, version: u8, payload_id: PayloadId) -> eyre::Result<GetPayloadResponse> {
        let method = get_payload_method(version)?;
        if version == 1 {
            let payload: ExecutionPayloadV1 =
                call(self.transport.as_ref(), method, (payload_id,), ENGINE_GET_PAYLOAD_TIMEOUT).await?;
            return Ok(GetPayloadResponse::from_v1(ExecutionPayload::V1(payload)));
        }
        call(self.transport.as_ref(), method, (payload_id,), ENGINE_GET_PAYLOAD_TIMEOUT).await
    }

    pub async fn exchange_capabilities(&self) -> eyre::Result<EngineCapabilities> {
        let resp: Vec<String> = call(
            self.transport.as_ref(),
            ENGINE_EXCHANGE_CAPABILITIES,
            (HIVENET_CAPABILITIES.to_vec(),),
            ENGINE_EXCHANGE_CAPABILITIES_TIMEOUT,
        )
        .await?;
        Ok(EngineCapabilities::from_response_strings(resp.into_iter().collect()))
    }
}

fn new_payload_params(
    version: u8,
    payload: &ExecutionPayload,
    versioned_hashes: Option<Vec<B256>>,
    parent_beacon_block_root: Option<B256>,
) -> eyre::Result<Value> {
    let body = match (version, payload) {
        (1, _) => serde_json::to_value(payload.as_v1())?,
        (2, ExecutionPayload::V3(p)) => serde_json::to_value(&p.payload_inner)?,
        _ => serde_json::to_value(payload)?,
    };
    if version < 3 {
        return Ok(json!([body]));
    }
    Ok(json!([body, versioned_hashes.unwrap_or_default(), parent_beacon_block_root]))
}

impl fmt::Debug for EngineApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineApiClient").field("transport", &"<dyn Transport>").finish()
    }
}

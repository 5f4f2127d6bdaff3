use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy_primitives::{B256, U256};
use alloy_rpc_types::Header;
use alloy_rpc_types_engine::{ExecutionPayload, ForkchoiceState, PayloadAttributes, PayloadId};
use async_trait::async_trait;
use color_eyre::eyre;
use hivenet_execution::{BlockTag, EngineClient};
use hivenet_types::engine_api::{ForkchoiceUpdatedResponse, GetPayloadResponse, PayloadStatusV1};

use crate::chain::InMemoryChain;

/// [`EngineClient`] backed directly by an [`InMemoryChain`], no HTTP involved.
///
/// Several engines may share one chain to model peers that already agree.
#[derive(Clone, Debug)]
pub struct InMemoryEngine {
    id: String,
    chain: Arc<Mutex<InMemoryChain>>,
    ttd: Option<U256>,
}

impl InMemoryEngine {
    pub fn new(id: impl Into<String>, chain: InMemoryChain) -> Self {
        Self::shared(id, Arc::new(Mutex::new(chain)))
    }

    pub fn shared(id: impl Into<String>, chain: Arc<Mutex<InMemoryChain>>) -> Self {
        Self { id: id.into(), chain, ttd: Some(U256::ZERO) }
    }

    pub fn with_ttd(mut self, ttd: Option<U256>) -> Self {
        self.ttd = ttd;
        self
    }

    pub fn chain(&self) -> MutexGuard<'_, InMemoryChain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared_chain(&self) -> Arc<Mutex<InMemoryChain>> {
        self.chain.clone()
    }
}

#[async_trait]
impl EngineClient for InMemoryEngine {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ttd(&self) -> Option<U256> {
        self.ttd
    }

    async fn forkchoice_updated(
        &self,
        version: u8,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> eyre::Result<ForkchoiceUpdatedResponse> {
        self.chain().forkchoice_updated(version, state, attributes)
    }

    async fn new_payload(
        &self,
        version: u8,
        payload: &ExecutionPayload,
        _versioned_hashes: Option<Vec<B256>>,
        parent_beacon_block_root: Option<B256>,
    ) -> eyre::Result<PayloadStatusV1> {
        self.chain().new_payload(version, payload, parent_beacon_block_root)
    }

    async fn get_payload(&self, version: u8, payload_id: PayloadId) -> eyre::Result<GetPayloadResponse> {
        self.chain().get_payload(version, payload_id)
    }

    async fn header_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Header>> {
        Ok(self.chain().block_by_tag(tag).map(|b| b.rpc_header()))
    }

    async fn check_ttd(&self) -> eyre::Result<bool> {
        let ttd = self.ttd.ok_or_else(|| eyre::eyre!("{} has no terminal total difficulty", self.id))?;
        Ok(self.chain().head().header.difficulty >= ttd)
    }
}

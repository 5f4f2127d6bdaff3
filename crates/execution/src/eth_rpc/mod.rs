//! Unauthenticated `eth_*` calls against an EL.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, Bytes, U64, U256};
use alloy_rpc_types::{Block, BlockId, BlockNumberOrTag, Header, TransactionReceipt};
use color_eyre::eyre::{self, eyre};
use serde_json::{Value, json};

use crate::transport::{Transport, call};

pub const ETH_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// A block label or number as accepted by `eth_getBlockByNumber`.
pub type BlockTag = BlockNumberOrTag;

#[derive(Clone)]
pub struct EthRpcClient {
    transport: Arc<dyn Transport>,
}

impl EthRpcClient {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self { transport: Arc::new(transport) }
    }

    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn rpc_request<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> eyre::Result<R> {
        call(self.transport.as_ref(), method, params, ETH_RPC_TIMEOUT).await
    }

    pub async fn chain_id(&self) -> eyre::Result<u64> {
        let id: U64 = self.rpc_request("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    pub async fn block_number(&self) -> eyre::Result<u64> {
        let n: U64 = self.rpc_request("eth_blockNumber", json!([])).await?;
        Ok(n.to::<u64>())
    }

    pub async fn block_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Block>> {
        self.rpc_request("eth_getBlockByNumber", json!([tag, false])).await
    }

    pub async fn block_by_hash(&self, hash: B256) -> eyre::Result<Option<Block>> {
        self.rpc_request("eth_getBlockByHash", json!([hash, false])).await
    }

    pub async fn header_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Header>> {
        Ok(self.block_by_number(tag).await?.map(|b| b.header))
    }

    pub async fn header_by_hash(&self, hash: B256) -> eyre::Result<Option<Header>> {
        Ok(self.block_by_hash(hash).await?.map(|b| b.header))
    }

    /// `totalDifficulty` of a block, read from the raw response since post-merge
    /// clients may omit it.
    pub async fn total_difficulty(&self, block: BlockId) -> eyre::Result<U256> {
        let raw: Option<Value> = match block {
            BlockId::Hash(h) => self.rpc_request("eth_getBlockByHash", json!([h.block_hash, false])).await?,
            BlockId::Number(n) => self.rpc_request("eth_getBlockByNumber", json!([n, false])).await?,
        };
        let raw = raw.ok_or_else(|| eyre!("block {block} not found"))?;
        let td = raw.get("totalDifficulty").cloned().ok_or_else(|| eyre!("block {block} has no totalDifficulty"))?;
        Ok(serde_json::from_value(td)?)
    }

    pub async fn balance_at(&self, address: Address, block: BlockTag) -> eyre::Result<U256> {
        self.rpc_request("eth_getBalance", json!([address, block])).await
    }

    pub async fn storage_at(&self, address: Address, slot: U256, block: BlockTag) -> eyre::Result<B256> {
        self.rpc_request("eth_getStorageAt", json!([address, slot, block])).await
    }

    pub async fn nonce_at(&self, address: Address, block: BlockTag) -> eyre::Result<u64> {
        let nonce: U64 = self.rpc_request("eth_getTransactionCount", json!([address, block])).await?;
        Ok(nonce.to::<u64>())
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes) -> eyre::Result<B256> {
        self.rpc_request("eth_sendRawTransaction", json!([raw])).await
    }

    pub async fn transaction_receipt(&self, hash: B256) -> eyre::Result<Option<TransactionReceipt>> {
        self.rpc_request("eth_getTransactionReceipt", json!([hash])).await
    }
}

impl std::fmt::Debug for EthRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthRpcClient").finish_non_exhaustive()
    }
}

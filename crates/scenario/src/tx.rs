//! Signed transactions sent by the spammers.

use alloy_consensus::{
    SignableTransaction, TxEip1559, TxEip4844, TxEip4844Variant, TxEip4844WithSidecar, TxEnvelope,
};
use alloy_eips::{
    eip2718::Encodable2718,
    eip4844::{
        BlobTransactionSidecar,
        builder::{SidecarBuilder, SimpleCoder},
    },
    eip7594::BlobTransactionSidecarVariant,
};
use alloy_network::TxSigner;
use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_signer_local::PrivateKeySigner;
use color_eyre::eyre::{self, eyre};

pub const SPAM_GAS_LIMIT: u64 = 500_000;

const MAX_PRIORITY_FEE_PER_GAS: u128 = 1_000_000_000; // 1 gwei
const MAX_FEE_PER_GAS: u128 = 30_000_000_000; // 30 gwei
const MAX_FEE_PER_BLOB_GAS: u128 = 1_000_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionType {
    #[default]
    DynamicFee,
    /// Type-3 transaction carrying one blob.
    Blob,
}

/// Builds the transactions of one spammer.
#[derive(Clone, Debug)]
pub struct TransactionCreator {
    pub chain_id: u64,
    /// `None` creates contracts with dynamic fee transactions and sends blob
    /// transactions back to their sender.
    pub recipient: Option<Address>,
    pub tx_type: TransactionType,
}

impl TransactionCreator {
    /// Returns the EIP-2718 bytes, in network form for blob transactions.
    pub async fn make_transaction(&self, signer: &PrivateKeySigner, nonce: u64) -> eyre::Result<Bytes> {
        let envelope = match self.tx_type {
            TransactionType::DynamicFee => self.make_dynamic_fee_tx(signer, nonce).await?,
            TransactionType::Blob => self.make_blob_tx(signer, nonce).await?,
        };
        Ok(envelope.encoded_2718().into())
    }

    async fn make_dynamic_fee_tx(&self, signer: &PrivateKeySigner, nonce: u64) -> eyre::Result<TxEnvelope> {
        let mut tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            max_priority_fee_per_gas: MAX_PRIORITY_FEE_PER_GAS,
            max_fee_per_gas: MAX_FEE_PER_GAS,
            gas_limit: SPAM_GAS_LIMIT,
            to: self.recipient.map_or(TxKind::Create, TxKind::Call),
            value: U256::from(1),
            input: Bytes::default(),
            access_list: Default::default(),
        };
        let signature = signer.sign_transaction(&mut tx).await?;
        Ok(TxEnvelope::Eip1559(tx.into_signed(signature)))
    }

    async fn make_blob_tx(&self, signer: &PrivateKeySigner, nonce: u64) -> eyre::Result<TxEnvelope> {
        let sidecar: BlobTransactionSidecar = SidecarBuilder::<SimpleCoder>::from_slice(&blob_data(signer.address(), nonce))
            .build()
            .map_err(|e| eyre!("failed to build blob sidecar: {e:?}"))?;
        let tx = TxEip4844 {
            chain_id: self.chain_id,
            nonce,
            max_priority_fee_per_gas: MAX_PRIORITY_FEE_PER_GAS,
            max_fee_per_gas: MAX_FEE_PER_GAS,
            gas_limit: SPAM_GAS_LIMIT,
            to: self.recipient.unwrap_or_else(|| signer.address()),
            value: U256::from(1),
            input: Bytes::default(),
            access_list: Default::default(),
            blob_versioned_hashes: sidecar.versioned_hashes().collect(),
            max_fee_per_blob_gas: MAX_FEE_PER_BLOB_GAS,
        };
        let sidecar = BlobTransactionSidecarVariant::Eip4844(sidecar);
        let mut tx = TxEip4844Variant::TxEip4844WithSidecar(TxEip4844WithSidecar::from_tx_and_sidecar(tx, sidecar));
        let signature = signer.sign_transaction(&mut tx).await?;
        Ok(TxEnvelope::Eip4844(tx.into_signed(signature)))
    }
}

/// Distinct per sender and nonce so no two blobs share a commitment.
fn blob_data(sender: Address, nonce: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(1024);
    data.extend_from_slice(sender.as_slice());
    data.extend_from_slice(&nonce.to_be_bytes());
    data.resize(1024, 0xb1);
    data
}

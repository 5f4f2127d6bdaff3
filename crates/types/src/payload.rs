//! Execution payload hashing and field-level customisation.

use alloy_consensus::{Header, Transaction, TxEnvelope};
use alloy_eips::{eip2718::Decodable2718, eip4895::Withdrawal};
use alloy_rpc_types_engine::{ExecutionPayload, ExecutionPayloadV2, ExecutionPayloadV3};
use alloy_trie::root::{ordered_trie_root, ordered_trie_root_with_encoder};
use color_eyre::eyre::{self, eyre};
use sha2::{Digest, Sha256};

use crate::{
    aliases::{Address, B64, B256, Bloom, Bytes, U256},
    constants::{EMPTY_UNCLE_HASH, VERSIONED_HASH_VERSION_KZG},
    error::HarnessError,
};

/// Transactions root of raw EIP-2718 encoded transactions.
pub fn transactions_root(transactions: &[Bytes]) -> B256 {
    ordered_trie_root_with_encoder(transactions, |tx, buf| buf.extend_from_slice(tx))
}

pub fn withdrawals_root(withdrawals: &[Withdrawal]) -> B256 {
    ordered_trie_root(withdrawals)
}

/// Rebuilds the execution header a payload describes.
pub fn payload_header(
    payload: &ExecutionPayload,
    parent_beacon_block_root: Option<B256>,
) -> eyre::Result<Header> {
    let v1 = payload.as_v1();
    let base_fee_per_gas = u64::try_from(v1.base_fee_per_gas)
        .map_err(|_| HarnessError::Overflow(format!("base fee {}", v1.base_fee_per_gas)))?;
    let v3 = payload.as_v3();

    Ok(Header {
        parent_hash: v1.parent_hash,
        ommers_hash: EMPTY_UNCLE_HASH,
        beneficiary: v1.fee_recipient,
        state_root: v1.state_root,
        transactions_root: transactions_root(&v1.transactions),
        receipts_root: v1.receipts_root,
        logs_bloom: v1.logs_bloom,
        difficulty: U256::ZERO,
        number: v1.block_number,
        gas_limit: v1.gas_limit,
        gas_used: v1.gas_used,
        timestamp: v1.timestamp,
        extra_data: v1.extra_data.clone(),
        mix_hash: v1.prev_randao,
        nonce: B64::ZERO,
        base_fee_per_gas: Some(base_fee_per_gas),
        withdrawals_root: payload.as_v2().map(|p| withdrawals_root(&p.withdrawals)),
        blob_gas_used: v3.map(|p| p.blob_gas_used),
        excess_blob_gas: v3.map(|p| p.excess_blob_gas),
        parent_beacon_block_root: v3.and(parent_beacon_block_root.or(Some(B256::ZERO))),
        ..Default::default()
    })
}

/// Keccak of the RLP header derived from the payload fields.
pub fn compute_block_hash(
    payload: &ExecutionPayload,
    parent_beacon_block_root: Option<B256>,
) -> eyre::Result<B256> {
    Ok(payload_header(payload, parent_beacon_block_root)?.hash_slow())
}

/// Blob versioned hashes carried by the payload's type-3 transactions, in order.
pub fn versioned_hashes(payload: &ExecutionPayload) -> eyre::Result<Vec<B256>> {
    let mut hashes = Vec::new();
    for (i, raw) in payload.as_v1().transactions.iter().enumerate() {
        let tx = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|e| eyre!("failed to decode transaction {i}: {e}"))?;
        if let Some(h) = tx.blob_versioned_hashes() {
            hashes.extend_from_slice(h);
        }
    }
    Ok(hashes)
}

/// Deterministic parent beacon root the CL Mocker uses for a payload timestamp.
pub fn timestamp_to_beacon_root(timestamp: u64) -> B256 {
    B256::from_slice(&Sha256::digest(timestamp.to_be_bytes()))
}

/// `0x01 || sha256(commitment)[1..]`, the hash a blob transaction commits to.
pub fn commitment_versioned_hash(commitment: &[u8]) -> B256 {
    let mut hash: [u8; 32] = Sha256::digest(commitment).into();
    hash[0] = VERSIONED_HASH_VERSION_KZG;
    B256::from(hash)
}

pub fn payload_withdrawals(payload: &ExecutionPayload) -> Option<&Vec<Withdrawal>> {
    payload.as_v2().map(|p| &p.withdrawals)
}

/// Field overrides applied to a built payload before it is re-broadcast.
///
/// Unless `block_hash` is set explicitly the hash is recomputed, so the
/// result is a well-formed payload with the requested content.
#[derive(Clone, Debug, Default)]
pub struct CustomPayloadData {
    pub parent_hash: Option<B256>,
    pub fee_recipient: Option<Address>,
    pub state_root: Option<B256>,
    pub receipts_root: Option<B256>,
    pub logs_bloom: Option<Bloom>,
    pub prev_randao: Option<B256>,
    pub number: Option<u64>,
    pub gas_limit: Option<u64>,
    pub gas_used: Option<u64>,
    pub timestamp: Option<u64>,
    pub extra_data: Option<Bytes>,
    pub base_fee_per_gas: Option<U256>,
    pub block_hash: Option<B256>,
    pub transactions: Option<Vec<Bytes>>,
    pub withdrawals: Option<Vec<Withdrawal>>,
    pub remove_withdrawals: bool,
    pub blob_gas_used: Option<u64>,
    pub excess_blob_gas: Option<u64>,
    pub parent_beacon_root: Option<B256>,
    pub remove_parent_beacon_root: bool,
}

impl CustomPayloadData {
    /// Returns the customised payload and the parent beacon root to send with it.
    pub fn apply(
        &self,
        base: &ExecutionPayload,
        parent_beacon_root: Option<B256>,
    ) -> eyre::Result<(ExecutionPayload, Option<B256>)> {
        let mut payload = base.clone();
        {
            let v1 = payload.as_v1_mut();
            macro_rules! set {
                ($field:ident, $src:expr) => {
                    if let Some(v) = &$src {
                        v1.$field = v.clone();
                    }
                };
            }
            set!(parent_hash, self.parent_hash);
            set!(fee_recipient, self.fee_recipient);
            set!(state_root, self.state_root);
            set!(receipts_root, self.receipts_root);
            set!(logs_bloom, self.logs_bloom);
            set!(prev_randao, self.prev_randao);
            set!(block_number, self.number);
            set!(gas_limit, self.gas_limit);
            set!(gas_used, self.gas_used);
            set!(timestamp, self.timestamp);
            set!(extra_data, self.extra_data);
            set!(base_fee_per_gas, self.base_fee_per_gas);
            set!(transactions, self.transactions);
        }

        payload = match (payload, &self.withdrawals, self.remove_withdrawals) {
            (ExecutionPayload::V2(p), _, true) => ExecutionPayload::V1(p.payload_inner),
            (ExecutionPayload::V3(p), _, true) => ExecutionPayload::V1(p.payload_inner.payload_inner),
            (ExecutionPayload::V1(p), Some(ws), false) => {
                ExecutionPayload::V2(ExecutionPayloadV2 { payload_inner: p, withdrawals: ws.clone() })
            }
            (ExecutionPayload::V2(mut p), Some(ws), false) => {
                p.withdrawals = ws.clone();
                ExecutionPayload::V2(p)
            }
            (ExecutionPayload::V3(mut p), Some(ws), false) => {
                p.payload_inner.withdrawals = ws.clone();
                ExecutionPayload::V3(p)
            }
            (p, _, _) => p,
        };

        if self.blob_gas_used.is_some() || self.excess_blob_gas.is_some() {
            payload = match payload {
                ExecutionPayload::V3(mut p) => {
                    p.blob_gas_used = self.blob_gas_used.unwrap_or(p.blob_gas_used);
                    p.excess_blob_gas = self.excess_blob_gas.unwrap_or(p.excess_blob_gas);
                    ExecutionPayload::V3(p)
                }
                ExecutionPayload::V2(p) => ExecutionPayload::V3(ExecutionPayloadV3 {
                    payload_inner: p,
                    blob_gas_used: self.blob_gas_used.unwrap_or_default(),
                    excess_blob_gas: self.excess_blob_gas.unwrap_or_default(),
                }),
                ExecutionPayload::V1(_) => {
                    return Err(eyre!("blob gas fields require a payload with withdrawals"));
                }
            };
        }

        let beacon_root = if self.remove_parent_beacon_root {
            None
        } else {
            self.parent_beacon_root.or(parent_beacon_root)
        };

        let hash = match self.block_hash {
            Some(h) => h,
            None => compute_block_hash(&payload, beacon_root)?,
        };
        payload.as_v1_mut().block_hash = hash;
        Ok((payload, beacon_root))
    }
}

#[cfg(test)]
mod tests {
    use alloy_rpc_types_engine::ExecutionPayloadV1;

    use super::*;

    fn sample_v1() -> ExecutionPayloadV1 {
        ExecutionPayloadV1 {
            parent_hash: B256::repeat_byte(1),
            fee_recipient: Address::repeat_byte(2),
            state_root: B256::repeat_byte(3),
            receipts_root: B256::repeat_byte(4),
            logs_bloom: Bloom::ZERO,
            prev_randao: B256::repeat_byte(5),
            block_number: 10,
            gas_limit: 30_000_000,
            gas_used: 0,
            timestamp: 1_700_000_000,
            extra_data: Bytes::new(),
            base_fee_per_gas: U256::from(7u64),
            block_hash: B256::ZERO,
            transactions: vec![],
        }
    }

    #[test]
    fn block_hash_matches_alloy_header_hash() {
        let payload = ExecutionPayload::V1(sample_v1());
        let header = payload_header(&payload, None).unwrap();
        assert_eq!(header.ommers_hash, EMPTY_UNCLE_HASH);
        assert_eq!(header.withdrawals_root, None);
        assert_eq!(compute_block_hash(&payload, None).unwrap(), header.hash_slow());
    }

    #[test]
    fn v3_header_carries_beacon_root() {
        let payload = ExecutionPayload::V3(ExecutionPayloadV3 {
            payload_inner: ExecutionPayloadV2 { payload_inner: sample_v1(), withdrawals: vec![] },
            blob_gas_used: 0,
            excess_blob_gas: 0,
        });
        let root = timestamp_to_beacon_root(1_700_000_000);
        let header = payload_header(&payload, Some(root)).unwrap();
        assert_eq!(header.parent_beacon_block_root, Some(root));
        assert_eq!(header.withdrawals_root, Some(alloy_trie::EMPTY_ROOT_HASH));
        assert_eq!(header.blob_gas_used, Some(0));
    }

    #[test]
    fn customising_state_root_changes_hash() {
        let base = ExecutionPayload::V1(sample_v1());
        let original_hash = compute_block_hash(&base, None).unwrap();

        let mut state_root = sample_v1().state_root;
        state_root.0[31] ^= 0xff;
        let custom = CustomPayloadData { state_root: Some(state_root), ..Default::default() };
        let (modified, _) = custom.apply(&base, None).unwrap();
        assert_eq!(modified.as_v1().state_root, state_root);
        assert_ne!(modified.as_v1().block_hash, original_hash);
        assert_eq!(modified.as_v1().block_hash, compute_block_hash(&modified, None).unwrap());
    }

    #[test]
    fn explicit_block_hash_is_kept() {
        let base = ExecutionPayload::V1(sample_v1());
        let custom = CustomPayloadData {
            parent_hash: Some(B256::repeat_byte(0xee)),
            block_hash: Some(B256::repeat_byte(0xdd)),
            ..Default::default()
        };
        let (modified, _) = custom.apply(&base, None).unwrap();
        assert_eq!(modified.as_v1().block_hash, B256::repeat_byte(0xdd));
        assert_eq!(modified.as_v1().parent_hash, B256::repeat_byte(0xee));
    }

    #[test]
    fn versioned_hash_replaces_first_byte() {
        let commitment = [0xc0u8; 48];
        let hash = commitment_versioned_hash(&commitment);
        assert_eq!(hash[0], VERSIONED_HASH_VERSION_KZG);
        assert_eq!(hash[1..], Sha256::digest(commitment)[1..]);
    }

    #[test]
    fn beacon_root_is_sha256_of_big_endian_timestamp() {
        let root = timestamp_to_beacon_root(1);
        let expected = Sha256::digest([0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(root.as_slice(), expected.as_slice());
    }
}

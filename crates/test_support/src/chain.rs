//! Deterministic in-memory execution chain.

use std::collections::{BTreeMap, HashMap};

use alloy_consensus::Header;
use alloy_eips::eip4895::Withdrawal;
use alloy_primitives::{Address, B256, Bloom, Bytes, U256, keccak256};
use alloy_rpc_types::BlockNumberOrTag;
use alloy_rpc_types_engine::{
    BlobsBundleV1, ExecutionPayload, ExecutionPayloadV1, ExecutionPayloadV2, ExecutionPayloadV3, ForkchoiceState,
    PayloadAttributes, PayloadId,
};
use color_eyre::eyre;
use hivenet_execution::ExecutionError;
use hivenet_types::{
    ForkConfig,
    constants::{DEFAULT_GAS_LIMIT, EMPTY_UNCLE_HASH, WEI_PER_GWEI},
    engine_api::{ForkchoiceUpdatedResponse, GetPayloadResponse, PayloadStatusKind, PayloadStatusV1},
    error::{INVALID_FORKCHOICE_STATE, INVALID_PAYLOAD_ATTRIBUTES, UNSUPPORTED_FORK},
    fork::ExecutionFork,
    payload::{compute_block_hash, payload_header, payload_withdrawals, withdrawals_root},
};

/// JSON-RPC code for a `getPayload` with an id the EL never handed out.
pub const UNKNOWN_PAYLOAD: i64 = -38001;

const BASE_FEE: u64 = 7;

/// State root the chain expects after applying `withdrawals` on top of `parent_state_root`.
///
/// The chain executes nothing; this rule is what makes a payload with a
/// tampered state root detectably invalid.
pub fn next_state_root(parent_state_root: B256, withdrawals: &[Withdrawal]) -> B256 {
    let mut preimage = parent_state_root.to_vec();
    preimage.extend_from_slice(withdrawals_root(withdrawals).as_slice());
    keccak256(preimage)
}

fn rpc_error(code: i64, message: impl Into<String>) -> eyre::Report {
    ExecutionError::JsonRpc { code, message: message.into() }.into()
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredBlock {
    pub hash: B256,
    pub header: Header,
    pub withdrawals: Vec<Withdrawal>,
}

impl StoredBlock {
    /// The block as `eth_getBlockByNumber` returns it, with transaction hashes only.
    pub fn rpc_header(&self) -> alloy_rpc_types::Header {
        alloy_rpc_types::Header {
            hash: self.hash,
            inner: self.header.clone(),
            total_difficulty: Some(self.header.difficulty),
            size: None,
        }
    }
}

#[derive(Clone, Debug)]
struct PendingPayload {
    payload: ExecutionPayload,
}

/// An execution chain that answers the Engine API deterministically.
#[derive(Debug)]
pub struct InMemoryChain {
    forks: ForkConfig,
    genesis: B256,
    blocks: HashMap<B256, StoredBlock>,
    canonical: BTreeMap<u64, B256>,
    forkchoice: ForkchoiceState,
    pending: HashMap<PayloadId, PendingPayload>,
    next_payload_id: u64,
    mempool: Vec<Bytes>,
    syncing: bool,
    calls: Vec<String>,
}

impl InMemoryChain {
    pub fn new(genesis_timestamp: u64, forks: ForkConfig) -> Self {
        let fork = forks.execution_fork_at(genesis_timestamp);
        let header = Header {
            ommers_hash: EMPTY_UNCLE_HASH,
            state_root: keccak256(b"hivenet genesis"),
            transactions_root: alloy_trie::EMPTY_ROOT_HASH,
            receipts_root: alloy_trie::EMPTY_ROOT_HASH,
            gas_limit: DEFAULT_GAS_LIMIT,
            timestamp: genesis_timestamp,
            base_fee_per_gas: Some(BASE_FEE),
            withdrawals_root: (fork >= ExecutionFork::Shanghai).then_some(alloy_trie::EMPTY_ROOT_HASH),
            blob_gas_used: (fork >= ExecutionFork::Cancun).then_some(0),
            excess_blob_gas: (fork >= ExecutionFork::Cancun).then_some(0),
            parent_beacon_block_root: (fork >= ExecutionFork::Cancun).then_some(B256::ZERO),
            ..Default::default()
        };
        let genesis = StoredBlock { hash: header.hash_slow(), header, withdrawals: Vec::new() };
        let hash = genesis.hash;
        Self {
            forks,
            genesis: hash,
            blocks: HashMap::from([(hash, genesis)]),
            canonical: BTreeMap::from([(0, hash)]),
            forkchoice: ForkchoiceState {
                head_block_hash: hash,
                safe_block_hash: B256::ZERO,
                finalized_block_hash: B256::ZERO,
            },
            pending: HashMap::new(),
            next_payload_id: 1,
            mempool: Vec::new(),
            syncing: false,
            calls: Vec::new(),
        }
    }

    pub fn forks(&self) -> ForkConfig {
        self.forks
    }

    pub fn genesis(&self) -> &StoredBlock {
        &self.blocks[&self.genesis]
    }

    pub fn head(&self) -> &StoredBlock {
        self.blocks.get(&self.forkchoice.head_block_hash).unwrap_or_else(|| self.genesis())
    }

    pub fn forkchoice(&self) -> ForkchoiceState {
        self.forkchoice
    }

    /// While syncing, every `newPayload` and `forkchoiceUpdated` answers `SYNCING`.
    pub fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
    }

    /// Engine methods received so far, in order.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn mempool(&self) -> &[Bytes] {
        &self.mempool
    }

    pub fn block_by_hash(&self, hash: &B256) -> Option<&StoredBlock> {
        self.blocks.get(hash)
    }

    pub fn block_by_tag(&self, tag: BlockNumberOrTag) -> Option<&StoredBlock> {
        let nonzero = |h: B256| (!h.is_zero()).then_some(h);
        let hash = match tag {
            BlockNumberOrTag::Latest | BlockNumberOrTag::Pending => Some(self.head().hash),
            BlockNumberOrTag::Safe => nonzero(self.forkchoice.safe_block_hash),
            BlockNumberOrTag::Finalized => nonzero(self.forkchoice.finalized_block_hash),
            BlockNumberOrTag::Earliest => Some(self.genesis),
            BlockNumberOrTag::Number(n) => self.canonical.get(&n).copied(),
        }?;
        self.blocks.get(&hash)
    }

    /// Withdrawn wei credited to `address` up to and including the block at `tag`.
    pub fn balance_at(&self, address: Address, tag: BlockNumberOrTag) -> U256 {
        let mut gwei = 0u64;
        let mut cursor = self.block_by_tag(tag);
        while let Some(block) = cursor {
            gwei += block.withdrawals.iter().filter(|w| w.address == address).map(|w| w.amount).sum::<u64>();
            cursor = self.blocks.get(&block.header.parent_hash);
        }
        U256::from(gwei) * U256::from(WEI_PER_GWEI)
    }

    pub fn submit_transaction(&mut self, raw: Bytes) -> B256 {
        let hash = keccak256(&raw);
        self.mempool.push(raw);
        hash
    }

    pub fn forkchoice_updated(
        &mut self,
        version: u8,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> eyre::Result<ForkchoiceUpdatedResponse> {
        self.calls.push(format!("engine_forkchoiceUpdatedV{version}"));
        let syncing = ForkchoiceUpdatedResponse {
            payload_status: PayloadStatusV1::new(PayloadStatusKind::Syncing, None),
            payload_id: None,
        };
        if self.syncing {
            return Ok(syncing);
        }
        let Some(head) = self.blocks.get(&state.head_block_hash).cloned() else {
            return Ok(syncing);
        };
        for (label, hash) in [("safe", state.safe_block_hash), ("finalized", state.finalized_block_hash)] {
            if !hash.is_zero() && !self.blocks.contains_key(&hash) {
                return Err(rpc_error(INVALID_FORKCHOICE_STATE, format!("unknown {label} block {hash}")));
            }
        }

        if let Some(attrs) = &attributes {
            let expected = self.forks.forkchoice_updated_version(head.header.timestamp, Some(attrs.timestamp));
            if version != expected {
                return Err(rpc_error(UNSUPPORTED_FORK, format!("expected forkchoiceUpdatedV{expected}")));
            }
            if attrs.timestamp <= head.header.timestamp {
                return Err(rpc_error(INVALID_PAYLOAD_ATTRIBUTES, "timestamp not after head"));
            }
        }

        self.set_canonical(&head);
        self.forkchoice = state;
        let payload_id = attributes.map(|attrs| self.build_payload(&head, attrs)).transpose()?;
        Ok(ForkchoiceUpdatedResponse {
            payload_status: PayloadStatusV1::new(PayloadStatusKind::Valid, Some(head.hash)),
            payload_id,
        })
    }

    /// Builds, imports and makes canonical one block on top of the head,
    /// paying out `withdrawals` when the fork has them.
    pub fn advance(&mut self, withdrawals: Vec<Withdrawal>) -> eyre::Result<B256> {
        let parent = self.head().clone();
        let timestamp = parent.header.timestamp + 1;
        let fork = self.forks.execution_fork_at(timestamp);
        let parent_beacon_block_root = (fork >= ExecutionFork::Cancun).then_some(B256::ZERO);
        let attrs = PayloadAttributes {
            timestamp,
            prev_randao: B256::ZERO,
            suggested_fee_recipient: Address::ZERO,
            withdrawals: (fork >= ExecutionFork::Shanghai).then_some(withdrawals),
            parent_beacon_block_root,
        };
        let fcu_version = self.forks.forkchoice_updated_version(parent.header.timestamp, Some(timestamp));
        let state = ForkchoiceState { head_block_hash: parent.hash, ..self.forkchoice };
        let payload_id = self
            .forkchoice_updated(fcu_version, state, Some(attrs))?
            .payload_id
            .ok_or_else(|| eyre::eyre!("no payload built on {}", parent.hash))?;
        let payload = self.get_payload(self.forks.get_payload_version(timestamp), payload_id)?.execution_payload;
        let hash = payload.as_v1().block_hash;
        let status = self.new_payload(self.forks.new_payload_version(timestamp), &payload, parent_beacon_block_root)?;
        if !status.is_valid() {
            return Err(eyre::eyre!("own payload {hash} rejected: {}", status.status));
        }
        self.forkchoice_updated(fcu_version, ForkchoiceState { head_block_hash: hash, ..state }, None)?;
        Ok(hash)
    }

    fn set_canonical(&mut self, head: &StoredBlock) {
        let head_number = head.header.number;
        self.canonical.retain(|n, _| *n <= head_number);
        let mut cursor = Some(head.clone());
        while let Some(block) = cursor {
            if self.canonical.get(&block.header.number) == Some(&block.hash) {
                break;
            }
            self.canonical.insert(block.header.number, block.hash);
            cursor = self.blocks.get(&block.header.parent_hash).cloned();
        }
    }

    fn build_payload(&mut self, parent: &StoredBlock, attrs: PayloadAttributes) -> eyre::Result<PayloadId> {
        let withdrawals = attrs.withdrawals.unwrap_or_default();
        let v1 = ExecutionPayloadV1 {
            parent_hash: parent.hash,
            fee_recipient: attrs.suggested_fee_recipient,
            state_root: next_state_root(parent.header.state_root, &withdrawals),
            receipts_root: alloy_trie::EMPTY_ROOT_HASH,
            logs_bloom: Bloom::ZERO,
            prev_randao: attrs.prev_randao,
            block_number: parent.header.number + 1,
            gas_limit: parent.header.gas_limit,
            gas_used: 0,
            timestamp: attrs.timestamp,
            extra_data: Bytes::new(),
            base_fee_per_gas: U256::from(BASE_FEE),
            block_hash: B256::ZERO,
            transactions: Vec::new(),
        };
        let mut payload = match self.forks.execution_fork_at(attrs.timestamp) {
            ExecutionFork::Paris => ExecutionPayload::V1(v1),
            ExecutionFork::Shanghai => ExecutionPayload::V2(ExecutionPayloadV2 { payload_inner: v1, withdrawals }),
            ExecutionFork::Cancun => ExecutionPayload::V3(ExecutionPayloadV3 {
                payload_inner: ExecutionPayloadV2 { payload_inner: v1, withdrawals },
                blob_gas_used: 0,
                excess_blob_gas: 0,
            }),
        };
        payload.as_v1_mut().block_hash = compute_block_hash(&payload, attrs.parent_beacon_block_root)?;

        let id = PayloadId::new(self.next_payload_id.to_be_bytes());
        self.next_payload_id += 1;
        self.pending.insert(id, PendingPayload { payload });
        Ok(id)
    }

    pub fn get_payload(&mut self, version: u8, payload_id: PayloadId) -> eyre::Result<GetPayloadResponse> {
        self.calls.push(format!("engine_getPayloadV{version}"));
        let pending = self
            .pending
            .get(&payload_id)
            .ok_or_else(|| rpc_error(UNKNOWN_PAYLOAD, format!("unknown payload {payload_id}")))?;
        let payload = pending.payload.clone();
        let expected = self.forks.get_payload_version(payload.as_v1().timestamp);
        if version != expected {
            return Err(rpc_error(UNSUPPORTED_FORK, format!("expected getPayloadV{expected}")));
        }
        if version == 1 {
            return Ok(GetPayloadResponse::from_v1(payload));
        }
        let cancun = version >= 3;
        Ok(GetPayloadResponse {
            execution_payload: payload,
            block_value: Some(U256::ZERO),
            blobs_bundle: cancun
                .then(|| BlobsBundleV1 { commitments: Vec::new(), proofs: Vec::new(), blobs: Vec::new() }),
            should_override_builder: cancun.then_some(false),
        })
    }

    pub fn new_payload(
        &mut self,
        version: u8,
        payload: &ExecutionPayload,
        parent_beacon_block_root: Option<B256>,
    ) -> eyre::Result<PayloadStatusV1> {
        self.calls.push(format!("engine_newPayloadV{version}"));
        let v1 = payload.as_v1();
        let expected = self.forks.new_payload_version(v1.timestamp);
        if version != expected {
            return Err(rpc_error(UNSUPPORTED_FORK, format!("expected newPayloadV{expected}")));
        }
        if self.syncing {
            return Ok(PayloadStatusV1::new(PayloadStatusKind::Syncing, None));
        }

        let computed = compute_block_hash(payload, parent_beacon_block_root)?;
        if computed != v1.block_hash {
            return Ok(PayloadStatusV1 {
                status: PayloadStatusKind::InvalidBlockHash,
                latest_valid_hash: None,
                validation_error: Some(format!("block hash mismatch: computed {computed}")),
            });
        }
        if self.blocks.contains_key(&v1.block_hash) {
            return Ok(PayloadStatusV1::new(PayloadStatusKind::Valid, Some(v1.block_hash)));
        }
        let Some(parent) = self.blocks.get(&v1.parent_hash) else {
            return Ok(PayloadStatusV1::new(PayloadStatusKind::Syncing, None));
        };

        let withdrawals = payload_withdrawals(payload).cloned().unwrap_or_default();
        let invalid = |reason: &str| PayloadStatusV1 {
            status: PayloadStatusKind::Invalid,
            latest_valid_hash: Some(parent.hash),
            validation_error: Some(reason.to_owned()),
        };
        if v1.block_number != parent.header.number + 1 {
            return Ok(invalid("block number does not follow parent"));
        }
        if v1.timestamp <= parent.header.timestamp {
            return Ok(invalid("timestamp not after parent"));
        }
        if v1.state_root != next_state_root(parent.header.state_root, &withdrawals) {
            return Ok(invalid("state root mismatch"));
        }

        let header = payload_header(payload, parent_beacon_block_root)?;
        let hash = v1.block_hash;
        self.blocks.insert(hash, StoredBlock { hash, header, withdrawals });
        Ok(PayloadStatusV1::new(PayloadStatusKind::Valid, Some(hash)))
    }
}

#[cfg(test)]
mod tests {
    use hivenet_execution::is_engine_error;
    use hivenet_types::{
        ForkName,
        payload::{CustomPayloadData, timestamp_to_beacon_root},
    };

    use super::*;

    const GENESIS: u64 = 1_000;

    fn capella_chain() -> InMemoryChain {
        InMemoryChain::new(GENESIS, ForkConfig { shanghai_timestamp: Some(0), ..ForkConfig::default() })
    }

    fn attrs(timestamp: u64, withdrawals: Vec<Withdrawal>) -> PayloadAttributes {
        PayloadAttributes {
            timestamp,
            prev_randao: B256::repeat_byte(0x11),
            suggested_fee_recipient: Address::repeat_byte(0x22),
            withdrawals: Some(withdrawals),
            parent_beacon_block_root: None,
        }
    }

    fn head_state(hash: B256) -> ForkchoiceState {
        ForkchoiceState { head_block_hash: hash, safe_block_hash: B256::ZERO, finalized_block_hash: B256::ZERO }
    }

    fn build(chain: &mut InMemoryChain, timestamp: u64, withdrawals: Vec<Withdrawal>) -> ExecutionPayload {
        let head = chain.head().hash;
        let resp = chain.forkchoice_updated(2, head_state(head), Some(attrs(timestamp, withdrawals))).unwrap();
        chain.get_payload(2, resp.payload_id.unwrap()).unwrap().execution_payload
    }

    #[test]
    fn built_payload_is_accepted_and_becomes_head() {
        let mut chain = capella_chain();
        let payload = build(&mut chain, GENESIS + 1, vec![]);
        assert_eq!(payload.as_v1().block_number, 1);
        assert_eq!(payload.as_v1().prev_randao, B256::repeat_byte(0x11));

        let status = chain.new_payload(2, &payload, None).unwrap();
        assert!(status.is_valid());
        assert_eq!(status.latest_valid_hash, Some(payload.as_v1().block_hash));

        chain.forkchoice_updated(2, head_state(payload.as_v1().block_hash), None).unwrap();
        assert_eq!(chain.head().header.number, 1);
        assert_eq!(chain.block_by_tag(BlockNumberOrTag::Number(1)).unwrap().hash, payload.as_v1().block_hash);
        assert_eq!(chain.head().header.mix_hash, B256::repeat_byte(0x11));
    }

    #[test]
    fn tampered_state_root_is_invalid_with_parent_as_latest_valid() {
        let mut chain = capella_chain();
        let payload = build(&mut chain, GENESIS + 1, vec![]);
        let mut state_root = payload.as_v1().state_root;
        state_root.0[31] ^= 0x01;
        let (bad, _) =
            CustomPayloadData { state_root: Some(state_root), ..Default::default() }.apply(&payload, None).unwrap();

        let status = chain.new_payload(2, &bad, None).unwrap();
        assert_eq!(status.status, PayloadStatusKind::Invalid);
        assert_eq!(status.latest_valid_hash, Some(chain.genesis().hash));
    }

    #[test]
    fn unknown_parent_and_unknown_head_are_syncing() {
        let mut chain = capella_chain();
        let payload = build(&mut chain, GENESIS + 1, vec![]);
        let (orphan, _) = CustomPayloadData { parent_hash: Some(B256::repeat_byte(0xaa)), ..Default::default() }
            .apply(&payload, None)
            .unwrap();
        let status = chain.new_payload(2, &orphan, None).unwrap();
        assert_eq!(status.status, PayloadStatusKind::Syncing);
        assert_eq!(status.latest_valid_hash, None);

        let resp = chain.forkchoice_updated(2, head_state(B256::repeat_byte(0xbb)), None).unwrap();
        assert_eq!(resp.payload_status.status, PayloadStatusKind::Syncing);
    }

    #[test]
    fn wrong_hash_is_reported_as_invalid_block_hash() {
        let mut chain = capella_chain();
        let payload = build(&mut chain, GENESIS + 1, vec![]);
        let (bad, _) = CustomPayloadData { block_hash: Some(B256::repeat_byte(0x01)), ..Default::default() }
            .apply(&payload, None)
            .unwrap();
        let status = chain.new_payload(2, &bad, None).unwrap();
        assert_eq!(status.status, PayloadStatusKind::InvalidBlockHash);
    }

    #[test]
    fn version_mismatch_is_unsupported_fork() {
        let mut chain = capella_chain();
        let head = chain.head().hash;
        let err = chain.forkchoice_updated(1, head_state(head), Some(attrs(GENESIS + 1, vec![]))).unwrap_err();
        assert!(is_engine_error(&err, UNSUPPORTED_FORK));

        let err = chain.forkchoice_updated(2, head_state(head), Some(attrs(GENESIS, vec![]))).unwrap_err();
        assert!(is_engine_error(&err, INVALID_PAYLOAD_ATTRIBUTES));
    }

    #[test]
    fn withdrawals_credit_balances() {
        let mut chain = capella_chain();
        let to = Address::repeat_byte(0x33);
        let withdrawal = Withdrawal { index: 0, validator_index: 4, address: to, amount: 5 };
        let payload = build(&mut chain, GENESIS + 1, vec![withdrawal]);
        chain.new_payload(2, &payload, None).unwrap();
        chain.forkchoice_updated(2, head_state(payload.as_v1().block_hash), None).unwrap();

        assert_eq!(chain.balance_at(to, BlockNumberOrTag::Latest), U256::from(5_000_000_000u64));
        assert_eq!(chain.balance_at(to, BlockNumberOrTag::Number(0)), U256::ZERO);
    }

    #[test]
    fn cancun_genesis_carries_blob_fields() {
        let forks = ForkConfig {
            shanghai_timestamp: Some(0),
            cancun_timestamp: Some(0),
            ..ForkConfig::at_genesis(ForkName::Deneb)
        };
        let mut chain = InMemoryChain::new(GENESIS, forks);
        assert_eq!(chain.genesis().header.blob_gas_used, Some(0));

        let head = chain.head().hash;
        let root = timestamp_to_beacon_root(GENESIS + 1);
        let attrs = PayloadAttributes { parent_beacon_block_root: Some(root), ..attrs(GENESIS + 1, vec![]) };
        let id = chain.forkchoice_updated(3, head_state(head), Some(attrs)).unwrap().payload_id.unwrap();
        let resp = chain.get_payload(3, id).unwrap();
        assert!(resp.blobs_bundle.is_some());
        assert!(chain.new_payload(3, &resp.execution_payload, Some(root)).unwrap().is_valid());
    }

    #[test]
    fn advance_extends_the_canonical_chain() {
        let mut chain = capella_chain();
        let to = Address::repeat_byte(0x44);
        let first = chain.advance(vec![Withdrawal { index: 0, validator_index: 1, address: to, amount: 3 }]).unwrap();
        let second = chain.advance(Vec::new()).unwrap();

        assert_eq!(chain.head().hash, second);
        assert_eq!(chain.head().header.parent_hash, first);
        assert_eq!(chain.block_by_tag(BlockNumberOrTag::Number(1)).unwrap().hash, first);
        assert_eq!(chain.balance_at(to, BlockNumberOrTag::Latest), U256::from(3_000_000_000u64));
    }
}

//! Scripted beacon REST server for the testnet checks, plus helpers that
//! point a testnet's nodes at per-node fakes on loopback.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use alloy_consensus::{SignableTransaction, TxEip4844, TxEip4844Variant, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, B256, Bloom, Bytes, FixedBytes, Signature, U256};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use hivenet_consensus::{BeaconClient, BeaconClientConfig, VersionedBeaconState};
use hivenet_execution::{ExecutionClient, ExecutionClientConfig};
use hivenet_genesis::{bls, derive_validator_keys, keys::DEFAULT_VALIDATOR_MNEMONIC};
use hivenet_node::{ExternalClient, ManagedClient, NodeDefinition, NodeDefinitions, Simulator};
use hivenet_test_support::RecordingSimulator;
use hivenet_types::{
    ForkConfig, ForkName,
    aliases::{Gwei, Root, Slot, ValidatorIndex},
    beacon::{BeaconBlockHeader, Checkpoint},
    constants::DEFAULT_JWT_SECRET,
    state::BeaconState,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tree_hash::TreeHash;

use crate::{
    config::Config,
    prepared::{Environment, PreparedTestnet},
    testnet::Testnet,
    verification::kzg_versioned_hash,
};

pub(crate) const SLOT_TIME: u64 = 1;
pub(crate) const SLOTS_PER_EPOCH: u64 = 8;

fn signature_hex() -> String {
    format!("0x{}", "00".repeat(96))
}

/// One block of the scripted chain and the post-state it commits to.
#[derive(Clone, Debug)]
pub(crate) struct FakeBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub state: BeaconState,
    pub payload_number: u64,
    pub payload_hash: B256,
    pub transactions: Vec<Bytes>,
    /// `(validator, address, gwei)` paid out by the payload.
    pub withdrawals: Vec<(ValidatorIndex, Address, Gwei)>,
    pub commitments: Vec<FixedBytes<48>>,
}

impl FakeBlock {
    pub(crate) fn new(slot: Slot, proposer_index: ValidatorIndex, state: &BeaconState) -> Self {
        Self {
            slot,
            proposer_index,
            state: state.clone(),
            payload_number: slot,
            payload_hash: B256::left_padding_from(&(slot + 1).to_be_bytes()),
            transactions: Vec::new(),
            withdrawals: Vec::new(),
            commitments: Vec::new(),
        }
    }

    /// Adds one blob transaction per commitment, each carrying `hashes[i]`.
    pub(crate) fn with_blobs(mut self, commitments: Vec<FixedBytes<48>>, hashes: Vec<B256>) -> Self {
        self.transactions.extend(hashes.into_iter().map(|h| blob_transaction(vec![h])));
        self.commitments = commitments;
        self
    }

    /// Like [`FakeBlock::with_blobs`] with the hashes the commitments imply.
    pub(crate) fn with_valid_blobs(self, commitments: Vec<FixedBytes<48>>) -> Self {
        let hashes = commitments.iter().map(|c| kzg_versioned_hash(c.as_slice())).collect();
        self.with_blobs(commitments, hashes)
    }

    pub(crate) fn with_withdrawal(mut self, index: ValidatorIndex, address: Address, amount: Gwei) -> Self {
        self.withdrawals.push((index, address, amount));
        self
    }

    fn body_root(&self) -> Root {
        Root::left_padding_from(&self.slot.to_be_bytes())
    }

    fn payload_json(&self, fork: ForkName) -> Value {
        let withdrawals: Vec<Value> = self
            .withdrawals
            .iter()
            .enumerate()
            .map(|(i, (index, address, amount))| {
                json!({"index": i.to_string(), "validator_index": index.to_string(), "address": address, "amount": amount.to_string()})
            })
            .collect();
        let mut payload = json!({
            "parent_hash": B256::ZERO,
            "fee_recipient": Address::ZERO,
            "state_root": B256::ZERO,
            "receipts_root": B256::ZERO,
            "logs_bloom": Bloom::ZERO,
            "prev_randao": B256::ZERO,
            "block_number": self.payload_number.to_string(),
            "gas_limit": "30000000",
            "gas_used": "0",
            "timestamp": self.slot.to_string(),
            "extra_data": "0x",
            "base_fee_per_gas": "7",
            "block_hash": self.payload_hash,
            "transactions": self.transactions,
            "withdrawals": withdrawals,
        });
        if fork.deneb_enabled() {
            payload["blob_gas_used"] = json!("0");
            payload["excess_blob_gas"] = json!("0");
        }
        payload
    }
}

/// Type-3 transaction committing to `hashes`; the signature is never checked.
pub(crate) fn blob_transaction(hashes: Vec<B256>) -> Bytes {
    let tx: TxEip4844Variant = TxEip4844Variant::TxEip4844(TxEip4844 {
        chain_id: 1,
        nonce: 0,
        gas_limit: 21_000,
        max_fee_per_gas: 1,
        max_priority_fee_per_gas: 1,
        to: Address::repeat_byte(0xb1),
        value: U256::ZERO,
        access_list: Default::default(),
        blob_versioned_hashes: hashes,
        max_fee_per_blob_gas: 1,
        input: Bytes::new(),
    });
    let signed = tx.into_signed(Signature::new(U256::from(1), U256::from(1), false));
    TxEnvelope::Eip4844(signed).encoded_2718().into()
}

/// The chain one fake serves; blocks are in ascending slot order and the
/// last one is the head.
#[derive(Clone, Debug)]
pub(crate) struct FakeChain {
    pub fork: ForkName,
    pub blocks: Vec<FakeBlock>,
    pub justified: Checkpoint,
    pub finalized: Checkpoint,
    /// Serve at most this many sidecars per block.
    pub sidecar_limit: Option<usize>,
    /// Fill byte of every served KZG proof.
    pub proof_byte: u8,
}

impl FakeChain {
    pub(crate) fn new(fork: ForkName, blocks: Vec<FakeBlock>) -> Self {
        Self {
            fork,
            blocks,
            justified: Checkpoint::default(),
            finalized: Checkpoint::default(),
            sidecar_limit: None,
            proof_byte: 0,
        }
    }

    pub(crate) fn finalized_at(mut self, epoch: u64, root: Root) -> Self {
        self.justified = Checkpoint { epoch, root };
        self.finalized = Checkpoint { epoch, root };
        self
    }
}

struct Served {
    chain: FakeChain,
    headers: Vec<BeaconBlockHeader>,
    roots: Vec<Root>,
    state_roots: Vec<Root>,
}

impl Served {
    fn new(chain: FakeChain) -> Self {
        let mut headers = Vec::with_capacity(chain.blocks.len());
        let mut roots = Vec::with_capacity(chain.blocks.len());
        let mut state_roots = Vec::with_capacity(chain.blocks.len());
        let mut parent_root = Root::ZERO;
        for block in &chain.blocks {
            let state_root = block.state.root();
            let header = BeaconBlockHeader {
                slot: block.slot,
                proposer_index: block.proposer_index,
                parent_root,
                state_root,
                body_root: block.body_root(),
            };
            parent_root = header.tree_hash_root();
            roots.push(parent_root);
            state_roots.push(state_root);
            headers.push(header);
        }
        Self { chain, headers, roots, state_roots }
    }

    fn resolve(&self, id: &str) -> Option<usize> {
        let position = |root: Root| self.roots.iter().position(|r| *r == root);
        match id {
            "head" => self.chain.blocks.len().checked_sub(1),
            "genesis" => self.chain.blocks.iter().position(|b| b.slot == 0),
            "finalized" => position(self.chain.finalized.root),
            "justified" => position(self.chain.justified.root),
            id if id.starts_with("0x") => {
                let root: Root = id.parse().ok()?;
                position(root).or_else(|| self.state_roots.iter().position(|r| *r == root))
            }
            id => {
                let slot: Slot = id.parse().ok()?;
                self.chain.blocks.iter().position(|b| b.slot == slot)
            }
        }
    }

    fn signed_header(&self, i: usize) -> Value {
        json!({"message": self.headers[i], "signature": signature_hex()})
    }
}

pub(crate) struct FakeBeaconNode {
    addr: SocketAddr,
    served: Arc<Served>,
}

impl FakeBeaconNode {
    pub(crate) async fn spawn(chain: FakeChain) -> Self {
        let served = Arc::new(Served::new(chain));
        let app = Router::new()
            .route("/eth/v1/beacon/headers/{id}", get(header))
            .route("/eth/v2/beacon/blocks/{id}", get(block))
            .route("/eth/v1/beacon/blocks/{id}/root", get(block_root))
            .route("/eth/v1/beacon/blob_sidecars/{id}", get(blob_sidecars))
            .route("/eth/v1/beacon/states/{id}/finality_checkpoints", get(checkpoints))
            .route("/eth/v1/beacon/states/{id}/validators", get(validators))
            .route("/eth/v2/debug/beacon/states/{id}", get(debug_state))
            .with_state(served.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Self { addr, served }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Block root of the `i`-th scripted block.
    pub(crate) fn root(&self, i: usize) -> Root {
        self.served.roots[i]
    }
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"code": 404, "message": "not found"}))).into_response()
}

async fn header(State(served): State<Arc<Served>>, Path(id): Path<String>) -> Response {
    let Some(i) = served.resolve(&id) else { return not_found() };
    Json(json!({"data": {"root": served.roots[i], "canonical": true, "header": served.signed_header(i)}})).into_response()
}

async fn block(State(served): State<Arc<Served>>, Path(id): Path<String>) -> Response {
    let Some(i) = served.resolve(&id) else { return not_found() };
    let fork = served.chain.fork;
    let block = &served.chain.blocks[i];
    let header = &served.headers[i];
    let mut body = json!({
        "randao_reveal": signature_hex(),
        "eth1_data": {"deposit_root": Root::ZERO, "deposit_count": "0", "block_hash": B256::ZERO},
        "graffiti": B256::ZERO,
        "execution_payload": block.payload_json(fork),
    });
    if fork.deneb_enabled() {
        body["blob_kzg_commitments"] = json!(block.commitments);
    }
    Json(json!({
        "version": fork.as_str(),
        "execution_optimistic": false,
        "data": {
            "message": {
                "slot": header.slot.to_string(),
                "proposer_index": header.proposer_index.to_string(),
                "parent_root": header.parent_root,
                "state_root": header.state_root,
                "body": body
            },
            "signature": signature_hex()
        }
    }))
    .into_response()
}

async fn block_root(State(served): State<Arc<Served>>, Path(id): Path<String>) -> Response {
    let Some(i) = served.resolve(&id) else { return not_found() };
    Json(json!({"data": {"root": served.roots[i]}})).into_response()
}

async fn blob_sidecars(State(served): State<Arc<Served>>, Path(id): Path<String>) -> Response {
    let Some(i) = served.resolve(&id) else { return not_found() };
    let chain = &served.chain;
    let limit = chain.sidecar_limit.unwrap_or(usize::MAX);
    let proof = format!("0x{}", format!("{:02x}", chain.proof_byte).repeat(48));
    let data: Vec<Value> = chain.blocks[i]
        .commitments
        .iter()
        .take(limit)
        .enumerate()
        .map(|(index, commitment)| {
            json!({
                "index": index.to_string(),
                "blob": "0x",
                "kzg_commitment": commitment,
                "kzg_proof": proof,
                "signed_block_header": served.signed_header(i),
            })
        })
        .collect();
    Json(json!({"data": data})).into_response()
}

async fn checkpoints(State(served): State<Arc<Served>>, Path(id): Path<String>) -> Response {
    if served.resolve(&id).is_none() {
        return not_found();
    }
    let chain = &served.chain;
    Json(json!({"data": {
        "previous_justified": chain.justified,
        "current_justified": chain.justified,
        "finalized": chain.finalized
    }}))
    .into_response()
}

async fn validators(
    State(served): State<Arc<Served>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(at) = served.resolve(&id) else { return not_found() };
    let wanted: Option<Vec<u64>> =
        query.get("id").map(|ids| ids.split(',').filter_map(|i| i.parse().ok()).collect());
    let state = &served.chain.blocks[at].state;
    let data: Vec<Value> = state
        .validators()
        .iter()
        .zip(state.balances().iter())
        .enumerate()
        .filter(|(i, _)| wanted.as_ref().is_none_or(|w| w.contains(&(*i as u64))))
        .map(|(i, (v, b))| {
            json!({"index": i.to_string(), "balance": b.to_string(), "status": "active_ongoing", "validator": v})
        })
        .collect();
    Json(json!({"data": data})).into_response()
}

async fn debug_state(State(served): State<Arc<Served>>, Path(id): Path<String>) -> Response {
    let Some(i) = served.resolve(&id) else { return not_found() };
    let state = &served.chain.blocks[i].state;
    let mut headers = HeaderMap::new();
    headers.insert("Eth-Consensus-Version", HeaderValue::from_static(state.fork_name().as_str()));
    (headers, state.to_ssz_bytes()).into_response()
}

fn loopback(client_type: &str) -> Arc<dyn ManagedClient> {
    Arc::new(ExternalClient::new(client_type, IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

/// Execution client of node `index` talking to a fake EL on `port`.
pub(crate) async fn execution_client(index: usize, port: u16) -> Arc<ExecutionClient> {
    let el = ExecutionClient::new(
        ExecutionClientConfig { jwt_secret: DEFAULT_JWT_SECRET, engine_port: port, rpc_port: port, ..ExecutionClientConfig::new(index) },
        loopback("geth"),
    );
    el.start().await.unwrap();
    Arc::new(el)
}

/// Beacon client of node `index` talking to a fake beacon node on `port`.
pub(crate) async fn beacon_client(index: usize, port: u16, genesis: &VersionedBeaconState) -> Arc<BeaconClient> {
    let bn = BeaconClient::new(
        BeaconClientConfig {
            api_port: port,
            spec: Some(genesis.spec().clone()),
            genesis_time: Some(genesis.inner().genesis_time()),
            genesis_validators_root: Some(genesis.genesis_validators_root()),
            ..BeaconClientConfig::new(index)
        },
        loopback("lighthouse-bn"),
    );
    bn.init(&CancellationToken::new()).await.unwrap();
    Arc::new(bn)
}

/// Capella testnet of `validators` validators over `definitions`, with one
/// second slots and eight slot epochs.
pub(crate) fn prepare(definitions: Vec<NodeDefinition>, validators: u64, genesis_time: u64) -> PreparedTestnet {
    bls::init().unwrap();
    let keys = Arc::new(derive_validator_keys(DEFAULT_VALIDATOR_MNEMONIC, 0, validators).unwrap());
    let config = Config {
        forks: ForkConfig::at_genesis(ForkName::Capella),
        validator_count: Some(validators),
        slot_time: Some(SLOT_TIME),
        slots_per_epoch: Some(SLOTS_PER_EPOCH),
        node_definitions: Some(NodeDefinitions(definitions)),
        genesis_execution_accounts: Some(Default::default()),
        ..Default::default()
    };
    PreparedTestnet::prepare_at(Environment::new(keys), &config, genesis_time).unwrap()
}

/// Creates the testnet, then points node `i` at the execution fake on
/// `ports[i].0` and the beacon fake on `ports[i].1`.
pub(crate) async fn wired_testnet(prepared: &PreparedTestnet, ports: &[(u16, u16)]) -> Testnet {
    let sim: Arc<dyn Simulator> = Arc::new(RecordingSimulator::new());
    let mut testnet = prepared.create(sim, CancellationToken::new()).await.unwrap();
    for (node, (el_port, bn_port)) in testnet.nodes.0.iter_mut().zip(ports) {
        node.execution = execution_client(node.index, *el_port).await;
        node.beacon = Some(beacon_client(node.index, *bn_port, &prepared.genesis_state).await);
    }
    testnet
}

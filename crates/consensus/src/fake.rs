//! In-process beacon REST server backing the client tests.
//!
//! Serves a four-block chain (slots 0, 1, 2 and 4) on top of a Capella
//! genesis state.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use alloy_primitives::B256;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hivenet_genesis::ValidatorKey;
use hivenet_types::{
    aliases::{Root, Slot},
    beacon::{SignedBlsToExecutionChange, SignedVoluntaryExit},
    state::BeaconState,
};
use serde_json::{Value, json};

use crate::{
    block::tests::{block_json, payload_json},
    state::tests::{GENESIS_TIME, capella_genesis},
};

const SLOTS: [Slot; 4] = [0, 1, 2, 4];
const STATE_ROOT_BYTE: u8 = 0x55;

struct Inner {
    state: BeaconState,
    keys: Vec<ValidatorKey>,
    bls_changes: Mutex<Vec<SignedBlsToExecutionChange>>,
    exits: Mutex<Vec<SignedVoluntaryExit>>,
}

pub(crate) struct FakeBeaconNode {
    addr: SocketAddr,
    inner: Arc<Inner>,
}

impl FakeBeaconNode {
    pub(crate) async fn spawn() -> Self {
        let (_, state, keys) = capella_genesis();
        let inner = Arc::new(Inner {
            state,
            keys,
            bls_changes: Mutex::new(Vec::new()),
            exits: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/eth/v1/config/spec", get(config_spec))
            .route("/eth/v1/beacon/genesis", get(genesis))
            .route("/eth/v1/node/identity", get(identity))
            .route("/eth/v1/beacon/headers/{id}", get(header))
            .route("/eth/v2/beacon/blocks/{id}", get(block))
            .route("/eth/v1/beacon/blocks/{id}/root", get(block_root))
            .route("/eth/v1/beacon/states/{id}/finality_checkpoints", get(checkpoints))
            .route("/eth/v1/beacon/states/{id}/validators", get(validators))
            .route("/eth/v1/beacon/states/{id}/validator_balances", get(balances))
            .route("/eth/v2/debug/beacon/states/{id}", get(debug_state))
            .route("/eth/v1/beacon/pool/bls_to_execution_changes", post(bls_changes))
            .route("/eth/v1/beacon/pool/voluntary_exits", post(voluntary_exit))
            .with_state(inner.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Self { addr, inner }
    }

    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    pub(crate) fn genesis_time(&self) -> u64 {
        GENESIS_TIME
    }

    pub(crate) fn genesis_validators_root(&self) -> Root {
        self.inner.state.genesis_validators_root()
    }

    pub(crate) fn validator_count(&self) -> usize {
        self.inner.state.validators().len()
    }

    pub(crate) fn keys(&self) -> &[ValidatorKey] {
        &self.inner.keys
    }

    pub(crate) fn submitted_bls_changes(&self) -> Vec<SignedBlsToExecutionChange> {
        self.inner.bls_changes.lock().unwrap().clone()
    }

    pub(crate) fn submitted_exits(&self) -> Vec<SignedVoluntaryExit> {
        self.inner.exits.lock().unwrap().clone()
    }

    pub(crate) fn root_at(slot: Slot) -> Root {
        Root::repeat_byte(0x20 + slot as u8)
    }

    /// Execution hash of the payload at `slot`; the genesis block has none.
    pub(crate) fn payload_hash(slot: Slot) -> B256 {
        if slot == 0 { B256::ZERO } else { B256::repeat_byte(0x40 + slot as u8) }
    }
}

fn resolve(id: &str) -> Option<Slot> {
    match id {
        "head" => SLOTS.last().copied(),
        "genesis" => Some(0),
        id if id.starts_with("0x") => {
            let root: Root = id.parse().ok()?;
            SLOTS.into_iter().find(|s| FakeBeaconNode::root_at(*s) == root)
        }
        id => id.parse().ok().filter(|s| SLOTS.contains(s)),
    }
}

fn parent_of(slot: Slot) -> Root {
    SLOTS
        .into_iter()
        .take_while(|s| *s < slot)
        .last()
        .map(FakeBeaconNode::root_at)
        .unwrap_or(Root::ZERO)
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"code": 404, "message": "not found"}))).into_response()
}

async fn config_spec() -> Json<Value> {
    Json(json!({"data": {
        "CONFIG_NAME": "hivenet",
        "SECONDS_PER_SLOT": "6",
        "SLOTS_PER_EPOCH": 32,
        "BLOB_SCHEDULE": []
    }}))
}

async fn genesis(State(inner): State<Arc<Inner>>) -> Json<Value> {
    Json(json!({"data": {
        "genesis_time": GENESIS_TIME.to_string(),
        "genesis_validators_root": inner.state.genesis_validators_root(),
        "genesis_fork_version": "0x00000000"
    }}))
}

async fn identity() -> Json<Value> {
    Json(json!({"data": {
        "peer_id": "16Uiu2Fake",
        "enr": "enr:-fake",
        "p2p_addresses": ["/ip4/127.0.0.1/tcp/9000"],
        "discovery_addresses": []
    }}))
}

async fn header(Path(id): Path<String>) -> Response {
    let Some(slot) = resolve(&id) else { return not_found() };
    Json(json!({"data": {
        "root": FakeBeaconNode::root_at(slot),
        "canonical": true,
        "header": {
            "message": {
                "slot": slot.to_string(),
                "proposer_index": "4",
                "parent_root": parent_of(slot),
                "state_root": Root::repeat_byte(STATE_ROOT_BYTE),
                "body_root": Root::ZERO
            },
            "signature": format!("0x{}", "00".repeat(96))
        }
    }}))
    .into_response()
}

async fn block(Path(id): Path<String>) -> Response {
    let Some(slot) = resolve(&id) else { return not_found() };
    let payload = payload_json(slot, FakeBeaconNode::payload_hash(slot));
    Json(block_json("capella", slot, parent_of(slot), Some(payload))).into_response()
}

async fn block_root(Path(id): Path<String>) -> Response {
    let Some(slot) = resolve(&id) else { return not_found() };
    Json(json!({"data": {"root": FakeBeaconNode::root_at(slot)}})).into_response()
}

async fn checkpoints(Path(_): Path<String>) -> Json<Value> {
    let genesis = json!({"epoch": "0", "root": FakeBeaconNode::root_at(0)});
    Json(json!({"data": {
        "previous_justified": genesis,
        "current_justified": genesis,
        "finalized": {"epoch": "0", "root": FakeBeaconNode::root_at(1)}
    }}))
}

fn requested_ids(query: &HashMap<String, String>) -> Option<Vec<u64>> {
    query.get("id").map(|ids| ids.split(',').filter_map(|i| i.parse().ok()).collect())
}

async fn validators(
    State(inner): State<Arc<Inner>>,
    Path(_): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let wanted = requested_ids(&query);
    let data: Vec<Value> = inner
        .state
        .validators()
        .iter()
        .zip(inner.state.balances().iter())
        .enumerate()
        .filter(|(i, _)| wanted.as_ref().is_none_or(|w| w.contains(&(*i as u64))))
        .map(|(i, (v, b))| {
            json!({"index": i.to_string(), "balance": b.to_string(), "status": "active_ongoing", "validator": v})
        })
        .collect();
    Json(json!({"data": data}))
}

async fn balances(
    State(inner): State<Arc<Inner>>,
    Path(_): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let wanted = requested_ids(&query);
    let data: Vec<Value> = inner
        .state
        .balances()
        .iter()
        .enumerate()
        .filter(|(i, _)| wanted.as_ref().is_none_or(|w| w.contains(&(*i as u64))))
        .map(|(i, b)| json!({"index": i.to_string(), "balance": b.to_string()}))
        .collect();
    Json(json!({"data": data}))
}

async fn debug_state(State(inner): State<Arc<Inner>>, Path(_): Path<String>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Eth-Consensus-Version", HeaderValue::from_static("capella"));
    (headers, inner.state.to_ssz_bytes()).into_response()
}

async fn bls_changes(
    State(inner): State<Arc<Inner>>,
    Json(changes): Json<Vec<SignedBlsToExecutionChange>>,
) -> StatusCode {
    inner.bls_changes.lock().unwrap().extend(changes);
    StatusCode::OK
}

async fn voluntary_exit(State(inner): State<Arc<Inner>>, Json(exit): Json<SignedVoluntaryExit>) -> StatusCode {
    inner.exits.lock().unwrap().push(exit);
    StatusCode::OK
}

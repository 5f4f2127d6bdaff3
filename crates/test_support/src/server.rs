//! JSON-RPC front for an [`InMemoryChain`].
//!
//! One listener answers both namespaces: `engine_*` calls must carry a valid
//! JWT, `eth_*` calls are open.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use alloy_primitives::{Address, B256, Bytes, U64};
use alloy_rpc_types::BlockNumberOrTag;
use alloy_rpc_types_engine::{
    ExecutionPayload, ExecutionPayloadV1, ExecutionPayloadV2, ExecutionPayloadV3, ForkchoiceState,
    PayloadAttributes, PayloadId,
};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use color_eyre::eyre::{self, eyre};
use hivenet_execution::engine_error_code;
use hivenet_proxy::jwt::verify_headers;
use hivenet_types::error::INTERNAL_ERROR;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{chain::InMemoryChain, engine::InMemoryEngine};

const METHOD_NOT_FOUND: i64 = -32601;

struct ServerState {
    chain: Arc<Mutex<InMemoryChain>>,
    jwt_secret: [u8; 32],
}

/// An execution client on a loopback port, serving an [`InMemoryChain`].
pub struct FakeExecutionLayer {
    addr: SocketAddr,
    chain: Arc<Mutex<InMemoryChain>>,
    cancel: CancellationToken,
}

impl FakeExecutionLayer {
    pub async fn spawn(chain: InMemoryChain, jwt_secret: [u8; 32]) -> eyre::Result<Self> {
        let chain = Arc::new(Mutex::new(chain));
        let state = Arc::new(ServerState { chain: chain.clone(), jwt_secret });
        let app = Router::new().route("/", post(handle)).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                debug!("fake execution layer stopped: {e}");
            }
        });
        Ok(Self { addr, chain, cancel })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> eyre::Result<Url> {
        Ok(Url::parse(&format!("http://{}", self.addr))?)
    }

    pub fn chain(&self) -> Arc<Mutex<InMemoryChain>> {
        self.chain.clone()
    }

    /// An in-process engine sharing this server's chain.
    pub fn engine(&self, id: impl Into<String>) -> InMemoryEngine {
        InMemoryEngine::shared(id, self.chain.clone())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakeExecutionLayer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle(State(state): State<Arc<ServerState>>, headers: HeaderMap, Json(req): Json<Value>) -> Response {
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let method = req.get("method").and_then(Value::as_str).unwrap_or_default().to_owned();
    let params = req.get("params").cloned().unwrap_or_else(|| json!([]));

    if method.starts_with("engine_") && verify_headers(&state.jwt_secret, &headers).is_err() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let body = match dispatch(&state.chain, &method, &params) {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(e) => {
            let code = engine_error_code(&e).unwrap_or(INTERNAL_ERROR);
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": format!("{e:#}")}})
        }
    };
    Json(body).into_response()
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, index: usize) -> eyre::Result<T> {
    Ok(serde_json::from_value(params.get(index).cloned().unwrap_or(Value::Null))?)
}

fn engine_version(method: &str) -> eyre::Result<u8> {
    method
        .rsplit_once('V')
        .and_then(|(_, v)| v.parse().ok())
        .ok_or_else(|| eyre!("no version in {method}"))
}

fn decode_payload(version: u8, raw: Value) -> eyre::Result<ExecutionPayload> {
    Ok(match version {
        1 => ExecutionPayload::V1(serde_json::from_value::<ExecutionPayloadV1>(raw)?),
        2 if raw.get("withdrawals").is_none() => ExecutionPayload::V1(serde_json::from_value(raw)?),
        2 => ExecutionPayload::V2(serde_json::from_value::<ExecutionPayloadV2>(raw)?),
        _ => ExecutionPayload::V3(serde_json::from_value::<ExecutionPayloadV3>(raw)?),
    })
}

fn block_json(chain: &InMemoryChain, tag: Option<BlockNumberOrTag>, hash: Option<B256>) -> eyre::Result<Value> {
    let block = match (tag, hash) {
        (Some(tag), _) => chain.block_by_tag(tag),
        (None, Some(hash)) => chain.block_by_hash(&hash),
        (None, None) => None,
    };
    let Some(block) = block else { return Ok(Value::Null) };

    let mut value = serde_json::to_value(&block.header)?;
    let obj = value.as_object_mut().ok_or_else(|| eyre!("header did not serialize to an object"))?;
    obj.insert("hash".into(), json!(block.hash));
    obj.insert("totalDifficulty".into(), json!(block.header.difficulty));
    obj.insert("size".into(), json!("0x0"));
    obj.insert("uncles".into(), json!([]));
    obj.insert("transactions".into(), json!([]));
    if block.header.withdrawals_root.is_some() {
        obj.insert("withdrawals".into(), json!(block.withdrawals));
    }
    Ok(value)
}

fn dispatch(chain: &Mutex<InMemoryChain>, method: &str, params: &Value) -> eyre::Result<Value> {
    let mut chain = chain.lock().unwrap_or_else(PoisonError::into_inner);
    let value = match method {
        m if m.starts_with("engine_forkchoiceUpdatedV") => {
            let state: ForkchoiceState = param(params, 0)?;
            let attrs: Option<PayloadAttributes> = param(params, 1)?;
            serde_json::to_value(chain.forkchoice_updated(engine_version(m)?, state, attrs)?)?
        }
        m if m.starts_with("engine_newPayloadV") => {
            let version = engine_version(m)?;
            let payload = decode_payload(version, params.get(0).cloned().unwrap_or(Value::Null))?;
            let root: Option<B256> = param(params, 2)?;
            serde_json::to_value(chain.new_payload(version, &payload, root)?)?
        }
        m if m.starts_with("engine_getPayloadV") => {
            let version = engine_version(m)?;
            let id: PayloadId = param(params, 0)?;
            let resp = chain.get_payload(version, id)?;
            if version == 1 {
                serde_json::to_value(resp.execution_payload.as_v1())?
            } else {
                serde_json::to_value(resp)?
            }
        }
        "engine_exchangeCapabilities" => params.get(0).cloned().unwrap_or_else(|| json!([])),
        "eth_chainId" => json!(U64::from(hivenet_types::constants::DEFAULT_CHAIN_ID)),
        "eth_blockNumber" => json!(U64::from(chain.head().header.number)),
        "eth_getBlockByNumber" => block_json(&chain, Some(param(params, 0)?), None)?,
        "eth_getBlockByHash" => block_json(&chain, None, Some(param(params, 0)?))?,
        "eth_getBalance" => {
            let address: Address = param(params, 0)?;
            let tag: BlockNumberOrTag = param(params, 1)?;
            json!(chain.balance_at(address, tag))
        }
        "eth_getTransactionCount" => json!(U64::ZERO),
        "eth_getStorageAt" => json!(B256::ZERO),
        "eth_sendRawTransaction" => {
            let raw: Bytes = param(params, 0)?;
            json!(chain.submit_transaction(raw))
        }
        "eth_getTransactionReceipt" => Value::Null,
        other => {
            return Err(hivenet_execution::ExecutionError::JsonRpc {
                code: METHOD_NOT_FOUND,
                message: format!("method {other} not found"),
            }
            .into());
        }
    };
    Ok(value)
}

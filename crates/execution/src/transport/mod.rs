#![allow(missing_docs)]

pub mod http;
#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre;
use serde::{Deserialize, Serialize};

/// A generic transport for sending JSON-RPC requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a JSON-RPC request and returns the response.
    async fn send(&self, req: &JsonRpcRequest, timeout: Duration) -> eyre::Result<JsonRpcResponse>;
}

/// Represents a JSON-RPC request object.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: serde_json::Value,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0", method: method.into(), params, id: 1 }
    }
}

/// Represents a JSON-RPC response object.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: serde_json::Value,
}

/// Represents a JSON-RPC error object.
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Sends `method` and decodes its result, keeping JSON-RPC error codes.
pub async fn call<P, R>(
    transport: &dyn Transport,
    method: &str,
    params: P,
    timeout: Duration,
) -> eyre::Result<R>
where
    P: Serialize,
    R: serde::de::DeserializeOwned,
{
    let req = JsonRpcRequest::new(method, serde_json::to_value(params)?);
    let resp = transport.send(&req, timeout).await?;

    if let Some(err) = resp.error {
        return Err(crate::error::ExecutionError::JsonRpc { code: err.code, message: err.message }.into());
    }

    let res = resp.result.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(res).map_err(|e| {
        crate::error::ExecutionError::InvalidResponse(format!("{method}: {e}")).into()
    })
}

//! A mock transport for testing the RPC clients.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use color_eyre::eyre::{self, eyre};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Transport};

/// A mock transport that can be programmed with expected responses for testing.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, Result<Value, (i64, String)>>>,
    requests: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs the result returned for the next call of `method`.
    pub async fn push_response(&self, method: &str, response: Value) {
        self.responses.lock().await.insert(method.to_owned(), Ok(response));
    }

    /// Programs a JSON-RPC error for the next call of `method`.
    pub async fn push_error(&self, method: &str, code: i64, message: &str) {
        self.responses.lock().await.insert(method.to_owned(), Err((code, message.to_owned())));
    }

    /// Method and params of every request seen so far.
    pub async fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &JsonRpcRequest, _timeout: Duration) -> eyre::Result<JsonRpcResponse> {
        self.requests.lock().await.push((request.method.clone(), request.params.clone()));
        let response = self.responses.lock().await.remove(&request.method);

        match response {
            Some(Ok(result)) => Ok(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id.into(),
                result: Some(result),
                error: None,
            }),
            Some(Err((code, message))) => Ok(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id.into(),
                result: None,
                error: Some(JsonRpcError { code, message }),
            }),
            None => Err(eyre!("MockTransport: received unexpected call to method '{}'", request.method)),
        }
    }
}

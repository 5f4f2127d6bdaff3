use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre;
use hivenet_proxy::JwtProvider;
use reqwest::{Client, header::CONTENT_TYPE};
use url::Url;

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::error::ExecutionError;

/// JSON-RPC over HTTP, optionally authenticated with an Engine API JWT.
pub struct HttpTransport {
    client: Client,
    url: Url,
    jwt_provider: Option<JwtProvider>,
}

impl HttpTransport {
    pub fn new(url: Url) -> eyre::Result<Self> {
        let client = Client::builder().pool_idle_timeout(Duration::from_secs(90)).build()?;
        Ok(Self { client, url, jwt_provider: None })
    }

    pub fn with_jwt(mut self, secret: [u8; 32]) -> Self {
        self.jwt_provider = Some(JwtProvider::new(secret));
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url.as_str())
            .field("jwt", &self.jwt_provider.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &JsonRpcRequest, timeout: Duration) -> eyre::Result<JsonRpcResponse> {
        let mut req_builder = self
            .client
            .post(self.url.clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(request);

        if let Some(provider) = &self.jwt_provider {
            let token = provider.get_token().await?;
            req_builder = req_builder.bearer_auth(token);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout(request.method.clone())
            } else {
                ExecutionError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        let response_bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout(request.method.clone())
            } else {
                ExecutionError::Transport(e.to_string())
            }
        })?;
        serde_json::from_slice(&response_bytes).map_err(|e| {
            let body = String::from_utf8_lossy(&response_bytes);
            ExecutionError::InvalidResponse(format!("{status}: {e}: {body}")).into()
        })
    }
}

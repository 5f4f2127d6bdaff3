//! JSON-RPC forwarder sitting between a CL and the Engine API of its EL.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use color_eyre::eyre::{self, eyre};
use hivenet_types::{
    error::{ErrorContext, HarnessError, INTERNAL_ERROR, PARSE_ERROR},
    spoof::Spoof,
};
use serde_json::Value;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    jwt::{JwtProvider, verify_headers},
    message::{error_response, message_id},
};

/// Inspects a raw request and optionally returns fields to overwrite in it.
pub type RequestCallback = Arc<dyn Fn(&[u8]) -> Option<Spoof> + Send + Sync>;
/// Inspects a raw response together with the request that produced it.
pub type ResponseCallback = Arc<dyn Fn(&[u8], &[u8]) -> Option<Spoof> + Send + Sync>;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_host: String,
    /// `0` picks a free port.
    pub listen_port: u16,
    pub destination: Url,
    pub jwt_secret: [u8; 32],
    /// Prefix for log lines, usually the EL the proxy fronts.
    pub name: String,
}

#[derive(Default)]
struct Spoofing {
    request_callbacks: HashMap<String, Vec<RequestCallback>>,
    response_callbacks: HashMap<String, Vec<ResponseCallback>>,
    requests: VecDeque<Spoof>,
    responses: VecDeque<Spoof>,
}

impl Spoofing {
    fn pop_rewrite(queue: &mut VecDeque<Spoof>, method: &str) -> Option<Spoof> {
        let pos = queue.iter().position(|s| s.method == method)?;
        queue.remove(pos)
    }
}

struct Shared {
    config: ProxyConfig,
    http: reqwest::Client,
    jwt: JwtProvider,
    spoofing: Mutex<Spoofing>,
    session: tokio::sync::Mutex<()>,
}

impl Shared {
    fn spoofing(&self) -> MutexGuard<'_, Spoofing> {
        self.spoofing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running spoof proxy.
///
/// Callbacks and rewrites can be registered at any time; they take effect on
/// the next message the proxy handles.
pub struct Proxy {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Proxy {
    /// Binds the listener and starts serving in the background.
    pub async fn spawn(config: ProxyConfig) -> eyre::Result<Self> {
        let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            jwt: JwtProvider::new(config.jwt_secret),
            http: reqwest::Client::builder().timeout(FORWARD_TIMEOUT).build()?,
            config,
            spoofing: Mutex::new(Spoofing::default()),
            session: tokio::sync::Mutex::new(()),
        });

        let app = Router::new().route("/", post(handle)).with_state(shared.clone());
        let token = CancellationToken::new();
        let shutdown = token.clone().cancelled_owned();

        info!(
            proxy = %shared.config.name,
            address = %local_addr,
            destination = %shared.config.destination,
            "Spoof proxy listening"
        );
        let name = shared.config.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(proxy = %name, "Spoof proxy server failed: {e}");
            }
        });

        Ok(Self { shared, local_addr, token, task: Mutex::new(Some(task)) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn add_request_callback(&self, method: impl Into<String>, callback: RequestCallback) {
        self.shared.spoofing().request_callbacks.entry(method.into()).or_default().push(callback);
    }

    pub fn add_response_callback(&self, method: impl Into<String>, callback: ResponseCallback) {
        self.shared.spoofing().response_callbacks.entry(method.into()).or_default().push(callback);
    }

    /// Queues a one-shot rewrite for the next request with a matching method.
    pub fn add_request(&self, spoof: Spoof) {
        self.shared.spoofing().requests.push_back(spoof);
    }

    /// Queues a one-shot rewrite for the next response with a matching method.
    pub fn add_response(&self, spoof: Spoof) {
        self.shared.spoofing().responses.push_back(spoof);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops accepting connections and waits for in-flight forwards to drain.
    pub async fn cancel(&self) {
        self.token.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(proxy = %self.shared.config.name, "Spoof proxy task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.shared.config.name)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

async fn handle(State(shared): State<Arc<Shared>>, headers: HeaderMap, body: Bytes) -> Response {
    let name = &shared.config.name;
    if let Err(e) = verify_headers(&shared.config.jwt_secret, &headers) {
        let err = HarnessError::JwtAuthError(ErrorContext::default(), e.to_string());
        warn!(proxy = %name, "{err}");
        return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }

    let method = match serde_json::from_slice::<Value>(&body) {
        Ok(msg) => msg.get("method").and_then(Value::as_str).unwrap_or_default().to_owned(),
        Err(e) => {
            warn!(proxy = %name, "Rejecting malformed request: {e}");
            let reply = error_response(Value::Null, PARSE_ERROR, format!("parse error: {e}"));
            return json_response(StatusCode::OK, reply);
        }
    };
    let id = message_id(&body);

    let _session = shared.session.lock().await;

    let request = match spoof_request(&shared, &method, body.to_vec()) {
        Ok(request) => request,
        Err(e) => {
            error!(proxy = %name, %method, "Request spoofing failed: {e}");
            return json_response(StatusCode::OK, error_response(id, INTERNAL_ERROR, e.to_string()));
        }
    };

    let (status, response) = match forward(&shared, request.clone()).await {
        Ok(forwarded) => forwarded,
        Err(e) => {
            warn!(proxy = %name, %method, "Upstream request failed: {e}");
            let msg = format!("upstream request failed: {e}");
            return json_response(StatusCode::OK, error_response(id, INTERNAL_ERROR, msg));
        }
    };

    if !status.is_success() {
        return json_response(status, response);
    }

    match spoof_response(&shared, &method, &request, response) {
        Ok(response) => json_response(status, response),
        Err(e) => {
            error!(proxy = %name, %method, "Response spoofing failed: {e}");
            json_response(StatusCode::OK, error_response(id, INTERNAL_ERROR, e.to_string()))
        }
    }
}

async fn forward(shared: &Shared, body: Vec<u8>) -> eyre::Result<(StatusCode, Vec<u8>)> {
    let token = shared.jwt.get_token().await?;
    let res = shared
        .http
        .post(shared.config.destination.clone())
        .header(CONTENT_TYPE, "application/json")
        .bearer_auth(token)
        .body(body)
        .send()
        .await?;
    let status = StatusCode::from_u16(res.status().as_u16())?;
    Ok((status, res.bytes().await?.to_vec()))
}

fn callback_panic(method: &str, payload: Box<dyn std::any::Any + Send>) -> eyre::Report {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    HarnessError::CallbackPanic(ErrorContext::default().with_method(method), msg).into()
}

/// Applies queued rewrites, then request callbacks.
fn spoof_request(shared: &Shared, method: &str, mut body: Vec<u8>) -> eyre::Result<Vec<u8>> {
    let (rewrite, callbacks) = {
        let mut spoofing = shared.spoofing();
        let rewrite = Spoofing::pop_rewrite(&mut spoofing.requests, method);
        let callbacks = spoofing.request_callbacks.get(method).cloned().unwrap_or_default();
        (rewrite, callbacks)
    };

    if let Some(rewrite) = rewrite {
        debug!(proxy = %shared.config.name, method, fields = ?rewrite.fields, "Rewriting request");
        body = rewrite.apply_to_request(&body)?;
    }

    let mut combined = None;
    for callback in callbacks {
        let spoof = catch_unwind(AssertUnwindSafe(|| callback(&body)))
            .map_err(|payload| callback_panic(method, payload))?;
        combined = Spoof::combine(combined, spoof)?;
    }
    if let Some(spoof) = combined {
        if spoof.method != method {
            return Err(eyre!("callback for {method} returned a spoof for {}", spoof.method));
        }
        debug!(proxy = %shared.config.name, method, fields = ?spoof.fields, "Spoofing request");
        body = spoof.apply_to_request(&body)?;
    }
    Ok(body)
}

/// Applies queued rewrites, then response callbacks.
fn spoof_response(
    shared: &Shared,
    method: &str,
    request: &[u8],
    mut body: Vec<u8>,
) -> eyre::Result<Vec<u8>> {
    let (rewrite, callbacks) = {
        let mut spoofing = shared.spoofing();
        let rewrite = Spoofing::pop_rewrite(&mut spoofing.responses, method);
        let callbacks = spoofing.response_callbacks.get(method).cloned().unwrap_or_default();
        (rewrite, callbacks)
    };
    if rewrite.is_none() && callbacks.is_empty() {
        return Ok(body);
    }

    if let Some(rewrite) = rewrite {
        debug!(proxy = %shared.config.name, method, fields = ?rewrite.fields, "Rewriting response");
        body = rewrite.apply_to_response(&body)?;
    }

    let mut combined = None;
    for callback in callbacks {
        let spoof = catch_unwind(AssertUnwindSafe(|| callback(&body, request)))
            .map_err(|payload| callback_panic(method, payload))?;
        combined = Spoof::combine(combined, spoof)?;
    }
    if let Some(spoof) = combined {
        debug!(proxy = %shared.config.name, method, fields = ?spoof.fields, "Spoofing response");
        body = spoof.apply_to_response(&body)?;
    }
    Ok(body)
}

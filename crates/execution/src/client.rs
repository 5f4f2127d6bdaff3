//! Handle over one execution client container.

use std::{
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_rpc_types::{Block, BlockId, BlockNumberOrTag, Header, TransactionReceipt};
use alloy_rpc_types_engine::{ExecutionPayload, ForkchoiceState, PayloadAttributes, PayloadId};
use async_trait::async_trait;
use color_eyre::eyre::{self, eyre};
use futures::future::join_all;
use hivenet_node::ManagedClient;
use hivenet_proxy::{
    Proxy, ProxyConfig, ResponseCallback,
    message::{request_method, request_param},
};
use hivenet_types::{
    ErrorContext, HarnessError,
    constants::{DEFAULT_JWT_SECRET, PORT_ENGINE, PORT_ETH_RPC},
    engine_api::{ForkchoiceUpdatedResponse, GetPayloadResponse, PayloadStatusV1},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    engine_api::{
        EngineApiClient,
        capabilities::{
            FORKCHOICE_UPDATED_METHODS, GET_PAYLOAD_METHODS, NEW_PAYLOAD_METHODS, forkchoice_updated_method,
            get_payload_method, new_payload_method,
        },
    },
    error::is_timeout,
    eth_rpc::{BlockTag, EthRpcClient},
    transport::http::HttpTransport,
};

const TTD_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ExecutionClientConfig {
    pub index: usize,
    pub ttd: Option<U256>,
    pub jwt_secret: [u8; 32],
    pub engine_port: u16,
    pub rpc_port: u16,
    /// Address the spoof proxy listens on; `None` connects straight to the EL.
    pub proxy_host: Option<IpAddr>,
    pub log_engine_calls: bool,
    pub subnet: String,
}

impl ExecutionClientConfig {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ttd: None,
            jwt_secret: DEFAULT_JWT_SECRET,
            engine_port: PORT_ENGINE,
            rpc_port: PORT_ETH_RPC,
            proxy_host: None,
            log_engine_calls: false,
            subnet: String::new(),
        }
    }
}

struct Connection {
    engine_url: Url,
    rpc_url: Url,
    engine: EngineApiClient,
    eth: EthRpcClient,
    proxy: Option<Arc<Proxy>>,
}

/// Engine API surface the CL Mocker drives.
#[async_trait]
pub trait EngineClient: Send + Sync {
    fn id(&self) -> String;

    fn ttd(&self) -> Option<U256>;

    async fn forkchoice_updated(
        &self,
        version: u8,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> eyre::Result<ForkchoiceUpdatedResponse>;

    async fn new_payload(
        &self,
        version: u8,
        payload: &ExecutionPayload,
        versioned_hashes: Option<Vec<B256>>,
        parent_beacon_block_root: Option<B256>,
    ) -> eyre::Result<PayloadStatusV1>;

    async fn get_payload(&self, version: u8, payload_id: PayloadId) -> eyre::Result<GetPayloadResponse>;

    async fn header_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Header>>;

    /// Whether the latest block's total difficulty has reached [`Self::ttd`].
    async fn check_ttd(&self) -> eyre::Result<bool>;
}

/// An EL together with its RPC connections and the spoof proxy fronting its Engine API.
pub struct ExecutionClient {
    config: ExecutionClientConfig,
    managed: Arc<dyn ManagedClient>,
    connection: RwLock<Option<Arc<Connection>>>,
    latest_forkchoice: Arc<Mutex<Option<ForkchoiceState>>>,
}

impl ExecutionClient {
    pub fn new(config: ExecutionClientConfig, managed: Arc<dyn ManagedClient>) -> Self {
        Self {
            config,
            managed,
            connection: RwLock::new(None),
            latest_forkchoice: Arc::new(Mutex::new(None)),
        }
    }

    pub fn index(&self) -> usize {
        self.config.index
    }

    pub fn client_type(&self) -> &str {
        self.managed.client_type()
    }

    pub fn subnet(&self) -> &str {
        &self.config.subnet
    }

    pub fn configured_ttd(&self) -> Option<U256> {
        self.config.ttd
    }

    pub fn managed(&self) -> &Arc<dyn ManagedClient> {
        &self.managed
    }

    pub fn is_running(&self) -> bool {
        self.managed.is_running() && self.conn().is_ok()
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::node(self.config.index, self.client_type())
    }

    fn conn(&self) -> eyre::Result<Arc<Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| eyre!("{}execution client not started", self.context()))
    }

    /// Starts the container (unless already up), then connects and spawns the proxy.
    pub async fn start(&self) -> eyre::Result<()> {
        if self.conn().is_ok() {
            return Err(HarnessError::ClientStartupError(self.context(), "client already started".into()).into());
        }
        if !self.managed.is_running() {
            self.managed.start().await?;
        }
        self.connect().await
    }

    async fn connect(&self) -> eyre::Result<()> {
        let ip = self
            .managed
            .ip()
            .ok_or_else(|| HarnessError::ClientStartupError(self.context(), "container has no IP".into()))?;
        let engine_url = Url::parse(&format!("http://{ip}:{}", self.config.engine_port))?;
        let rpc_url = Url::parse(&format!("http://{ip}:{}", self.config.rpc_port))?;

        let proxy = match self.config.proxy_host {
            Some(host) => Some(Arc::new(self.spawn_proxy(host, engine_url.clone()).await?)),
            None => None,
        };
        let engine_target = match &proxy {
            Some(proxy) => Url::parse(&proxy.url())?,
            None => engine_url.clone(),
        };

        let engine = EngineApiClient::new(HttpTransport::new(engine_target)?.with_jwt(self.config.jwt_secret));
        let eth = EthRpcClient::new(HttpTransport::new(rpc_url.clone())?);
        info!(
            node = self.config.index,
            client = %self.client_type(),
            engine = %engine_url,
            rpc = %rpc_url,
            proxied = proxy.is_some(),
            "Execution client connected"
        );

        *self.connection.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(Connection { engine_url, rpc_url, engine, eth, proxy }));
        Ok(())
    }

    async fn spawn_proxy(&self, host: IpAddr, destination: Url) -> eyre::Result<Proxy> {
        let proxy = Proxy::spawn(ProxyConfig {
            listen_host: host.to_string(),
            listen_port: 0,
            destination,
            jwt_secret: self.config.jwt_secret,
            name: format!("el-{}", self.config.index),
        })
        .await?;

        for method in FORKCHOICE_UPDATED_METHODS {
            let latest = self.latest_forkchoice.clone();
            proxy.add_request_callback(
                method,
                Arc::new(move |raw: &[u8]| {
                    if let Ok(state) = request_param::<ForkchoiceState>(raw, 0) {
                        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
                    }
                    None
                }),
            );
        }

        if self.config.log_engine_calls {
            let index = self.config.index;
            let log: ResponseCallback = Arc::new(move |res: &[u8], req: &[u8]| {
                debug!(
                    node = index,
                    method = %request_method(req).unwrap_or_default(),
                    request = %String::from_utf8_lossy(req),
                    response = %String::from_utf8_lossy(res),
                    "Engine call"
                );
                None
            });
            for method in FORKCHOICE_UPDATED_METHODS.iter().chain(&NEW_PAYLOAD_METHODS).chain(&GET_PAYLOAD_METHODS) {
                proxy.add_response_callback(*method, log.clone());
            }
        }
        Ok(proxy)
    }

    pub async fn shutdown(&self) -> eyre::Result<()> {
        let conn = self.connection.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(proxy) = conn.and_then(|c| c.proxy.clone()) {
            proxy.cancel().await;
        }
        self.managed.shutdown().await
    }

    /// Stops the proxy without stopping the container.
    pub async fn cancel_proxy(&self) {
        if let Some(proxy) = self.proxy() {
            proxy.cancel().await;
        }
    }

    pub fn proxy(&self) -> Option<Arc<Proxy>> {
        self.conn().ok().and_then(|c| c.proxy.clone())
    }

    pub fn engine_url(&self) -> eyre::Result<Url> {
        Ok(self.conn()?.engine_url.clone())
    }

    pub fn rpc_url(&self) -> eyre::Result<Url> {
        Ok(self.conn()?.rpc_url.clone())
    }

    /// Engine endpoint a beacon node should use: the proxy when there is one.
    pub fn beacon_engine_url(&self) -> eyre::Result<String> {
        let conn = self.conn()?;
        Ok(match &conn.proxy {
            Some(proxy) => proxy.url(),
            None => conn.engine_url.to_string(),
        })
    }

    pub async fn enode_url(&self) -> eyre::Result<String> {
        self.managed.enode_url().await
    }

    /// Last forkchoice state sent to this EL, by the harness or through the proxy.
    pub fn latest_forkchoice(&self) -> Option<ForkchoiceState> {
        *self.latest_forkchoice.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn annotate(&self, method: &str, err: eyre::Report) -> eyre::Report {
        let ctx = self.context().with_method(method);
        if is_timeout(&err) {
            return HarnessError::RpcTimeout(ctx).into();
        }
        err.wrap_err(ctx.to_string().trim_end().to_owned())
    }

    pub async fn forkchoice_updated(
        &self,
        version: u8,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> eyre::Result<ForkchoiceUpdatedResponse> {
        let method = forkchoice_updated_method(version)?;
        *self.latest_forkchoice.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
        debug!(node = self.config.index, method, head = %state.head_block_hash, "Sending forkchoice update");
        self.conn()?
            .engine
            .forkchoice_updated(version, state, attributes)
            .await
            .map_err(|e| self.annotate(method, e))
    }

    pub async fn new_payload(
        &self,
        version: u8,
        payload: &ExecutionPayload,
        versioned_hashes: Option<Vec<B256>>,
        parent_beacon_block_root: Option<B256>,
    ) -> eyre::Result<PayloadStatusV1> {
        let method = new_payload_method(version)?;
        debug!(
            node = self.config.index,
            method,
            number = payload.as_v1().block_number,
            hash = %payload.as_v1().block_hash,
            "Sending new payload"
        );
        self.conn()?
            .engine
            .new_payload(version, payload, versioned_hashes, parent_beacon_block_root)
            .await
            .map_err(|e| self.annotate(method, e))
    }

    pub async fn get_payload(&self, version: u8, payload_id: PayloadId) -> eyre::Result<GetPayloadResponse> {
        let method = get_payload_method(version)?;
        self.conn()?.engine.get_payload(version, payload_id).await.map_err(|e| self.annotate(method, e))
    }

    pub async fn block_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Block>> {
        self.conn()?.eth.block_by_number(tag).await.map_err(|e| self.annotate("eth_getBlockByNumber", e))
    }

    pub async fn block_by_hash(&self, hash: B256) -> eyre::Result<Option<Block>> {
        self.conn()?.eth.block_by_hash(hash).await.map_err(|e| self.annotate("eth_getBlockByHash", e))
    }

    pub async fn header_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Header>> {
        self.conn()?.eth.header_by_number(tag).await.map_err(|e| self.annotate("eth_getBlockByNumber", e))
    }

    pub async fn header_by_hash(&self, hash: B256) -> eyre::Result<Option<Header>> {
        self.conn()?.eth.header_by_hash(hash).await.map_err(|e| self.annotate("eth_getBlockByHash", e))
    }

    pub async fn total_difficulty(&self, block: BlockId) -> eyre::Result<U256> {
        self.conn()?.eth.total_difficulty(block).await.map_err(|e| self.annotate("eth_getBlockByNumber", e))
    }

    pub async fn balance_at(&self, address: Address, block: BlockTag) -> eyre::Result<U256> {
        self.conn()?.eth.balance_at(address, block).await.map_err(|e| self.annotate("eth_getBalance", e))
    }

    pub async fn storage_at(&self, address: Address, slot: U256, block: BlockTag) -> eyre::Result<B256> {
        self.conn()?.eth.storage_at(address, slot, block).await.map_err(|e| self.annotate("eth_getStorageAt", e))
    }

    pub async fn nonce_at(&self, address: Address, block: BlockTag) -> eyre::Result<u64> {
        self.conn()?.eth.nonce_at(address, block).await.map_err(|e| self.annotate("eth_getTransactionCount", e))
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes) -> eyre::Result<B256> {
        self.conn()?.eth.send_raw_transaction(raw).await.map_err(|e| self.annotate("eth_sendRawTransaction", e))
    }

    pub async fn transaction_receipt(&self, hash: B256) -> eyre::Result<Option<TransactionReceipt>> {
        self.conn()?
            .eth
            .transaction_receipt(hash)
            .await
            .map_err(|e| self.annotate("eth_getTransactionReceipt", e))
    }

    /// Whether the latest block's total difficulty has reached the configured TTD.
    pub async fn check_ttd(&self) -> eyre::Result<bool> {
        let ttd = self
            .config
            .ttd
            .ok_or_else(|| HarnessError::ConfigError(self.context(), "no terminal total difficulty".into()))?;
        let td = self.total_difficulty(BlockId::Number(BlockNumberOrTag::Latest)).await?;
        Ok(td >= ttd)
    }

    /// Polls [`Self::check_ttd`] every second until it holds or `cancel` fires.
    pub async fn wait_for_ttd(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        let mut interval = tokio::time::interval(TTD_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = interval.tick() => {}
            }
            match self.check_ttd().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!(node = self.config.index, "Unable to check TTD: {e}"),
            }
        }
    }
}

impl std::fmt::Debug for ExecutionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionClient")
            .field("index", &self.config.index)
            .field("client", &self.client_type())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EngineClient for ExecutionClient {
    fn id(&self) -> String {
        format!("{}-{}", self.config.index, self.client_type())
    }

    fn ttd(&self) -> Option<U256> {
        self.config.ttd
    }

    async fn forkchoice_updated(
        &self,
        version: u8,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> eyre::Result<ForkchoiceUpdatedResponse> {
        ExecutionClient::forkchoice_updated(self, version, state, attributes).await
    }

    async fn new_payload(
        &self,
        version: u8,
        payload: &ExecutionPayload,
        versioned_hashes: Option<Vec<B256>>,
        parent_beacon_block_root: Option<B256>,
    ) -> eyre::Result<PayloadStatusV1> {
        ExecutionClient::new_payload(self, version, payload, versioned_hashes, parent_beacon_block_root).await
    }

    async fn get_payload(&self, version: u8, payload_id: PayloadId) -> eyre::Result<GetPayloadResponse> {
        ExecutionClient::get_payload(self, version, payload_id).await
    }

    async fn header_by_number(&self, tag: BlockTag) -> eyre::Result<Option<Header>> {
        ExecutionClient::header_by_number(self, tag).await
    }

    async fn check_ttd(&self) -> eyre::Result<bool> {
        ExecutionClient::check_ttd(self).await
    }
}

/// The ELs of a testnet, in node order.
#[derive(Clone, Debug, Default)]
pub struct ExecutionClients(pub Vec<Arc<ExecutionClient>>);

impl ExecutionClients {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<ExecutionClient>> {
        self.0.iter()
    }

    pub fn by_index(&self, index: usize) -> Option<&Arc<ExecutionClient>> {
        self.0.iter().find(|c| c.index() == index)
    }

    pub fn running(&self) -> ExecutionClients {
        ExecutionClients(self.0.iter().filter(|c| c.is_running()).cloned().collect())
    }

    /// Clients in `subnet`; an empty label selects all.
    pub fn subnet(&self, subnet: &str) -> ExecutionClients {
        if subnet.is_empty() {
            return self.clone();
        }
        ExecutionClients(self.0.iter().filter(|c| c.subnet() == subnet).cloned().collect())
    }

    /// Comma-separated enode URLs, for `HIVE_BOOTNODE`.
    pub async fn enodes(&self) -> eyre::Result<String> {
        let mut enodes = Vec::with_capacity(self.0.len());
        for client in &self.0 {
            enodes.push(client.enode_url().await?);
        }
        Ok(enodes.join(","))
    }

    /// True when every client reports the same latest block hash.
    pub async fn check_heads(&self) -> eyre::Result<bool> {
        if self.0.len() <= 1 {
            return Err(eyre!("attempted to check the heads of a single or zero clients"));
        }
        let heads = join_all(self.0.iter().map(|c| c.header_by_number(BlockNumberOrTag::Latest))).await;
        let mut base = None;
        for (client, head) in self.0.iter().zip(heads) {
            let hash = head?.ok_or_else(|| eyre!("node {} has no latest header", client.index()))?.hash;
            match base {
                None => base = Some(hash),
                Some(b) if b != hash => {
                    info!(node = client.index(), %hash, expected = %b, "Hash mismatch between heads");
                    return Ok(false);
                }
                Some(_) => debug!(node = client.index(), %hash, "Hash match between heads"),
            }
        }
        Ok(true)
    }
}

impl From<Vec<Arc<ExecutionClient>>> for ExecutionClients {
    fn from(clients: Vec<Arc<ExecutionClient>>) -> Self {
        Self(clients)
    }
}

impl<'a> IntoIterator for &'a ExecutionClients {
    type Item = &'a Arc<ExecutionClient>;
    type IntoIter = std::slice::Iter<'a, Arc<ExecutionClient>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

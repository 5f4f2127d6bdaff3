//! Handle over one beacon node and the typed REST calls the harness makes against it.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy_primitives::B256;
use color_eyre::eyre::{self, WrapErr, eyre};
use futures::future::join_all;
use hivenet_node::ManagedClient;
use hivenet_types::{
    BeaconSpec, ErrorContext, HarnessError,
    aliases::{DomainType, Epoch, Root, Slot, ValidatorIndex, Version},
    beacon::{SignedBlsToExecutionChange, SignedVoluntaryExit},
    constants::PORT_BEACON_API,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::{
    api::{BeaconApi, BlockId, StateId, VersionedResponse},
    block::{BlobSidecar, BlockHeaderAndInfo, VersionedSignedBeaconBlock},
    responses::{FinalityCheckpoints, GenesisData, NodeIdentity, RootData, ValidatorBalance, ValidatorResponse},
    state::VersionedBeaconState,
};

const INIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `0x1234..abcd`
pub fn shorten(value: impl fmt::Display) -> String {
    let s = value.to_string();
    if s.len() <= 12 {
        return s;
    }
    format!("{}..{}", &s[..6], &s[s.len() - 4..])
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// Validator selector of the `validators` and `validator_balances` endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidatorId {
    Index(ValidatorIndex),
    Pubkey([u8; 48]),
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorId::Index(i) => write!(f, "{i}"),
            ValidatorId::Pubkey(pk) => write!(f, "0x{}", alloy_primitives::hex::encode(pk)),
        }
    }
}

fn query(key: &str, values: &[impl fmt::Display]) -> Option<String> {
    (!values.is_empty())
        .then(|| format!("{key}={}", values.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")))
}

#[derive(Clone, Debug)]
pub struct BeaconClientConfig {
    pub index: usize,
    pub api_port: u16,
    /// Known up front when the harness built the genesis; otherwise fetched on init.
    pub spec: Option<BeaconSpec>,
    pub genesis_time: Option<u64>,
    pub genesis_validators_root: Option<Root>,
    pub subnet: String,
}

impl BeaconClientConfig {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            api_port: PORT_BEACON_API,
            spec: None,
            genesis_time: None,
            genesis_validators_root: None,
            subnet: String::new(),
        }
    }
}

/// A beacon node together with the chain parameters learned from it.
pub struct BeaconClient {
    config: BeaconClientConfig,
    managed: Arc<dyn ManagedClient>,
    api: RwLock<Option<BeaconApi>>,
    spec: RwLock<Option<Arc<BeaconSpec>>>,
    genesis: RwLock<Option<(u64, Root)>>,
    builder_endpoint: RwLock<Option<String>>,
}

impl BeaconClient {
    pub fn new(config: BeaconClientConfig, managed: Arc<dyn ManagedClient>) -> Self {
        let spec = config.spec.clone().map(Arc::new);
        let genesis = config.genesis_time.zip(config.genesis_validators_root);
        Self {
            config,
            managed,
            api: RwLock::new(None),
            spec: RwLock::new(spec),
            genesis: RwLock::new(genesis),
            builder_endpoint: RwLock::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.config.index
    }

    pub fn client_type(&self) -> &str {
        self.managed.client_type()
    }

    /// Client type without the `-bn` suffix.
    pub fn client_name(&self) -> &str {
        let name = self.client_type();
        name.strip_suffix("-bn").unwrap_or(name)
    }

    pub fn subnet(&self) -> &str {
        &self.config.subnet
    }

    pub fn managed(&self) -> &Arc<dyn ManagedClient> {
        &self.managed
    }

    pub fn is_running(&self) -> bool {
        self.managed.is_running()
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::node(self.config.index, self.client_name())
    }

    /// Builder relay the node and its validator client should use.
    pub fn set_builder_endpoint(&self, endpoint: impl Into<String>) {
        *self.builder_endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.into());
    }

    pub fn builder_endpoint(&self) -> Option<String> {
        self.builder_endpoint.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn api(&self) -> eyre::Result<BeaconApi> {
        self.api
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| eyre!("{}beacon api not initialized", self.context()))
    }

    pub fn api_url(&self) -> eyre::Result<Url> {
        Ok(self.api()?.url().clone())
    }

    pub fn spec(&self) -> eyre::Result<Arc<BeaconSpec>> {
        self.spec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| HarnessError::ConfigError(self.context(), "init not called yet".into()).into())
    }

    fn genesis_info(&self) -> eyre::Result<(u64, Root)> {
        self.genesis
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or_else(|| HarnessError::ConfigError(self.context(), "init not called yet".into()).into())
    }

    pub fn genesis_time(&self) -> eyre::Result<u64> {
        Ok(self.genesis_info()?.0)
    }

    pub fn genesis_validators_root(&self) -> eyre::Result<Root> {
        Ok(self.genesis_info()?.1)
    }

    /// Slot the wall clock is in.
    pub fn current_slot(&self) -> eyre::Result<Slot> {
        Ok(self.spec()?.time_to_slot(unix_now(), self.genesis_time()?))
    }

    /// Starts the container unless it is already up, then initialises the API.
    pub async fn start(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        if !self.managed.is_running() {
            if let Some(endpoint) = self.builder_endpoint() {
                self.managed.add_start_option(
                    hivenet_types::StartBundle::new().param("HIVE_ETH2_BUILDER_ENDPOINT", endpoint),
                );
            }
            self.managed.start().await?;
        }
        self.init(cancel).await
    }

    /// Connects to the REST API and waits until the spec and genesis are known.
    pub async fn init(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        if self.api.read().unwrap_or_else(PoisonError::into_inner).is_none() {
            let ip = self
                .managed
                .ip()
                .ok_or_else(|| HarnessError::ClientStartupError(self.context(), "container has no IP".into()))?;
            let url = Url::parse(&format!("http://{ip}:{}", self.config.api_port))?;
            *self.api.write().unwrap_or_else(PoisonError::into_inner) = Some(BeaconApi::new(url, self.context())?);
        }

        let need_spec = self.spec.read().unwrap_or_else(PoisonError::into_inner).is_none();
        let need_genesis = self.genesis.read().unwrap_or_else(PoisonError::into_inner).is_none();
        let spec_task = async {
            if !need_spec {
                return Ok(());
            }
            let spec = poll_until(cancel, || self.beacon_config()).await?;
            *self.spec.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(spec));
            eyre::Ok(())
        };
        let genesis_task = async {
            if !need_genesis {
                return Ok(());
            }
            let genesis = poll_until(cancel, || self.genesis()).await?;
            *self.genesis.write().unwrap_or_else(PoisonError::into_inner) =
                Some((genesis.genesis_time, genesis.genesis_validators_root));
            eyre::Ok(())
        };
        let (spec, genesis) = tokio::join!(spec_task, genesis_task);
        spec?;
        genesis?;
        info!(node = self.config.index, client = %self.client_name(), "Beacon client initialized");
        Ok(())
    }

    pub async fn shutdown(&self) -> eyre::Result<()> {
        self.api.write().unwrap_or_else(PoisonError::into_inner).take();
        self.managed.shutdown().await
    }

    async fn get_data<T: serde::de::DeserializeOwned>(&self, path: &str) -> eyre::Result<T> {
        self.api()?
            .get_data::<T>(path)
            .await?
            .ok_or_else(|| eyre!("{}{path} not found on beacon client", self.context()))
    }

    async fn get_versioned(&self, path: &str) -> eyre::Result<VersionedResponse> {
        self.api()?
            .get::<VersionedResponse>(path)
            .await?
            .ok_or_else(|| eyre!("{}{path} not found on beacon client", self.context()))
    }

    /// `/eth/v1/config/spec` parsed into a spec.
    pub async fn beacon_config(&self) -> eyre::Result<BeaconSpec> {
        let raw: HashMap<String, Value> = self.get_data("/eth/v1/config/spec").await?;
        let map = raw
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect();
        BeaconSpec::from_config_map(&map)
    }

    pub async fn genesis(&self) -> eyre::Result<GenesisData> {
        self.get_data("/eth/v1/beacon/genesis").await
    }

    pub async fn identity(&self) -> eyre::Result<NodeIdentity> {
        self.get_data("/eth/v1/node/identity").await
    }

    pub async fn enr(&self) -> eyre::Result<String> {
        let id = self.identity().await?;
        debug!(node = self.config.index, peer_id = %id.peer_id, enr = %id.enr, p2p = ?id.p2p_addresses, "Beacon identity");
        Ok(id.enr)
    }

    /// Multiaddr other beacon nodes can use as a static peer.
    pub async fn p2p_addr(&self) -> eyre::Result<String> {
        let id = self.identity().await?;
        let ip = self.managed.ip().ok_or_else(|| eyre!("{}client has no IP", self.context()))?;
        Ok(format!("/ip4/{ip}/tcp/{}/p2p/{}", hivenet_types::constants::PORT_BEACON_TCP, id.peer_id))
    }

    pub async fn block_v2(&self, id: BlockId) -> eyre::Result<VersionedSignedBeaconBlock> {
        let res = self.get_versioned(&format!("/eth/v2/beacon/blocks/{id}")).await?;
        VersionedSignedBeaconBlock::from_response(res)
    }

    pub async fn block_is_optimistic(&self, id: BlockId) -> eyre::Result<bool> {
        Ok(self.get_versioned(&format!("/eth/v2/beacon/blocks/{id}")).await?.execution_optimistic)
    }

    pub async fn block_v2_root(&self, id: BlockId) -> eyre::Result<Root> {
        let data: RootData = self.get_data(&format!("/eth/v1/beacon/blocks/{id}/root")).await?;
        Ok(data.root)
    }

    pub async fn block_header(&self, id: BlockId) -> eyre::Result<BlockHeaderAndInfo> {
        self.get_data(&format!("/eth/v1/beacon/headers/{id}")).await
    }

    pub async fn state_validators(
        &self,
        state: StateId,
        ids: &[ValidatorId],
        statuses: &[&str],
    ) -> eyre::Result<Vec<ValidatorResponse>> {
        let params: Vec<String> = [query("id", ids), query("status", statuses)].into_iter().flatten().collect();
        let mut path = format!("/eth/v1/beacon/states/{state}/validators");
        if !params.is_empty() {
            path = format!("{path}?{}", params.join("&"));
        }
        self.get_data(&path).await
    }

    pub async fn state_validator_balances(
        &self,
        state: StateId,
        ids: &[ValidatorId],
    ) -> eyre::Result<Vec<ValidatorBalance>> {
        let mut path = format!("/eth/v1/beacon/states/{state}/validator_balances");
        if let Some(q) = query("id", ids) {
            path = format!("{path}?{q}");
        }
        self.get_data(&path).await
    }

    pub async fn state_finality_checkpoints(&self, state: StateId) -> eyre::Result<FinalityCheckpoints> {
        self.get_data(&format!("/eth/v1/beacon/states/{state}/finality_checkpoints")).await
    }

    /// Checkpoints of the state a block commits to, looked up by root and then by slot.
    pub async fn block_finality_checkpoints(&self, id: BlockId) -> eyre::Result<FinalityCheckpoints> {
        let header = self.block_header(id).await?;
        match self.state_finality_checkpoints(StateId::Root(header.header.message.state_root)).await {
            Ok(checkpoints) => Ok(checkpoints),
            Err(_) => self.state_finality_checkpoints(StateId::Slot(header.slot())).await,
        }
    }

    /// Full state from the debug API, transferred as SSZ.
    pub async fn beacon_state_v2(&self, state: StateId) -> eyre::Result<VersionedBeaconState> {
        let path = format!("/eth/v2/debug/beacon/states/{state}");
        let (fork, bytes) = self
            .api()?
            .get_ssz(&path)
            .await?
            .ok_or_else(|| eyre!("{}{path} not found on beacon client", self.context()))?;
        VersionedBeaconState::from_ssz(&bytes, fork, self.spec()?)
            .wrap_err_with(|| format!("{}state {state}", self.context()))
    }

    pub async fn beacon_state_v2_by_block(&self, id: BlockId) -> eyre::Result<VersionedBeaconState> {
        let header = self.block_header(id).await?;
        self.beacon_state_v2(StateId::Root(header.header.message.state_root)).await
    }

    pub async fn blob_sidecars(&self, id: BlockId) -> eyre::Result<Vec<BlobSidecar>> {
        self.get_data(&format!("/eth/v1/beacon/blob_sidecars/{id}")).await
    }

    /// Signing domain for `domain_type`; without a version the head state's current one is used.
    pub async fn compute_domain(&self, domain_type: DomainType, version: Option<Version>) -> eyre::Result<B256> {
        let genesis_validators_root = self.genesis_validators_root()?;
        let spec = self.spec()?;
        let version = match version {
            Some(v) => v,
            None => self.beacon_state_v2_by_block(BlockId::Head).await?.current_version(),
        };
        Ok(spec.compute_domain(domain_type, version, genesis_validators_root))
    }

    pub async fn submit_pool_bls_to_execution_change(
        &self,
        changes: &[SignedBlsToExecutionChange],
    ) -> eyre::Result<()> {
        self.api()?.post("/eth/v1/beacon/pool/bls_to_execution_changes", changes).await
    }

    pub async fn submit_voluntary_exit(&self, exit: &SignedVoluntaryExit) -> eyre::Result<()> {
        self.api()?.post("/eth/v1/beacon/pool/voluntary_exits", exit).await
    }

    /// Polls the head once per slot until it carries an execution payload.
    pub async fn wait_for_execution_payload(&self, cancel: &CancellationToken) -> eyre::Result<B256> {
        let spec = self.spec()?;
        let genesis_time = self.genesis_time()?;
        info!(node = self.config.index, client = %self.client_name(), "Waiting for execution payload");
        let mut ticker = tokio::time::interval(Duration::from_secs(spec.seconds_per_slot));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = ticker.tick() => {}
            }
            let head = self.block_header(BlockId::Head).await?;
            if !head.canonical {
                continue;
            }
            let Ok(block) = self.block_v2(BlockId::Root(head.root)).await else {
                continue;
            };
            let execution = block.execution_block_hash().unwrap_or_default();
            info!(
                node = self.config.index,
                client = %self.client_name(),
                slot = head.slot(),
                wall_slot = spec.time_to_slot(unix_now(), genesis_time),
                head = %shorten(head.root),
                exec = %shorten(execution),
                "Waiting for execution payload"
            );
            if execution != B256::ZERO {
                return Ok(execution);
            }
        }
    }

    /// Polls once per slot until block `id` reaches the requested optimistic status.
    pub async fn wait_for_optimistic_state(
        &self,
        cancel: &CancellationToken,
        id: BlockId,
        optimistic: bool,
    ) -> eyre::Result<BlockHeaderAndInfo> {
        let spec = self.spec()?;
        let mut ticker = tokio::time::interval(Duration::from_secs(spec.seconds_per_slot));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = ticker.tick() => {}
            }
            match self.block_is_optimistic(id).await {
                Ok(status) if status == optimistic => return self.block_header(id).await,
                _ => continue,
            }
        }
    }

    /// Walks back from the head to the most recent block with an execution payload.
    pub async fn latest_execution_beacon_block(&self) -> eyre::Result<Option<VersionedSignedBeaconBlock>> {
        let head = self.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
        for slot in (1..=head.slot()).rev() {
            let block = match self.block_v2(BlockId::Slot(slot)).await {
                Ok(block) => block,
                // Skipped slots have no block.
                Err(_) => continue,
            };
            if block.has_execution_payload() {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// First block since genesis with an execution payload, up to the wall-clock slot.
    pub async fn first_execution_beacon_block(&self) -> eyre::Result<Option<VersionedSignedBeaconBlock>> {
        let last = self.current_slot()?;
        for slot in 0..=last {
            let Ok(block) = self.block_v2(BlockId::Slot(slot)).await else {
                continue;
            };
            if block.has_execution_payload() {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    pub async fn beacon_block_by_execution_hash(
        &self,
        hash: B256,
    ) -> eyre::Result<Option<VersionedSignedBeaconBlock>> {
        let head = self.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
        for slot in (1..=head.slot()).rev() {
            let Ok(block) = self.block_v2(BlockId::Slot(slot)).await else {
                continue;
            };
            if block.execution_block_hash() == Some(hash) {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Number of blocks per epoch on the canonical chain, following parent roots from the head.
    pub async fn filled_slots_count_per_epoch(&self) -> eyre::Result<BTreeMap<Epoch, u64>> {
        let spec = self.spec()?;
        let mut counts = BTreeMap::new();
        let mut header = self.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
        loop {
            *counts.entry(spec.slot_to_epoch(header.slot())).or_insert(0) += 1;
            let parent = header.header.message.parent_root;
            if parent == Root::ZERO {
                break;
            }
            header = self.block_header(BlockId::Root(parent)).await.wrap_err("failed to poll header")?;
        }
        Ok(counts)
    }

    /// One-line summary of fork, head, payload and checkpoints.
    pub async fn status_line(&self) -> String {
        let (mut slot, mut head, mut version) = (0, String::new(), String::new());
        let (mut justified, mut finalized) = (String::new(), String::new());
        let mut execution = "0x0000..0000".to_string();
        if let Ok(header) = self.block_header(BlockId::Head).await {
            slot = header.slot();
            head = shorten(header.root);
        }
        if let Ok(checkpoints) = self.block_finality_checkpoints(BlockId::Head).await {
            justified = shorten(checkpoints.current_justified.root);
            finalized = shorten(checkpoints.finalized.root);
        }
        if let Ok(block) = self.block_v2(BlockId::Head).await {
            version = block.version().to_string();
            if let Some(hash) = block.execution_block_hash() {
                execution = shorten(hash);
            }
        }
        format!(
            "beacon {} ({}): fork={version}, slot={slot}, head={head}, exec_payload={execution}, \
             justified={justified}, finalized={finalized}",
            self.config.index,
            self.client_name()
        )
    }
}

impl fmt::Debug for BeaconClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconClient")
            .field("index", &self.config.index)
            .field("client", &self.client_type())
            .finish_non_exhaustive()
    }
}

/// Retries `f` every second until it succeeds or `cancel` fires.
async fn poll_until<T, F, Fut>(cancel: &CancellationToken, mut f: F) -> eyre::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<T>>,
{
    loop {
        if let Ok(value) = f().await {
            return Ok(value);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
            _ = tokio::time::sleep(INIT_POLL_INTERVAL) => {}
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BeaconClients(pub Vec<Arc<BeaconClient>>);

impl BeaconClients {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<BeaconClient>> {
        self.0.iter()
    }

    pub fn running(&self) -> BeaconClients {
        BeaconClients(self.0.iter().filter(|b| b.is_running()).cloned().collect())
    }

    /// Clients in `subnet`; every client when `subnet` is empty.
    pub fn subnet(&self, subnet: &str) -> BeaconClients {
        if subnet.is_empty() {
            return self.clone();
        }
        BeaconClients(self.0.iter().filter(|b| b.subnet() == subnet).cloned().collect())
    }

    /// Comma-separated ENRs of the running nodes.
    pub async fn enrs(&self) -> eyre::Result<String> {
        let mut enrs = Vec::new();
        for bn in self.0.iter().filter(|b| b.is_running()) {
            enrs.push(bn.enr().await?);
        }
        Ok(enrs.join(","))
    }

    /// Comma-separated multiaddrs of the running nodes.
    pub async fn p2p_addrs(&self) -> eyre::Result<String> {
        let mut addrs = Vec::new();
        for bn in self.0.iter().filter(|b| b.is_running()) {
            addrs.push(bn.p2p_addr().await?);
        }
        Ok(addrs.join(","))
    }

    pub async fn beacon_block_by_execution_hash(
        &self,
        hash: B256,
    ) -> eyre::Result<Option<VersionedSignedBeaconBlock>> {
        for bn in &self.0 {
            if let Some(block) = bn.beacon_block_by_execution_hash(hash).await? {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    pub async fn submit_pool_bls_to_execution_change(
        &self,
        changes: &[SignedBlsToExecutionChange],
    ) -> eyre::Result<()> {
        for bn in &self.0 {
            bn.submit_pool_bls_to_execution_change(changes).await?;
        }
        Ok(())
    }

    /// Logs a status line per node, in node order.
    pub async fn print_status(&self) {
        let lines = join_all(self.0.iter().map(|b| b.status_line())).await;
        for line in lines {
            info!("{line}");
        }
    }
}

impl From<Vec<Arc<BeaconClient>>> for BeaconClients {
    fn from(clients: Vec<Arc<BeaconClient>>) -> Self {
        Self(clients)
    }
}

impl IntoIterator for BeaconClients {
    type Item = Arc<BeaconClient>;
    type IntoIter = std::vec::IntoIter<Arc<BeaconClient>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BeaconClients {
    type Item = &'a Arc<BeaconClient>;
    type IntoIter = std::slice::Iter<'a, Arc<BeaconClient>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

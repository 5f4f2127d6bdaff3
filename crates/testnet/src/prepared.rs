//! Builds the genesis artifacts of a testnet and turns them into started nodes.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, OnceLock},
};

use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_consensus::{
    BeaconClient, BeaconClientConfig, BeaconClients, ValidatorClient, VersionedBeaconState,
};
use hivenet_execution::{ExecutionClient, ExecutionClientConfig, ExecutionClients};
use hivenet_genesis::{
    ExecutionGenesis, Shares, SpecOverrides, ValidatorKey, ValidatorKeys,
    accounts::{TEST_ACCOUNT_COUNT, funded_allocs, test_accounts, vault_start_amount},
    build_beacon_state, build_chain_config, build_execution_genesis, build_spec, consensus_bundle,
    keys_bundle,
};
use hivenet_node::{HiveManagedClient, ManagedClient, NodeDefinition, OptionsGenerator, Simulator};
use hivenet_types::{
    BeaconSpec, HarnessError, StartBundle,
    aliases::ValidatorIndex,
    constants::{
        DEFAULT_JWT_SECRET, DEFAULT_SAFE_SLOTS_TO_IMPORT_OPTIMISTICALLY, GENESIS_DELAY_SECS, PORT_BEACON_API,
        PORT_BEACON_GRPC, PORT_ENGINE, PORT_ETH_RPC, PORT_METRICS,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::{Config, log_level_string},
    node::{NodeBundle, Nodes},
    testnet::{Testnet, unix_now},
    validators::Validators,
};

/// Where the EL genesis is placed in the container.
pub const GENESIS_JSON_PATH: &str = "/genesis.json";
/// Where pre-generated blocks are placed for import.
pub const CHAIN_RLP_PATH: &str = "/chain.rlp";

/// Harness-wide settings that are not part of a testnet's config.
#[derive(Clone, Debug)]
pub struct Environment {
    pub keys: Arc<ValidatorKeys>,
    pub log_engine_calls: bool,
    /// Host the per-EL spoof proxies listen on; `None` disables them.
    pub proxy_host: Option<IpAddr>,
    pub engine_port: u16,
    pub rpc_port: u16,
    pub beacon_api_port: u16,
    /// Client verbosity, 0 (error) to 5 (trace).
    pub log_level: u8,
}

impl Environment {
    pub fn new(keys: Arc<ValidatorKeys>) -> Self {
        Self {
            keys,
            log_engine_calls: false,
            proxy_host: None,
            engine_port: PORT_ENGINE,
            rpc_port: PORT_ETH_RPC,
            beacon_api_port: PORT_BEACON_API,
            log_level: 3,
        }
    }
}

/// Clients created so far; start-time options read peers from here.
#[derive(Default)]
struct Peers {
    execution: OnceLock<ExecutionClients>,
    beacon: OnceLock<BeaconClients>,
}

impl Peers {
    fn execution(&self, index: usize) -> Option<Arc<ExecutionClient>> {
        self.execution.get().and_then(|els| els.by_index(index).cloned())
    }

    fn beacon(&self, index: usize) -> Option<Arc<BeaconClient>> {
        self.beacon.get().and_then(|bns| bns.iter().find(|bn| bn.index() == index).cloned())
    }
}

/// Genesis artifacts and start bundles, ready to launch nodes from.
#[derive(Clone, Debug)]
pub struct PreparedTestnet {
    pub env: Environment,
    pub config: Config,
    pub spec: Arc<BeaconSpec>,
    pub execution_genesis: Arc<ExecutionGenesis>,
    pub genesis_state: Arc<VersionedBeaconState>,
    /// Keys in genesis order, truncated to the validator count.
    pub keys: Arc<ValidatorKeys>,
    pub execution_bundle: StartBundle,
    pub beacon_bundle: StartBundle,
    pub validator_bundle: StartBundle,
}

impl PreparedTestnet {
    /// Builds the EL and CL genesis for a chain starting [`GENESIS_DELAY_SECS`] from now.
    pub fn prepare(env: Environment, config: &Config) -> eyre::Result<Self> {
        Self::prepare_at(env, config, unix_now() + GENESIS_DELAY_SECS)
    }

    pub fn prepare_at(env: Environment, config: &Config, genesis_time: u64) -> eyre::Result<Self> {
        let mut config = config.clone();
        config.fill_defaults();
        info!(
            genesis_time,
            slot_time = config.slot_time(),
            slots_per_epoch = config.slots_per_epoch(),
            nodes = config.node_definitions().len(),
            "Preparing testnet"
        );

        let chain_config = build_chain_config(
            config.terminal_total_difficulty(),
            genesis_time,
            config.slots_per_epoch(),
            config.slot_time(),
            &config.forks,
        )
        .wrap_err("error producing chain config")?;
        let allocs = match &config.genesis_execution_accounts {
            Some(accounts) => accounts.clone(),
            None => funded_allocs(&test_accounts(TEST_ACCOUNT_COUNT)?, vault_start_amount()),
        };
        let el = build_execution_genesis(
            genesis_time,
            config.eth1_consensus.clone().unwrap_or_default(),
            chain_config,
            allocs,
            config.initial_base_fee_per_gas,
        )
        .wrap_err("error producing execution genesis")?;

        let validator_count = match config.validator_count {
            Some(count) => count,
            None => env.keys.len() as u64,
        };
        if (env.keys.len() as u64) < validator_count {
            return Err(HarnessError::InsufficientValidators {
                required: validator_count,
                available: env.keys.len() as u64,
            }
            .into());
        }
        let keys: ValidatorKeys = env.keys.iter().take(validator_count as usize).cloned().collect();

        let mut spec = build_spec(
            &config.forks,
            &el,
            &SpecOverrides {
                validator_count,
                slot_time: Some(config.slot_time()),
                safe_slots_to_import_optimistically: config.safe_slots_to_import_optimistically,
            },
        );
        spec.slots_per_epoch = config.slots_per_epoch();
        let state = build_beacon_state(&spec, &el, genesis_time, &keys).wrap_err("error producing beacon genesis")?;
        let consensus = consensus_bundle(&spec, &state, &el)?;

        let execution_bundle = StartBundle::from_params(el.to_params())
            .file(GENESIS_JSON_PATH, el.to_json()?.into_bytes())
            .param("HIVE_LOGLEVEL", log_level_string(env.log_level))
            .param("HIVE_NODETYPE", "full")
            .param("HIVE_JWTSECRET", "true");

        let common = StartBundle::new()
            .param("HIVE_ETH2_BN_GRPC_PORT", PORT_BEACON_GRPC)
            .param("HIVE_ETH2_METRICS_PORT", PORT_METRICS)
            .param("HIVE_ETH2_CONFIG_DEPOSIT_CONTRACT_ADDRESS", el.deposit_address)
            .param("HIVE_ETH2_DEPOSIT_DEPLOY_BLOCK_HASH", el.hash);

        let mut beacon_bundle = common
            .clone()
            .param("HIVE_CHECK_LIVE_PORT", env.beacon_api_port)
            .param("HIVE_ETH2_MERGE_ENABLED", "1")
            .param("HIVE_ETH2_ETH1_GENESIS_TIME", el.genesis.timestamp)
            .param("HIVE_ETH2_GENESIS_FORK", config.forks.genesis_fork().as_str())
            .param(
                "HIVE_ETH2_SAFE_SLOTS_TO_IMPORT_OPTIMISTICALLY",
                config.safe_slots_to_import_optimistically.unwrap_or(DEFAULT_SAFE_SLOTS_TO_IMPORT_OPTIMISTICALLY),
            )
            .merge(consensus.clone());
        if config.disable_peer_scoring {
            beacon_bundle = beacon_bundle.param("HIVE_ETH2_DISABLE_PEER_SCORING", "1");
        }

        let mut validator_bundle = common.param("HIVE_CHECK_LIVE_PORT", 0).merge(consensus);
        if let Some(builder) = config.active_builder() {
            validator_bundle = validator_bundle.merge(StartBundle::from_params(builder.to_params()));
        }
        if let Some(blobber) = config.active_blobber() {
            validator_bundle = validator_bundle.merge(StartBundle::from_params(blobber.to_params()));
        }

        let spec = Arc::new(spec);
        Ok(Self {
            env,
            config,
            genesis_state: Arc::new(VersionedBeaconState::new(state, spec.clone())),
            spec,
            execution_genesis: Arc::new(el),
            keys: Arc::new(keys),
            execution_bundle,
            beacon_bundle,
            validator_bundle,
        })
    }

    /// Keys of each node, in node order; keys of the extra share are left out.
    fn key_tranches(&self) -> Vec<BTreeMap<ValidatorIndex, ValidatorKey>> {
        let mut shares = self.config.node_definitions().shares();
        if let Some(extra) = self.config.extra_shares {
            shares.push(extra);
        }
        Shares(shares).key_tranches(&self.keys)
    }

    fn execution_options(&self, index: usize, def: &NodeDefinition, peers: &Arc<Peers>) -> eyre::Result<OptionsGenerator> {
        let el = &self.execution_genesis;
        let ttd = def.execution_client_ttd.unwrap_or(self.config.terminal_total_difficulty());
        let mut base = self
            .execution_bundle
            .clone()
            .merge(StartBundle::from_params(el.consensus.hive_params(index)))
            .param("HIVE_TERMINAL_TOTAL_DIFFICULTY", ttd);
        if ttd <= el.header.difficulty {
            base = base
                .param("HIVE_TERMINAL_BLOCK_HASH", el.hash)
                .param("HIVE_TERMINAL_BLOCK_NUMBER", el.header.number);
        }
        if let Some(path) = &def.chain_file {
            let chain = std::fs::read(path).wrap_err_with(|| format!("failed to read chain file {}", path.display()))?;
            base = base.file(CHAIN_RLP_PATH, chain);
        }

        let peers = peers.clone();
        let subnet = def.execution_subnet().to_owned();
        Ok(Arc::new(move || {
            let peers = peers.clone();
            let subnet = subnet.clone();
            let base = base.clone();
            Box::pin(async move {
                let mut bundle = base;
                if let Some(els) = peers.execution.get() {
                    let bootnodes = els.running().subnet(&subnet);
                    if !bootnodes.is_empty() {
                        bundle = bundle.param("HIVE_BOOTNODE", bootnodes.enodes().await?);
                    }
                }
                Ok(bundle)
            })
        }))
    }

    fn beacon_options(&self, index: usize, def: &NodeDefinition, peers: &Arc<Peers>) -> OptionsGenerator {
        let ttd = def.beacon_node_ttd.unwrap_or(self.config.terminal_total_difficulty());
        let base = self
            .beacon_bundle
            .clone()
            .param("HIVE_ETH2_BEACON_NODE_INDEX", index)
            .param("HIVE_ETH2_BN_API_PORT", self.env.beacon_api_port)
            .param("HIVE_TERMINAL_TOTAL_DIFFICULTY", ttd);
        let peers = peers.clone();
        let subnet = def.consensus_subnet().to_owned();
        Arc::new(move || {
            let peers = peers.clone();
            let subnet = subnet.clone();
            let base = base.clone();
            Box::pin(async move {
                let el = peers
                    .execution(index)
                    .filter(|el| el.is_running())
                    .ok_or_else(|| eyre!("attempted to start beacon node when the execution client is not yet running"))?;
                let mut bundle = base
                    .param("HIVE_ETH2_ETH1_RPC_ADDRS", el.rpc_url()?)
                    .param("HIVE_ETH2_ETH1_ENGINE_RPC_ADDRS", el.beacon_engine_url()?);
                if let Some(bns) = peers.beacon.get() {
                    let others = bns.running().subnet(&subnet);
                    if !others.is_empty() {
                        let enrs = others.enrs().await?;
                        if !enrs.is_empty() {
                            bundle = bundle.param("HIVE_ETH2_BOOTNODE_ENRS", enrs);
                        }
                        let static_peers = others.p2p_addrs().await?;
                        if !static_peers.is_empty() {
                            bundle = bundle.param("HIVE_ETH2_STATIC_PEERS", static_peers);
                        }
                    }
                }
                Ok(bundle)
            })
        })
    }

    fn validator_options(&self, index: usize, keys: StartBundle, peers: &Arc<Peers>) -> OptionsGenerator {
        let base = self.validator_bundle.clone().merge(keys);
        let blobber = self.config.active_blobber().and_then(|b| b.beacon_api(index));
        let api_port = self.env.beacon_api_port;
        let peers = peers.clone();
        Arc::new(move || {
            let peers = peers.clone();
            let base = base.clone();
            Box::pin(async move {
                let bn = peers
                    .beacon(index)
                    .filter(|bn| bn.is_running())
                    .ok_or_else(|| eyre!("attempted to start a validator when the beacon node is not running"))?;
                let (ip, port) = match blobber {
                    Some(addr) => addr,
                    None => (bn.managed().ip().ok_or_else(|| eyre!("beacon node {index} has no IP"))?, api_port),
                };
                Ok(base.param("HIVE_ETH2_BN_API_IP", ip).param("HIVE_ETH2_BN_API_PORT", port))
            })
        })
    }

    /// Creates every node's clients and starts those not marked `disable_startup`.
    pub async fn create(&self, simulator: Arc<dyn Simulator>, cancel: CancellationToken) -> eyre::Result<Testnet> {
        let definitions = self.config.node_definitions();
        if definitions.is_empty() {
            return Err(HarnessError::config("testnet has no nodes").into());
        }
        let peers = Arc::new(Peers::default());
        let tranches = self.key_tranches();
        let builder = self.config.active_builder();

        let mut nodes = Vec::with_capacity(definitions.len());
        for (index, def) in definitions.iter().enumerate() {
            let el_managed: Arc<dyn ManagedClient> = Arc::new(HiveManagedClient::new(
                simulator.clone(),
                def.execution_client.clone(),
                self.execution_options(index, def, &peers)?,
            ));
            let execution = Arc::new(ExecutionClient::new(
                ExecutionClientConfig {
                    ttd: Some(def.execution_client_ttd.unwrap_or(self.config.terminal_total_difficulty())),
                    jwt_secret: DEFAULT_JWT_SECRET,
                    engine_port: self.env.engine_port,
                    rpc_port: self.env.rpc_port,
                    proxy_host: self.env.proxy_host,
                    log_engine_calls: self.env.log_engine_calls,
                    subnet: def.execution_subnet().to_owned(),
                    ..ExecutionClientConfig::new(index)
                },
                el_managed,
            ));

            let (beacon, validator) = if def.has_consensus() {
                let managed: Arc<dyn ManagedClient> = Arc::new(HiveManagedClient::new(
                    simulator.clone(),
                    def.consensus_client.clone(),
                    self.beacon_options(index, def, &peers),
                ));
                let bn = Arc::new(BeaconClient::new(
                    BeaconClientConfig {
                        api_port: self.env.beacon_api_port,
                        spec: Some((*self.spec).clone()),
                        genesis_time: Some(self.genesis_state.inner().genesis_time()),
                        genesis_validators_root: Some(self.genesis_state.genesis_validators_root()),
                        subnet: def.consensus_subnet().to_owned(),
                        ..BeaconClientConfig::new(index)
                    },
                    managed,
                ));
                if let Some(endpoint) = builder.as_ref().and_then(|b| b.endpoint(index)) {
                    bn.set_builder_endpoint(endpoint);
                }

                let keys = tranches.get(index).cloned().unwrap_or_default();
                let vc_managed: Arc<dyn ManagedClient> = Arc::new(HiveManagedClient::new(
                    simulator.clone(),
                    def.validator_client_name(),
                    self.validator_options(index, keys_bundle(keys.values()), &peers),
                ));
                let vc = Arc::new(ValidatorClient::new(index, vc_managed, keys, Some(bn.clone())));
                (Some(bn), Some(vc))
            } else {
                (None, None)
            };

            nodes.push(NodeBundle {
                index,
                definition: def.clone(),
                execution,
                beacon,
                validator,
                verification: def.test_verification_node,
            });
        }
        let nodes = Nodes(nodes);
        // Set once, before any client starts.
        let _ = peers.execution.set(nodes.execution_clients());
        let _ = peers.beacon.set(nodes.beacon_clients());

        let validators = Validators::new(&self.genesis_state, self.keys.clone())?;
        let testnet = Testnet::new(
            nodes,
            validators,
            self.execution_genesis.clone(),
            self.genesis_state.clone(),
            cancel.clone(),
        );

        for node in testnet.nodes.iter() {
            if node.definition.disable_startup {
                info!(node = node.index, "Startup disabled for {}", node.definition);
                continue;
            }
            node.start(&cancel).await.wrap_err_with(|| format!("failed to start node {}", node.index))?;
        }
        Ok(testnet)
    }
}

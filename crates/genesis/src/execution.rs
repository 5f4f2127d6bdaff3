//! Execution-layer genesis: chain config, allocations, embedded system contracts.

use std::{collections::BTreeMap, path::Path};

use alloy_consensus::Header;
use alloy_genesis::{ChainConfig, CliqueConfig, Genesis, GenesisAccount};
use alloy_primitives::{U256, keccak256};
use alloy_trie::{
    EMPTY_ROOT_HASH, KECCAK_EMPTY, TrieAccount,
    root::{state_root_unhashed, storage_root_unhashed},
};
use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};

use hivenet_types::{
    ForkConfig, HarnessError, Params,
    aliases::{Address, B64, B256, BlockHash, Bytes},
    constants::{
        BEACON_ROOTS_ADDRESS, DEFAULT_CHAIN_ID, DEFAULT_GAS_LIMIT, DEFAULT_NETWORK_ID,
        DEPOSIT_CONTRACT_ADDRESS, EMPTY_UNCLE_HASH,
    },
};

const DEPOSIT_CONTRACT: &str = include_str!("../assets/deposit_contract.json");
const BEACON_ROOTS_CONTRACT: &str = include_str!("../assets/beacon_roots_contract.json");

pub const CLIQUE_PERIOD_DEFAULT: u64 = 2;
pub const DEFAULT_CLIQUE_PRIVATE_KEY: &str =
    "9c647b8b7c4e7c3490668fb6c11473619db80c93704c70893d3813af4090c39c";
pub const DEFAULT_CLIQUE_MINER: Address =
    alloy_primitives::address!("658bdf435d810c91414ec09147daa6db62406379");
pub const DEFAULT_ETHASH_MINER: Address =
    alloy_primitives::address!("1212121212121212121212121212121212121212");

const INITIAL_BASE_FEE: u64 = 1_000_000_000;

/// How the EL chain grows before (or without) the beacon chain driving it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionConsensus {
    Ethash {
        miner: Option<Address>,
        mining_nodes: Option<usize>,
    },
    /// A pre-generated chain is imported; clients do not mine.
    PreChain,
    #[default]
    PostMergeGenesis,
    Clique {
        period: Option<u64>,
        private_key: Option<String>,
        miner: Option<Address>,
    },
}

impl ExecutionConsensus {
    pub fn configure(&self, genesis: &mut Genesis) {
        if let ExecutionConsensus::Clique { period, miner, .. } = self {
            genesis.config.clique = Some(CliqueConfig {
                period: Some(period.unwrap_or(CLIQUE_PERIOD_DEFAULT)),
                epoch: Some(0),
            });
            let mut extra = vec![0u8; 32];
            extra.extend_from_slice(miner.unwrap_or(DEFAULT_CLIQUE_MINER).as_slice());
            extra.extend_from_slice(&[0u8; 65]);
            genesis.extra_data = Bytes::from(extra);
        }
    }

    /// Parameters for the EL of node `node`; only the first nodes mine or seal.
    pub fn hive_params(&self, node: usize) -> Params {
        let mut params = Params::new();
        match self {
            ExecutionConsensus::Ethash { miner, mining_nodes } => {
                if node < mining_nodes.unwrap_or(1) {
                    params.insert(
                        "HIVE_MINER".into(),
                        miner.unwrap_or(DEFAULT_ETHASH_MINER).to_string(),
                    );
                }
            }
            ExecutionConsensus::Clique { private_key, miner, .. } if node == 0 => {
                params.insert(
                    "HIVE_CLIQUE_PRIVATEKEY".into(),
                    private_key.clone().unwrap_or_else(|| DEFAULT_CLIQUE_PRIVATE_KEY.into()),
                );
                params.insert(
                    "HIVE_MINER".into(),
                    miner.unwrap_or(DEFAULT_CLIQUE_MINER).to_string(),
                );
            }
            _ => {}
        }
        params
    }

    pub fn difficulty_per_block(&self) -> U256 {
        match self {
            ExecutionConsensus::Ethash { .. } | ExecutionConsensus::PreChain => {
                U256::from(131_072u64)
            }
            ExecutionConsensus::PostMergeGenesis => U256::ZERO,
            ExecutionConsensus::Clique { .. } => U256::from(2u64),
        }
    }

    pub fn seconds_per_block(&self) -> u64 {
        match self {
            ExecutionConsensus::Ethash { .. } => 10,
            ExecutionConsensus::PreChain => 1,
            ExecutionConsensus::PostMergeGenesis => 12,
            ExecutionConsensus::Clique { period, .. } => period.unwrap_or(CLIQUE_PERIOD_DEFAULT),
        }
    }
}

/// Chain config with every pre-merge fork at block 0 and post-merge forks timed from the
/// beacon genesis.
pub fn build_chain_config(
    ttd: U256,
    beacon_genesis_time: u64,
    slots_per_epoch: u64,
    seconds_per_slot: u64,
    forks: &ForkConfig,
) -> eyre::Result<ChainConfig> {
    let mut config = ChainConfig {
        chain_id: DEFAULT_CHAIN_ID,
        homestead_block: Some(0),
        eip150_block: Some(0),
        eip155_block: Some(0),
        eip158_block: Some(0),
        byzantium_block: Some(0),
        constantinople_block: Some(0),
        petersburg_block: Some(0),
        istanbul_block: Some(0),
        muir_glacier_block: Some(0),
        berlin_block: Some(0),
        london_block: Some(0),
        arrow_glacier_block: Some(0),
        merge_netsplit_block: Some(0),
        terminal_total_difficulty: Some(ttd),
        ..Default::default()
    };

    let mut previous = ("bellatrix", forks.bellatrix_fork_epoch);
    for (name, epoch) in
        [("capella", forks.capella_fork_epoch), ("deneb", forks.deneb_fork_epoch)]
    {
        if let Some(epoch) = epoch {
            let Some(prev_epoch) = previous.1 else {
                return Err(HarnessError::config(format!(
                    "fork '{name}' has a time but previous fork '{}' does not",
                    previous.0
                ))
                .into());
            };
            if epoch < prev_epoch {
                return Err(HarnessError::config(format!(
                    "fork '{name}' has a time before previous fork '{}'",
                    previous.0
                ))
                .into());
            }
            let timestamp = epoch
                .checked_mul(seconds_per_slot * slots_per_epoch)
                .and_then(|t| t.checked_add(beacon_genesis_time))
                .ok_or_else(|| HarnessError::Overflow(format!("{name} fork timestamp")))?;
            match name {
                "capella" => config.shanghai_time = Some(timestamp),
                _ => config.cancun_time = Some(timestamp),
            }
        }
        previous = (name, epoch);
    }
    Ok(config)
}

/// A built EL genesis together with its block header and hash.
#[derive(Clone, Debug)]
pub struct ExecutionGenesis {
    pub genesis: Genesis,
    pub header: Header,
    pub hash: BlockHash,
    pub deposit_address: Address,
    pub consensus: ExecutionConsensus,
}

fn embedded_account(raw: &str) -> eyre::Result<GenesisAccount> {
    serde_json::from_str(raw).wrap_err("failed to parse embedded contract")
}

/// Builds the EL genesis with the deposit contract preloaded at its empty-tree state.
pub fn build_execution_genesis(
    genesis_time: u64,
    consensus: ExecutionConsensus,
    chain_config: ChainConfig,
    extra_allocs: BTreeMap<Address, GenesisAccount>,
    initial_base_fee: Option<U256>,
) -> eyre::Result<ExecutionGenesis> {
    let base_fee = initial_base_fee
        .map(|fee| {
            u128::try_from(fee)
                .map_err(|_| HarnessError::Overflow(format!("initial base fee {fee}")))
        })
        .transpose()?;

    let cancun_time = chain_config.cancun_time;
    let mut genesis = Genesis {
        config: chain_config,
        nonce: 0,
        timestamp: genesis_time,
        extra_data: Bytes::new(),
        gas_limit: DEFAULT_GAS_LIMIT,
        difficulty: U256::ZERO,
        mix_hash: B256::ZERO,
        coinbase: Address::ZERO,
        base_fee_per_gas: base_fee,
        ..Default::default()
    };
    genesis.alloc.insert(DEPOSIT_CONTRACT_ADDRESS, embedded_account(DEPOSIT_CONTRACT)?);
    genesis.alloc.extend(extra_allocs);

    if let Some(cancun) = cancun_time {
        genesis.alloc.insert(BEACON_ROOTS_ADDRESS, embedded_account(BEACON_ROOTS_CONTRACT)?);
        if genesis_time >= cancun {
            genesis.blob_gas_used.get_or_insert(0);
            genesis.excess_blob_gas.get_or_insert(0);
        }
    }

    consensus.configure(&mut genesis);
    let header = genesis_header(&genesis)?;
    let hash = header.hash_slow();
    Ok(ExecutionGenesis {
        genesis,
        header,
        hash,
        deposit_address: DEPOSIT_CONTRACT_ADDRESS,
        consensus,
    })
}

/// State root of the genesis allocation.
pub fn genesis_state_root(alloc: &BTreeMap<Address, GenesisAccount>) -> B256 {
    state_root_unhashed(alloc.iter().map(|(address, account)| {
        let storage_root = account
            .storage
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| {
                storage_root_unhashed(
                    s.iter()
                        .map(|(k, v)| (*k, U256::from_be_bytes(v.0)))
                        .filter(|(_, v)| !v.is_zero()),
                )
            })
            .unwrap_or(EMPTY_ROOT_HASH);
        let code_hash = account
            .code
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(keccak256)
            .unwrap_or(KECCAK_EMPTY);
        (
            *address,
            TrieAccount {
                nonce: account.nonce.unwrap_or_default(),
                balance: account.balance,
                storage_root,
                code_hash,
            },
        )
    }))
}

/// Block 0 as the EL computes it from the genesis file.
pub fn genesis_header(genesis: &Genesis) -> eyre::Result<Header> {
    let config = &genesis.config;
    let ts = genesis.timestamp;
    let base_fee = match config.london_block {
        Some(0) => {
            let fee = genesis.base_fee_per_gas.unwrap_or(u128::from(INITIAL_BASE_FEE));
            Some(u64::try_from(fee).map_err(|_| HarnessError::Overflow(format!("base fee {fee}")))?)
        }
        _ => None,
    };
    let shanghai = config.shanghai_time.is_some_and(|t| t <= ts);
    let cancun = config.cancun_time.is_some_and(|t| t <= ts);

    Ok(Header {
        parent_hash: B256::ZERO,
        ommers_hash: EMPTY_UNCLE_HASH,
        beneficiary: genesis.coinbase,
        state_root: genesis_state_root(&genesis.alloc),
        transactions_root: EMPTY_ROOT_HASH,
        receipts_root: EMPTY_ROOT_HASH,
        difficulty: genesis.difficulty,
        number: 0,
        gas_limit: genesis.gas_limit,
        gas_used: 0,
        timestamp: ts,
        extra_data: genesis.extra_data.clone(),
        mix_hash: genesis.mix_hash,
        nonce: B64::from(genesis.nonce.to_be_bytes()),
        base_fee_per_gas: base_fee,
        withdrawals_root: shanghai.then_some(EMPTY_ROOT_HASH),
        blob_gas_used: cancun.then(|| genesis.blob_gas_used.unwrap_or_default()),
        excess_blob_gas: cancun.then(|| genesis.excess_blob_gas.unwrap_or_default()),
        parent_beacon_block_root: cancun.then_some(B256::ZERO),
        ..Default::default()
    })
}

impl ExecutionGenesis {
    pub fn network_id(&self) -> u64 {
        DEFAULT_NETWORK_ID
    }

    pub fn chain_id(&self) -> u64 {
        self.genesis.config.chain_id
    }

    pub fn terminal_total_difficulty(&self) -> U256 {
        self.genesis.config.terminal_total_difficulty.unwrap_or(U256::ZERO)
    }

    pub fn is_post_merge(&self) -> bool {
        self.header.difficulty >= self.terminal_total_difficulty()
    }

    /// Fork schedule and chain identity as client start parameters.
    pub fn to_params(&self) -> Params {
        let c = &self.genesis.config;
        let block = |b: Option<u64>| b.unwrap_or_default().to_string();
        let mut params: Params = [
            ("HIVE_DEPOSIT_CONTRACT_ADDRESS", self.deposit_address.to_string()),
            ("HIVE_NETWORK_ID", self.network_id().to_string()),
            ("HIVE_CHAIN_ID", self.chain_id().to_string()),
            ("HIVE_FORK_HOMESTEAD", block(c.homestead_block)),
            ("HIVE_FORK_TANGERINE", block(c.eip150_block)),
            ("HIVE_FORK_SPURIOUS", block(c.eip155_block)),
            ("HIVE_FORK_BYZANTIUM", block(c.byzantium_block)),
            ("HIVE_FORK_CONSTANTINOPLE", block(c.constantinople_block)),
            ("HIVE_FORK_PETERSBURG", block(c.petersburg_block)),
            ("HIVE_FORK_ISTANBUL", block(c.istanbul_block)),
            ("HIVE_FORK_MUIRGLACIER", block(c.muir_glacier_block)),
            ("HIVE_FORK_BERLIN", block(c.berlin_block)),
            ("HIVE_FORK_LONDON", block(c.london_block)),
            ("HIVE_FORK_ARROWGLACIER", block(c.arrow_glacier_block)),
            ("HIVE_MERGE_BLOCK_ID", block(c.merge_netsplit_block)),
            ("HIVE_TERMINAL_TOTAL_DIFFICULTY", self.terminal_total_difficulty().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        if let Some(t) = c.shanghai_time {
            params.insert("HIVE_SHANGHAI_TIMESTAMP".into(), t.to_string());
        }
        if let Some(t) = c.cancun_time {
            params.insert("HIVE_CANCUN_TIMESTAMP".into(), t.to_string());
        }
        params
    }

    /// `genesis.json` as the clients load it.
    pub fn to_json(&self) -> eyre::Result<String> {
        let mut value = serde_json::to_value(&self.genesis)?;
        if let Some(root) = value.as_object_mut() {
            root.insert("gasUsed".into(), serde_json::Value::String("0x0".into()));
            root.insert("parentHash".into(), serde_json::Value::String(B256::ZERO.to_string()));
        }
        if let Some(config) = value.get_mut("config").and_then(serde_json::Value::as_object_mut) {
            if matches!(config.get("daoForkSupport"), Some(serde_json::Value::Bool(false))) {
                config.remove("daoForkSupport");
            }
        }
        Ok(serde_json::to_string_pretty(&value)?)
    }

    pub fn write(&self, path: &Path) -> eyre::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

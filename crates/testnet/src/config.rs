//! Testnet configuration, loadable from TOML and combinable field by field.

use std::{collections::BTreeMap, fmt, net::IpAddr, path::Path};

use alloy_genesis::GenesisAccount;
use alloy_primitives::{Address, U256};
use color_eyre::eyre::{self, WrapErr};
use hivenet_genesis::ExecutionConsensus;
use hivenet_node::NodeDefinitions;
use hivenet_types::{ForkConfig, Params};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_SLOTS_PER_EPOCH: u64 = 32;
pub const DEFAULT_SLOT_TIME: u64 = 12;
pub const MINIMAL_SLOT_TIME: u64 = 6;

/// Port of the first mock builder; node `i` uses `port + i`.
pub const DEFAULT_BUILDER_PORT: u16 = 18550;
/// Port of the first blobber proxy; node `i` uses `port + i`.
pub const DEFAULT_BLOBBER_PORT: u16 = 20000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub forks: ForkConfig,
    pub validator_count: Option<u64>,
    pub slots_per_epoch: Option<u64>,
    pub slot_time: Option<u64>,
    pub terminal_total_difficulty: Option<U256>,
    pub safe_slots_to_import_optimistically: Option<u64>,

    pub node_definitions: Option<NodeDefinitions>,
    pub eth1_consensus: Option<ExecutionConsensus>,
    pub initial_base_fee_per_gas: Option<U256>,
    pub genesis_execution_accounts: Option<BTreeMap<Address, GenesisAccount>>,
    /// Weight of the keys no node validates with.
    pub extra_shares: Option<u64>,

    pub disable_peer_scoring: bool,

    pub enable_builders: bool,
    pub builder: Option<BuilderConfig>,
    pub enable_blobber: bool,
    pub blobber: Option<BlobberConfig>,
}

impl Config {
    pub fn from_toml(raw: &str) -> eyre::Result<Self> {
        toml::from_str(raw).wrap_err("failed to parse testnet config")
    }

    pub fn load(path: &Path) -> eyre::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read testnet config {}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Field-wise join where `other` takes precedence.
    pub fn join(&self, other: &Config) -> Config {
        Config {
            forks: self.forks.join(&other.forks),
            validator_count: other.validator_count.or(self.validator_count),
            slots_per_epoch: other.slots_per_epoch.or(self.slots_per_epoch),
            slot_time: other.slot_time.or(self.slot_time),
            terminal_total_difficulty: other.terminal_total_difficulty.or(self.terminal_total_difficulty),
            safe_slots_to_import_optimistically: other
                .safe_slots_to_import_optimistically
                .or(self.safe_slots_to_import_optimistically),
            node_definitions: other.node_definitions.clone().or_else(|| self.node_definitions.clone()),
            eth1_consensus: other.eth1_consensus.clone().or_else(|| self.eth1_consensus.clone()),
            initial_base_fee_per_gas: other.initial_base_fee_per_gas.or(self.initial_base_fee_per_gas),
            genesis_execution_accounts: other
                .genesis_execution_accounts
                .clone()
                .or_else(|| self.genesis_execution_accounts.clone()),
            extra_shares: other.extra_shares.or(self.extra_shares),
            disable_peer_scoring: other.disable_peer_scoring || self.disable_peer_scoring,
            enable_builders: other.enable_builders || self.enable_builders,
            builder: other.builder.clone().or_else(|| self.builder.clone()),
            enable_blobber: other.enable_blobber || self.enable_blobber,
            blobber: other.blobber.clone().or_else(|| self.blobber.clone()),
        }
    }

    /// Slot timing defaults; six second slots only when every beacon client supports them.
    pub fn fill_defaults(&mut self) {
        if self.slots_per_epoch.is_none() {
            self.slots_per_epoch = Some(DEFAULT_SLOTS_PER_EPOCH);
        }
        if self.slot_time.is_none() {
            let minimal = self.node_definitions.as_ref().is_some_and(|n| n.all_support_minimal_slot_time());
            let slot_time = if minimal { MINIMAL_SLOT_TIME } else { DEFAULT_SLOT_TIME };
            info!(slot_time, "Using default slot time");
            self.slot_time = Some(slot_time);
        }
    }

    pub fn slots_per_epoch(&self) -> u64 {
        self.slots_per_epoch.unwrap_or(DEFAULT_SLOTS_PER_EPOCH)
    }

    pub fn slot_time(&self) -> u64 {
        self.slot_time.unwrap_or(DEFAULT_SLOT_TIME)
    }

    pub fn validator_count(&self) -> u64 {
        self.validator_count.unwrap_or_default()
    }

    pub fn terminal_total_difficulty(&self) -> U256 {
        self.terminal_total_difficulty.unwrap_or_default()
    }

    pub fn node_definitions(&self) -> NodeDefinitions {
        self.node_definitions.clone().unwrap_or_default()
    }

    /// Builder settings in effect, if builders are enabled.
    pub fn active_builder(&self) -> Option<BuilderConfig> {
        self.enable_builders.then(|| self.builder.clone().unwrap_or_default())
    }

    pub fn active_blobber(&self) -> Option<BlobberConfig> {
        self.enable_blobber.then(|| self.blobber.clone().unwrap_or_default())
    }
}

/// Behaviour of the mock builder serving each beacon node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Address the builders listen on; without one no endpoint is handed to the clients.
    pub host: Option<IpAddr>,
    pub base_port: u16,
    pub error_on_header_request: bool,
    pub error_on_payload_reveal: bool,
    /// Sign bids with the previous fork's version.
    pub invalid_payload_version: bool,
    pub extra_data: Option<String>,
    /// Missed slots per epoch after which clients must stop asking the builder.
    pub circuit_breaker_missed_slots: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            host: None,
            base_port: DEFAULT_BUILDER_PORT,
            error_on_header_request: false,
            error_on_payload_reveal: false,
            invalid_payload_version: false,
            extra_data: None,
            circuit_breaker_missed_slots: 10,
        }
    }
}

impl BuilderConfig {
    pub fn endpoint(&self, node: usize) -> Option<String> {
        let host = self.host?;
        Some(format!("http://{host}:{}", usize::from(self.base_port) + node))
    }

    pub fn to_params(&self) -> Params {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        let mut params: Params = [
            ("HIVE_ETH2_BUILDER_ERROR_ON_HEADER_REQUEST", flag(self.error_on_header_request)),
            ("HIVE_ETH2_BUILDER_ERROR_ON_PAYLOAD_REVEAL", flag(self.error_on_payload_reveal)),
            ("HIVE_ETH2_BUILDER_INVALID_PAYLOAD_VERSION", flag(self.invalid_payload_version)),
            ("HIVE_ETH2_BUILDER_CIRCUIT_BREAKER_MISSED_SLOTS", self.circuit_breaker_missed_slots.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        if let Some(extra) = &self.extra_data {
            params.insert("HIVE_ETH2_BUILDER_EXTRA_DATA".into(), extra.clone());
        }
        params
    }
}

/// What the blobber does to the sidecars of the blocks it relays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobberAction {
    #[default]
    Passthrough,
    SendBlobsBeforeBlock,
    SendBlobsAfterBlock,
    ShuffledBlobs,
    EquivocatingBlobSidecars,
    InvalidBlobSidecars,
    DelayBlock,
}

impl BlobberAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BlobberAction::Passthrough => "passthrough",
            BlobberAction::SendBlobsBeforeBlock => "send_blobs_before_block",
            BlobberAction::SendBlobsAfterBlock => "send_blobs_after_block",
            BlobberAction::ShuffledBlobs => "shuffled_blobs",
            BlobberAction::EquivocatingBlobSidecars => "equivocating_blob_sidecars",
            BlobberAction::InvalidBlobSidecars => "invalid_blob_sidecars",
            BlobberAction::DelayBlock => "delay_block",
        }
    }
}

impl fmt::Display for BlobberAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blob sidecar proxy placed between validator clients and their beacon node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobberConfig {
    pub host: Option<IpAddr>,
    pub base_port: u16,
    pub action: BlobberAction,
    /// Apply the action to one in every `frequency` proposals.
    pub action_frequency: u64,
}

impl Default for BlobberConfig {
    fn default() -> Self {
        Self { host: None, base_port: DEFAULT_BLOBBER_PORT, action: BlobberAction::default(), action_frequency: 1 }
    }
}

impl BlobberConfig {
    /// Beacon API address validator client `node` should use instead of its beacon node.
    pub fn beacon_api(&self, node: usize) -> Option<(IpAddr, u16)> {
        let port = u16::try_from(usize::from(self.base_port) + node).ok()?;
        Some((self.host?, port))
    }

    pub fn to_params(&self) -> Params {
        [
            ("HIVE_ETH2_BLOBBER_ACTION".to_string(), self.action.to_string()),
            ("HIVE_ETH2_BLOBBER_ACTION_FREQUENCY".to_string(), self.action_frequency.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

/// Client verbosity for `HIVE_LOGLEVEL`.
pub fn log_level_string(level: u8) -> &'static str {
    match level {
        2 => "warn",
        3 => "info",
        4 => "debug",
        5 => "trace",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use hivenet_node::NodeDefinition;
    use hivenet_types::ForkName;

    use super::*;

    #[test]
    fn join_prefers_right_hand_side() {
        let base = Config {
            validator_count: Some(64),
            slot_time: Some(12),
            forks: ForkConfig::at_genesis(ForkName::Bellatrix),
            enable_builders: true,
            ..Default::default()
        };
        let over = Config {
            slot_time: Some(6),
            forks: ForkConfig { capella_fork_epoch: Some(1), ..Default::default() },
            ..Default::default()
        };
        let joined = base.join(&over);
        assert_eq!(joined.validator_count, Some(64));
        assert_eq!(joined.slot_time, Some(6));
        assert_eq!(joined.forks.bellatrix_fork_epoch, Some(0));
        assert_eq!(joined.forks.capella_fork_epoch, Some(1));
        assert!(joined.enable_builders);
        assert_eq!(Config::default().join(&Config::default()), Config::default());
    }

    #[test]
    fn default_slot_time_depends_on_beacon_clients() {
        let fast = NodeDefinitions(vec![NodeDefinition::new("geth", "lighthouse-bn")]);
        let mut config = Config { node_definitions: Some(fast), ..Default::default() };
        config.fill_defaults();
        assert_eq!(config.slot_time, Some(MINIMAL_SLOT_TIME));
        assert_eq!(config.slots_per_epoch, Some(DEFAULT_SLOTS_PER_EPOCH));

        let mixed = NodeDefinitions(vec![
            NodeDefinition::new("geth", "lighthouse-bn"),
            NodeDefinition::new("geth", "nimbus-bn"),
        ]);
        let mut config = Config { node_definitions: Some(mixed), slots_per_epoch: Some(8), ..Default::default() };
        config.fill_defaults();
        assert_eq!(config.slot_time, Some(DEFAULT_SLOT_TIME));
        assert_eq!(config.slots_per_epoch, Some(8));
    }

    #[test]
    fn loads_from_toml() {
        let config = Config::from_toml(
            r#"
            validator_count = 128
            slot_time = 6
            extra_shares = 1
            enable_builders = true

            [forks]
            bellatrix_fork_epoch = 0
            capella_fork_epoch = 1

            [eth1_consensus]
            kind = "clique"
            period = 3

            [[node_definitions]]
            execution_client = "geth"
            consensus_client = "teku-bn"
            validator_shares = 2

            [builder]
            host = "10.0.0.2"
            error_on_payload_reveal = true
            "#,
        )
        .unwrap();
        assert_eq!(config.validator_count(), 128);
        assert_eq!(config.forks.capella_fork_epoch, Some(1));
        assert!(matches!(config.eth1_consensus, Some(ExecutionConsensus::Clique { period: Some(3), .. })));
        let nodes = config.node_definitions();
        assert_eq!(nodes.0[0].consensus_client, "teku-bn");
        assert_eq!(nodes.shares(), vec![2]);

        let builder = config.active_builder().unwrap();
        assert_eq!(builder.endpoint(1).as_deref(), Some("http://10.0.0.2:18551"));
        assert_eq!(builder.to_params()["HIVE_ETH2_BUILDER_ERROR_ON_PAYLOAD_REVEAL"], "1");
        assert_eq!(builder.circuit_breaker_missed_slots, 10);
        assert!(config.active_blobber().is_none());
    }

    #[test]
    fn blobber_params_and_redirect() {
        let blobber = BlobberConfig {
            host: Some("10.0.0.3".parse().unwrap()),
            action: BlobberAction::EquivocatingBlobSidecars,
            ..Default::default()
        };
        assert_eq!(blobber.to_params()["HIVE_ETH2_BLOBBER_ACTION"], "equivocating_blob_sidecars");
        assert_eq!(blobber.beacon_api(2), Some(("10.0.0.3".parse().unwrap(), 20002)));
        assert_eq!(BlobberConfig::default().beacon_api(0), None);
    }

    #[test]
    fn log_levels_map_to_names() {
        assert_eq!(log_level_string(3), "info");
        assert_eq!(log_level_string(5), "trace");
        assert_eq!(log_level_string(0), "error");
        assert_eq!(log_level_string(9), "error");
    }
}

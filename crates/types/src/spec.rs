//! Beacon chain configuration as shared with the CL clients of a testnet.

use std::collections::HashMap;

use color_eyre::eyre::{self, eyre};
use serde_yaml::{Mapping, Value};
use tree_hash::TreeHash;

use crate::{
    aliases::{Address, B256, Domain, DomainType, Epoch, Root, Slot, U256, Version},
    beacon::{ForkData, SigningData},
    constants::{DEPOSIT_CONTRACT_ADDRESS, FAR_FUTURE_EPOCH, GWEI_PER_ETH, MAX_EFFECTIVE_BALANCE},
    fork::{ForkConfig, ForkName},
};

/// The `0x0a` in the last version byte keeps testnet signatures from ever validating on
/// a public network.
pub const TESTNET_VERSION_SUFFIX: u8 = 0x0a;

/// Beacon chain config values plus the preset values the harness reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeaconSpec {
    pub config_name: String,
    pub preset_base: String,

    pub genesis_fork_version: Version,
    pub altair_fork_version: Version,
    pub bellatrix_fork_version: Version,
    pub capella_fork_version: Version,
    pub deneb_fork_version: Version,
    pub altair_fork_epoch: Epoch,
    pub bellatrix_fork_epoch: Epoch,
    pub capella_fork_epoch: Epoch,
    pub deneb_fork_epoch: Epoch,

    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub seconds_per_eth1_block: u64,
    pub eth1_follow_distance: u64,
    pub min_genesis_active_validator_count: u64,
    pub min_genesis_time: u64,
    pub genesis_delay: u64,

    pub terminal_total_difficulty: U256,
    pub terminal_block_hash: B256,
    pub terminal_block_hash_activation_epoch: Epoch,
    pub safe_slots_to_import_optimistically: u64,

    pub deposit_chain_id: u64,
    pub deposit_network_id: u64,
    pub deposit_contract_address: Address,

    pub shard_committee_period: u64,
    pub churn_limit_quotient: u64,
    pub min_per_epoch_churn_limit: u64,
    pub min_validator_withdrawability_delay: u64,
    pub ejection_balance: u64,
    pub proposer_score_boost: u64,
    pub inactivity_score_bias: u64,
    pub inactivity_score_recovery_rate: u64,

    pub max_effective_balance: u64,
    pub effective_balance_increment: u64,
    pub sync_committee_size: u64,
    pub epochs_per_sync_committee_period: u64,
    pub max_withdrawals_per_payload: u64,
    pub max_bls_to_execution_changes: u64,
    pub max_validators_per_withdrawals_sweep: u64,
    pub max_blobs_per_block: u64,
    pub epochs_per_historical_vector: u64,
}

impl BeaconSpec {
    /// Mainnet preset with a minimal-network config, as the testnet builder starts from.
    pub fn mainnet() -> Self {
        Self {
            config_name: "hive".into(),
            preset_base: "mainnet".into(),
            genesis_fork_version: [0x00, 0x00, 0x00, 0x00],
            altair_fork_version: [0x01, 0x00, 0x00, 0x00],
            bellatrix_fork_version: [0x02, 0x00, 0x00, 0x00],
            capella_fork_version: [0x03, 0x00, 0x00, 0x00],
            deneb_fork_version: [0x04, 0x00, 0x00, 0x00],
            altair_fork_epoch: FAR_FUTURE_EPOCH,
            bellatrix_fork_epoch: FAR_FUTURE_EPOCH,
            capella_fork_epoch: FAR_FUTURE_EPOCH,
            deneb_fork_epoch: FAR_FUTURE_EPOCH,
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            seconds_per_eth1_block: 14,
            eth1_follow_distance: 2048,
            min_genesis_active_validator_count: 16384,
            min_genesis_time: 0,
            genesis_delay: 0,
            terminal_total_difficulty: U256::MAX - U256::from(1024u64),
            terminal_block_hash: B256::ZERO,
            terminal_block_hash_activation_epoch: FAR_FUTURE_EPOCH,
            safe_slots_to_import_optimistically: 128,
            deposit_chain_id: 1,
            deposit_network_id: 1,
            deposit_contract_address: DEPOSIT_CONTRACT_ADDRESS,
            shard_committee_period: 256,
            churn_limit_quotient: 65536,
            min_per_epoch_churn_limit: 4,
            min_validator_withdrawability_delay: 256,
            ejection_balance: 16 * GWEI_PER_ETH,
            proposer_score_boost: 40,
            inactivity_score_bias: 4,
            inactivity_score_recovery_rate: 16,
            max_effective_balance: MAX_EFFECTIVE_BALANCE,
            effective_balance_increment: GWEI_PER_ETH,
            sync_committee_size: 512,
            epochs_per_sync_committee_period: 256,
            max_withdrawals_per_payload: 16,
            max_bls_to_execution_changes: 16,
            max_validators_per_withdrawals_sweep: 16384,
            max_blobs_per_block: 6,
            epochs_per_historical_vector: 65536,
        }
    }

    pub fn time_to_slot(&self, timestamp: u64, genesis_time: u64) -> Slot {
        timestamp.saturating_sub(genesis_time) / self.seconds_per_slot.max(1)
    }

    pub fn slot_to_epoch(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch.max(1)
    }

    pub fn epoch_start_slot(&self, epoch: Epoch) -> Slot {
        epoch.saturating_mul(self.slots_per_epoch)
    }

    pub fn slot_start_time(&self, slot: Slot, genesis_time: u64) -> u64 {
        genesis_time + slot * self.seconds_per_slot
    }

    pub fn fork_epoch(&self, fork: ForkName) -> Epoch {
        match fork {
            ForkName::Phase0 => 0,
            ForkName::Altair => self.altair_fork_epoch,
            ForkName::Bellatrix => self.bellatrix_fork_epoch,
            ForkName::Capella => self.capella_fork_epoch,
            ForkName::Deneb => self.deneb_fork_epoch,
        }
    }

    pub fn fork_version(&self, fork: ForkName) -> Version {
        match fork {
            ForkName::Phase0 => self.genesis_fork_version,
            ForkName::Altair => self.altair_fork_version,
            ForkName::Bellatrix => self.bellatrix_fork_version,
            ForkName::Capella => self.capella_fork_version,
            ForkName::Deneb => self.deneb_fork_version,
        }
    }

    pub fn fork_name_at_epoch(&self, epoch: Epoch) -> ForkName {
        ForkName::ALL
            .into_iter()
            .rev()
            .find(|f| self.fork_epoch(*f) <= epoch)
            .unwrap_or(ForkName::Phase0)
    }

    pub fn fork_name_at_slot(&self, slot: Slot) -> ForkName {
        self.fork_name_at_epoch(self.slot_to_epoch(slot))
    }

    pub fn fork_version_at_epoch(&self, epoch: Epoch) -> Version {
        self.fork_version(self.fork_name_at_epoch(epoch))
    }

    /// Resolves a version back to its fork name.
    pub fn fork_name_of_version(&self, version: Version) -> Option<ForkName> {
        ForkName::ALL.into_iter().find(|f| self.fork_version(*f) == version)
    }

    /// Applies the testnet fork schedule with distinctive fork versions.
    pub fn apply_fork_config(&mut self, forks: &ForkConfig) {
        for fork in ForkName::ALL {
            let version = [fork.version_byte(), 0x00, 0x00, TESTNET_VERSION_SUFFIX];
            let epoch = forks.fork_epoch(fork).unwrap_or(FAR_FUTURE_EPOCH);
            match fork {
                ForkName::Phase0 => self.genesis_fork_version = version,
                ForkName::Altair => {
                    self.altair_fork_version = version;
                    self.altair_fork_epoch = epoch;
                }
                ForkName::Bellatrix => {
                    self.bellatrix_fork_version = version;
                    self.bellatrix_fork_epoch = epoch;
                }
                ForkName::Capella => {
                    self.capella_fork_version = version;
                    self.capella_fork_epoch = epoch;
                }
                ForkName::Deneb => {
                    self.deneb_fork_version = version;
                    self.deneb_fork_epoch = epoch;
                }
            }
        }
    }

    pub fn compute_fork_data_root(
        &self,
        current_version: Version,
        genesis_validators_root: Root,
    ) -> Root {
        ForkData { current_version, genesis_validators_root }.tree_hash_root()
    }

    /// `domain_type || fork_data_root[..28]`
    pub fn compute_domain(
        &self,
        domain_type: DomainType,
        fork_version: Version,
        genesis_validators_root: Root,
    ) -> Domain {
        let fork_data_root = self.compute_fork_data_root(fork_version, genesis_validators_root);
        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&domain_type);
        domain[4..].copy_from_slice(&fork_data_root[..28]);
        B256::from(domain)
    }

    pub fn compute_signing_root<T: TreeHash>(&self, object: &T, domain: Domain) -> Root {
        SigningData { object_root: object.tree_hash_root(), domain }.tree_hash_root()
    }

    /// Parses the `/eth/v1/config/spec` response of a beacon node.
    pub fn from_config_map(map: &HashMap<String, String>) -> eyre::Result<Self> {
        let mut spec = BeaconSpec::mainnet();
        let num = |key: &str| -> eyre::Result<Option<u64>> {
            map.get(key)
                .map(|v| v.parse::<u64>().map_err(|e| eyre!("invalid {key}={v}: {e}")))
                .transpose()
        };
        let version = |key: &str| -> eyre::Result<Option<Version>> {
            map.get(key)
                .map(|v| {
                    let bytes = hex::decode(v.trim_start_matches("0x"))?;
                    <Version>::try_from(bytes.as_slice()).map_err(|_| eyre!("invalid {key}={v}"))
                })
                .transpose()
        };

        macro_rules! set_num {
            ($field:ident, $key:literal) => {
                if let Some(v) = num($key)? {
                    spec.$field = v;
                }
            };
        }
        macro_rules! set_version {
            ($field:ident, $key:literal) => {
                if let Some(v) = version($key)? {
                    spec.$field = v;
                }
            };
        }

        if let Some(name) = map.get("CONFIG_NAME") {
            spec.config_name = name.clone();
        }
        if let Some(preset) = map.get("PRESET_BASE") {
            spec.preset_base = preset.clone();
        }
        set_version!(genesis_fork_version, "GENESIS_FORK_VERSION");
        set_version!(altair_fork_version, "ALTAIR_FORK_VERSION");
        set_version!(bellatrix_fork_version, "BELLATRIX_FORK_VERSION");
        set_version!(capella_fork_version, "CAPELLA_FORK_VERSION");
        set_version!(deneb_fork_version, "DENEB_FORK_VERSION");
        set_num!(altair_fork_epoch, "ALTAIR_FORK_EPOCH");
        set_num!(bellatrix_fork_epoch, "BELLATRIX_FORK_EPOCH");
        set_num!(capella_fork_epoch, "CAPELLA_FORK_EPOCH");
        set_num!(deneb_fork_epoch, "DENEB_FORK_EPOCH");
        set_num!(seconds_per_slot, "SECONDS_PER_SLOT");
        set_num!(slots_per_epoch, "SLOTS_PER_EPOCH");
        set_num!(seconds_per_eth1_block, "SECONDS_PER_ETH1_BLOCK");
        set_num!(eth1_follow_distance, "ETH1_FOLLOW_DISTANCE");
        set_num!(min_genesis_active_validator_count, "MIN_GENESIS_ACTIVE_VALIDATOR_COUNT");
        set_num!(min_genesis_time, "MIN_GENESIS_TIME");
        set_num!(genesis_delay, "GENESIS_DELAY");
        set_num!(safe_slots_to_import_optimistically, "SAFE_SLOTS_TO_IMPORT_OPTIMISTICALLY");
        set_num!(deposit_chain_id, "DEPOSIT_CHAIN_ID");
        set_num!(deposit_network_id, "DEPOSIT_NETWORK_ID");
        set_num!(shard_committee_period, "SHARD_COMMITTEE_PERIOD");
        set_num!(churn_limit_quotient, "CHURN_LIMIT_QUOTIENT");
        set_num!(min_per_epoch_churn_limit, "MIN_PER_EPOCH_CHURN_LIMIT");
        set_num!(min_validator_withdrawability_delay, "MIN_VALIDATOR_WITHDRAWABILITY_DELAY");
        set_num!(ejection_balance, "EJECTION_BALANCE");
        set_num!(proposer_score_boost, "PROPOSER_SCORE_BOOST");
        set_num!(max_effective_balance, "MAX_EFFECTIVE_BALANCE");
        set_num!(effective_balance_increment, "EFFECTIVE_BALANCE_INCREMENT");
        set_num!(sync_committee_size, "SYNC_COMMITTEE_SIZE");
        set_num!(epochs_per_sync_committee_period, "EPOCHS_PER_SYNC_COMMITTEE_PERIOD");
        set_num!(max_withdrawals_per_payload, "MAX_WITHDRAWALS_PER_PAYLOAD");
        set_num!(max_bls_to_execution_changes, "MAX_BLS_TO_EXECUTION_CHANGES");
        set_num!(max_validators_per_withdrawals_sweep, "MAX_VALIDATORS_PER_WITHDRAWALS_SWEEP");
        set_num!(max_blobs_per_block, "MAX_BLOBS_PER_BLOCK");
        set_num!(epochs_per_historical_vector, "EPOCHS_PER_HISTORICAL_VECTOR");

        if let Some(ttd) = map.get("TERMINAL_TOTAL_DIFFICULTY") {
            spec.terminal_total_difficulty =
                ttd.parse::<U256>().map_err(|e| eyre!("invalid TERMINAL_TOTAL_DIFFICULTY: {e}"))?;
        }
        if let Some(hash) = map.get("TERMINAL_BLOCK_HASH") {
            spec.terminal_block_hash = hash.parse()?;
        }
        if let Some(addr) = map.get("DEPOSIT_CONTRACT_ADDRESS") {
            spec.deposit_contract_address = addr.parse()?;
        }
        Ok(spec)
    }

    /// Renders the runtime config consumed by CL clients as `config.yaml`.
    pub fn config_yaml(&self) -> eyre::Result<String> {
        let mut m = Mapping::new();
        let mut put = |k: &str, v: Value| {
            m.insert(Value::String(k.to_string()), v);
        };
        let version = |v: Version| Value::String(format!("0x{}", hex::encode(v)));
        let n = |v: u64| Value::Number(v.into());

        put("PRESET_BASE", Value::String(self.preset_base.clone()));
        put("CONFIG_NAME", Value::String(self.config_name.clone()));
        put("TERMINAL_TOTAL_DIFFICULTY", Value::String(self.terminal_total_difficulty.to_string()));
        put("TERMINAL_BLOCK_HASH", Value::String(self.terminal_block_hash.to_string()));
        put("TERMINAL_BLOCK_HASH_ACTIVATION_EPOCH", n(self.terminal_block_hash_activation_epoch));
        put("SAFE_SLOTS_TO_IMPORT_OPTIMISTICALLY", n(self.safe_slots_to_import_optimistically));
        put("MIN_GENESIS_ACTIVE_VALIDATOR_COUNT", n(self.min_genesis_active_validator_count));
        put("MIN_GENESIS_TIME", n(self.min_genesis_time));
        put("GENESIS_FORK_VERSION", version(self.genesis_fork_version));
        put("GENESIS_DELAY", n(self.genesis_delay));
        put("ALTAIR_FORK_VERSION", version(self.altair_fork_version));
        put("ALTAIR_FORK_EPOCH", n(self.altair_fork_epoch));
        put("BELLATRIX_FORK_VERSION", version(self.bellatrix_fork_version));
        put("BELLATRIX_FORK_EPOCH", n(self.bellatrix_fork_epoch));
        put("CAPELLA_FORK_VERSION", version(self.capella_fork_version));
        put("CAPELLA_FORK_EPOCH", n(self.capella_fork_epoch));
        put("DENEB_FORK_VERSION", version(self.deneb_fork_version));
        put("DENEB_FORK_EPOCH", n(self.deneb_fork_epoch));
        put("SECONDS_PER_SLOT", n(self.seconds_per_slot));
        put("SECONDS_PER_ETH1_BLOCK", n(self.seconds_per_eth1_block));
        put("MIN_VALIDATOR_WITHDRAWABILITY_DELAY", n(self.min_validator_withdrawability_delay));
        put("SHARD_COMMITTEE_PERIOD", n(self.shard_committee_period));
        put("ETH1_FOLLOW_DISTANCE", n(self.eth1_follow_distance));
        put("INACTIVITY_SCORE_BIAS", n(self.inactivity_score_bias));
        put("INACTIVITY_SCORE_RECOVERY_RATE", n(self.inactivity_score_recovery_rate));
        put("EJECTION_BALANCE", n(self.ejection_balance));
        put("MIN_PER_EPOCH_CHURN_LIMIT", n(self.min_per_epoch_churn_limit));
        put("CHURN_LIMIT_QUOTIENT", n(self.churn_limit_quotient));
        put("PROPOSER_SCORE_BOOST", n(self.proposer_score_boost));
        put("DEPOSIT_CHAIN_ID", n(self.deposit_chain_id));
        put("DEPOSIT_NETWORK_ID", n(self.deposit_network_id));
        put("DEPOSIT_CONTRACT_ADDRESS", Value::String(self.deposit_contract_address.to_string()));

        Ok(serde_yaml::to_string(&m)?)
    }

    /// Renders the preset values introduced by `fork` as `preset_<fork>.yaml`.
    pub fn preset_yaml(&self, fork: ForkName) -> eyre::Result<String> {
        let entries: Vec<(&str, u64)> = match fork {
            ForkName::Phase0 => vec![
                ("MAX_COMMITTEES_PER_SLOT", 64),
                ("TARGET_COMMITTEE_SIZE", 128),
                ("MAX_VALIDATORS_PER_COMMITTEE", 2048),
                ("SHUFFLE_ROUND_COUNT", 90),
                ("HYSTERESIS_QUOTIENT", 4),
                ("HYSTERESIS_DOWNWARD_MULTIPLIER", 1),
                ("HYSTERESIS_UPWARD_MULTIPLIER", 5),
                ("MIN_DEPOSIT_AMOUNT", GWEI_PER_ETH),
                ("MAX_EFFECTIVE_BALANCE", self.max_effective_balance),
                ("EFFECTIVE_BALANCE_INCREMENT", self.effective_balance_increment),
                ("MIN_ATTESTATION_INCLUSION_DELAY", 1),
                ("SLOTS_PER_EPOCH", self.slots_per_epoch),
                ("MIN_SEED_LOOKAHEAD", 1),
                ("MAX_SEED_LOOKAHEAD", 4),
                ("EPOCHS_PER_ETH1_VOTING_PERIOD", 64),
                ("SLOTS_PER_HISTORICAL_ROOT", 8192),
                ("MIN_EPOCHS_TO_INACTIVITY_PENALTY", 4),
                ("EPOCHS_PER_HISTORICAL_VECTOR", self.epochs_per_historical_vector),
                ("EPOCHS_PER_SLASHINGS_VECTOR", 8192),
                ("HISTORICAL_ROOTS_LIMIT", 16_777_216),
                ("VALIDATOR_REGISTRY_LIMIT", 1_099_511_627_776),
                ("BASE_REWARD_FACTOR", 64),
                ("WHISTLEBLOWER_REWARD_QUOTIENT", 512),
                ("PROPOSER_REWARD_QUOTIENT", 8),
                ("INACTIVITY_PENALTY_QUOTIENT", 67_108_864),
                ("MIN_SLASHING_PENALTY_QUOTIENT", 128),
                ("PROPORTIONAL_SLASHING_MULTIPLIER", 1),
                ("MAX_PROPOSER_SLASHINGS", 16),
                ("MAX_ATTESTER_SLASHINGS", 2),
                ("MAX_ATTESTATIONS", 128),
                ("MAX_DEPOSITS", 16),
                ("MAX_VOLUNTARY_EXITS", 16),
            ],
            ForkName::Altair => vec![
                ("INACTIVITY_PENALTY_QUOTIENT_ALTAIR", 50_331_648),
                ("MIN_SLASHING_PENALTY_QUOTIENT_ALTAIR", 64),
                ("PROPORTIONAL_SLASHING_MULTIPLIER_ALTAIR", 2),
                ("SYNC_COMMITTEE_SIZE", self.sync_committee_size),
                ("EPOCHS_PER_SYNC_COMMITTEE_PERIOD", self.epochs_per_sync_committee_period),
                ("MIN_SYNC_COMMITTEE_PARTICIPANTS", 1),
                ("UPDATE_TIMEOUT", 8192),
            ],
            ForkName::Bellatrix => vec![
                ("INACTIVITY_PENALTY_QUOTIENT_BELLATRIX", 16_777_216),
                ("MIN_SLASHING_PENALTY_QUOTIENT_BELLATRIX", 32),
                ("PROPORTIONAL_SLASHING_MULTIPLIER_BELLATRIX", 3),
                ("MAX_BYTES_PER_TRANSACTION", 1_073_741_824),
                ("MAX_TRANSACTIONS_PER_PAYLOAD", 1_048_576),
                ("BYTES_PER_LOGS_BLOOM", 256),
                ("MAX_EXTRA_DATA_BYTES", 32),
            ],
            ForkName::Capella => vec![
                ("MAX_BLS_TO_EXECUTION_CHANGES", self.max_bls_to_execution_changes),
                ("MAX_WITHDRAWALS_PER_PAYLOAD", self.max_withdrawals_per_payload),
                ("MAX_VALIDATORS_PER_WITHDRAWALS_SWEEP", self.max_validators_per_withdrawals_sweep),
            ],
            ForkName::Deneb => vec![
                ("FIELD_ELEMENTS_PER_BLOB", 4096),
                ("MAX_BLOB_COMMITMENTS_PER_BLOCK", 4096),
                ("MAX_BLOBS_PER_BLOCK", self.max_blobs_per_block),
                ("KZG_COMMITMENT_INCLUSION_PROOF_DEPTH", 17),
            ],
        };
        let mut m = Mapping::new();
        for (k, v) in entries {
            m.insert(Value::String(k.to_string()), Value::Number(v.into()));
        }
        Ok(serde_yaml::to_string(&m)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testnet_spec() -> BeaconSpec {
        let mut spec = BeaconSpec::mainnet();
        spec.apply_fork_config(&ForkConfig {
            bellatrix_fork_epoch: Some(0),
            capella_fork_epoch: Some(1),
            ..ForkConfig::at_genesis(ForkName::Altair)
        });
        spec.seconds_per_slot = 6;
        spec
    }

    #[test]
    fn slot_and_epoch_arithmetic() {
        let spec = testnet_spec();
        assert_eq!(spec.time_to_slot(1_000 + 59, 1_000), 9);
        assert_eq!(spec.time_to_slot(900, 1_000), 0);
        assert_eq!(spec.slot_to_epoch(63), 1);
        assert_eq!(spec.slot_to_epoch(64), 2);
        assert_eq!(spec.epoch_start_slot(3), 96);
    }

    #[test]
    fn fork_versions_carry_testnet_suffix() {
        let spec = testnet_spec();
        assert_eq!(spec.genesis_fork_version, [0, 0, 0, 0x0a]);
        assert_eq!(spec.capella_fork_version, [3, 0, 0, 0x0a]);
        assert_eq!(spec.deneb_fork_epoch, FAR_FUTURE_EPOCH);
        assert_eq!(spec.fork_name_at_epoch(0), ForkName::Bellatrix);
        assert_eq!(spec.fork_name_at_epoch(1), ForkName::Capella);
        assert_eq!(spec.fork_name_of_version([2, 0, 0, 0x0a]), Some(ForkName::Bellatrix));
    }

    #[test]
    fn domain_prefix_is_domain_type() {
        let spec = testnet_spec();
        let domain = spec.compute_domain(
            crate::constants::DOMAIN_BLS_TO_EXECUTION_CHANGE,
            spec.genesis_fork_version,
            B256::repeat_byte(7),
        );
        assert_eq!(&domain[..4], &[0x0a, 0, 0, 0]);
        let other = spec.compute_domain(
            crate::constants::DOMAIN_BLS_TO_EXECUTION_CHANGE,
            spec.capella_fork_version,
            B256::repeat_byte(7),
        );
        assert_ne!(domain, other);
    }

    #[test]
    fn config_map_round_trips_through_yaml() {
        let spec = testnet_spec();
        let yaml = spec.config_yaml().unwrap();
        let parsed: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(&yaml).unwrap();
        let map: HashMap<String, String> = parsed
            .into_iter()
            .map(|(k, v)| {
                let s = match v {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    other => panic!("unexpected value {other:?}"),
                };
                (k, s)
            })
            .collect();
        let back = BeaconSpec::from_config_map(&map).unwrap();
        assert_eq!(back.capella_fork_version, spec.capella_fork_version);
        assert_eq!(back.capella_fork_epoch, 1);
        assert_eq!(back.seconds_per_slot, 6);
        assert_eq!(back.terminal_total_difficulty, spec.terminal_total_difficulty);
    }

    #[test]
    fn preset_contains_slots_per_epoch() {
        let mut spec = testnet_spec();
        spec.slots_per_epoch = 8;
        let yaml = spec.preset_yaml(ForkName::Phase0).unwrap();
        assert!(yaml.contains("SLOTS_PER_EPOCH: 8"));
    }
}

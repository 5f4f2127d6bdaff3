//! Protocol and harness constants shared across hivenet crates.

use alloy_primitives::{Address, B256, address, b256};

use crate::aliases::{DomainType, Epoch, Gwei};

pub const GWEI_PER_ETH: u64 = 1_000_000_000;
pub const WEI_PER_GWEI: u64 = 1_000_000_000;

pub const MAX_EFFECTIVE_BALANCE: Gwei = 32 * GWEI_PER_ETH;
pub const EFFECTIVE_BALANCE_INCREMENT: Gwei = GWEI_PER_ETH;
pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;
pub const GENESIS_EPOCH: Epoch = 0;

/// Participation flags are a 3-bit field (source, target, head) weighted 1+2+4.
pub const MAX_PARTICIPATION_SCORE: u64 = 7;

pub const BASE_REWARD_FACTOR: u64 = 64;
pub const BASE_REWARDS_PER_EPOCH: u64 = 4;
pub const HYSTERESIS_QUOTIENT: u64 = 4;

pub const BLS_WITHDRAWAL_PREFIX: u8 = 0x00;
pub const ETH1_ADDRESS_WITHDRAWAL_PREFIX: u8 = 0x01;
pub const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;

pub const DOMAIN_BEACON_PROPOSER: DomainType = [0x00, 0x00, 0x00, 0x00];
pub const DOMAIN_BEACON_ATTESTER: DomainType = [0x01, 0x00, 0x00, 0x00];
pub const DOMAIN_RANDAO: DomainType = [0x02, 0x00, 0x00, 0x00];
pub const DOMAIN_DEPOSIT: DomainType = [0x03, 0x00, 0x00, 0x00];
pub const DOMAIN_VOLUNTARY_EXIT: DomainType = [0x04, 0x00, 0x00, 0x00];
pub const DOMAIN_SYNC_COMMITTEE: DomainType = [0x07, 0x00, 0x00, 0x00];
pub const DOMAIN_BLS_TO_EXECUTION_CHANGE: DomainType = [0x0a, 0x00, 0x00, 0x00];

/// `keccak256(rlp([]))`, the ommers hash every post-merge header carries.
pub const EMPTY_UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

pub const MAX_EXTRA_DATA_BYTES: usize = 32;

pub const DEPOSIT_CONTRACT_ADDRESS: Address = address!("4242424242424242424242424242424242424242");
pub const BEACON_ROOTS_ADDRESS: Address = address!("000F3df6D732807Ef1319fB7B8bB8522d0Beac02");

/// Shared engine secret every client container is started with (`HIVE_JWTSECRET=true`).
pub const DEFAULT_JWT_SECRET: [u8; 32] = *b"secretsecretsecretsecretsecretse";

pub const DEFAULT_CHAIN_ID: u64 = 7;
pub const DEFAULT_NETWORK_ID: u64 = 7;
pub const DEFAULT_GAS_LIMIT: u64 = 30_000_000;

pub const DEFAULT_SAFE_SLOTS_TO_IMPORT_OPTIMISTICALLY: u64 = 128;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS_ON_WAITS: usize = 3;
pub const GENESIS_DELAY_SECS: u64 = 30;

pub const PORT_ENGINE: u16 = 8551;
pub const PORT_ETH_RPC: u16 = 8545;
pub const PORT_BEACON_TCP: u16 = 9000;
pub const PORT_BEACON_UDP: u16 = 9000;
pub const PORT_BEACON_API: u16 = 4000;
pub const PORT_BEACON_GRPC: u16 = 4001;
pub const PORT_METRICS: u16 = 8080;
pub const PORT_VALIDATOR_API: u16 = 5000;

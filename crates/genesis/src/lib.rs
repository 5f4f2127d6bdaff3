//! Key derivation and genesis construction for EL and CL clients.
//!
//! Everything here runs once at testnet setup and produces immutable artifacts:
//! validator keys with their keystores, the EL `genesis.json` and the beacon
//! `genesis.ssz` together with the files clients are started from.

#![forbid(unsafe_code)]

pub mod accounts;
pub mod bls;
pub mod consensus;
pub mod execution;
pub mod keys;
pub mod keystore;

pub use accounts::{TestAccount, test_accounts};
pub use consensus::{SpecOverrides, build_beacon_state, build_spec, consensus_bundle};
pub use execution::{ExecutionConsensus, ExecutionGenesis, build_chain_config, build_execution_genesis};
pub use keys::{KeySource, Shares, ValidatorKey, ValidatorKeys, derive_validator_keys, keys_bundle};

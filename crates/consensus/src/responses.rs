//! Response bodies of the beacon API endpoints the harness reads.

use hivenet_types::{
    aliases::{Gwei, Root, ValidatorIndex, Version},
    beacon::{Checkpoint, Validator},
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub peer_id: String,
    pub enr: String,
    #[serde(default)]
    pub p2p_addresses: Vec<String>,
    #[serde(default)]
    pub discovery_addresses: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: Root,
    #[serde(with = "serde_utils::bytes_4_hex")]
    pub genesis_fork_version: Version,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityCheckpoints {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorResponse {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: ValidatorIndex,
    #[serde(with = "serde_utils::quoted_u64")]
    pub balance: Gwei,
    pub status: String,
    pub validator: Validator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorBalance {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: ValidatorIndex,
    #[serde(with = "serde_utils::quoted_u64")]
    pub balance: Gwei,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RootData {
    pub root: Root,
}

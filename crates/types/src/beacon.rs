//! SSZ containers of the beacon chain used by the harness.
//!
//! Field order matches the consensus specs; changing it changes every root.

use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
use ssz_types::{BitList, FixedVector, VariableList, typenum};
use superstruct::superstruct;
use tree_hash_derive::TreeHash;

use crate::{
    aliases::{Address, B256, BlsPubkey, BlsSignature, Domain, Epoch, Gwei, Root, Slot, U256,
        ValidatorIndex, Version},
    constants::{ETH1_ADDRESS_WITHDRAWAL_PREFIX, FAR_FUTURE_EPOCH},
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Fork {
    #[serde(with = "serde_utils::bytes_4_hex")]
    pub previous_version: Version,
    #[serde(with = "serde_utils::bytes_4_hex")]
    pub current_version: Version,
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct ForkData {
    pub current_version: Version,
    pub genesis_validators_root: Root,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct SigningData {
    pub object_root: Root,
    pub domain: Domain,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash,
)]
pub struct Checkpoint {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
    pub root: Root,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Eth1Data {
    pub deposit_root: Root,
    #[serde(with = "serde_utils::quoted_u64")]
    pub deposit_count: u64,
    pub block_hash: B256,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockHeader {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body_root: Root,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Validator {
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub effective_balance: Gwei,
    pub slashed: bool,
    #[serde(with = "serde_utils::quoted_u64")]
    pub activation_eligibility_epoch: Epoch,
    #[serde(with = "serde_utils::quoted_u64")]
    pub activation_epoch: Epoch,
    #[serde(with = "serde_utils::quoted_u64")]
    pub exit_epoch: Epoch,
    #[serde(with = "serde_utils::quoted_u64")]
    pub withdrawable_epoch: Epoch,
}

impl Validator {
    /// Execution address of a `0x01` credential.
    pub fn eth1_withdrawal_address(&self) -> Option<Address> {
        (self.withdrawal_credentials[0] == ETH1_ADDRESS_WITHDRAWAL_PREFIX)
            .then(|| Address::from_slice(&self.withdrawal_credentials[12..]))
    }

    pub fn is_active_at(&self, epoch: Epoch) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }

    pub fn exit_initiated(&self) -> bool {
        self.exit_epoch != FAR_FUTURE_EPOCH
    }

    pub fn is_fully_withdrawable(&self, balance: Gwei, epoch: Epoch) -> bool {
        self.eth1_withdrawal_address().is_some() && self.withdrawable_epoch <= epoch && balance > 0
    }

    pub fn is_partially_withdrawable(&self, balance: Gwei, max_effective_balance: Gwei) -> bool {
        self.eth1_withdrawal_address().is_some() &&
            self.effective_balance == max_effective_balance &&
            balance > max_effective_balance
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BlsToExecutionChange {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: ValidatorIndex,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub from_bls_pubkey: BlsPubkey,
    pub to_execution_address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBlsToExecutionChange {
    pub message: BlsToExecutionChange,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct VoluntaryExit {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: ValidatorIndex,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: u64,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

pub type MaxValidatorsPerCommittee = typenum::U2048;

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct PendingAttestation {
    pub aggregation_bits: BitList<MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub inclusion_delay: u64,
    pub proposer_index: ValidatorIndex,
}

pub type SyncCommitteeSize = typenum::U512;

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct SyncCommittee {
    pub pubkeys: FixedVector<BlsPubkey, SyncCommitteeSize>,
    pub aggregate_pubkey: BlsPubkey,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Withdrawal {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: ValidatorIndex,
    pub address: Address,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: Gwei,
}

impl From<&Withdrawal> for alloy_eips::eip4895::Withdrawal {
    fn from(w: &Withdrawal) -> Self {
        alloy_eips::eip4895::Withdrawal {
            index: w.index,
            validator_index: w.validator_index,
            address: w.address,
            amount: w.amount,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, TreeHash)]
pub struct HistoricalSummary {
    pub block_summary_root: Root,
    pub state_summary_root: Root,
}

pub type BytesPerLogsBloom = typenum::U256;
pub type MaxExtraDataBytes = typenum::U32;

#[superstruct(
    variants(Bellatrix, Capella, Deneb),
    variant_attributes(derive(
        Clone,
        Debug,
        Default,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Encode,
        Decode,
        TreeHash
    ))
)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Encode, TreeHash)]
#[serde(untagged)]
#[ssz(enum_behaviour = "transparent")]
#[tree_hash(enum_behaviour = "transparent")]
pub struct ExecutionPayloadHeader {
    #[superstruct(getter(copy))]
    pub parent_hash: B256,
    #[superstruct(getter(copy))]
    pub fee_recipient: Address,
    #[superstruct(getter(copy))]
    pub state_root: B256,
    #[superstruct(getter(copy))]
    pub receipts_root: B256,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub logs_bloom: FixedVector<u8, BytesPerLogsBloom>,
    #[superstruct(getter(copy))]
    pub prev_randao: B256,
    #[serde(with = "serde_utils::quoted_u64")]
    #[superstruct(getter(copy))]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    #[superstruct(getter(copy))]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    #[superstruct(getter(copy))]
    pub gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    #[superstruct(getter(copy))]
    pub timestamp: u64,
    #[serde(with = "ssz_types::serde_utils::hex_var_list")]
    pub extra_data: VariableList<u8, MaxExtraDataBytes>,
    #[serde(with = "serde_utils::quoted_u256")]
    #[superstruct(getter(copy))]
    pub base_fee_per_gas: U256,
    #[superstruct(getter(copy))]
    pub block_hash: B256,
    #[superstruct(getter(copy))]
    pub transactions_root: Root,
    #[superstruct(only(Capella, Deneb), partial_getter(copy))]
    pub withdrawals_root: Root,
    #[superstruct(only(Deneb), partial_getter(copy))]
    #[serde(with = "serde_utils::quoted_u64")]
    pub blob_gas_used: u64,
    #[superstruct(only(Deneb), partial_getter(copy))]
    #[serde(with = "serde_utils::quoted_u64")]
    pub excess_blob_gas: u64,
}

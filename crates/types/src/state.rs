//! Fork-versioned beacon state with mainnet preset list bounds.

use ssz::{Decode, DecodeError, Encode};
use ssz_derive::{Decode, Encode};
use ssz_types::{BitVector, FixedVector, VariableList, typenum};
use superstruct::superstruct;
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash;

use crate::{
    aliases::{B256, Epoch, Gwei, Root, Slot, ValidatorIndex},
    beacon::{
        BeaconBlockHeader, Checkpoint, Eth1Data, ExecutionPayloadHeaderBellatrix,
        ExecutionPayloadHeaderCapella, ExecutionPayloadHeaderDeneb, Fork, HistoricalSummary,
        PendingAttestation, SyncCommittee, Validator, Withdrawal,
    },
    fork::ForkName,
    spec::BeaconSpec,
};

pub type SlotsPerHistoricalRoot = typenum::U8192;
pub type HistoricalRootsLimit = typenum::U16777216;
pub type Eth1DataVotesLimit = typenum::U2048;
pub type ValidatorRegistryLimit = typenum::U1099511627776;
pub type EpochsPerHistoricalVector = typenum::U65536;
pub type EpochsPerSlashingsVector = typenum::U8192;
pub type MaxPendingAttestations = typenum::U4096;
pub type JustificationBitsLength = typenum::U4;

#[superstruct(
    variants(Phase0, Altair, Bellatrix, Capella, Deneb),
    variant_attributes(derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TreeHash))
)]
#[derive(Clone, Debug, PartialEq, Eq, Encode, TreeHash)]
#[ssz(enum_behaviour = "transparent")]
#[tree_hash(enum_behaviour = "transparent")]
pub struct BeaconState {
    #[superstruct(getter(copy))]
    pub genesis_time: u64,
    #[superstruct(getter(copy))]
    pub genesis_validators_root: Root,
    #[superstruct(getter(copy))]
    pub slot: Slot,
    pub fork: Fork,

    pub latest_block_header: BeaconBlockHeader,
    pub block_roots: FixedVector<Root, SlotsPerHistoricalRoot>,
    pub state_roots: FixedVector<Root, SlotsPerHistoricalRoot>,
    pub historical_roots: VariableList<Root, HistoricalRootsLimit>,

    pub eth1_data: Eth1Data,
    pub eth1_data_votes: VariableList<Eth1Data, Eth1DataVotesLimit>,
    #[superstruct(getter(copy))]
    pub eth1_deposit_index: u64,

    pub validators: VariableList<Validator, ValidatorRegistryLimit>,
    pub balances: VariableList<Gwei, ValidatorRegistryLimit>,

    pub randao_mixes: FixedVector<B256, EpochsPerHistoricalVector>,
    pub slashings: FixedVector<Gwei, EpochsPerSlashingsVector>,

    #[superstruct(only(Phase0))]
    pub previous_epoch_attestations: VariableList<PendingAttestation, MaxPendingAttestations>,
    #[superstruct(only(Phase0))]
    pub current_epoch_attestations: VariableList<PendingAttestation, MaxPendingAttestations>,
    #[superstruct(only(Altair, Bellatrix, Capella, Deneb))]
    pub previous_epoch_participation: VariableList<u8, ValidatorRegistryLimit>,
    #[superstruct(only(Altair, Bellatrix, Capella, Deneb))]
    pub current_epoch_participation: VariableList<u8, ValidatorRegistryLimit>,

    pub justification_bits: BitVector<JustificationBitsLength>,
    #[superstruct(getter(copy))]
    pub previous_justified_checkpoint: Checkpoint,
    #[superstruct(getter(copy))]
    pub current_justified_checkpoint: Checkpoint,
    #[superstruct(getter(copy))]
    pub finalized_checkpoint: Checkpoint,

    #[superstruct(only(Altair, Bellatrix, Capella, Deneb))]
    pub inactivity_scores: VariableList<u64, ValidatorRegistryLimit>,
    #[superstruct(only(Altair, Bellatrix, Capella, Deneb))]
    pub current_sync_committee: SyncCommittee,
    #[superstruct(only(Altair, Bellatrix, Capella, Deneb))]
    pub next_sync_committee: SyncCommittee,

    #[superstruct(
        only(Bellatrix),
        partial_getter(rename = "latest_execution_payload_header_bellatrix")
    )]
    pub latest_execution_payload_header: ExecutionPayloadHeaderBellatrix,
    #[superstruct(
        only(Capella),
        partial_getter(rename = "latest_execution_payload_header_capella")
    )]
    pub latest_execution_payload_header: ExecutionPayloadHeaderCapella,
    #[superstruct(only(Deneb), partial_getter(rename = "latest_execution_payload_header_deneb"))]
    pub latest_execution_payload_header: ExecutionPayloadHeaderDeneb,

    #[superstruct(only(Capella, Deneb), partial_getter(copy))]
    pub next_withdrawal_index: u64,
    #[superstruct(only(Capella, Deneb), partial_getter(copy))]
    pub next_withdrawal_validator_index: ValidatorIndex,
    #[superstruct(only(Capella, Deneb))]
    pub historical_summaries: VariableList<HistoricalSummary, HistoricalRootsLimit>,
}

impl BeaconState {
    pub fn fork_name(&self) -> ForkName {
        match self {
            BeaconState::Phase0(_) => ForkName::Phase0,
            BeaconState::Altair(_) => ForkName::Altair,
            BeaconState::Bellatrix(_) => ForkName::Bellatrix,
            BeaconState::Capella(_) => ForkName::Capella,
            BeaconState::Deneb(_) => ForkName::Deneb,
        }
    }

    pub fn from_ssz_bytes_by_fork(bytes: &[u8], fork: ForkName) -> Result<Self, DecodeError> {
        Ok(match fork {
            ForkName::Phase0 => BeaconState::Phase0(BeaconStatePhase0::from_ssz_bytes(bytes)?),
            ForkName::Altair => BeaconState::Altair(BeaconStateAltair::from_ssz_bytes(bytes)?),
            ForkName::Bellatrix => {
                BeaconState::Bellatrix(BeaconStateBellatrix::from_ssz_bytes(bytes)?)
            }
            ForkName::Capella => BeaconState::Capella(BeaconStateCapella::from_ssz_bytes(bytes)?),
            ForkName::Deneb => BeaconState::Deneb(BeaconStateDeneb::from_ssz_bytes(bytes)?),
        })
    }

    pub fn to_ssz_bytes(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn root(&self) -> Root {
        self.tree_hash_root()
    }

    pub fn current_version(&self) -> [u8; 4] {
        self.fork().current_version
    }

    pub fn previous_version(&self) -> [u8; 4] {
        self.fork().previous_version
    }

    pub fn balance(&self, index: ValidatorIndex) -> Option<Gwei> {
        self.balances().get(index as usize).copied()
    }

    /// Block hash of the latest execution payload header, for Bellatrix and later.
    pub fn latest_execution_payload_header_hash(&self) -> Option<B256> {
        match self {
            BeaconState::Bellatrix(s) => Some(s.latest_execution_payload_header.block_hash),
            BeaconState::Capella(s) => Some(s.latest_execution_payload_header.block_hash),
            BeaconState::Deneb(s) => Some(s.latest_execution_payload_header.block_hash),
            _ => None,
        }
    }

    pub fn latest_execution_payload_header_number(&self) -> Option<u64> {
        match self {
            BeaconState::Bellatrix(s) => Some(s.latest_execution_payload_header.block_number),
            BeaconState::Capella(s) => Some(s.latest_execution_payload_header.block_number),
            BeaconState::Deneb(s) => Some(s.latest_execution_payload_header.block_number),
            _ => None,
        }
    }

    /// Current-epoch participation flags; `None` before Altair.
    pub fn epoch_participation(&self) -> Option<&[u8]> {
        self.current_epoch_participation().ok().map(|p| &p[..])
    }

    pub fn current_epoch(&self, spec: &BeaconSpec) -> Epoch {
        spec.slot_to_epoch(self.slot())
    }

    /// Withdrawals the next payload must contain, following the Capella sweep.
    pub fn next_withdrawals(&self, spec: &BeaconSpec) -> Vec<Withdrawal> {
        let (Ok(mut withdrawal_index), Ok(mut validator_index)) =
            (self.next_withdrawal_index(), self.next_withdrawal_validator_index())
        else {
            return Vec::new();
        };
        let validators = self.validators();
        let balances = self.balances();
        if validators.is_empty() {
            return Vec::new();
        }
        let epoch = self.current_epoch(spec);
        let bound = (validators.len() as u64).min(spec.max_validators_per_withdrawals_sweep);
        let mut withdrawals = Vec::new();

        for _ in 0..bound {
            let idx = validator_index as usize;
            let (Some(validator), Some(&balance)) = (validators.get(idx), balances.get(idx)) else {
                break;
            };
            if let Some(address) = validator.eth1_withdrawal_address() {
                if validator.is_fully_withdrawable(balance, epoch) {
                    withdrawals.push(Withdrawal {
                        index: withdrawal_index,
                        validator_index,
                        address,
                        amount: balance,
                    });
                    withdrawal_index += 1;
                } else if validator.is_partially_withdrawable(balance, spec.max_effective_balance) {
                    withdrawals.push(Withdrawal {
                        index: withdrawal_index,
                        validator_index,
                        address,
                        amount: balance - spec.max_effective_balance,
                    });
                    withdrawal_index += 1;
                }
            }
            if withdrawals.len() as u64 == spec.max_withdrawals_per_payload {
                break;
            }
            validator_index = (validator_index + 1) % validators.len() as u64;
        }
        withdrawals
    }
}

//! Views over a beacon state fetched from a node's debug API.

use std::sync::Arc;

use color_eyre::eyre::{self, eyre};
use hivenet_types::{
    BeaconSpec, ForkName,
    aliases::{Address, B256, Epoch, Gwei, Root, Slot, ValidatorIndex, Version},
    beacon::{Validator, Withdrawal},
    state::BeaconState,
};

/// Whether the validator's whole balance is withdrawn at `epoch`.
pub fn is_fully_withdrawable(validator: &Validator, balance: Gwei, epoch: Epoch) -> bool {
    validator.is_fully_withdrawable(balance, epoch)
}

/// Whether the validator has an excess over the maximum effective balance to sweep.
pub fn is_partially_withdrawable(spec: &BeaconSpec, validator: &Validator, balance: Gwei) -> bool {
    validator.is_partially_withdrawable(balance, spec.max_effective_balance)
}

/// Execution address encoded in the last 20 bytes of the credentials.
pub fn eth1_withdrawal_credential(validator: &Validator) -> Address {
    Address::from_slice(&validator.withdrawal_credentials[12..])
}

/// A decoded beacon state bundled with the spec it was produced under.
#[derive(Clone, Debug)]
pub struct VersionedBeaconState {
    state: BeaconState,
    spec: Arc<BeaconSpec>,
}

impl VersionedBeaconState {
    pub fn new(state: BeaconState, spec: Arc<BeaconSpec>) -> Self {
        Self { state, spec }
    }

    /// Decodes an SSZ state; without an advertised version every fork is tried,
    /// newest first.
    pub fn from_ssz(
        bytes: &[u8],
        fork: Option<ForkName>,
        spec: Arc<BeaconSpec>,
    ) -> eyre::Result<Self> {
        let candidates: Vec<ForkName> = match fork {
            Some(f) => vec![f],
            None => ForkName::ALL.into_iter().rev().collect(),
        };
        for fork in candidates {
            if let Ok(state) = BeaconState::from_ssz_bytes_by_fork(bytes, fork) {
                return Ok(Self::new(state, spec));
            }
        }
        Err(eyre!("badly formatted beacon state"))
    }

    pub fn inner(&self) -> &BeaconState {
        &self.state
    }

    pub fn spec(&self) -> &BeaconSpec {
        &self.spec
    }

    pub fn fork_name(&self) -> ForkName {
        self.state.fork_name()
    }

    pub fn root(&self) -> Root {
        self.state.root()
    }

    pub fn slot(&self) -> Slot {
        self.state.slot()
    }

    pub fn current_version(&self) -> Version {
        self.state.current_version()
    }

    pub fn previous_version(&self) -> Version {
        self.state.previous_version()
    }

    pub fn genesis_validators_root(&self) -> Root {
        self.state.genesis_validators_root()
    }

    pub fn validators(&self) -> &[Validator] {
        self.state.validators()
    }

    pub fn balances(&self) -> &[Gwei] {
        self.state.balances()
    }

    pub fn randao_mixes(&self) -> &[B256] {
        self.state.randao_mixes()
    }

    /// `None` on phase0 states, which track attestations instead.
    pub fn current_epoch_participation(&self) -> Option<&[u8]> {
        self.state.epoch_participation()
    }

    pub fn latest_execution_payload_header_hash(&self) -> Option<B256> {
        self.state.latest_execution_payload_header_hash()
    }

    /// Zero before Capella.
    pub fn next_withdrawal_index(&self) -> u64 {
        self.state.next_withdrawal_index().unwrap_or_default()
    }

    /// Zero before Capella.
    pub fn next_withdrawal_validator_index(&self) -> ValidatorIndex {
        self.state.next_withdrawal_validator_index().unwrap_or_default()
    }

    /// Withdrawals the payload of `slot` is expected to carry given this state.
    ///
    /// Bellatrix states sweep from index zero; earlier forks have no withdrawals.
    pub fn next_withdrawals(&self, slot: Slot) -> eyre::Result<Vec<Withdrawal>> {
        let (mut withdrawal_index, mut validator_index) = match self.fork_name() {
            ForkName::Phase0 | ForkName::Altair => return Err(eyre!("badly formatted beacon state")),
            ForkName::Bellatrix => (0, 0),
            _ => (self.next_withdrawal_index(), self.next_withdrawal_validator_index()),
        };
        let spec = &self.spec;
        let epoch = spec.slot_to_epoch(slot);
        let validators = self.validators();
        let balances = self.balances();
        let count = validators.len() as u64;
        let mut withdrawals = Vec::new();

        let mut i = 0u64;
        loop {
            let idx = validator_index as usize;
            let (Some(validator), Some(&balance)) = (validators.get(idx), balances.get(idx)) else {
                return Err(eyre!("invalid validator index {validator_index}"));
            };
            if i >= count || i >= spec.max_validators_per_withdrawals_sweep {
                break;
            }
            if validator.eth1_withdrawal_address().is_some() {
                let amount = if is_fully_withdrawable(validator, balance, epoch) {
                    Some(balance)
                } else if is_partially_withdrawable(spec, validator, balance) {
                    Some(balance - spec.max_effective_balance)
                } else {
                    None
                };
                if let Some(amount) = amount {
                    withdrawals.push(Withdrawal {
                        index: withdrawal_index,
                        validator_index,
                        address: eth1_withdrawal_credential(validator),
                        amount,
                    });
                    withdrawal_index += 1;
                }
            }
            if withdrawals.len() as u64 == spec.max_withdrawals_per_payload {
                break;
            }
            validator_index = (validator_index + 1) % count;
            i += 1;
        }
        Ok(withdrawals)
    }
}

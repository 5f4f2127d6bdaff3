//! Beacon genesis state and the consensus config bundle.

use alloy_consensus::Header;
use alloy_primitives::U256;
use color_eyre::eyre::{self, eyre};
use sha2::{Digest, Sha256};
use ssz_types::{
    BitVector, FixedVector, VariableList,
    typenum::{self, Unsigned},
};
use tracing::debug;
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash;

use hivenet_types::{
    BeaconSpec, ForkName, HarnessError, StartBundle,
    aliases::{Address, B256, BlsSignature, Epoch, Gwei, Root, ValidatorIndex, bls_pubkey},
    beacon::{
        BeaconBlockHeader, Eth1Data, ExecutionPayloadHeaderBellatrix,
        ExecutionPayloadHeaderCapella, ExecutionPayloadHeaderDeneb, Fork, SyncCommittee,
        Validator,
    },
    constants::{
        DOMAIN_SYNC_COMMITTEE, FAR_FUTURE_EPOCH, GENESIS_EPOCH, MAX_EXTRA_DATA_BYTES,
    },
    state::{
        BeaconState, BeaconStateAltair, BeaconStateBellatrix, BeaconStateCapella,
        BeaconStateDeneb, BeaconStatePhase0, EpochsPerSlashingsVector,
    },
};

use crate::{bls, execution::ExecutionGenesis, keys::ValidatorKey};

pub const SHUFFLE_ROUND_COUNT: u8 = 90;
const MAX_RANDOM_BYTE: u64 = u8::MAX as u64;

pub const CONFIG_PATH: &str = "/hive/input/config.yaml";
pub const GENESIS_STATE_PATH: &str = "/hive/input/genesis.ssz";

// Every list in a block body holds composite elements, so its empty root only
// depends on the list limit and 32-byte roots are a sufficient stand-in.
type EmptyList<N> = VariableList<Root, N>;

#[derive(Default, TreeHash)]
struct SyncAggregate {
    sync_committee_bits: BitVector<typenum::U512>,
    sync_committee_signature: BlsSignature,
}

#[derive(Default, TreeHash)]
struct ExecutionPayloadBellatrix {
    parent_hash: B256,
    fee_recipient: Address,
    state_root: B256,
    receipts_root: B256,
    logs_bloom: FixedVector<u8, typenum::U256>,
    prev_randao: B256,
    block_number: u64,
    gas_limit: u64,
    gas_used: u64,
    timestamp: u64,
    extra_data: VariableList<u8, typenum::U32>,
    base_fee_per_gas: U256,
    block_hash: B256,
    transactions: EmptyList<typenum::U1048576>,
}

#[derive(Default, TreeHash)]
struct ExecutionPayloadCapella {
    parent_hash: B256,
    fee_recipient: Address,
    state_root: B256,
    receipts_root: B256,
    logs_bloom: FixedVector<u8, typenum::U256>,
    prev_randao: B256,
    block_number: u64,
    gas_limit: u64,
    gas_used: u64,
    timestamp: u64,
    extra_data: VariableList<u8, typenum::U32>,
    base_fee_per_gas: U256,
    block_hash: B256,
    transactions: EmptyList<typenum::U1048576>,
    withdrawals: EmptyList<typenum::U16>,
}

#[derive(Default, TreeHash)]
struct ExecutionPayloadDeneb {
    parent_hash: B256,
    fee_recipient: Address,
    state_root: B256,
    receipts_root: B256,
    logs_bloom: FixedVector<u8, typenum::U256>,
    prev_randao: B256,
    block_number: u64,
    gas_limit: u64,
    gas_used: u64,
    timestamp: u64,
    extra_data: VariableList<u8, typenum::U32>,
    base_fee_per_gas: U256,
    block_hash: B256,
    transactions: EmptyList<typenum::U1048576>,
    withdrawals: EmptyList<typenum::U16>,
    blob_gas_used: u64,
    excess_blob_gas: u64,
}

#[derive(Default, TreeHash)]
struct BodyPhase0 {
    randao_reveal: BlsSignature,
    eth1_data: Eth1Data,
    graffiti: B256,
    proposer_slashings: EmptyList<typenum::U16>,
    attester_slashings: EmptyList<typenum::U2>,
    attestations: EmptyList<typenum::U128>,
    deposits: EmptyList<typenum::U16>,
    voluntary_exits: EmptyList<typenum::U16>,
}

#[derive(Default, TreeHash)]
struct BodyAltair {
    randao_reveal: BlsSignature,
    eth1_data: Eth1Data,
    graffiti: B256,
    proposer_slashings: EmptyList<typenum::U16>,
    attester_slashings: EmptyList<typenum::U2>,
    attestations: EmptyList<typenum::U128>,
    deposits: EmptyList<typenum::U16>,
    voluntary_exits: EmptyList<typenum::U16>,
    sync_aggregate: SyncAggregate,
}

#[derive(Default, TreeHash)]
struct BodyBellatrix {
    randao_reveal: BlsSignature,
    eth1_data: Eth1Data,
    graffiti: B256,
    proposer_slashings: EmptyList<typenum::U16>,
    attester_slashings: EmptyList<typenum::U2>,
    attestations: EmptyList<typenum::U128>,
    deposits: EmptyList<typenum::U16>,
    voluntary_exits: EmptyList<typenum::U16>,
    sync_aggregate: SyncAggregate,
    execution_payload: ExecutionPayloadBellatrix,
}

#[derive(Default, TreeHash)]
struct BodyCapella {
    randao_reveal: BlsSignature,
    eth1_data: Eth1Data,
    graffiti: B256,
    proposer_slashings: EmptyList<typenum::U16>,
    attester_slashings: EmptyList<typenum::U2>,
    attestations: EmptyList<typenum::U128>,
    deposits: EmptyList<typenum::U16>,
    voluntary_exits: EmptyList<typenum::U16>,
    sync_aggregate: SyncAggregate,
    execution_payload: ExecutionPayloadCapella,
    bls_to_execution_changes: EmptyList<typenum::U16>,
}

#[derive(Default, TreeHash)]
struct BodyDeneb {
    randao_reveal: BlsSignature,
    eth1_data: Eth1Data,
    graffiti: B256,
    proposer_slashings: EmptyList<typenum::U16>,
    attester_slashings: EmptyList<typenum::U2>,
    attestations: EmptyList<typenum::U128>,
    deposits: EmptyList<typenum::U16>,
    voluntary_exits: EmptyList<typenum::U16>,
    sync_aggregate: SyncAggregate,
    execution_payload: ExecutionPayloadDeneb,
    bls_to_execution_changes: EmptyList<typenum::U16>,
    blob_kzg_commitments: EmptyList<typenum::U4096>,
}

/// Root of the default block body of `fork`.
pub fn empty_body_root(fork: ForkName) -> Root {
    match fork {
        ForkName::Phase0 => BodyPhase0::default().tree_hash_root(),
        ForkName::Altair => BodyAltair::default().tree_hash_root(),
        ForkName::Bellatrix => BodyBellatrix::default().tree_hash_root(),
        ForkName::Capella => BodyCapella::default().tree_hash_root(),
        ForkName::Deneb => BodyDeneb::default().tree_hash_root(),
    }
}

/// Root of the deposit tree before any deposit.
pub fn empty_deposit_root() -> Root {
    VariableList::<Root, typenum::U4294967296>::empty().tree_hash_root()
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Swap-or-not shuffle of a single index.
pub fn compute_shuffled_index(mut index: u64, index_count: u64, seed: &[u8; 32]) -> u64 {
    for round in 0..SHUFFLE_ROUND_COUNT {
        let pivot_hash = hash(&[seed, &[round]]);
        let mut pivot_bytes = [0u8; 8];
        pivot_bytes.copy_from_slice(&pivot_hash[..8]);
        let pivot = u64::from_le_bytes(pivot_bytes) % index_count;
        let flip = (pivot + index_count - index) % index_count;
        let position = index.max(flip);
        let source = hash(&[seed, &[round], &((position / 256) as u32).to_le_bytes()]);
        let byte = source[((position % 256) / 8) as usize];
        if (byte >> (position % 8)) & 1 == 1 {
            index = flip;
        }
    }
    index
}

/// Sync committee seed at `epoch`, where `mix` is the RANDAO mix of that epoch.
pub fn sync_committee_seed(epoch: Epoch, mix: &B256) -> [u8; 32] {
    hash(&[&DOMAIN_SYNC_COMMITTEE, &epoch.to_le_bytes(), mix.as_slice()])
}

/// Balance-weighted sampling of `size` members from `active`.
pub fn compute_sync_committee_indices(
    validators: &[Validator],
    active: &[ValidatorIndex],
    seed: &[u8; 32],
    size: u64,
    max_effective_balance: Gwei,
) -> eyre::Result<Vec<ValidatorIndex>> {
    let count = active.len() as u64;
    if count == 0 {
        return Err(HarnessError::InsufficientValidators { required: 1, available: 0 }.into());
    }
    let mut indices = Vec::with_capacity(size as usize);
    let mut i = 0u64;
    while (indices.len() as u64) < size {
        let shuffled = compute_shuffled_index(i % count, count, seed);
        let candidate = active[shuffled as usize];
        let random_byte = u64::from(hash(&[seed, &(i / 32).to_le_bytes()])[(i % 32) as usize]);
        let effective = validators
            .get(candidate as usize)
            .map(|v| v.effective_balance)
            .ok_or(HarnessError::UnknownValidatorIndex(candidate))?;
        if effective * MAX_RANDOM_BYTE >= max_effective_balance * random_byte {
            indices.push(candidate);
        }
        i += 1;
    }
    Ok(indices)
}

fn genesis_sync_committee(
    spec: &BeaconSpec,
    validators: &[Validator],
    pubkeys: &[[u8; 48]],
    mix: &B256,
) -> eyre::Result<SyncCommittee> {
    let active: Vec<ValidatorIndex> = validators
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_active_at(GENESIS_EPOCH))
        .map(|(i, _)| i as ValidatorIndex)
        .collect();
    let seed = sync_committee_seed(GENESIS_EPOCH, mix);
    let indices = compute_sync_committee_indices(
        validators,
        &active,
        &seed,
        spec.sync_committee_size,
        spec.max_effective_balance,
    )?;
    let members: Vec<[u8; 48]> = indices.iter().map(|i| pubkeys[*i as usize]).collect();
    let aggregate = bls::aggregate_pubkeys(&members)?;
    Ok(SyncCommittee {
        pubkeys: FixedVector::new(members.iter().map(bls_pubkey).collect())
            .map_err(|e| eyre!("sync committee size: {e:?}"))?,
        aggregate_pubkey: bls_pubkey(&aggregate),
    })
}

fn genesis_validators(spec: &BeaconSpec, keys: &[ValidatorKey]) -> eyre::Result<(Vec<Validator>, Vec<Gwei>)> {
    let mut validators = Vec::with_capacity(keys.len());
    let mut balances = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        let balance = spec
            .max_effective_balance
            .checked_add(key.extra_initial_balance)
            .ok_or_else(|| HarnessError::Overflow(format!("initial balance of validator {i}")))?;
        let effective_balance = (balance - balance % spec.effective_balance_increment)
            .min(spec.max_effective_balance);
        let mut validator = Validator {
            pubkey: bls_pubkey(&key.validator_pubkey),
            withdrawal_credentials: key.withdrawal_credentials(),
            effective_balance,
            slashed: false,
            activation_eligibility_epoch: FAR_FUTURE_EPOCH,
            activation_epoch: FAR_FUTURE_EPOCH,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
        };
        if effective_balance == spec.max_effective_balance {
            validator.activation_eligibility_epoch = GENESIS_EPOCH;
            validator.activation_epoch = GENESIS_EPOCH;
        }
        if key.exited || key.slashed {
            validator.exit_epoch = GENESIS_EPOCH;
            validator.withdrawable_epoch =
                GENESIS_EPOCH + spec.min_validator_withdrawability_delay;
            validator.slashed = key.slashed;
        }
        validators.push(validator);
        balances.push(balance);
    }
    Ok((validators, balances))
}

type PayloadFields = (FixedVector<u8, typenum::U256>, VariableList<u8, typenum::U32>);

fn payload_fields(header: &Header) -> eyre::Result<PayloadFields> {
    if header.extra_data.len() > MAX_EXTRA_DATA_BYTES {
        return Err(HarnessError::config(format!(
            "extra data is {} bytes, max is {MAX_EXTRA_DATA_BYTES}",
            header.extra_data.len()
        ))
        .into());
    }
    let bloom = FixedVector::new(header.logs_bloom.to_vec())
        .map_err(|e| eyre!("logs bloom: {e:?}"))?;
    let extra = VariableList::new(header.extra_data.to_vec())
        .map_err(|e| eyre!("extra data: {e:?}"))?;
    Ok((bloom, extra))
}

fn empty_transactions_root() -> Root {
    VariableList::<Root, typenum::U1048576>::empty().tree_hash_root()
}

fn empty_withdrawals_root() -> Root {
    VariableList::<Root, typenum::U16>::empty().tree_hash_root()
}

/// Payload header embedding the EL genesis block.
pub fn genesis_payload_header_bellatrix(
    header: &Header,
    hash: B256,
) -> eyre::Result<ExecutionPayloadHeaderBellatrix> {
    let (logs_bloom, extra_data) = payload_fields(header)?;
    Ok(ExecutionPayloadHeaderBellatrix {
        parent_hash: header.parent_hash,
        fee_recipient: header.beneficiary,
        state_root: header.state_root,
        receipts_root: header.receipts_root,
        logs_bloom,
        prev_randao: B256::ZERO,
        block_number: header.number,
        gas_limit: header.gas_limit,
        gas_used: header.gas_used,
        timestamp: header.timestamp,
        extra_data,
        base_fee_per_gas: U256::from(header.base_fee_per_gas.unwrap_or_default()),
        block_hash: hash,
        transactions_root: empty_transactions_root(),
    })
}

fn genesis_payload_header_capella(
    header: &Header,
    hash: B256,
) -> eyre::Result<ExecutionPayloadHeaderCapella> {
    let h = genesis_payload_header_bellatrix(header, hash)?;
    Ok(ExecutionPayloadHeaderCapella {
        parent_hash: h.parent_hash,
        fee_recipient: h.fee_recipient,
        state_root: h.state_root,
        receipts_root: h.receipts_root,
        logs_bloom: h.logs_bloom,
        prev_randao: h.prev_randao,
        block_number: h.block_number,
        gas_limit: h.gas_limit,
        gas_used: h.gas_used,
        timestamp: h.timestamp,
        extra_data: h.extra_data,
        base_fee_per_gas: h.base_fee_per_gas,
        block_hash: h.block_hash,
        transactions_root: h.transactions_root,
        withdrawals_root: empty_withdrawals_root(),
    })
}

fn genesis_payload_header_deneb(
    header: &Header,
    hash: B256,
) -> eyre::Result<ExecutionPayloadHeaderDeneb> {
    let h = genesis_payload_header_capella(header, hash)?;
    Ok(ExecutionPayloadHeaderDeneb {
        parent_hash: h.parent_hash,
        fee_recipient: h.fee_recipient,
        state_root: h.state_root,
        receipts_root: h.receipts_root,
        logs_bloom: h.logs_bloom,
        prev_randao: h.prev_randao,
        block_number: h.block_number,
        gas_limit: h.gas_limit,
        gas_used: h.gas_used,
        timestamp: h.timestamp,
        extra_data: h.extra_data,
        base_fee_per_gas: h.base_fee_per_gas,
        block_hash: h.block_hash,
        transactions_root: h.transactions_root,
        withdrawals_root: h.withdrawals_root,
        blob_gas_used: header.blob_gas_used.unwrap_or_default(),
        excess_blob_gas: header.excess_blob_gas.unwrap_or_default(),
    })
}

fn fixed<T: Clone + Default, N: typenum::Unsigned>(value: T) -> FixedVector<T, N> {
    FixedVector::from_elem(value)
}

fn list<T, N: typenum::Unsigned>(items: Vec<T>) -> eyre::Result<VariableList<T, N>> {
    VariableList::new(items).map_err(|e| eyre!("list bound exceeded: {e:?}"))
}

/// Builds the genesis state of a testnet whose validators are all pre-deposited.
///
/// The deposit contract is an empty tree, the RANDAO is seeded with the EL genesis
/// hash and, from Bellatrix on, the EL genesis block is embedded as the latest payload
/// header when it is already past the terminal total difficulty.
pub fn build_beacon_state(
    spec: &BeaconSpec,
    el: &ExecutionGenesis,
    genesis_time: u64,
    keys: &[ValidatorKey],
) -> eyre::Result<BeaconState> {
    if (keys.len() as u64) < spec.min_genesis_active_validator_count {
        return Err(HarnessError::InsufficientValidators {
            required: spec.min_genesis_active_validator_count,
            available: keys.len() as u64,
        }
        .into());
    }

    let fork_name = spec.fork_name_at_epoch(GENESIS_EPOCH);
    let fork = Fork {
        previous_version: spec.fork_version(fork_name.previous().unwrap_or(ForkName::Phase0)),
        current_version: spec.fork_version(fork_name),
        epoch: GENESIS_EPOCH,
    };
    let eth1_data =
        Eth1Data { deposit_root: empty_deposit_root(), deposit_count: 0, block_hash: el.hash };
    let latest_block_header =
        BeaconBlockHeader { body_root: empty_body_root(fork_name), ..Default::default() };

    let (validators, balances) = genesis_validators(spec, keys)?;
    let mut slashings = FixedVector::<Gwei, EpochsPerSlashingsVector>::from_elem(0);
    let slot = (GENESIS_EPOCH % EpochsPerSlashingsVector::to_u64()) as usize;
    for (validator, key) in validators.iter().zip(keys) {
        if key.slashed {
            slashings[slot] = slashings[slot]
                .checked_add(validator.effective_balance)
                .ok_or_else(|| HarnessError::Overflow("genesis slashings".into()))?;
        }
    }
    let validators_list = list(validators.clone())?;
    let genesis_validators_root = validators_list.tree_hash_root();
    let n = validators.len();

    let embed_payload = el.is_post_merge();
    debug!(
        fork = %fork_name.as_str(),
        validators = n,
        %genesis_validators_root,
        embed_payload,
        "Building beacon genesis state"
    );

    let phase0 = BeaconStatePhase0 {
        genesis_time,
        genesis_validators_root,
        slot: 0,
        fork: fork.clone(),
        latest_block_header,
        block_roots: fixed(Root::ZERO),
        state_roots: fixed(Root::ZERO),
        historical_roots: VariableList::empty(),
        eth1_data,
        eth1_data_votes: VariableList::empty(),
        eth1_deposit_index: 0,
        validators: validators_list,
        balances: list(balances)?,
        randao_mixes: fixed(el.hash),
        slashings,
        previous_epoch_attestations: VariableList::empty(),
        current_epoch_attestations: VariableList::empty(),
        justification_bits: Default::default(),
        previous_justified_checkpoint: Default::default(),
        current_justified_checkpoint: Default::default(),
        finalized_checkpoint: Default::default(),
    };
    if fork_name == ForkName::Phase0 {
        return Ok(BeaconState::Phase0(phase0));
    }

    let pubkeys: Vec<[u8; 48]> = keys.iter().map(|k| k.validator_pubkey).collect();
    let sync_committee = genesis_sync_committee(spec, &validators, &pubkeys, &el.hash)?;
    let altair = BeaconStateAltair {
        genesis_time,
        genesis_validators_root,
        slot: 0,
        fork: fork.clone(),
        latest_block_header: phase0.latest_block_header,
        block_roots: phase0.block_roots,
        state_roots: phase0.state_roots,
        historical_roots: phase0.historical_roots,
        eth1_data: phase0.eth1_data,
        eth1_data_votes: phase0.eth1_data_votes,
        eth1_deposit_index: 0,
        validators: phase0.validators,
        balances: phase0.balances,
        randao_mixes: phase0.randao_mixes,
        slashings: phase0.slashings,
        previous_epoch_participation: list(vec![0; n])?,
        current_epoch_participation: list(vec![0; n])?,
        justification_bits: phase0.justification_bits,
        previous_justified_checkpoint: Default::default(),
        current_justified_checkpoint: Default::default(),
        finalized_checkpoint: Default::default(),
        inactivity_scores: list(vec![0; n])?,
        current_sync_committee: sync_committee.clone(),
        next_sync_committee: sync_committee,
    };

    let header = &el.header;
    Ok(match fork_name {
        ForkName::Phase0 | ForkName::Altair => BeaconState::Altair(altair),
        ForkName::Bellatrix => {
            let latest_execution_payload_header = if embed_payload {
                genesis_payload_header_bellatrix(header, el.hash)?
            } else {
                Default::default()
            };
            BeaconState::Bellatrix(BeaconStateBellatrix {
                genesis_time,
                genesis_validators_root,
                slot: 0,
                fork,
                latest_block_header: altair.latest_block_header,
                block_roots: altair.block_roots,
                state_roots: altair.state_roots,
                historical_roots: altair.historical_roots,
                eth1_data: altair.eth1_data,
                eth1_data_votes: altair.eth1_data_votes,
                eth1_deposit_index: 0,
                validators: altair.validators,
                balances: altair.balances,
                randao_mixes: altair.randao_mixes,
                slashings: altair.slashings,
                previous_epoch_participation: altair.previous_epoch_participation,
                current_epoch_participation: altair.current_epoch_participation,
                justification_bits: altair.justification_bits,
                previous_justified_checkpoint: Default::default(),
                current_justified_checkpoint: Default::default(),
                finalized_checkpoint: Default::default(),
                inactivity_scores: altair.inactivity_scores,
                current_sync_committee: altair.current_sync_committee,
                next_sync_committee: altair.next_sync_committee,
                latest_execution_payload_header,
            })
        }
        ForkName::Capella => {
            let latest_execution_payload_header = if embed_payload {
                genesis_payload_header_capella(header, el.hash)?
            } else {
                Default::default()
            };
            BeaconState::Capella(BeaconStateCapella {
                genesis_time,
                genesis_validators_root,
                slot: 0,
                fork,
                latest_block_header: altair.latest_block_header,
                block_roots: altair.block_roots,
                state_roots: altair.state_roots,
                historical_roots: altair.historical_roots,
                eth1_data: altair.eth1_data,
                eth1_data_votes: altair.eth1_data_votes,
                eth1_deposit_index: 0,
                validators: altair.validators,
                balances: altair.balances,
                randao_mixes: altair.randao_mixes,
                slashings: altair.slashings,
                previous_epoch_participation: altair.previous_epoch_participation,
                current_epoch_participation: altair.current_epoch_participation,
                justification_bits: altair.justification_bits,
                previous_justified_checkpoint: Default::default(),
                current_justified_checkpoint: Default::default(),
                finalized_checkpoint: Default::default(),
                inactivity_scores: altair.inactivity_scores,
                current_sync_committee: altair.current_sync_committee,
                next_sync_committee: altair.next_sync_committee,
                latest_execution_payload_header,
                next_withdrawal_index: 0,
                next_withdrawal_validator_index: 0,
                historical_summaries: VariableList::empty(),
            })
        }
        ForkName::Deneb => {
            let latest_execution_payload_header = if embed_payload {
                genesis_payload_header_deneb(header, el.hash)?
            } else {
                Default::default()
            };
            BeaconState::Deneb(BeaconStateDeneb {
                genesis_time,
                genesis_validators_root,
                slot: 0,
                fork,
                latest_block_header: altair.latest_block_header,
                block_roots: altair.block_roots,
                state_roots: altair.state_roots,
                historical_roots: altair.historical_roots,
                eth1_data: altair.eth1_data,
                eth1_data_votes: altair.eth1_data_votes,
                eth1_deposit_index: 0,
                validators: altair.validators,
                balances: altair.balances,
                randao_mixes: altair.randao_mixes,
                slashings: altair.slashings,
                previous_epoch_participation: altair.previous_epoch_participation,
                current_epoch_participation: altair.current_epoch_participation,
                justification_bits: altair.justification_bits,
                previous_justified_checkpoint: Default::default(),
                current_justified_checkpoint: Default::default(),
                finalized_checkpoint: Default::default(),
                inactivity_scores: altair.inactivity_scores,
                current_sync_committee: altair.current_sync_committee,
                next_sync_committee: altair.next_sync_committee,
                latest_execution_payload_header,
                next_withdrawal_index: 0,
                next_withdrawal_validator_index: 0,
                historical_summaries: VariableList::empty(),
            })
        }
    })
}

/// Inputs of the testnet beacon spec beyond the fork schedule.
#[derive(Clone, Debug, Default)]
pub struct SpecOverrides {
    pub validator_count: u64,
    pub slot_time: Option<u64>,
    pub safe_slots_to_import_optimistically: Option<u64>,
}

/// Mainnet spec specialised for a short-lived local testnet.
pub fn build_spec(
    forks: &hivenet_types::ForkConfig,
    el: &ExecutionGenesis,
    overrides: &SpecOverrides,
) -> BeaconSpec {
    let mut spec = BeaconSpec::mainnet();
    spec.config_name = "hive".into();
    spec.apply_fork_config(forks);
    spec.deposit_chain_id = el.chain_id();
    spec.deposit_network_id = el.network_id();
    spec.deposit_contract_address = el.deposit_address;
    spec.eth1_follow_distance = 1;
    spec.min_genesis_active_validator_count = overrides.validator_count;
    if let Some(slot_time) = overrides.slot_time {
        spec.seconds_per_slot = slot_time;
    }
    if let Some(safe_slots) = overrides.safe_slots_to_import_optimistically {
        spec.safe_slots_to_import_optimistically = safe_slots;
    }
    spec.terminal_total_difficulty = el.terminal_total_difficulty();
    if el.is_post_merge() {
        spec.terminal_block_hash = el.hash;
        spec.terminal_block_hash_activation_epoch = GENESIS_EPOCH;
    }
    spec.shard_committee_period = 0;
    spec.churn_limit_quotient = 2;
    spec.min_validator_withdrawability_delay = 0;
    spec.proposer_score_boost = 40;
    spec
}

/// Files and parameters every beacon and validator client starts from.
pub fn consensus_bundle(
    spec: &BeaconSpec,
    state: &BeaconState,
    el: &ExecutionGenesis,
) -> eyre::Result<StartBundle> {
    let mut bundle = StartBundle::new()
        .param("HIVE_ETH2_ETH1_GENESIS_HASH", el.hash)
        .file(CONFIG_PATH, spec.config_yaml()?.into_bytes())
        .file(GENESIS_STATE_PATH, state.to_ssz_bytes());
    for fork in ForkName::ALL {
        bundle = bundle.file(
            format!("/hive/input/preset_{}.yaml", fork.as_str()),
            spec.preset_yaml(fork)?.into_bytes(),
        );
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hivenet_types::{ForkConfig, constants::MAX_EFFECTIVE_BALANCE};

    use super::*;
    use crate::{
        execution::{ExecutionConsensus, build_chain_config, build_execution_genesis},
        keys::{DEFAULT_VALIDATOR_MNEMONIC, derive_validator_keys},
    };

    const GENESIS_TIME: u64 = 1_700_000_000;

    fn el(forks: &ForkConfig, ttd: u64) -> ExecutionGenesis {
        let config = build_chain_config(U256::from(ttd), GENESIS_TIME, 32, 12, forks).unwrap();
        build_execution_genesis(
            GENESIS_TIME,
            ExecutionConsensus::PostMergeGenesis,
            config,
            BTreeMap::new(),
            None,
        )
        .unwrap()
    }

    fn keys(n: u64) -> Vec<ValidatorKey> {
        bls::init().unwrap();
        derive_validator_keys(DEFAULT_VALIDATOR_MNEMONIC, 0, n).unwrap()
    }

    #[test]
    fn shuffled_index_is_a_permutation() {
        let seed = [7u8; 32];
        let mut seen: Vec<u64> = (0..50).map(|i| compute_shuffled_index(i, 50, &seed)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn empty_roots_differ_per_fork() {
        let roots: Vec<Root> = ForkName::ALL.into_iter().map(empty_body_root).collect();
        for (i, a) in roots.iter().enumerate() {
            for b in &roots[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(
            empty_deposit_root(),
            "0xd70a234731285c6804c2a4f56711ddb8c82c99740f207854891028af34e27e5e".parse::<B256>().unwrap()
        );
    }

    #[test]
    fn capella_genesis_state_embeds_payload() {
        let forks = ForkConfig::at_genesis(ForkName::Capella);
        let el = el(&forks, 0);
        let mut keys = keys(4);
        keys[2].exited = true;
        keys[3].slashed = true;
        keys[1].extra_initial_balance = 5;
        let spec = build_spec(&forks, &el, &SpecOverrides { validator_count: 4, ..Default::default() });
        let state = build_beacon_state(&spec, &el, GENESIS_TIME + 30, &keys).unwrap();

        assert_eq!(state.fork_name(), ForkName::Capella);
        assert_eq!(state.latest_execution_payload_header_hash(), Some(el.hash));
        assert_eq!(state.genesis_time(), GENESIS_TIME + 30);
        assert_eq!(state.balance(1), Some(MAX_EFFECTIVE_BALANCE + 5));
        let validators = state.validators();
        assert_eq!(validators[0].activation_epoch, 0);
        assert_eq!(validators[2].exit_epoch, 0);
        assert!(validators[3].slashed);
        assert_eq!(state.slashings()[0], MAX_EFFECTIVE_BALANCE);
        assert_eq!(state.randao_mixes()[0], el.hash);
        assert_eq!(state.previous_version(), spec.bellatrix_fork_version);

        let decoded =
            BeaconState::from_ssz_bytes_by_fork(&state.to_ssz_bytes(), ForkName::Capella).unwrap();
        assert_eq!(decoded.root(), state.root());
    }

    #[test]
    fn oversized_initial_balance_overflows() {
        let forks = ForkConfig::at_genesis(ForkName::Capella);
        let el = el(&forks, 0);
        let mut keys = keys(2);
        keys[1].extra_initial_balance = u64::MAX;
        let spec = build_spec(&forks, &el, &SpecOverrides { validator_count: 2, ..Default::default() });
        let err = build_beacon_state(&spec, &el, GENESIS_TIME, &keys).unwrap_err();
        assert!(matches!(err.downcast_ref::<HarnessError>(), Some(HarnessError::Overflow(_))));
        assert!(err.to_string().contains("validator 1"), "{err}");
    }

    #[test]
    fn slashings_vector_follows_preset_length() {
        let forks = ForkConfig::at_genesis(ForkName::Capella);
        let el = el(&forks, 0);
        let mut keys = keys(2);
        keys[0].slashed = true;
        keys[1].slashed = true;
        let spec = build_spec(&forks, &el, &SpecOverrides { validator_count: 2, ..Default::default() });
        let state = build_beacon_state(&spec, &el, GENESIS_TIME, &keys).unwrap();
        assert_eq!(state.slashings().len(), EpochsPerSlashingsVector::to_usize());
        assert_eq!(state.slashings()[0], 2 * MAX_EFFECTIVE_BALANCE);
        assert!(state.slashings()[1..].iter().all(|s| *s == 0));
    }

    #[test]
    fn pre_merge_bellatrix_state_has_default_payload_header() {
        let forks = ForkConfig::at_genesis(ForkName::Bellatrix);
        let el = el(&forks, 100);
        let spec = build_spec(&forks, &el, &SpecOverrides { validator_count: 2, ..Default::default() });
        let state = build_beacon_state(&spec, &el, GENESIS_TIME, &keys(2)).unwrap();
        assert_eq!(state.latest_execution_payload_header_hash(), Some(B256::ZERO));
        assert_eq!(spec.terminal_block_hash, B256::ZERO);
    }

    #[test]
    fn too_few_keys_is_rejected() {
        let forks = ForkConfig::at_genesis(ForkName::Altair);
        let el = el(&forks, 0);
        let spec = build_spec(&forks, &el, &SpecOverrides { validator_count: 3, ..Default::default() });
        let err = build_beacon_state(&spec, &el, GENESIS_TIME, &keys(2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::InsufficientValidators { required: 3, available: 2 })
        ));
    }

    #[test]
    fn bundle_carries_config_presets_and_state() {
        let forks = ForkConfig::at_genesis(ForkName::Altair);
        let el = el(&forks, 0);
        let spec = build_spec(&forks, &el, &SpecOverrides { validator_count: 1, slot_time: Some(6), ..Default::default() });
        let state = build_beacon_state(&spec, &el, GENESIS_TIME, &keys(1)).unwrap();
        let bundle = consensus_bundle(&spec, &state, &el).unwrap();
        assert!(bundle.files.contains_key(CONFIG_PATH));
        assert!(bundle.files.contains_key("/hive/input/preset_deneb.yaml"));
        assert_eq!(bundle.params["HIVE_ETH2_ETH1_GENESIS_HASH"], el.hash.to_string());
        assert_eq!(spec.seconds_per_slot, 6);
    }
}

use std::collections::BTreeMap;

use alloy_eips::eip4895::Withdrawal;
use alloy_primitives::{Address, B256, U256};
use alloy_rpc_types::Header;
use alloy_rpc_types_engine::{BlobsBundleV1, ExecutionPayload, ForkchoiceState, PayloadAttributes, PayloadId};

use crate::history::ExecutedPayloadHistory;

/// Everything the mocker knows about the chain it is driving.
///
/// Callbacks receive it mutably, so a test can inspect the payload in flight
/// or stage the next withdrawals and fee recipient.
#[derive(Clone, Debug, Default)]
pub struct ClMockerState {
    pub ttd_reached: bool,
    /// Number of the first block produced by the mocker.
    pub first_pos_block_number: Option<u64>,

    pub latest_header: Option<Header>,
    pub latest_head_number: u64,
    pub latest_forkchoice: ForkchoiceState,

    pub latest_payload_attributes: Option<PayloadAttributes>,
    pub latest_payload_built: Option<ExecutionPayload>,
    pub latest_block_value: Option<U256>,
    pub latest_blobs_bundle: Option<BlobsBundleV1>,
    pub latest_should_override_builder: Option<bool>,
    pub latest_versioned_hashes: Option<Vec<B256>>,
    pub latest_parent_beacon_root: Option<B256>,
    pub latest_executed_payload: Option<ExecutionPayload>,

    pub prev_randao_history: BTreeMap<u64, B256>,
    pub executed_payload_history: ExecutedPayloadHistory,
    pub head_hash_history: Vec<B256>,
    pub header_history: BTreeMap<u64, Header>,

    /// Withdrawals for the next payload; generated when left empty.
    pub next_withdrawals: Option<Vec<Withdrawal>>,
    pub next_fee_recipient: Address,
    pub next_payload_id: Option<PayloadId>,
    /// Id of the client producing the block in flight.
    pub next_block_producer: Option<String>,
    pub current_payload_number: u64,
}

impl ClMockerState {
    pub fn latest_header_hash(&self) -> B256 {
        self.latest_header.as_ref().map(|h| h.hash).unwrap_or_default()
    }

    pub fn latest_timestamp(&self) -> u64 {
        self.latest_header.as_ref().map(|h| h.timestamp).unwrap_or_default()
    }

    /// Head, safe and finalized hashes after the latest head entered the history.
    pub fn forkchoice_from_history(&self, slots_to_safe: u64, slots_to_finalized: u64) -> ForkchoiceState {
        let back = |slots: u64| {
            let len = self.head_hash_history.len() as u64;
            if len > slots {
                self.head_hash_history[(len - slots - 1) as usize]
            } else {
                B256::ZERO
            }
        };
        ForkchoiceState {
            head_block_hash: self.head_hash_history.last().copied().unwrap_or_default(),
            safe_block_hash: back(slots_to_safe),
            finalized_block_hash: back(slots_to_finalized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forkchoice_trails_head_by_configured_slots() {
        let mut state = ClMockerState::default();
        let h = |n: u8| B256::repeat_byte(n);

        state.head_hash_history.push(h(1));
        let fc = state.forkchoice_from_history(1, 2);
        assert_eq!(fc.head_block_hash, h(1));
        assert!(fc.safe_block_hash.is_zero());
        assert!(fc.finalized_block_hash.is_zero());

        state.head_hash_history.extend([h(2), h(3)]);
        let fc = state.forkchoice_from_history(1, 2);
        assert_eq!(fc.head_block_hash, h(3));
        assert_eq!(fc.safe_block_hash, h(2));
        assert_eq!(fc.finalized_block_hash, h(1));

        assert_eq!(state.forkchoice_from_history(0, 0).safe_block_hash, h(3));
    }
}

use std::collections::BTreeMap;

use alloy_eips::eip4895::Withdrawal;
use alloy_primitives::Address;
use alloy_rpc_types_engine::ExecutionPayload;
use hivenet_types::payload::payload_withdrawals;

/// Withdrawals generated per block when a test does not supply its own.
pub const DEFAULT_WITHDRAWALS_PER_BLOCK: u64 = 10;

/// Payloads broadcast by the mocker, by block number.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutedPayloadHistory(BTreeMap<u64, ExecutionPayload>);

impl ExecutedPayloadHistory {
    pub fn insert(&mut self, payload: ExecutionPayload) {
        self.0.insert(payload.as_v1().block_number, payload);
    }

    pub fn get(&self, number: u64) -> Option<&ExecutionPayload> {
        self.0.get(&number)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &ExecutionPayload)> {
        self.0.iter()
    }

    pub fn latest_payload_number(&self) -> Option<u64> {
        self.0.keys().next_back().copied()
    }

    /// Highest withdrawal index included in any executed payload.
    pub fn latest_withdrawals_index(&self) -> u64 {
        self.0
            .values()
            .filter_map(payload_withdrawals)
            .flatten()
            .map(|w| w.index)
            .max()
            .unwrap_or_default()
    }
}

/// Withdrawals for the next payload, continuing the index sequence of `previous`.
///
/// Validator `i` withdraws 100 gwei to the address whose first byte is `i`.
pub fn make_next_withdrawals(previous: Option<&ExecutionPayload>) -> Vec<Withdrawal> {
    let start = previous
        .and_then(payload_withdrawals)
        .and_then(|ws| ws.iter().map(|w| w.index).max())
        .unwrap_or_default();
    (0..DEFAULT_WITHDRAWALS_PER_BLOCK)
        .map(|i| {
            let mut address = [0u8; 20];
            address[0] = i as u8;
            Withdrawal { index: start + i + 1, validator_index: i, address: Address::from(address), amount: 100 }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, Bloom, Bytes, U256};
    use alloy_rpc_types_engine::{ExecutionPayloadV1, ExecutionPayloadV2};

    use super::*;

    fn payload(number: u64, withdrawals: Vec<Withdrawal>) -> ExecutionPayload {
        ExecutionPayload::V2(ExecutionPayloadV2 {
            payload_inner: ExecutionPayloadV1 {
                parent_hash: B256::ZERO,
                fee_recipient: Address::ZERO,
                state_root: B256::ZERO,
                receipts_root: B256::ZERO,
                logs_bloom: Bloom::ZERO,
                prev_randao: B256::ZERO,
                block_number: number,
                gas_limit: 0,
                gas_used: 0,
                timestamp: number,
                extra_data: Bytes::new(),
                base_fee_per_gas: U256::ZERO,
                block_hash: B256::repeat_byte(number as u8),
                transactions: vec![],
            },
            withdrawals,
        })
    }

    #[test]
    fn withdrawals_continue_after_latest_index() {
        let first = make_next_withdrawals(None);
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].index, 1);
        assert_eq!(first[9].index, 10);
        assert_eq!(first[3].address[0], 3);
        assert_eq!(first[3].amount, 100);

        let next = make_next_withdrawals(Some(&payload(1, first)));
        assert_eq!(next[0].index, 11);
        assert_eq!(next[0].validator_index, 0);
    }

    #[test]
    fn history_tracks_latest_number_and_index() {
        let mut history = ExecutedPayloadHistory::default();
        assert_eq!(history.latest_payload_number(), None);
        history.insert(payload(2, make_next_withdrawals(None)));
        history.insert(payload(1, vec![]));
        assert_eq!(history.latest_payload_number(), Some(2));
        assert_eq!(history.latest_withdrawals_index(), 10);
        assert_eq!(history.get(1).unwrap().as_v1().block_number, 1);
    }
}

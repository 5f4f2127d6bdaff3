//! How well validators attested, read from the beacon state.

use color_eyre::eyre;
use hivenet_consensus::{BeaconClient, StateId};
use hivenet_types::{
    BeaconSpec,
    aliases::{Epoch, Gwei, Slot},
    beacon::Validator,
    constants::{BASE_REWARD_FACTOR, BASE_REWARDS_PER_EPOCH, MAX_PARTICIPATION_SCORE},
};

/// Mean participation flags of the epoch, normalised to `[0, 1]`.
pub fn calc_health(participation: &[u8]) -> f64 {
    if participation.is_empty() {
        return 0.0;
    }
    let sum: u64 = participation.iter().map(|p| u64::from(*p)).sum();
    let avg = sum as f64 / participation.len() as f64;
    avg / MAX_PARTICIPATION_SCORE as f64
}

/// Phase0 approximation: average balance gain over one epoch relative to the
/// base reward of a validator with the average balance.
pub fn legacy_calc_health(before: &[Gwei], after: &[Gwei]) -> f64 {
    if before.is_empty() || after.is_empty() {
        return 0.0;
    }
    let sum_before: u64 = before.iter().sum();
    let sum_after: u64 = after.iter().sum();
    let avg_before = sum_before / before.len() as u64;
    let avg_after = sum_after / after.len() as u64;
    let sqrt = sum_before.isqrt();
    if sqrt == 0 {
        return 0.0;
    }
    let base_reward = avg_before * BASE_REWARD_FACTOR / sqrt / BASE_REWARDS_PER_EPOCH;
    if base_reward == 0 {
        return 0.0;
    }
    (avg_after as f64 - avg_before as f64) / (base_reward * BASE_REWARDS_PER_EPOCH) as f64
}

fn is_active_for_rewards(v: &Validator, epoch: Epoch) -> bool {
    epoch >= v.activation_eligibility_epoch && epoch < v.exit_epoch && !v.slashed
}

/// Participation of the epoch `slot` is in, as seen by `bn`.
pub async fn health(bn: &BeaconClient, spec: &BeaconSpec, slot: Slot) -> eyre::Result<f64> {
    let state = bn.beacon_state_v2(StateId::Slot(slot)).await?;
    if let Some(participation) = state.current_epoch_participation() {
        return Ok(calc_health(participation));
    }

    let epoch = spec.slot_to_epoch(slot);
    let after_epoch = epoch.saturating_sub(1);
    let before_epoch = after_epoch.saturating_sub(1);
    let before = bn.beacon_state_v2(StateId::Slot(spec.epoch_start_slot(before_epoch))).await?;
    let after = bn.beacon_state_v2(StateId::Slot(spec.epoch_start_slot(after_epoch))).await?;

    let active: Vec<usize> = state
        .validators()
        .iter()
        .enumerate()
        .filter(|(_, v)| is_active_for_rewards(v, epoch))
        .map(|(i, _)| i)
        .collect();
    let pick = |balances: &[Gwei]| active.iter().filter_map(|i| balances.get(*i).copied()).collect::<Vec<_>>();
    Ok(legacy_calc_health(&pick(before.balances()), &pick(after.balances())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participation_is_normalised_by_max_score() {
        assert_eq!(calc_health(&[]), 0.0);
        assert_eq!(calc_health(&[7, 7, 7]), 1.0);
        assert!((calc_health(&[7, 0]) - 0.5).abs() < 1e-9);
        assert!((calc_health(&[3, 3]) - 3.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn legacy_health_compares_gain_to_base_reward() {
        let balance = 32_000_000_000u64;
        let before = vec![balance; 64];
        let sqrt = (balance * 64).isqrt();
        let base = balance * BASE_REWARD_FACTOR / sqrt / BASE_REWARDS_PER_EPOCH;

        let full: Vec<Gwei> = before.iter().map(|b| b + base * BASE_REWARDS_PER_EPOCH).collect();
        assert!((legacy_calc_health(&before, &full) - 1.0).abs() < 1e-9);

        let half: Vec<Gwei> = before.iter().map(|b| b + base * 2).collect();
        assert!((legacy_calc_health(&before, &half) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn legacy_health_is_negative_on_losses() {
        let before = vec![32_000_000_000u64; 4];
        let after = vec![31_999_000_000u64; 4];
        assert!(legacy_calc_health(&before, &after) < 0.0);
        assert_eq!(legacy_calc_health(&[], &after), 0.0);
        assert_eq!(legacy_calc_health(&[0, 0], &[0, 0]), 0.0);
    }
}

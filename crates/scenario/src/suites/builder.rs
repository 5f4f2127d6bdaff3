//! External mock builder serving every beacon node, optionally misbehaving.

use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_consensus::{BeaconClient, BlockId};
use hivenet_genesis::ValidatorKeys;
use hivenet_node::NodeDefinitions;
use hivenet_testnet::{BuilderConfig, Config};
use hivenet_types::{ForkName, aliases::Slot};
use tracing::info;

use super::base::BaseScenario;
use crate::scenario::{Scenario, ScenarioContext};

/// Extra data the builder stamps on every payload it builds.
pub const BUILDER_EXTRA_DATA: &str = "builder payload tst";
/// Missed slots tolerated when the CL can reject the bid before signing.
pub const MAX_MISSED_SLOTS_NO_CIRCUIT_BREAKER: u64 = 1;

#[derive(Clone, Debug)]
pub struct BuilderScenario {
    pub base: BaseScenario,
    /// Where the builders listen; node `i` uses `base_port + i`.
    pub host: IpAddr,
    pub error_on_header_request: bool,
    pub error_on_payload_reveal: bool,
    pub invalid_payload_version: bool,
    pub verify_missed_slots_count: bool,
    pub circuit_breaker_missed_slots: u64,
}

impl BuilderScenario {
    pub fn new(base: BaseScenario, host: IpAddr) -> Self {
        Self {
            base,
            host,
            error_on_header_request: false,
            error_on_payload_reveal: false,
            invalid_payload_version: false,
            verify_missed_slots_count: false,
            circuit_breaker_missed_slots: BuilderConfig::default().circuit_breaker_missed_slots,
        }
    }

    /// Whether builder payloads are expected in the canonical chain.
    pub fn builder_produces_valid_payload(&self) -> bool {
        !(self.error_on_header_request || self.error_on_payload_reveal || self.invalid_payload_version)
    }

    /// A failed reveal is only noticed after the block is signed, so the slot is lost.
    pub fn causes_missed_slot(&self) -> bool {
        self.error_on_payload_reveal
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            host: Some(self.host),
            error_on_header_request: self.error_on_header_request,
            error_on_payload_reveal: self.error_on_payload_reveal,
            invalid_payload_version: self.invalid_payload_version,
            extra_data: Some(BUILDER_EXTRA_DATA.to_string()),
            circuit_breaker_missed_slots: self.circuit_breaker_missed_slots,
            ..Default::default()
        }
    }

    fn max_missed_slots(&self) -> u64 {
        if self.causes_missed_slot() { self.circuit_breaker_missed_slots } else { MAX_MISSED_SLOTS_NO_CIRCUIT_BREAKER }
    }

    /// Post-Deneb canonical slots of `bn` whose payload carries the builder's extra data.
    async fn builder_blocks(&self, ctx: &ScenarioContext, bn: &BeaconClient) -> eyre::Result<Vec<Slot>> {
        let spec = ctx.testnet.spec();
        let first = spec.epoch_start_slot(spec.fork_epoch(ForkName::Deneb));
        let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?.slot();
        let mut slots = Vec::new();
        for slot in first.max(1)..=head {
            let Ok(block) = bn.block_v2(BlockId::Slot(slot)).await else {
                continue;
            };
            if block.execution_extra_data().is_some_and(|extra| extra.as_ref() == BUILDER_EXTRA_DATA.as_bytes()) {
                slots.push(slot);
            }
        }
        Ok(slots)
    }
}

#[async_trait]
impl Scenario for BuilderScenario {
    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.base.timeout
    }

    fn testnet_config(&self, clients: &NodeDefinitions) -> eyre::Result<Config> {
        let mut config = self.base.testnet_config(clients)?;
        config.enable_builders = true;
        config.builder = Some(self.builder_config());
        Ok(config)
    }

    fn validator_keys(&self, mnemonic: &str) -> eyre::Result<ValidatorKeys> {
        self.base.validator_keys(mnemonic)
    }

    async fn execute_pre_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.execute_pre_fork(ctx).await
    }

    /// Slots missed before the circuit breaker trips delay the fork by up to an epoch.
    async fn wait_for_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let spe = ctx.testnet.spec().slots_per_epoch;
        let mut slots = self.base.deneb_fork_epoch() * spe + 4;
        if self.causes_missed_slot() {
            slots += spe;
        }
        ctx.within_slots(slots, "deneb", ctx.testnet.wait_for_fork(&ctx.cancel, ForkName::Deneb)).await
    }

    async fn execute_post_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.execute_post_fork(ctx).await
    }

    async fn execute_post_fork_wait(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.execute_post_fork_wait(ctx).await
    }

    async fn verify(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.verify(ctx).await?;
        let testnet = &ctx.testnet;

        for node in testnet.nodes.verification().running().iter() {
            let Some(bn) = &node.beacon else {
                continue;
            };
            let slots = self.builder_blocks(ctx, bn).await?;
            match (self.builder_produces_valid_payload(), slots.first()) {
                (true, None) => {
                    return Err(eyre!(
                        "node {} ({}): no builder payload included in the canonical chain after deneb",
                        node.index,
                        node.client_names()
                    ));
                }
                (false, Some(slot)) => {
                    return Err(eyre!(
                        "node {} ({}): modified builder payload included in canonical chain at slot {slot}",
                        node.index,
                        node.client_names()
                    ));
                }
                _ => info!(node = node.index, builder_blocks = slots.len(), "Builder payloads as expected"),
            }
        }

        if self.verify_missed_slots_count {
            let bn = testnet
                .nodes
                .beacon_clients()
                .running()
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| eyre!("no running beacon node"))?;
            let counts = bn.filled_slots_count_per_epoch().await.wrap_err("unable to obtain slot count per epoch")?;
            for (epoch, filled) in &counts {
                info!(epoch, filled, "Filled slots");
            }
            let deneb_epoch = self.base.deneb_fork_epoch();
            let required = testnet.spec().slots_per_epoch.saturating_sub(self.max_missed_slots());
            let filled = counts.get(&deneb_epoch).copied().unwrap_or_default();
            if filled < required {
                return Err(eyre!("epoch {deneb_epoch} should have at least {required} filled slots, but has {filled}"));
            }
        }
        Ok(())
    }
}

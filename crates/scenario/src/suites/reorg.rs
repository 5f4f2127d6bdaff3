//! Partitioned chains joined by a late, non-validating node.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_consensus::{BeaconClient, BlockId};
use hivenet_genesis::ValidatorKeys;
use hivenet_node::NodeDefinitions;
use hivenet_testnet::{BlockTree, Config};
use hivenet_types::aliases::{Root, Slot};
use tracing::info;

use super::base::BaseScenario;
use crate::{
    reorg::ReorgSetup,
    scenario::{Scenario, ScenarioContext},
};

/// Epochs the joiner gets to sync and bridge the partitions.
const JOINER_SYNC_EPOCHS: u64 = 1;

#[derive(Debug)]
pub struct ReorgScenario {
    pub base: BaseScenario,
    pub setup: ReorgSetup,
    /// Tip of the heaviest partition when the joiner was started.
    heavy_tip: Mutex<Option<Root>>,
}

impl ReorgScenario {
    pub fn new(base: BaseScenario, setup: ReorgSetup) -> Self {
        Self { base, setup, heavy_tip: Mutex::default() }
    }

    /// Node representing the partition with the highest weight; ties go to the lower index.
    pub fn heavy_node(&self) -> usize {
        self.setup
            .chain_weights
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map(|(i, _)| i)
            .unwrap_or_default()
    }
}

/// Adds the chain of `bn` from its head back to a known block or `stop_slot`.
async fn collect_chain(tree: &mut BlockTree, bn: &BeaconClient, stop_slot: Slot) -> eyre::Result<Root> {
    let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
    let tip = head.root;
    let mut current = head;
    loop {
        let message = &current.header.message;
        let known = tree.contains(&message.parent_root);
        tree.insert(current.root, message.slot, message.parent_root);
        if known || message.slot <= stop_slot {
            return Ok(tip);
        }
        current = bn.block_header(BlockId::Root(message.parent_root)).await?;
    }
}

#[async_trait]
impl Scenario for ReorgScenario {
    fn name(&self) -> String {
        self.base.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.base.timeout
    }

    fn testnet_config(&self, clients: &NodeDefinitions) -> eyre::Result<Config> {
        let mut config = self.base.testnet_config(clients)?;
        config.node_definitions = Some(self.setup.apply(&config.node_definitions())?);
        Ok(config)
    }

    fn validator_keys(&self, mnemonic: &str) -> eyre::Result<ValidatorKeys> {
        self.base.validator_keys(mnemonic)
    }

    async fn execute_pre_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.execute_pre_fork(ctx).await
    }

    async fn wait_for_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.wait_for_fork(ctx).await
    }

    async fn execute_post_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.execute_post_fork(ctx).await
    }

    /// Lets the partitions grow apart, records their tips, then starts the joiner.
    async fn execute_post_fork_wait(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.execute_post_fork_wait(ctx).await?;
        let testnet = &ctx.testnet;

        let mut tree = BlockTree::new();
        let mut heavy_tip = None;
        for node in testnet.nodes.running().iter() {
            let Some(bn) = &node.beacon else {
                continue;
            };
            let tip = collect_chain(&mut tree, bn, 0).await?;
            if node.index == self.heavy_node() {
                heavy_tip = Some(tip);
            }
        }
        let heavy_tip = heavy_tip.ok_or_else(|| eyre!("node {} is not running", self.heavy_node()))?;
        let tips: Vec<String> = tree.heads().iter().map(|h| format!("{}@{}", h.root, h.slot)).collect();
        info!(?tips, heavy = %heavy_tip, "Partition tips before joining");
        if tips.len() < 2 {
            return Err(eyre!("partitions did not diverge: {} tip(s)", tips.len()));
        }
        *self.heavy_tip.lock().unwrap_or_else(PoisonError::into_inner) = Some(heavy_tip);

        ReorgSetup::start_joiner(testnet, &ctx.cancel).await?;
        testnet.wait_slots(&ctx.cancel, JOINER_SYNC_EPOCHS * testnet.spec().slots_per_epoch).await
    }

    /// Every node, joiner included, must have re-orged onto the heaviest partition.
    async fn verify(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        self.base.verify(ctx).await?;
        let heavy_tip = (*self.heavy_tip.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or_else(|| eyre!("heavy partition tip was not recorded"))?;
        for node in ctx.testnet.nodes.running().iter() {
            let Some(bn) = &node.beacon else {
                continue;
            };
            let header = bn
                .block_header(BlockId::Root(heavy_tip))
                .await
                .wrap_err_with(|| format!("node {} ({}) does not know the heavy tip", node.index, node.client_names()))?;
            if !header.canonical {
                return Err(eyre!(
                    "node {} ({}) did not re-org to the heavy chain {heavy_tip}",
                    node.index,
                    node.client_names()
                ));
            }
        }
        info!(tip = %heavy_tip, "Every node is on the heavy chain");
        Ok(())
    }
}

//! Deneb fork run with transaction and blob load, credential changes and exits.

use std::{collections::BTreeSet, time::Duration};

use alloy_genesis::GenesisAccount;
use alloy_primitives::{Address, Bytes, U256, address, bytes};
use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_consensus::{BlockId, StateId};
use hivenet_genesis::{
    TestAccount, ValidatorKeys,
    accounts::{TEST_ACCOUNT_COUNT, funded_allocs, test_accounts, vault_start_amount},
    derive_validator_keys,
    keys::WithdrawalCredentialType,
};
use hivenet_node::{NodeDefinition, NodeDefinitions};
use hivenet_testnet::{Config, Validators, VerificationSlot};
use hivenet_types::{
    ForkConfig, ForkName, HarnessError,
    aliases::{Gwei, ValidatorIndex},
    constants::{DOMAIN_BLS_TO_EXECUTION_CHANGE, DOMAIN_VOLUNTARY_EXIT},
};
use tracing::info;

use crate::{
    scenario::{Scenario, ScenarioContext},
    spammer::{BlobSpammer, TransactionSpammer},
    tx::TransactionType,
    verifier::engine_version_verifiers,
};

pub const DEFAULT_VALIDATOR_COUNT: u64 = 128;
pub const DEFAULT_NODE_COUNT: usize = 2;

/// Receives the spam; its code logs and stores so every call touches state.
pub const CODE_CONTRACT_ADDRESS: Address = address!("cccccccccccccccccccccccccccccccccccccccc");
pub const CODE_CONTRACT: Bytes = bytes!("328043558043600080a250");

const NON_WITHDRAWABLE_GROUP: &str = "non_withdrawable";
const TO_EXIT_GROUP: &str = "to_exit";

/// Slots granted past the fork's first slot for the fork to reach every head.
const FORK_GRACE_SLOTS: u64 = 4;
const FINALITY_TIMEOUT_EPOCHS: u64 = 5;
const BLOBS_TIMEOUT_EPOCHS: u64 = 1;
const OPERATIONS_TIMEOUT_EPOCHS: u64 = 2;

/// Execution address validator `index` withdraws to: its low byte followed by zeros.
pub fn withdrawal_address(index: ValidatorIndex) -> Address {
    let mut address = Address::ZERO;
    address.0[0] = index as u8;
    address
}

/// Generic Deneb scenario; most suites are a configuration of it.
///
/// Share fields select one in every `n` validators, `0` selecting none.
#[derive(Clone, Debug)]
pub struct BaseScenario {
    pub name: String,
    pub node_count: usize,
    /// Defaults to every node.
    pub validating_node_count: Option<usize>,
    pub validator_count: u64,
    pub deneb_genesis: bool,
    pub slot_time: Option<u64>,

    pub genesis_execution_withdrawal_credentials_shares: u64,
    pub genesis_exited_shares: u64,
    pub genesis_slashed_shares: u64,
    pub extra_gwei: Gwei,

    /// Exit the first of this many chunks of validators after the fork.
    pub exit_validators_share: usize,

    pub epochs_after_fork: u64,
    pub wait_for_blobs: bool,
    pub wait_for_finality: bool,
    pub timeout: Duration,
}

impl Default for BaseScenario {
    fn default() -> Self {
        Self {
            name: "test-deneb-fork".into(),
            node_count: DEFAULT_NODE_COUNT,
            validating_node_count: None,
            validator_count: DEFAULT_VALIDATOR_COUNT,
            deneb_genesis: false,
            slot_time: None,
            genesis_execution_withdrawal_credentials_shares: 0,
            genesis_exited_shares: 0,
            genesis_slashed_shares: 0,
            extra_gwei: 0,
            exit_validators_share: 0,
            epochs_after_fork: 1,
            wait_for_blobs: false,
            wait_for_finality: false,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl BaseScenario {
    pub fn validating_node_count(&self) -> usize {
        self.validating_node_count.unwrap_or(self.node_count)
    }

    pub fn deneb_fork_epoch(&self) -> u64 {
        if self.deneb_genesis { 0 } else { 1 }
    }

    pub fn fork_config(&self) -> ForkConfig {
        ForkConfig {
            altair_fork_epoch: Some(0),
            bellatrix_fork_epoch: Some(0),
            capella_fork_epoch: Some(0),
            deneb_fork_epoch: Some(self.deneb_fork_epoch()),
            ..Default::default()
        }
    }

    /// `node_count` nodes cycling over `clients`; the first
    /// `validating_node_count` of them validate.
    pub fn node_definitions(&self, clients: &NodeDefinitions) -> eyre::Result<NodeDefinitions> {
        if clients.is_empty() {
            return Err(HarnessError::config("no client combinations to run with").into());
        }
        let validating = self.validating_node_count();
        Ok(NodeDefinitions(
            (0..self.node_count)
                .map(|i| NodeDefinition {
                    validator_shares: u64::from(i < validating),
                    ..clients.0[i % clients.len()].clone()
                })
                .collect(),
        ))
    }

    fn spammer_accounts(&self) -> eyre::Result<(Vec<TestAccount>, Vec<TestAccount>)> {
        let mut normal = test_accounts(TEST_ACCOUNT_COUNT)?;
        let blobs = normal.split_off(normal.len() / 2);
        Ok((normal, blobs))
    }

    async fn send_bls_changes(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let testnet = &ctx.testnet;
        let validators = testnet.validators.non_withdrawable();
        ctx.set_group(NON_WITHDRAWABLE_GROUP, validators.clone());
        if validators.is_empty() {
            info!("No validators left on BLS credentials");
            return Ok(());
        }
        let beacons = testnet.nodes.beacon_clients().running();
        if beacons.is_empty() {
            return Err(eyre!("no running beacon node to submit credential changes to"));
        }
        let spec = testnet.spec();
        let domain = spec.compute_domain(
            DOMAIN_BLS_TO_EXECUTION_CHANGE,
            spec.genesis_fork_version,
            testnet.genesis_validators_root(),
        );
        info!(%domain, "Sending BLS to execution changes");
        let indexes = validators.indexes();
        for (i, index) in indexes.iter().enumerate() {
            let bn = &beacons.0[i % beacons.len()];
            validators
                .sign_send_bls_to_execution_change(*index, bn, withdrawal_address(*index), domain)
                .await
                .wrap_err_with(|| format!("unable to submit bls-to-execution change of validator {index}"))?;
        }
        info!(count = indexes.len(), "Sent bls-to-execution changes");
        Ok(())
    }

    async fn send_exits(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        if self.exit_validators_share == 0 {
            return Ok(());
        }
        let testnet = &ctx.testnet;
        let Some(validators) = testnet.validators.chunks(self.exit_validators_share).into_iter().next() else {
            return Ok(());
        };
        ctx.set_group(TO_EXIT_GROUP, validators.clone());
        if validators.is_empty() {
            info!("No validators to exit");
            return Ok(());
        }
        let beacons = testnet.nodes.beacon_clients().running();
        if beacons.is_empty() {
            return Err(eyre!("no running beacon node to submit exits to"));
        }
        let spec = testnet.spec();
        let domain = spec.compute_domain(
            DOMAIN_VOLUNTARY_EXIT,
            spec.fork_version(ForkName::Capella),
            testnet.genesis_validators_root(),
        );
        let epoch = spec.slot_to_epoch(testnet.current_slot());
        for (i, index) in validators.indexes().iter().enumerate() {
            let bn = &beacons.0[i % beacons.len()];
            validators
                .sign_send_voluntary_exit(*index, bn, epoch, domain)
                .await
                .wrap_err_with(|| format!("unable to submit exit of validator {index}"))?;
        }
        info!(count = validators.count(), epoch, "Sent voluntary exits");
        Ok(())
    }

    /// Polls until every validating node proposed a block carrying blobs.
    async fn wait_for_blob_proposers(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let testnet = &ctx.testnet;
        let required: BTreeSet<usize> = testnet
            .nodes
            .validator_clients()
            .iter()
            .enumerate()
            .filter(|(_, vc)| !vc.keys().is_empty())
            .map(|(i, _)| i)
            .collect();
        let mut seen = BTreeSet::new();
        ctx.within_epochs(BLOBS_TIMEOUT_EPOCHS, "blobs from every proposer", async {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                    _ = tokio::time::sleep(testnet.slot_duration()) => {}
                }
                let blobs = testnet.verify_blobs(VerificationSlot::LatestSlotByHead).await?;
                if blobs > 0 {
                    let proposer = testnet.proposer(VerificationSlot::LatestSlotByHead).await?;
                    info!(proposer, blobs, "Blobs included in the chain");
                    seen.insert(proposer);
                }
                if required.is_subset(&seen) {
                    info!("All clients have produced a block with blobs");
                    return Ok(());
                }
            }
        })
        .await
    }

    /// Polls the head state until `done` holds for the validators of `group`.
    async fn wait_for_group(
        &self,
        ctx: &ScenarioContext,
        group: &str,
        what: &str,
        done: impl Fn(&Validators) -> usize,
    ) -> eyre::Result<()> {
        let Some(validators) = ctx.group(group) else {
            return Ok(());
        };
        if validators.is_empty() {
            return Ok(());
        }
        let testnet = &ctx.testnet;
        let beacons = testnet.nodes.beacon_clients().running();
        let bn = beacons.iter().next().ok_or_else(|| eyre!("no running beacon node"))?;
        ctx.within_epochs(OPERATIONS_TIMEOUT_EPOCHS, what, async {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                    _ = tokio::time::sleep(testnet.slot_duration()) => {}
                }
                let state = bn.beacon_state_v2(StateId::Head).await.wrap_err("error getting beacon state")?;
                validators.update_from_beacon_state(&state)?;
                let pending = done(&validators);
                if pending == 0 {
                    info!(group, "All validators done: {what}");
                    return Ok(());
                }
                info!(group, pending, "Validators pending: {what}");
            }
        })
        .await
    }
}

#[async_trait]
impl Scenario for BaseScenario {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn testnet_config(&self, clients: &NodeDefinitions) -> eyre::Result<Config> {
        let mut accounts = funded_allocs(&test_accounts(TEST_ACCOUNT_COUNT)?, vault_start_amount());
        accounts.insert(
            CODE_CONTRACT_ADDRESS,
            GenesisAccount { balance: U256::ZERO, code: Some(CODE_CONTRACT), ..Default::default() },
        );
        Ok(Config {
            forks: self.fork_config(),
            validator_count: Some(self.validator_count),
            slot_time: self.slot_time,
            terminal_total_difficulty: Some(U256::ZERO),
            node_definitions: Some(self.node_definitions(clients)?),
            genesis_execution_accounts: Some(accounts),
            ..Default::default()
        })
    }

    /// Every validator gets an identifiable extra balance; shares pick the
    /// ones starting with an execution credential, exited or slashed.
    fn validator_keys(&self, mnemonic: &str) -> eyre::Result<ValidatorKeys> {
        let mut keys = derive_validator_keys(mnemonic, 0, self.validator_count)?;
        for (index, key) in keys.iter_mut().enumerate() {
            let index = index as u64;
            key.extra_initial_balance = (index + 1) * 1_000_000 + self.extra_gwei;
            let shares = self.genesis_execution_withdrawal_credentials_shares;
            if shares > 0 && index % shares == 0 {
                key.withdrawal_credential_type = WithdrawalCredentialType::Eth1;
                key.withdrawal_exec_address = withdrawal_address(index);
            }
            if self.genesis_exited_shares > 1 && index % self.genesis_exited_shares == 1 {
                key.exited = true;
            }
            if self.genesis_slashed_shares > 2 && index % self.genesis_slashed_shares == 2 {
                key.slashed = true;
            }
        }
        Ok(keys)
    }

    async fn execute_pre_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let testnet = &ctx.testnet;
        let (normal, _) = self.spammer_accounts()?;
        let spammer = TransactionSpammer::new("normal", normal, TransactionType::DynamicFee)
            .with_recipient(CODE_CONTRACT_ADDRESS)
            .with_transactions_per_iteration(40)
            .with_seconds_between_iterations(testnet.spec().seconds_per_slot);
        testnet.track(spammer.spawn(testnet.nodes.execution_clients().running(), ctx.cancel.child_token()));

        let chain = &testnet.execution_genesis().genesis.config;
        for verifier in engine_version_verifiers(chain.shanghai_time, chain.cancun_time)? {
            ctx.add_verifier(verifier);
        }
        testnet.wait_for_genesis(&ctx.cancel).await
    }

    async fn wait_for_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let slots = self.deneb_fork_epoch() * ctx.testnet.spec().slots_per_epoch + FORK_GRACE_SLOTS;
        ctx.within_slots(slots, "deneb", ctx.testnet.wait_for_fork(&ctx.cancel, ForkName::Deneb)).await
    }

    async fn execute_post_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let testnet = &ctx.testnet;
        testnet.wait_slots(&ctx.cancel, 1).await?;

        let (_, blobs) = self.spammer_accounts()?;
        let spammer = BlobSpammer::new(blobs)
            .with_recipient(CODE_CONTRACT_ADDRESS)
            .with_seconds_between_iterations(testnet.spec().seconds_per_slot);
        testnet.track(spammer.spawn(testnet.nodes.execution_clients().running(), ctx.cancel.child_token()));

        self.send_bls_changes(ctx).await?;
        self.send_exits(ctx).await
    }

    async fn execute_post_fork_wait(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let testnet = &ctx.testnet;
        if self.epochs_after_fork > 0 {
            testnet
                .wait_slots(&ctx.cancel, self.epochs_after_fork * testnet.spec().slots_per_epoch)
                .await
                .wrap_err_with(|| format!("error waiting for {} epochs after fork", self.epochs_after_fork))?;
        }
        if self.wait_for_blobs {
            self.wait_for_blob_proposers(ctx).await?;
        }
        if self.wait_for_finality {
            ctx.within_epochs(
                FINALITY_TIMEOUT_EPOCHS,
                "epoch finalization",
                testnet.wait_for_current_epoch_finalization(&ctx.cancel),
            )
            .await?;
        }
        Ok(())
    }

    async fn verify(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
        let testnet = &ctx.testnet;
        testnet.verify_el_heads().await.wrap_err("error verifying execution layer heads")?;

        for node in testnet.nodes.running().iter() {
            let Some(bn) = &node.beacon else {
                continue;
            };
            let optimistic = bn.block_is_optimistic(BlockId::Head).await.wrap_err_with(|| {
                format!("error querying optimistic state on node {} ({})", node.index, node.client_names())
            })?;
            if optimistic {
                return Err(eyre!("node {} ({}) is optimistic, it should be synced", node.index, node.client_names()));
            }
        }

        self.wait_for_group(ctx, NON_WITHDRAWABLE_GROUP, "credential change", |v| v.non_withdrawable().count())
            .await?;
        self.wait_for_group(ctx, TO_EXIT_GROUP, "exit initiation", |v| v.count() - v.exit_initiated().count())
            .await?;

        let blobs = testnet.verify_blobs(VerificationSlot::LatestSlotByHead).await.wrap_err("error verifying blobs")?;
        if blobs == 0 {
            return Err(eyre!("no blobs were included in the chain"));
        }
        info!(blobs, "Blobs included in the chain");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hivenet_genesis::{bls, keys::DEFAULT_VALIDATOR_MNEMONIC};

    use super::*;

    fn clients() -> NodeDefinitions {
        NodeDefinitions(vec![NodeDefinition::new("geth", "lighthouse-bn"), NodeDefinition::new("reth", "teku-bn")])
    }

    #[test]
    fn withdrawal_address_keeps_low_byte() {
        assert_eq!(withdrawal_address(5).0[0], 5);
        assert_eq!(withdrawal_address(0x105).0[0], 5);
        assert!(withdrawal_address(5).0[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn config_cycles_clients_and_funds_accounts() {
        let scenario = BaseScenario { node_count: 3, validating_node_count: Some(2), ..Default::default() };
        let config = scenario.testnet_config(&clients()).unwrap();

        let nodes = config.node_definitions();
        let els: Vec<_> = nodes.iter().map(|n| n.execution_client.as_str()).collect();
        assert_eq!(els, ["geth", "reth", "geth"]);
        let shares: Vec<_> = nodes.iter().map(|n| n.validator_shares).collect();
        assert_eq!(shares, [1, 1, 0]);

        assert_eq!(config.forks.capella_fork_epoch, Some(0));
        assert_eq!(config.forks.deneb_fork_epoch, Some(1));
        let accounts = config.genesis_execution_accounts.unwrap();
        assert_eq!(accounts.len(), TEST_ACCOUNT_COUNT as usize + 1);
        assert_eq!(accounts[&CODE_CONTRACT_ADDRESS].code, Some(CODE_CONTRACT));
        assert!(scenario.testnet_config(&NodeDefinitions::default()).is_err());
    }

    #[test]
    fn validator_keys_follow_shares() {
        bls::init().unwrap();
        let scenario = BaseScenario {
            validator_count: 8,
            genesis_execution_withdrawal_credentials_shares: 2,
            genesis_exited_shares: 4,
            genesis_slashed_shares: 4,
            extra_gwei: 7,
            ..Default::default()
        };
        let keys = scenario.validator_keys(DEFAULT_VALIDATOR_MNEMONIC).unwrap();
        assert_eq!(keys.len(), 8);
        assert_eq!(keys[0].extra_initial_balance, 1_000_007);
        assert_eq!(keys[3].extra_initial_balance, 4_000_007);

        let eth1: Vec<_> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.withdrawal_credential_type == WithdrawalCredentialType::Eth1)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(eth1, [0, 2, 4, 6]);
        assert_eq!(keys[4].withdrawal_exec_address, withdrawal_address(4));
        let exited: Vec<_> = keys.iter().enumerate().filter(|(_, k)| k.exited).map(|(i, _)| i).collect();
        assert_eq!(exited, [1, 5]);
        let slashed: Vec<_> = keys.iter().enumerate().filter(|(_, k)| k.slashed).map(|(i, _)| i).collect();
        assert_eq!(slashed, [2, 6]);
    }

    #[test]
    fn spammer_accounts_split_in_halves() {
        let (normal, blobs) = BaseScenario::default().spammer_accounts().unwrap();
        assert_eq!(normal.len(), blobs.len());
        assert_eq!(blobs[0].index, TEST_ACCOUNT_COUNT / 2);
    }
}

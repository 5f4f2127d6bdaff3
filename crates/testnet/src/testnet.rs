//! A running testnet and the slot-paced loops that wait for chain milestones.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy_primitives::B256;
use color_eyre::eyre::{self, WrapErr, eyre};
use futures::future::join_all;
use hivenet_consensus::{BlockId, VersionedBeaconState, shorten};
use hivenet_genesis::ExecutionGenesis;
use hivenet_types::{
    BeaconSpec, ErrorContext, ForkName, HarnessError,
    aliases::{Epoch, Root, Slot},
    beacon::Checkpoint,
    constants::DEFAULT_MAX_CONSECUTIVE_ERRORS_ON_WAITS,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    health::health,
    node::{NodeBundle, Nodes},
    results::Results,
    validators::Validators,
};

/// Epoch after which a finalized checkpoint lagging more than two epochs is a failure.
const FINALITY_GRACE_EPOCHS: Epoch = 4;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// Outcome of polling one node in a round.
pub(crate) enum Round<T> {
    Pending(String),
    Done(String, T),
    Fatal(eyre::Report),
}

fn checkpoint_str(cp: &Checkpoint) -> String {
    format!("{}:{}", cp.epoch, shorten(cp.root))
}

/// Everything a scenario needs once the nodes are created.
pub struct Testnet {
    pub nodes: Nodes,
    pub validators: Validators,
    pub max_consecutive_errors_on_waits: usize,
    spec: Arc<BeaconSpec>,
    genesis_time: u64,
    genesis_validators_root: Root,
    execution_genesis: Arc<ExecutionGenesis>,
    genesis_state: Arc<VersionedBeaconState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Testnet {
    pub(crate) fn new(
        nodes: Nodes,
        validators: Validators,
        execution_genesis: Arc<ExecutionGenesis>,
        genesis_state: Arc<VersionedBeaconState>,
        cancel: CancellationToken,
    ) -> Self {
        let spec = Arc::new(genesis_state.spec().clone());
        Self {
            nodes,
            validators,
            max_consecutive_errors_on_waits: DEFAULT_MAX_CONSECUTIVE_ERRORS_ON_WAITS,
            genesis_time: genesis_state.inner().genesis_time(),
            genesis_validators_root: genesis_state.genesis_validators_root(),
            spec,
            execution_genesis,
            genesis_state,
            cancel,
            tasks: Mutex::default(),
        }
    }

    pub fn spec(&self) -> &Arc<BeaconSpec> {
        &self.spec
    }

    pub fn genesis_time(&self) -> u64 {
        self.genesis_time
    }

    pub fn genesis_validators_root(&self) -> Root {
        self.genesis_validators_root
    }

    pub fn execution_genesis(&self) -> &ExecutionGenesis {
        &self.execution_genesis
    }

    pub fn genesis_state(&self) -> &VersionedBeaconState {
        &self.genesis_state
    }

    /// Token cancelled by [`Testnet::stop`]; background work should derive from it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.spec.seconds_per_slot)
    }

    pub fn slots_duration(&self, slots: u64) -> Duration {
        self.slot_duration() * u32::try_from(slots).unwrap_or(u32::MAX)
    }

    pub fn epochs_duration(&self, epochs: Epoch) -> Duration {
        self.slots_duration(epochs.saturating_mul(self.spec.slots_per_epoch))
    }

    /// Slot by wall clock.
    pub fn current_slot(&self) -> Slot {
        self.spec.time_to_slot(unix_now(), self.genesis_time)
    }

    /// Hands a background task (spammer, verifier) to the testnet; it is aborted on stop.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    /// Cancels the proxies and every tracked task; containers are left to the simulator.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for el in self.nodes.execution_clients().running().iter() {
            el.cancel_proxy().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }

    /// Position of the validator client holding `pubkey`.
    pub fn validator_client_index(&self, pubkey: &[u8; 48]) -> eyre::Result<usize> {
        self.nodes
            .validator_clients()
            .iter()
            .position(|vc| vc.contains_key(pubkey))
            .ok_or_else(|| eyre!("key not found in any validator client"))
    }

    /// Participation of the epoch of `slot` as seen by the first verification node.
    pub async fn health(&self, slot: Slot) -> eyre::Result<f64> {
        let nodes = self.nodes.verification().running();
        let node = nodes.iter().find(|n| n.beacon.is_some()).ok_or_else(|| eyre!("no running beacon node"))?;
        health(node.beacon()?, &self.spec, slot).await
    }

    pub async fn wait_for_genesis(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        let wait = Duration::from_secs(self.genesis_time.saturating_sub(unix_now()));
        info!(secs = wait.as_secs(), "Waiting for genesis");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarnessError::CtxCancelled.into()),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// Sleeps `slots` slots, logging every running beacon node once per slot.
    pub async fn wait_slots(&self, cancel: &CancellationToken, slots: Slot) -> eyre::Result<()> {
        for _ in 0..slots {
            self.nodes.beacon_clients().running().print_status().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = tokio::time::sleep(self.slot_duration()) => {}
            }
        }
        Ok(())
    }

    fn lagging(&self, clock_slot: Slot, slot: Slot) -> Option<eyre::Report> {
        (clock_slot > slot && clock_slot - slot >= self.spec.slots_per_epoch)
            .then(|| eyre!("unable to sync for an entire epoch: clock_slot={clock_slot}, slot={slot}"))
    }

    /// Polls every running verification node once per slot until all report done.
    ///
    /// Returns the value the first node finished with.
    pub(crate) async fn wait_loop<T, F, Fut>(&self, cancel: &CancellationToken, poll: F) -> eyre::Result<T>
    where
        F: Fn(NodeBundle, Slot) -> Fut,
        Fut: Future<Output = eyre::Result<Round<T>>>,
    {
        let nodes: Vec<NodeBundle> =
            self.nodes.verification().running().iter().filter(|n| n.beacon.is_some()).cloned().collect();
        if nodes.is_empty() {
            return Err(eyre!("no running verification nodes"));
        }
        let names: Vec<(usize, String)> = nodes.iter().map(|n| (n.index, n.client_names())).collect();
        let mut results =
            Results::new(names.iter().map(|(i, name)| (*i, name.as_str())), self.max_consecutive_errors_on_waits);

        let slot = self.slot_duration();
        let mut ticker = tokio::time::interval_at(Instant::now() + slot, slot);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = ticker.tick() => {}
            }
            let now = unix_now();
            if now < self.genesis_time + self.spec.seconds_per_slot {
                info!(secs = self.genesis_time.saturating_sub(now), "Time till genesis");
                continue;
            }
            let clock_slot = self.spec.time_to_slot(now, self.genesis_time);

            results.clear();
            let rounds = join_all(nodes.iter().map(|n| poll(n.clone(), clock_slot))).await;
            let mut finished = Vec::new();
            for (r, round) in results.0.iter_mut().zip(rounds) {
                match round {
                    Ok(Round::Pending(msg)) => r.msg = msg,
                    Ok(Round::Done(msg, value)) => {
                        r.msg = msg;
                        r.done = true;
                        finished.push(value);
                    }
                    Ok(Round::Fatal(err)) => r.fatal = Some(err),
                    Err(err) => r.err = Some(err),
                }
            }
            results.check_errors()?;
            results.print_messages();
            if results.all_done() {
                if let Some(value) = finished.into_iter().next() {
                    return Ok(value);
                }
            }
        }
    }

    /// Waits until every verification node's head block is of `fork`.
    pub async fn wait_for_fork(&self, cancel: &CancellationToken, fork: ForkName) -> eyre::Result<()> {
        self.wait_loop(cancel, |n, clock_slot| async move {
            let bn = n.beacon()?;
            let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
            let checkpoints =
                bn.block_finality_checkpoints(BlockId::Head).await.wrap_err("failed to poll finality checkpoint")?;
            let block = bn.block_v2(BlockId::Root(head.root)).await.wrap_err("failed to retrieve block")?;
            if let Some(err) = self.lagging(clock_slot, head.slot()) {
                return Ok(Round::Fatal(err));
            }
            let msg = format!(
                "fork={}, clock_slot={clock_slot}, slot={}, head={}, exec_payload={}, justified={}, finalized={}",
                block.version(),
                head.slot(),
                shorten(head.root),
                shorten(block.execution_block_hash().unwrap_or_default()),
                checkpoint_str(&checkpoints.current_justified),
                checkpoint_str(&checkpoints.finalized),
            );
            Ok(if block.fork_name() == fork { Round::Done(msg, ()) } else { Round::Pending(msg) })
        })
        .await
    }

    /// Waits for a non-zero finalized checkpoint on every verification node.
    ///
    /// Fails with [`HarnessError::FinalityStalled`] once a head past epoch four
    /// is more than two epochs ahead of finality.
    pub async fn wait_for_finality(&self, cancel: &CancellationToken) -> eyre::Result<Checkpoint> {
        self.wait_loop(cancel, |n, clock_slot| async move {
            let bn = n.beacon()?;
            let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
            let checkpoints =
                bn.block_finality_checkpoints(BlockId::Head).await.wrap_err("failed to poll finality checkpoint")?;
            let block = bn.block_v2(BlockId::Root(head.root)).await.wrap_err("failed to retrieve block")?;
            let slot = head.slot();
            if let Some(err) = self.lagging(clock_slot, slot) {
                return Ok(Round::Fatal(err));
            }
            let head_epoch = self.spec.slot_to_epoch(slot);
            let finalized_epoch = checkpoints.finalized.epoch;
            if head_epoch > FINALITY_GRACE_EPOCHS && head_epoch > finalized_epoch + 2 {
                return Ok(Round::Fatal(
                    HarnessError::FinalityStalled {
                        ctx: ErrorContext::node(n.index, n.client_names()),
                        head_epoch,
                        finalized_epoch,
                    }
                    .into(),
                ));
            }
            let health = health(bn, &self.spec, slot).await.unwrap_or_default();
            let msg = format!(
                "fork={}, clock_slot={clock_slot}, slot={slot}, head={}, health={health:.2}, exec_payload={}, \
                 justified={}, finalized={}",
                block.version(),
                shorten(head.root),
                shorten(block.execution_block_hash().unwrap_or_default()),
                checkpoint_str(&checkpoints.current_justified),
                checkpoint_str(&checkpoints.finalized),
            );
            Ok(if checkpoints.finalized != Checkpoint::default() {
                Round::Done(msg, checkpoints.finalized)
            } else {
                Round::Pending(msg)
            })
        })
        .await
    }

    /// Waits until the finalized block of every verification node carries an execution payload.
    pub async fn wait_for_execution_finality(&self, cancel: &CancellationToken) -> eyre::Result<Checkpoint> {
        self.wait_loop(cancel, |n, clock_slot| async move {
            let bn = n.beacon()?;
            let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
            if let Some(err) = self.lagging(clock_slot, head.slot()) {
                return Ok(Round::Fatal(err));
            }
            let checkpoints =
                bn.block_finality_checkpoints(BlockId::Head).await.wrap_err("failed to poll finality checkpoint")?;
            let (mut version, mut execution) = ("", B256::ZERO);
            if checkpoints.finalized != Checkpoint::default() {
                let block =
                    bn.block_v2(BlockId::Root(checkpoints.finalized.root)).await.wrap_err("failed to retrieve block")?;
                version = block.version();
                execution = block.execution_block_hash().unwrap_or_default();
            }
            let msg = format!(
                "fork={version}, clock_slot={clock_slot}, slot={}, head={}, exec_payload={}, justified={}, \
                 finalized={}",
                head.slot(),
                shorten(head.root),
                shorten(execution),
                checkpoint_str(&checkpoints.current_justified),
                checkpoint_str(&checkpoints.finalized),
            );
            Ok(if execution.is_zero() { Round::Pending(msg) } else { Round::Done(msg, checkpoints.finalized) })
        })
        .await
    }

    /// Waits until the epoch current at call time is finalized on every verification node.
    pub async fn wait_for_current_epoch_finalization(&self, cancel: &CancellationToken) -> eyre::Result<Checkpoint> {
        let epoch_to_finalize = self.spec.slot_to_epoch(self.current_slot());
        let checkpoint = self
            .wait_loop(cancel, |n, clock_slot| async move {
                let bn = n.beacon()?;
                let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
                if let Some(err) = self.lagging(clock_slot, head.slot()) {
                    return Ok(Round::Fatal(err));
                }
                let checkpoints = bn
                    .block_finality_checkpoints(BlockId::Head)
                    .await
                    .wrap_err("failed to poll finality checkpoint")?;
                let msg = format!(
                    "clock_slot={clock_slot}, slot={}, head={}, justified={}, finalized={}, \
                     epoch_to_finalize={epoch_to_finalize}",
                    head.slot(),
                    shorten(head.root),
                    checkpoint_str(&checkpoints.current_justified),
                    checkpoint_str(&checkpoints.finalized),
                );
                let finalized = checkpoints.finalized;
                Ok(if finalized != Checkpoint::default() && finalized.epoch >= epoch_to_finalize {
                    Round::Done(msg, finalized)
                } else {
                    Round::Pending(msg)
                })
            })
            .await?;
        info!(epoch = epoch_to_finalize, "Epoch finalized");
        Ok(checkpoint)
    }

    /// Waits for TTD on the first verification EL, then for a head block with
    /// an execution payload on every verification node.
    pub async fn wait_for_execution_payload(&self, cancel: &CancellationToken) -> eyre::Result<B256> {
        let nodes = self.nodes.verification().running();
        let el = nodes.get(0).map(|n| n.execution.clone()).ok_or_else(|| eyre!("no running verification nodes"))?;
        let slot = self.slot_duration();
        loop {
            match el.check_ttd().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => warn!(node = el.index(), "Error querying TTD: {err:#}"),
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = tokio::time::sleep(slot) => {}
            }
        }

        self.wait_loop(cancel, |n, clock_slot| async move {
            let bn = n.beacon()?;
            let head = bn.block_header(BlockId::Head).await.wrap_err("failed to poll head")?;
            let slot = head.slot();
            if let Some(err) = self.lagging(clock_slot, slot) {
                return Ok(Round::Fatal(err));
            }
            let block = bn.block_v2(BlockId::Root(head.root)).await.wrap_err("failed to retrieve block")?;
            let hash = block.execution_block_hash().unwrap_or_default();
            let health = health(bn, &self.spec, slot).await.unwrap_or_default();
            let msg = format!(
                "fork={}, clock_slot={clock_slot}, slot={slot}, head={}, health={health:.2}, exec_payload={}",
                block.version(),
                shorten(head.root),
                shorten(hash),
            );
            Ok(if hash.is_zero() { Round::Pending(msg) } else { Round::Done(msg, hash) })
        })
        .await
    }
}

impl std::fmt::Debug for Testnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Testnet")
            .field("nodes", &self.nodes.len())
            .field("genesis_time", &self.genesis_time)
            .field("genesis_validators_root", &self.genesis_validators_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hivenet_node::NodeDefinition;
    use hivenet_test_support::{FakeExecutionLayer, InMemoryChain};
    use hivenet_types::{ForkConfig, constants::DEFAULT_JWT_SECRET, error::harness_error};

    use super::*;
    use crate::fake_beacon::{FakeBeaconNode, FakeBlock, FakeChain, SLOT_TIME, beacon_client, prepare, wired_testnet};

    const HEAD_SLOT: Slot = 48;

    /// One node whose beacon fake has its head at `head_slot`, on a chain
    /// whose wall clock is just past [`HEAD_SLOT`].
    async fn single_node(head_slot: Slot, finalized: Option<Checkpoint>) -> (Testnet, FakeExecutionLayer, FakeBeaconNode) {
        let genesis_time = unix_now() - HEAD_SLOT * SLOT_TIME;
        let prepared = prepare(vec![NodeDefinition::new("geth", "lighthouse")], 4, genesis_time);
        let state = prepared.genesis_state.inner();
        let mut chain = FakeChain::new(ForkName::Capella, vec![FakeBlock::new(0, 0, state), FakeBlock::new(head_slot, 1, state)]);
        if let Some(cp) = finalized {
            chain = chain.finalized_at(cp.epoch, cp.root);
        }
        let el = FakeExecutionLayer::spawn(
            InMemoryChain::new(genesis_time, ForkConfig::at_genesis(ForkName::Capella)),
            DEFAULT_JWT_SECRET,
        )
        .await
        .unwrap();
        let bn = FakeBeaconNode::spawn(chain).await;
        let testnet = wired_testnet(&prepared, &[(el.port(), bn.port())]).await;
        (testnet, el, bn)
    }

    #[tokio::test]
    async fn finality_wait_returns_the_finalized_checkpoint() {
        let finalized = Checkpoint { epoch: 5, root: Root::repeat_byte(0xf5) };
        let (testnet, el, _bn) = single_node(HEAD_SLOT, Some(finalized)).await;
        let cp = testnet.wait_for_finality(&CancellationToken::new()).await.unwrap();
        assert_eq!(cp, finalized);
        el.shutdown();
    }

    #[tokio::test]
    async fn finality_lagging_two_epochs_behind_a_late_head_is_stalled() {
        let (testnet, el, _bn) = single_node(HEAD_SLOT, None).await;
        let err = testnet.wait_for_finality(&CancellationToken::new()).await.unwrap_err();
        match harness_error(&err) {
            Some(HarnessError::FinalityStalled { head_epoch, finalized_epoch, .. }) => {
                assert_eq!(*head_epoch, HEAD_SLOT / testnet.spec().slots_per_epoch);
                assert_eq!(*finalized_epoch, 0);
            }
            other => panic!("expected stalled finality, got {other:?}: {err:#}"),
        }
        el.shutdown();
    }

    #[tokio::test]
    async fn head_an_epoch_behind_the_clock_is_fatal() {
        let (testnet, el, _bn) = single_node(2, None).await;
        let err = testnet.wait_for_finality(&CancellationToken::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("unable to sync for an entire epoch"), "{err:#}");
        assert!(harness_error(&err).is_none());
        el.shutdown();
    }

    #[tokio::test]
    async fn cancelled_wait_reports_cancellation() {
        let (testnet, el, _bn) = single_node(HEAD_SLOT, None).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = testnet.wait_for_finality(&cancel).await.unwrap_err();
        assert!(matches!(harness_error(&err), Some(HarnessError::CtxCancelled)));
        el.shutdown();
    }

    #[tokio::test]
    async fn beacon_errors_are_tolerated_until_the_limit() {
        let (mut testnet, el, _bn) = single_node(HEAD_SLOT, None).await;
        testnet.max_consecutive_errors_on_waits = 1;
        // The EL fake serves no beacon routes.
        testnet.nodes.0[0].beacon = Some(beacon_client(0, el.port(), testnet.genesis_state()).await);
        let err = testnet.wait_for_finality(&CancellationToken::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("too many consecutive errors"), "{err:#}");
        el.shutdown();
    }
}

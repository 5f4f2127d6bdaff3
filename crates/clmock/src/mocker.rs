//! Deterministic PoS block production over a set of engine clients.
//!
//! One production cycle picks a producer, asks it to build a payload, fetches
//! the payload, broadcasts it to every client and then moves the forkchoice.
//! The whole cycle runs under one lock, which client membership changes also
//! take.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use alloy_primitives::{B256, B64, U256};
use alloy_rpc_types::{BlockNumberOrTag, Header};
use alloy_rpc_types_engine::{ForkchoiceState, PayloadAttributes, PayloadId};
use color_eyre::eyre::{self, eyre};
use futures::FutureExt;
use hivenet_execution::{
    EngineClient,
    engine_api::capabilities::{get_payload_method, forkchoice_updated_method},
};
use hivenet_types::{
    ErrorContext, ForkConfig, HarnessError,
    constants::{EMPTY_UNCLE_HASH, MAX_EXTRA_DATA_BYTES},
    engine_api::{PayloadStatusKind, PayloadStatusV1},
    payload::{commitment_versioned_hash, timestamp_to_beacon_root},
};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    callbacks::{
        BlockContext, BlockProcessCallbacks, EngineCaller, ExecutePayloadOutcome, ForkchoiceOutcome,
        broadcast_forkchoice, is_optimistically_syncing,
    },
    config::ClMockerConfig,
    history::make_next_withdrawals,
    state::ClMockerState,
};

const TTD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEADER_METHOD: &str = "eth_getBlockByNumber";

struct Inner {
    clients: Vec<Arc<dyn EngineClient>>,
    state: ClMockerState,
    rng: StdRng,
    payload_ids: HashMap<String, HashSet<PayloadId>>,
    statuses: HashMap<String, PayloadStatusKind>,
    /// Added to the head number when rotating producers; grows with every skipped client.
    producer_offset: u64,
}

/// Drives block production for a set of execution clients.
pub struct ClMocker {
    config: ClMockerConfig,
    forks: ForkConfig,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl ClMocker {
    pub fn new(config: ClMockerConfig, forks: ForkConfig) -> Self {
        Self::with_cancellation(config, forks, CancellationToken::new())
    }

    pub fn with_cancellation(config: ClMockerConfig, forks: ForkConfig, cancel: CancellationToken) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            forks,
            cancel,
            inner: Mutex::new(Inner {
                clients: Vec::new(),
                state: ClMockerState::default(),
                rng,
                payload_ids: HashMap::new(),
                statuses: HashMap::new(),
                producer_offset: 0,
            }),
        }
    }

    pub fn config(&self) -> &ClMockerConfig {
        &self.config
    }

    pub fn forks(&self) -> ForkConfig {
        self.forks
    }

    fn caller(&self) -> EngineCaller {
        EngineCaller { cancel: self.cancel.clone(), timeout: self.config.rpc_timeout }
    }

    pub async fn add_engine_client(&self, client: Arc<dyn EngineClient>) {
        let mut inner = self.inner.lock().await;
        info!(client = %client.id(), "CL mocker: adding engine client");
        inner.clients.push(client);
    }

    /// Removes the client with the given id; returns whether it was present.
    pub async fn remove_engine_client(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.clients.len();
        inner.clients.retain(|c| c.id() != id);
        inner.statuses.remove(id);
        inner.payload_ids.remove(id);
        before != inner.clients.len()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.inner.lock().await.clients.iter().map(|c| c.id()).collect()
    }

    /// Snapshot of the production state.
    pub async fn state(&self) -> ClMockerState {
        self.inner.lock().await.state.clone()
    }

    pub async fn latest_header(&self) -> Option<Header> {
        self.inner.lock().await.state.latest_header.clone()
    }

    pub async fn set_next_withdrawals(&self, withdrawals: Vec<alloy_eips::eip4895::Withdrawal>) {
        self.inner.lock().await.state.next_withdrawals = Some(withdrawals);
    }

    pub async fn set_next_fee_recipient(&self, fee_recipient: alloy_primitives::Address) {
        self.inner.lock().await.state.next_fee_recipient = fee_recipient;
    }

    pub async fn is_optimistically_syncing(&self) -> bool {
        let inner = self.inner.lock().await;
        is_optimistically_syncing(&inner.state, self.config.safe_slots_to_import_optimistically)
    }

    /// Resets the chain view to the latest block of `client`.
    pub async fn init_chain(&self, client: &dyn EngineClient) -> eyre::Result<()> {
        let mut inner = self.inner.lock().await;
        self.init_chain_locked(&mut inner.state, client).await
    }

    async fn init_chain_locked(&self, state: &mut ClMockerState, client: &dyn EngineClient) -> eyre::Result<()> {
        let header = self
            .caller()
            .call(client, HEADER_METHOD, client.header_by_number(BlockNumberOrTag::Latest))
            .await?
            .ok_or_else(|| HarnessError::ChainDivergence(ErrorContext::client(client.id()), "no latest header".into()))?;

        info!(client = %client.id(), number = header.number, hash = %header.hash, "CL mocker: chain initialised");
        state.latest_head_number = header.number;
        state.latest_forkchoice = ForkchoiceState {
            head_block_hash: header.hash,
            safe_block_hash: B256::ZERO,
            finalized_block_hash: B256::ZERO,
        };
        state.head_hash_history.clear();
        state.first_pos_block_number = None;
        state.header_history.clear();
        state.header_history.insert(header.number, header.clone());
        state.latest_header = Some(header);
        Ok(())
    }

    /// Polls the clients until one reports its terminal total difficulty, then
    /// points every client's forkchoice head at that block.
    pub async fn wait_for_ttd(&self) -> eyre::Result<()> {
        let caller = self.caller();
        let mut interval = tokio::time::interval(TTD_POLL_INTERVAL);
        let reached = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(HarnessError::CtxCancelled.into()),
                _ = interval.tick() => {}
            }
            let clients = self.inner.lock().await.clients.clone();
            let mut found = None;
            for client in clients {
                match caller.call(client.as_ref(), "check_ttd", client.check_ttd()).await {
                    Ok(true) => {
                        found = Some(client);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) if is_cancelled(&e) => return Err(e),
                    Err(e) => debug!(client = %client.id(), "TTD check failed: {e:#}"),
                }
            }
            if let Some(client) = found {
                break client;
            }
        };

        let mut inner = self.inner.lock().await;
        let Inner { clients, state, .. } = &mut *inner;
        self.init_chain_locked(state, reached.as_ref()).await?;
        state.ttd_reached = true;

        let head = state.latest_header_hash();
        let forkchoice = state.latest_forkchoice;
        let version = self.forks.forkchoice_updated_version(state.latest_timestamp(), None);
        let outcomes = broadcast_forkchoice(&caller, clients, |_| true, forkchoice, None, version).await?;
        for outcome in outcomes {
            if let Some(result) = outcome.result {
                let resp = result.map_err(|e| e.wrap_err(format!("forkchoiceUpdated to {} after TTD", outcome.client)))?;
                debug!(client = %outcome.client, status = %resp.payload_status.status, "forkchoice set to TTD block");
            }
        }
        info!(number = state.latest_head_number, hash = %head, "🏁 Terminal total difficulty reached");
        Ok(())
    }

    pub async fn produce_blocks(&self, count: u64, callbacks: &dyn BlockProcessCallbacks) -> eyre::Result<()> {
        for _ in 0..count {
            self.produce_single_block(callbacks).await?;
        }
        Ok(())
    }

    /// Runs one full production cycle.
    pub async fn produce_single_block(&self, callbacks: &dyn BlockProcessCallbacks) -> eyre::Result<()> {
        let mut inner = self.inner.lock().await;
        let Inner { clients, state, rng, payload_ids, statuses, producer_offset } = &mut *inner;
        if !state.ttd_reached {
            return Err(eyre!("cannot produce blocks before the terminal total difficulty is reached"));
        }
        let caller = self.caller();
        let mut ctx = BlockContext {
            state,
            clients,
            statuses,
            caller: &caller,
            forks: self.forks,
            safe_slots_to_import_optimistically: self.config.safe_slots_to_import_optimistically,
        };
        self.run_cycle(&mut ctx, rng, payload_ids, producer_offset, callbacks).await
    }

    async fn run_cycle(
        &self,
        ctx: &mut BlockContext<'_>,
        rng: &mut StdRng,
        payload_ids: &mut HashMap<String, HashSet<PayloadId>>,
        producer_offset: &mut u64,
        callbacks: &dyn BlockProcessCallbacks,
    ) -> eyre::Result<()> {
        let latest = ctx.state.latest_header.clone().ok_or_else(|| eyre!("chain not initialised"))?;
        ctx.state.current_payload_number = latest.number + 1;

        let producer = self.pick_producer(ctx, &latest, producer_offset).await?;
        ctx.state.next_block_producer = Some(producer.id());
        if ctx.state.next_withdrawals.is_none() {
            ctx.state.next_withdrawals = Some(make_next_withdrawals(ctx.state.latest_payload_built.as_ref()));
        }
        run_hook("on_payload_producer_selected", callbacks.on_payload_producer_selected(ctx)).await?;

        self.generate_payload_attributes(ctx.state, rng, &latest);
        run_hook("on_payload_attributes_generated", callbacks.on_payload_attributes_generated(ctx)).await?;

        self.request_next_payload(ctx, producer.as_ref(), &latest, payload_ids).await?;
        ctx.state.next_withdrawals = None;
        run_hook("on_request_next_payload", callbacks.on_request_next_payload(ctx)).await?;

        ctx.caller.sleep(self.config.payload_production_delay).await?;

        self.get_next_payload(ctx, producer.as_ref(), &latest).await?;
        run_hook("on_get_payload", callbacks.on_get_payload(ctx)).await?;

        self.broadcast_next_new_payload(ctx).await?;
        run_hook("on_new_payload_broadcast", callbacks.on_new_payload_broadcast(ctx)).await?;

        let previous = ctx.state.latest_forkchoice;
        let built = ctx.state.latest_payload_built.as_ref().ok_or_else(|| eyre!("no payload built"))?;
        let built_hash = built.as_v1().block_hash;
        ctx.state.head_hash_history.push(built_hash);
        ctx.state.latest_forkchoice =
            ctx.state.forkchoice_from_history(self.config.slots_to_safe, self.config.slots_to_finalized);
        self.broadcast_latest_forkchoice(ctx).await?;
        run_hook("on_forkchoice_broadcast", callbacks.on_forkchoice_broadcast(ctx)).await?;

        let current = ctx.state.latest_forkchoice;
        if current.safe_block_hash != previous.safe_block_hash {
            run_hook("on_safe_block_change", callbacks.on_safe_block_change(ctx)).await?;
        }
        if current.finalized_block_hash != previous.finalized_block_hash {
            run_hook("on_finalized_block_change", callbacks.on_finalized_block_change(ctx)).await?;
        }

        if ctx.state.first_pos_block_number.is_none() {
            ctx.state.first_pos_block_number = Some(latest.number + 1);
        }
        ctx.state.latest_head_number += 1;

        let header = self.verify_new_head(ctx, built_hash).await?;
        info!(
            number = header.number,
            hash = %header.hash,
            safe = %current.safe_block_hash,
            finalized = %current.finalized_block_hash,
            "🧱 New block produced"
        );
        ctx.state.header_history.insert(header.number, header.clone());
        ctx.state.latest_header = Some(header);
        Ok(())
    }

    /// Rotates through the clients starting after the previous producer and
    /// returns the first one whose latest block is `latest`.
    async fn pick_producer(
        &self,
        ctx: &BlockContext<'_>,
        latest: &Header,
        producer_offset: &mut u64,
    ) -> eyre::Result<Arc<dyn EngineClient>> {
        let len = ctx.clients.len() as u64;
        let start = ctx.state.latest_head_number.wrapping_add(*producer_offset);
        for skipped in 0..len {
            let client = &ctx.clients[(start.wrapping_add(skipped) % len) as usize];
            let header = ctx
                .caller
                .call(client.as_ref(), HEADER_METHOD, client.header_by_number(BlockNumberOrTag::Latest))
                .await?;
            match header {
                Some(h) if h.hash == latest.hash && h.number == latest.number => {
                    *producer_offset = producer_offset.wrapping_add(skipped);
                    return Ok(client.clone());
                }
                Some(h) => debug!(client = %client.id(), number = h.number, hash = %h.hash, "client not on the latest head"),
                None => debug!(client = %client.id(), "client returned no latest header"),
            }
        }
        Err(HarnessError::NoEligibleProducer { number: latest.number, hash: latest.hash }.into())
    }

    fn next_block_timestamp(&self, state: &ClMockerState, latest: &Header) -> u64 {
        match (state.first_pos_block_number, self.config.transition_payload_timestamp) {
            (None, Some(ts)) => ts,
            _ => latest.timestamp + self.config.block_timestamp_increment,
        }
    }

    fn generate_payload_attributes(&self, state: &mut ClMockerState, rng: &mut StdRng, latest: &Header) {
        let mut prev_randao = B256::ZERO;
        rng.fill_bytes(&mut prev_randao.0);
        let timestamp = self.next_block_timestamp(state, latest);

        let withdrawals = if self.forks.is_shanghai(timestamp) { state.next_withdrawals.clone() } else { None };
        let parent_beacon_block_root = self.forks.is_cancun(timestamp).then(|| timestamp_to_beacon_root(timestamp));
        state.latest_payload_attributes = Some(PayloadAttributes {
            timestamp,
            prev_randao,
            suggested_fee_recipient: state.next_fee_recipient,
            withdrawals,
            parent_beacon_block_root,
        });
        state.prev_randao_history.insert(latest.number + 1, prev_randao);
    }

    async fn request_next_payload(
        &self,
        ctx: &mut BlockContext<'_>,
        producer: &dyn EngineClient,
        latest: &Header,
        payload_ids: &mut HashMap<String, HashSet<PayloadId>>,
    ) -> eyre::Result<()> {
        let attrs = ctx.state.latest_payload_attributes.clone().ok_or_else(|| eyre!("no payload attributes"))?;
        let version = self.forks.forkchoice_updated_version(latest.timestamp, Some(attrs.timestamp));
        let method = forkchoice_updated_method(version)?;
        let err_ctx = || ErrorContext::client(producer.id()).with_method(method);

        let forkchoice = ctx.state.latest_forkchoice;
        let resp = ctx
            .caller
            .call(producer, method, producer.forkchoice_updated(version, forkchoice, Some(attrs)))
            .await?;
        expect_valid(&resp.payload_status, forkchoice.head_block_hash, err_ctx)?;

        let payload_id = resp.payload_id.ok_or_else(|| {
            HarnessError::UnexpectedPayloadStatus { ctx: err_ctx(), expected: "payload id".into(), got: "none".into() }
        })?;
        if !payload_ids.entry(producer.id()).or_default().insert(payload_id) {
            return Err(HarnessError::ChainDivergence(err_ctx(), format!("reused payload id {payload_id}")).into());
        }
        debug!(client = %producer.id(), %payload_id, "payload requested");
        ctx.state.next_payload_id = Some(payload_id);
        Ok(())
    }

    async fn get_next_payload(
        &self,
        ctx: &mut BlockContext<'_>,
        producer: &dyn EngineClient,
        latest: &Header,
    ) -> eyre::Result<()> {
        let attrs = ctx.state.latest_payload_attributes.clone().ok_or_else(|| eyre!("no payload attributes"))?;
        let payload_id = ctx.state.next_payload_id.ok_or_else(|| eyre!("no payload id"))?;
        let version = self.forks.get_payload_version(attrs.timestamp);
        let method = get_payload_method(version)?;
        let err_ctx = || ErrorContext::client(producer.id()).with_method(method);

        let resp = ctx.caller.call(producer, method, producer.get_payload(version, payload_id)).await?;
        let payload = resp.execution_payload.as_v1();
        let diverged = |what: &str| -> eyre::Report { HarnessError::ChainDivergence(err_ctx(), what.to_owned()).into() };
        if payload.timestamp != attrs.timestamp {
            return Err(diverged(&format!("timestamp {} != {}", payload.timestamp, attrs.timestamp)));
        }
        if payload.fee_recipient != attrs.suggested_fee_recipient {
            return Err(diverged(&format!("fee recipient {} != {}", payload.fee_recipient, attrs.suggested_fee_recipient)));
        }
        if payload.prev_randao != attrs.prev_randao {
            return Err(HarnessError::MixHashMismatch {
                ctx: err_ctx(),
                number: payload.block_number,
                expected: attrs.prev_randao,
                got: payload.prev_randao,
            }
            .into());
        }
        if payload.parent_hash != latest.hash {
            return Err(HarnessError::HashMismatch { ctx: err_ctx(), expected: latest.hash, got: payload.parent_hash }.into());
        }
        if payload.block_number != latest.number + 1 {
            return Err(diverged(&format!("block number {} does not follow {}", payload.block_number, latest.number)));
        }

        if self.forks.is_cancun(attrs.timestamp) {
            let bundle = resp.blobs_bundle.as_ref().ok_or_else(|| diverged("missing blobs bundle"))?;
            ctx.state.latest_versioned_hashes =
                Some(bundle.commitments.iter().map(|c| commitment_versioned_hash(c.as_slice())).collect());
            ctx.state.latest_parent_beacon_root = attrs.parent_beacon_block_root;
        } else {
            ctx.state.latest_versioned_hashes = None;
            ctx.state.latest_parent_beacon_root = None;
        }

        ctx.state.latest_block_value = resp.block_value;
        ctx.state.latest_blobs_bundle = resp.blobs_bundle;
        ctx.state.latest_should_override_builder = resp.should_override_builder;
        ctx.state.latest_payload_built = Some(resp.execution_payload);
        Ok(())
    }

    async fn broadcast_next_new_payload(&self, ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        let payload = ctx.state.latest_payload_built.clone().ok_or_else(|| eyre!("no payload built"))?;
        let hash = payload.as_v1().block_hash;
        let version = self.forks.new_payload_version(payload.as_v1().timestamp);
        let hashes = ctx.state.latest_versioned_hashes.clone();
        let root = ctx.state.latest_parent_beacon_root;
        let outcomes = ctx.broadcast_new_payload(&payload, hashes, root, version).await?;

        let mut validations = 0;
        for ExecutePayloadOutcome { client, result } in outcomes {
            let err_ctx = || ErrorContext::client(client.clone()).with_method(format!("engine_newPayloadV{version}"));
            let status = result.map_err(|e| e.wrap_err(format!("newPayload to {client}")))?;
            match status.status {
                PayloadStatusKind::Valid => {
                    let got = status.latest_valid_hash.unwrap_or_default();
                    if got != hash {
                        return Err(HarnessError::HashMismatch { ctx: err_ctx(), expected: hash, got }.into());
                    }
                    validations += 1;
                }
                PayloadStatusKind::Accepted => {
                    if status.latest_valid_hash.is_some_and(|h| !h.is_zero()) {
                        return Err(HarnessError::UnexpectedPayloadStatus {
                            ctx: err_ctx(),
                            expected: "ACCEPTED with null latestValidHash".into(),
                            got: format!("{:?}", status.latest_valid_hash),
                        }
                        .into());
                    }
                }
                other => warn!(%client, status = %other, "newPayload not validated"),
            }
        }
        if validations == 0 {
            return Err(HarnessError::UnexpectedPayloadStatus {
                ctx: ErrorContext::default().with_method(format!("engine_newPayloadV{version}")),
                expected: "at least one VALID".into(),
                got: "none".into(),
            }
            .into());
        }

        ctx.state.executed_payload_history.insert(payload.clone());
        ctx.state.latest_executed_payload = Some(payload);
        Ok(())
    }

    async fn broadcast_latest_forkchoice(&self, ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        let executed_ts = ctx.state.latest_executed_payload.as_ref().map_or(0, |p| p.as_v1().timestamp);
        let version = self.forks.forkchoice_updated_version(executed_ts, None);
        let forkchoice = ctx.state.latest_forkchoice;
        let outcomes = ctx.broadcast_forkchoice_updated(forkchoice, None, version).await?;

        for ForkchoiceOutcome { client, result } in outcomes {
            let Some(result) = result else { continue };
            let resp = result.map_err(|e| e.wrap_err(format!("forkchoiceUpdated to {client}")))?;
            if !resp.payload_status.is_valid() {
                debug!(%client, status = %resp.payload_status.status, "forkchoice not yet valid");
                continue;
            }
            let err_ctx = || ErrorContext::client(client.clone()).with_method(format!("engine_forkchoiceUpdatedV{version}"));
            expect_valid(&resp.payload_status, forkchoice.head_block_hash, err_ctx)?;
            if let Some(id) = resp.payload_id {
                return Err(HarnessError::UnexpectedPayloadStatus {
                    ctx: err_ctx(),
                    expected: "no payload id".into(),
                    got: id.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Confirms that some client serves the new head with post-merge header fields.
    async fn verify_new_head(&self, ctx: &BlockContext<'_>, expected: B256) -> eyre::Result<Header> {
        let number = ctx.state.latest_head_number;
        let randao = ctx.state.prev_randao_history.get(&number).copied().unwrap_or_default();
        let mut found = None;
        for client in ctx.clients {
            let header = ctx
                .caller
                .call(client.as_ref(), HEADER_METHOD, client.header_by_number(BlockNumberOrTag::Number(number)))
                .await?;
            let Some(header) = header else { continue };
            if header.hash != expected {
                continue;
            }
            let err_ctx = || ErrorContext::client(client.id()).with_method(HEADER_METHOD);
            let diverged = |what: String| -> eyre::Report { HarnessError::ChainDivergence(err_ctx(), what).into() };
            if header.ommers_hash != EMPTY_UNCLE_HASH {
                return Err(diverged(format!("uncle hash {} at block {number}", header.ommers_hash)));
            }
            if header.difficulty != U256::ZERO {
                return Err(diverged(format!("difficulty {} at block {number}", header.difficulty)));
            }
            if header.mix_hash != randao {
                return Err(
                    HarnessError::MixHashMismatch { ctx: err_ctx(), number, expected: randao, got: header.mix_hash }.into()
                );
            }
            if header.nonce != B64::ZERO {
                return Err(diverged(format!("nonce {} at block {number}", header.nonce)));
            }
            if header.extra_data.len() > MAX_EXTRA_DATA_BYTES {
                return Err(diverged(format!("extra data of {} bytes at block {number}", header.extra_data.len())));
            }
            found = Some(header);
        }
        found.ok_or_else(|| {
            HarnessError::ChainDivergence(ErrorContext::default(), format!("no client serves block {number} ({expected})"))
                .into()
        })
    }
}

fn expect_valid(status: &PayloadStatusV1, head: B256, err_ctx: impl Fn() -> ErrorContext) -> eyre::Result<()> {
    if status.status != PayloadStatusKind::Valid {
        return Err(HarnessError::UnexpectedPayloadStatus {
            ctx: err_ctx(),
            expected: PayloadStatusKind::Valid.to_string(),
            got: status.status.to_string(),
        }
        .into());
    }
    let got = status.latest_valid_hash.unwrap_or_default();
    if got != head {
        return Err(HarnessError::HashMismatch { ctx: err_ctx(), expected: head, got }.into());
    }
    if let Some(err) = &status.validation_error {
        return Err(HarnessError::UnexpectedPayloadStatus {
            ctx: err_ctx(),
            expected: "no validation error".into(),
            got: err.clone(),
        }
        .into());
    }
    Ok(())
}

fn is_cancelled(report: &eyre::Report) -> bool {
    matches!(hivenet_types::error::harness_error(report), Some(HarnessError::CtxCancelled))
}

async fn run_hook(name: &str, hook: impl std::future::Future<Output = eyre::Result<()>>) -> eyre::Result<()> {
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            Err(HarnessError::CallbackPanic(ErrorContext::default().with_method(name), msg).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use hivenet_test_support::{InMemoryChain, InMemoryEngine};
    use hivenet_types::payload::CustomPayloadData;

    use super::*;
    use crate::callbacks::NoCallbacks;

    const GENESIS: u64 = 1_000;

    fn shanghai() -> ForkConfig {
        ForkConfig { shanghai_timestamp: Some(0), ..Default::default() }
    }

    fn config() -> ClMockerConfig {
        ClMockerConfig::new(1, 0).with_payload_production_delay(Duration::ZERO)
    }

    fn engine(id: &str, forks: ForkConfig) -> InMemoryEngine {
        InMemoryEngine::new(id, InMemoryChain::new(GENESIS, forks))
    }

    async fn mocker(config: ClMockerConfig, forks: ForkConfig, engines: &[InMemoryEngine]) -> ClMocker {
        let mocker = ClMocker::new(config, forks);
        for e in engines {
            mocker.add_engine_client(Arc::new(e.clone())).await;
        }
        mocker.wait_for_ttd().await.unwrap();
        mocker
    }

    fn count(engine: &InMemoryEngine, method: &str) -> usize {
        engine.chain().calls().iter().filter(|c| c.as_str() == method).count()
    }

    #[tokio::test]
    async fn produces_blocks_rotating_producers() {
        let (a, b) = (engine("a", shanghai()), engine("b", shanghai()));
        let mocker = mocker(config(), shanghai(), &[a.clone(), b.clone()]).await;

        mocker.produce_blocks(3, &NoCallbacks).await.unwrap();

        let state = mocker.state().await;
        assert_eq!(state.latest_head_number, 3);
        assert_eq!(state.first_pos_block_number, Some(1));
        assert_eq!(state.head_hash_history.len(), 3);
        assert_eq!(state.executed_payload_history.len(), 3);
        assert_eq!(state.latest_header_hash(), state.head_hash_history[2]);
        assert_eq!(state.latest_forkchoice.safe_block_hash, state.head_hash_history[1]);
        assert_eq!(state.latest_forkchoice.finalized_block_hash, state.head_hash_history[0]);

        for e in [&a, &b] {
            let chain = e.chain();
            assert_eq!(chain.head().header.number, 3);
            assert_eq!(chain.forkchoice(), state.latest_forkchoice);
        }
        assert_eq!(count(&a, "engine_getPayloadV2"), 2);
        assert_eq!(count(&b, "engine_getPayloadV2"), 1);
    }

    /// Records the producer of every block.
    #[derive(Default)]
    struct Producers(StdMutex<Vec<String>>);

    #[async_trait]
    impl BlockProcessCallbacks for Producers {
        async fn on_payload_producer_selected(&self, ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.0.lock().unwrap().extend(ctx.state.next_block_producer.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn skipped_producer_shifts_later_rotations() {
        let (a, b, c) = (engine("a", shanghai()), engine("b", shanghai()), engine("c", shanghai()));
        let mocker = mocker(config(), shanghai(), &[a.clone(), b.clone(), c.clone()]).await;
        b.chain().set_syncing(true);

        let producers = Producers::default();
        mocker.produce_blocks(6, &producers).await.unwrap();

        let picked = producers.0.lock().unwrap().clone();
        assert_eq!(picked, ["a", "c", "a", "c", "a", "c"]);
        assert_eq!(count(&a, "engine_getPayloadV2"), 3);
        assert_eq!(count(&b, "engine_getPayloadV2"), 0);
        assert_eq!(count(&c, "engine_getPayloadV2"), 3);
    }

    /// Height of the finalized block each engine last received, sampled
    /// after every forkchoice update of a cycle.
    struct FinalizedHeights {
        engines: Vec<InMemoryEngine>,
        heights: StdMutex<Vec<u64>>,
    }

    impl FinalizedHeights {
        fn sample(&self) {
            let mut heights = self.heights.lock().unwrap();
            for engine in &self.engines {
                let chain = engine.chain();
                let finalized = chain.forkchoice().finalized_block_hash;
                heights.push(chain.block_by_hash(&finalized).map_or(0, |b| b.header.number));
            }
        }
    }

    #[async_trait]
    impl BlockProcessCallbacks for FinalizedHeights {
        async fn on_request_next_payload(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.sample();
            Ok(())
        }
        async fn on_forkchoice_broadcast(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.sample();
            Ok(())
        }
    }

    #[tokio::test]
    async fn finalized_height_never_decreases() {
        const SLOTS_TO_FINALIZED: u64 = 3;
        const BLOCKS: u64 = SLOTS_TO_FINALIZED + 5;

        let (a, b) = (engine("a", shanghai()), engine("b", shanghai()));
        let cfg = config().with_slots_to_finalized(SLOTS_TO_FINALIZED);
        let mocker = mocker(cfg, shanghai(), &[a.clone(), b.clone()]).await;
        let recorder = FinalizedHeights { engines: vec![a.clone(), b], heights: StdMutex::new(Vec::new()) };
        mocker.produce_blocks(BLOCKS, &recorder).await.unwrap();

        let heights = recorder.heights.lock().unwrap().clone();
        assert_eq!(heights.len() as u64, BLOCKS * 4);
        assert!(heights.windows(2).all(|w| w[0] <= w[1]), "finalized heights went backwards: {heights:?}");
        assert_eq!(heights.first(), Some(&0));
        assert_eq!(heights.last(), Some(&(BLOCKS - SLOTS_TO_FINALIZED)));

        let state = mocker.state().await;
        let finalized = state.head_hash_history[(BLOCKS - SLOTS_TO_FINALIZED - 1) as usize];
        assert_eq!(state.latest_forkchoice.finalized_block_hash, finalized);
        assert_eq!(a.chain().forkchoice().finalized_block_hash, finalized);
    }

    #[tokio::test]
    async fn withdrawals_reach_the_chain() {
        let a = engine("a", shanghai());
        let mocker = mocker(config(), shanghai(), &[a.clone()]).await;
        mocker.produce_blocks(2, &NoCallbacks).await.unwrap();

        let state = mocker.state().await;
        assert_eq!(state.executed_payload_history.latest_withdrawals_index(), 20);
        let balance = a.chain().balance_at(alloy_primitives::Address::ZERO, BlockNumberOrTag::Latest);
        assert_eq!(balance, U256::from(2 * 100 * hivenet_types::constants::WEI_PER_GWEI));
    }

    #[tokio::test]
    async fn zero_slots_to_safe_follows_head() {
        let a = engine("a", shanghai());
        let mocker = mocker(config().with_slots_to_safe(0), shanghai(), &[a]).await;
        mocker.produce_single_block(&NoCallbacks).await.unwrap();

        let fc = mocker.state().await.latest_forkchoice;
        assert_eq!(fc.safe_block_hash, fc.head_block_hash);
        assert!(fc.finalized_block_hash.is_zero());
    }

    #[derive(Default)]
    struct Recorder {
        hooks: StdMutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn push(&self, name: &'static str) {
            self.hooks.lock().unwrap().push(name);
        }
    }

    #[async_trait]
    impl BlockProcessCallbacks for Recorder {
        async fn on_payload_producer_selected(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("producer");
            Ok(())
        }
        async fn on_payload_attributes_generated(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("attributes");
            Ok(())
        }
        async fn on_request_next_payload(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("request");
            Ok(())
        }
        async fn on_get_payload(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("get");
            Ok(())
        }
        async fn on_new_payload_broadcast(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("new_payload");
            Ok(())
        }
        async fn on_forkchoice_broadcast(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("forkchoice");
            Ok(())
        }
        async fn on_safe_block_change(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("safe");
            Ok(())
        }
        async fn on_finalized_block_change(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            self.push("finalized");
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_run_in_cycle_order() {
        let mocker = mocker(config(), shanghai(), &[engine("a", shanghai())]).await;
        let recorder = Recorder::default();
        mocker.produce_blocks(3, &recorder).await.unwrap();

        let cycle = ["producer", "attributes", "request", "get", "new_payload", "forkchoice"];
        let hooks = recorder.hooks.lock().unwrap().clone();
        let mut expected = cycle.to_vec();
        expected.extend(cycle);
        expected.push("safe");
        expected.extend(cycle);
        expected.extend(["safe", "finalized"]);
        assert_eq!(hooks, expected);
    }

    enum Tamper {
        StateRoot,
        UnknownParent,
    }

    struct Rebroadcast {
        tamper: Tamper,
        seen: StdMutex<Option<PayloadStatusV1>>,
    }

    #[async_trait]
    impl BlockProcessCallbacks for Rebroadcast {
        async fn on_get_payload(&self, ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
            let built = ctx.state.latest_payload_built.clone().unwrap();
            let custom = match self.tamper {
                Tamper::StateRoot => CustomPayloadData { state_root: Some(B256::repeat_byte(7)), ..Default::default() },
                Tamper::UnknownParent => {
                    CustomPayloadData { parent_hash: Some(B256::repeat_byte(9)), ..Default::default() }
                }
            };
            let (payload, root) = custom.apply(&built, None)?;
            let version = ctx.forks().new_payload_version(payload.as_v1().timestamp);
            let mut outcomes = ctx.broadcast_new_payload(&payload, None, root, version).await?;
            *self.seen.lock().unwrap() = Some(outcomes.remove(0).result?);
            Ok(())
        }
    }

    #[tokio::test]
    async fn invalid_state_root_reports_parent_as_latest_valid() {
        let a = engine("a", shanghai());
        let genesis = a.chain().genesis().hash;
        let mocker = mocker(config(), shanghai(), &[a]).await;
        let cb = Rebroadcast { tamper: Tamper::StateRoot, seen: StdMutex::new(None) };
        mocker.produce_single_block(&cb).await.unwrap();

        let status = cb.seen.lock().unwrap().clone().unwrap();
        assert_eq!(status.status, PayloadStatusKind::Invalid);
        assert_eq!(status.latest_valid_hash, Some(genesis));
        assert_eq!(mocker.state().await.latest_head_number, 1);
    }

    #[tokio::test]
    async fn unknown_parent_is_syncing() {
        let mocker = mocker(config(), shanghai(), &[engine("a", shanghai())]).await;
        let cb = Rebroadcast { tamper: Tamper::UnknownParent, seen: StdMutex::new(None) };
        mocker.produce_single_block(&cb).await.unwrap();

        let status = cb.seen.lock().unwrap().clone().unwrap();
        assert_eq!(status.status, PayloadStatusKind::Syncing);
        assert_eq!(status.latest_valid_hash, None);
    }

    #[tokio::test]
    async fn no_producer_on_latest_head() {
        let mocker = mocker(config(), shanghai(), &[engine("a", shanghai())]).await;
        assert!(mocker.remove_engine_client("a").await);
        mocker
            .add_engine_client(Arc::new(InMemoryEngine::new("b", InMemoryChain::new(GENESIS + 5, shanghai()))))
            .await;

        let err = mocker.produce_single_block(&NoCallbacks).await.unwrap_err();
        assert!(matches!(
            hivenet_types::error::harness_error(&err),
            Some(HarnessError::NoEligibleProducer { number: 0, .. })
        ));
    }

    #[tokio::test]
    async fn engine_versions_follow_fork_schedule() {
        let forks = ForkConfig { shanghai_timestamp: Some(0), cancun_timestamp: Some(GENESIS + 2), ..Default::default() };
        let a = engine("a", forks);
        let mocker = mocker(config(), forks, &[a.clone()]).await;
        mocker.produce_blocks(2, &NoCallbacks).await.unwrap();

        let calls = a.chain().calls().to_vec();
        let block_calls: Vec<&str> = calls.iter().skip(1).map(String::as_str).collect();
        assert_eq!(
            block_calls,
            [
                "engine_forkchoiceUpdatedV2",
                "engine_getPayloadV2",
                "engine_newPayloadV2",
                "engine_forkchoiceUpdatedV2",
                "engine_forkchoiceUpdatedV3",
                "engine_getPayloadV3",
                "engine_newPayloadV3",
                "engine_forkchoiceUpdatedV3",
            ]
        );
        let state = mocker.state().await;
        assert_eq!(state.latest_parent_beacon_root, Some(timestamp_to_beacon_root(GENESIS + 2)));
        assert_eq!(state.latest_versioned_hashes, Some(vec![]));
    }

    #[tokio::test]
    async fn syncing_client_skipped_until_optimistic() {
        for (safe_slots, expected_fcus) in [(10, 1), (0, 2)] {
            let (a, b) = (engine("a", shanghai()), engine("b", shanghai()));
            let cfg = ClMockerConfig::new(1, safe_slots).with_payload_production_delay(Duration::ZERO);
            let mocker = mocker(cfg, shanghai(), &[a, b.clone()]).await;
            b.chain().set_syncing(true);

            mocker.produce_single_block(&NoCallbacks).await.unwrap();
            assert_eq!(count(&b, "engine_forkchoiceUpdatedV2"), expected_fcus, "safe slots {safe_slots}");
        }
    }

    #[tokio::test]
    async fn optimistic_after_safe_slots() {
        let cfg = ClMockerConfig::new(1, 1).with_payload_production_delay(Duration::ZERO);
        let mocker = mocker(cfg, shanghai(), &[engine("a", shanghai())]).await;
        assert!(!mocker.is_optimistically_syncing().await);
        mocker.produce_single_block(&NoCallbacks).await.unwrap();
        assert!(!mocker.is_optimistically_syncing().await);
        mocker.produce_single_block(&NoCallbacks).await.unwrap();
        assert!(mocker.is_optimistically_syncing().await);
    }

    #[tokio::test]
    async fn cancellation_stops_production() {
        let cancel = CancellationToken::new();
        let mocker = ClMocker::with_cancellation(config(), shanghai(), cancel.clone());
        mocker.add_engine_client(Arc::new(engine("a", shanghai()))).await;
        mocker.wait_for_ttd().await.unwrap();

        cancel.cancel();
        let err = mocker.produce_single_block(&NoCallbacks).await.unwrap_err();
        assert!(is_cancelled(&err));
    }

    struct Panics;

    #[async_trait]
    impl BlockProcessCallbacks for Panics {
        async fn on_get_payload(&self, _: &mut BlockContext<'_>) -> eyre::Result<()> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panicking_callback_is_reported() {
        let mocker = mocker(config(), shanghai(), &[engine("a", shanghai())]).await;
        let err = mocker.produce_single_block(&Panics).await.unwrap_err();
        match hivenet_types::error::harness_error(&err) {
            Some(HarnessError::CallbackPanic(ctx, msg)) => {
                assert_eq!(ctx.method.as_deref(), Some("on_get_payload"));
                assert_eq!(msg, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

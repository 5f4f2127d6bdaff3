//! Hooks into the block production cycle and the context they run in.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use alloy_primitives::B256;
use alloy_rpc_types_engine::{ExecutionPayload, ForkchoiceState, PayloadAttributes};
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::join_all;
use hivenet_execution::EngineClient;
use hivenet_types::{
    ErrorContext, ForkConfig, HarnessError,
    engine_api::{ForkchoiceUpdatedResponse, PayloadStatusKind, PayloadStatusV1},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::ClMockerState;

/// Per-step hooks of [`crate::ClMocker::produce_single_block`].
///
/// Every hook defaults to a no-op. An error returned from a hook aborts the
/// cycle and is surfaced to the caller unchanged.
#[async_trait]
pub trait BlockProcessCallbacks: Send + Sync {
    async fn on_payload_producer_selected(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_payload_attributes_generated(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_request_next_payload(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_get_payload(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_new_payload_broadcast(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_forkchoice_broadcast(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_safe_block_change(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_finalized_block_change(&self, _ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        Ok(())
    }
}

/// Produces blocks without interfering.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallbacks;

impl BlockProcessCallbacks for NoCallbacks {}

/// Runs engine calls under the mocker's cancellation token and RPC timeout.
#[derive(Clone, Debug)]
pub(crate) struct EngineCaller {
    pub(crate) cancel: CancellationToken,
    pub(crate) timeout: Duration,
}

impl EngineCaller {
    pub(crate) async fn call<T>(
        &self,
        client: &dyn EngineClient,
        method: &str,
        fut: impl Future<Output = eyre::Result<T>>,
    ) -> eyre::Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HarnessError::CtxCancelled.into()),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(res) => res,
                Err(_) => Err(HarnessError::RpcTimeout(ErrorContext::client(client.id()).with_method(method)).into()),
            },
        }
    }

    pub(crate) async fn sleep(&self, duration: Duration) -> eyre::Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HarnessError::CtxCancelled.into()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Response of one client to a `newPayload` broadcast.
#[derive(Debug)]
pub struct ExecutePayloadOutcome {
    pub client: String,
    pub result: eyre::Result<PayloadStatusV1>,
}

/// Response of one client to a `forkchoiceUpdated` broadcast.
#[derive(Debug)]
pub struct ForkchoiceOutcome {
    pub client: String,
    /// `None` when the client was skipped because it cannot import optimistically.
    pub result: Option<eyre::Result<ForkchoiceUpdatedResponse>>,
}

/// View of the mocker handed to callbacks for the duration of one block.
pub struct BlockContext<'a> {
    pub state: &'a mut ClMockerState,
    pub(crate) clients: &'a [Arc<dyn EngineClient>],
    pub(crate) statuses: &'a mut HashMap<String, PayloadStatusKind>,
    pub(crate) caller: &'a EngineCaller,
    pub(crate) forks: ForkConfig,
    pub(crate) safe_slots_to_import_optimistically: u64,
}

impl BlockContext<'_> {
    pub fn forks(&self) -> ForkConfig {
        self.forks
    }

    pub fn clients(&self) -> &[Arc<dyn EngineClient>] {
        self.clients
    }

    /// The client selected to build the block in flight.
    pub fn producer(&self) -> Option<Arc<dyn EngineClient>> {
        let id = self.state.next_block_producer.as_deref()?;
        self.clients.iter().find(|c| c.id() == id).cloned()
    }

    pub fn is_optimistically_syncing(&self) -> bool {
        is_optimistically_syncing(self.state, self.safe_slots_to_import_optimistically)
    }

    /// Sends `payload` to every client in parallel and records each status.
    pub async fn broadcast_new_payload(
        &mut self,
        payload: &ExecutionPayload,
        versioned_hashes: Option<Vec<B256>>,
        parent_beacon_block_root: Option<B256>,
        version: u8,
    ) -> eyre::Result<Vec<ExecutePayloadOutcome>> {
        let method = hivenet_execution::engine_api::capabilities::new_payload_method(version)?;
        let caller = self.caller;
        let calls = self.clients.iter().map(|client| {
            let hashes = versioned_hashes.clone();
            async move {
                let result = caller
                    .call(
                        client.as_ref(),
                        method,
                        client.new_payload(version, payload, hashes, parent_beacon_block_root),
                    )
                    .await;
                ExecutePayloadOutcome { client: client.id(), result }
            }
        });
        let outcomes = join_all(calls).await;
        for outcome in &outcomes {
            if let Ok(status) = &outcome.result {
                debug!(client = %outcome.client, status = %status.status, "newPayload response");
                self.statuses.insert(outcome.client.clone(), status.status);
            }
        }
        Ok(outcomes)
    }

    /// Sends a forkchoice update to every client allowed past the optimistic gate.
    ///
    /// A client receives the update when its last `newPayload` was `VALID`, or
    /// when the mocker is optimistic and the client answered `SYNCING` or
    /// `ACCEPTED` (or has not been sent a payload yet).
    pub async fn broadcast_forkchoice_updated(
        &mut self,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
        version: u8,
    ) -> eyre::Result<Vec<ForkchoiceOutcome>> {
        let optimistic = self.is_optimistically_syncing();
        let statuses = &*self.statuses;
        let send = |client: &Arc<dyn EngineClient>| match statuses.get(&client.id()) {
            Some(PayloadStatusKind::Valid) => true,
            Some(PayloadStatusKind::Syncing | PayloadStatusKind::Accepted) | None => optimistic,
            Some(_) => false,
        };
        broadcast_forkchoice(self.caller, self.clients, send, state, attributes, version).await
    }
}

pub(crate) fn is_optimistically_syncing(state: &ClMockerState, safe_slots: u64) -> bool {
    if safe_slots == 0 {
        return true;
    }
    let Some(first_pos) = state.first_pos_block_number else { return false };
    let executed = state.latest_executed_payload.as_ref().map_or(0, |p| p.as_v1().block_number);
    executed.saturating_sub(first_pos) >= safe_slots
}

pub(crate) async fn broadcast_forkchoice(
    caller: &EngineCaller,
    clients: &[Arc<dyn EngineClient>],
    send: impl Fn(&Arc<dyn EngineClient>) -> bool,
    state: ForkchoiceState,
    attributes: Option<PayloadAttributes>,
    version: u8,
) -> eyre::Result<Vec<ForkchoiceOutcome>> {
    let method = hivenet_execution::engine_api::capabilities::forkchoice_updated_method(version)?;
    let calls = clients.iter().map(|client| {
        let attributes = attributes.clone();
        let skip = !send(client);
        async move {
            if skip {
                debug!(client = %client.id(), "skipping forkchoiceUpdated: cannot import optimistically");
                return ForkchoiceOutcome { client: client.id(), result: None };
            }
            let result = caller
                .call(client.as_ref(), method, client.forkchoice_updated(version, state, attributes))
                .await;
            ForkchoiceOutcome { client: client.id(), result: Some(result) }
        }
    });
    Ok(join_all(calls).await)
}

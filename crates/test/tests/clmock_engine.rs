//! CL Mocker driving fake ELs over HTTP through execution handles.

mod common;

use std::{sync::Mutex, time::Duration};

use alloy_primitives::B256;
use async_trait::async_trait;
use color_eyre::{Result, eyre};
use common::{execution_client, fake_el, shanghai};
use hivenet_clmock::{BlockContext, BlockProcessCallbacks, ClMocker, ClMockerConfig, NoCallbacks};
use hivenet_execution::{BlockTag, EngineClient};
use hivenet_types::{
    engine_api::{PayloadStatusKind, PayloadStatusV1},
    payload::CustomPayloadData,
};
use tokio_util::sync::CancellationToken;

fn config() -> ClMockerConfig {
    ClMockerConfig::new(1, 0).with_payload_production_delay(Duration::ZERO)
}

/// Re-broadcasts a tampered copy of every built payload and keeps the first answer.
struct Rebroadcast {
    custom: CustomPayloadData,
    seen: Mutex<Vec<PayloadStatusV1>>,
}

impl Rebroadcast {
    fn new(custom: CustomPayloadData) -> Self {
        Self { custom, seen: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl BlockProcessCallbacks for Rebroadcast {
    async fn on_get_payload(&self, ctx: &mut BlockContext<'_>) -> eyre::Result<()> {
        let built = ctx.state.latest_payload_built.clone().ok_or_else(|| eyre::eyre!("no payload built"))?;
        let (payload, root) = self.custom.apply(&built, None)?;
        let version = ctx.forks().new_payload_version(payload.as_v1().timestamp);
        for outcome in ctx.broadcast_new_payload(&payload, None, root, version).await? {
            self.seen.lock().unwrap().push(outcome.result?);
        }
        Ok(())
    }
}

#[tokio::test]
async fn two_clients_follow_the_mocked_chain() -> Result<()> {
    let (fa, fb) = (fake_el(shanghai()).await?, fake_el(shanghai()).await?);
    let a = execution_client(0, &fa, false).await?;
    let b = execution_client(1, &fb, true).await?;

    let mocker = ClMocker::new(config(), shanghai());
    mocker.add_engine_client(a.clone()).await;
    mocker.add_engine_client(b.clone()).await;
    mocker.wait_for_ttd().await?;
    mocker.produce_blocks(4, &NoCallbacks).await?;

    let state = mocker.state().await;
    assert_eq!(state.latest_head_number, 4);
    for client in [&a, &b] {
        let head = client.header_by_number(BlockTag::Latest).await?.expect("head");
        assert_eq!(head.hash, state.latest_header_hash(), "{} diverged", client.id());
    }
    for client in [&a, &b] {
        assert_eq!(client.latest_forkchoice(), Some(state.latest_forkchoice));
    }
    fa.shutdown();
    fb.shutdown();
    Ok(())
}

#[tokio::test]
async fn altered_state_root_is_invalid_with_parent_as_latest_valid() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, true).await?;
    let mocker = ClMocker::new(config(), shanghai());
    mocker.add_engine_client(client.clone()).await;
    mocker.wait_for_ttd().await?;

    let parent = mocker.state().await.latest_header_hash();
    let cb = Rebroadcast::new(CustomPayloadData { state_root: Some(B256::repeat_byte(0x5a)), ..Default::default() });
    mocker.produce_single_block(&cb).await?;
    let head = mocker.state().await.latest_header_hash();

    let seen = cb.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, PayloadStatusKind::Invalid);
    assert_eq!(seen[0].latest_valid_hash, Some(parent));
    // The honest payload still became the head.
    assert_ne!(head, parent);
    fake.shutdown();
    Ok(())
}

#[tokio::test]
async fn unknown_parent_is_not_valid() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, false).await?;
    let mocker = ClMocker::new(config(), shanghai());
    mocker.add_engine_client(client).await;
    mocker.wait_for_ttd().await?;

    mocker.produce_single_block(&NoCallbacks).await?;
    let cb = Rebroadcast::new(CustomPayloadData { parent_hash: Some(B256::repeat_byte(0x77)), ..Default::default() });
    mocker.produce_single_block(&cb).await?;

    let seen = cb.seen.lock().unwrap().clone();
    assert!(
        matches!(seen[0].status, PayloadStatusKind::Syncing | PayloadStatusKind::Accepted),
        "unexpected status {}",
        seen[0].status
    );
    assert_eq!(mocker.state().await.latest_head_number, 2);
    fake.shutdown();
    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_ttd_wait() -> Result<()> {
    let cancel = CancellationToken::new();
    let mocker = ClMocker::with_cancellation(config(), shanghai(), cancel.clone());
    cancel.cancel();
    let err = mocker.wait_for_ttd().await.unwrap_err();
    assert!(matches!(
        hivenet_types::error::harness_error(&err),
        Some(hivenet_types::HarnessError::CtxCancelled)
    ));
    Ok(())
}

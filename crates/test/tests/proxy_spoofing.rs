//! Engine API traffic between an execution handle and a fake EL, routed
//! through the spoof proxy.

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use alloy_primitives::B256;
use alloy_rpc_types_engine::ForkchoiceState;
use color_eyre::Result;
use common::{execution_client, fake_el, shanghai};
use hivenet_execution::{BlockTag, is_engine_error};
use hivenet_proxy::message::request_param;
use hivenet_scenario::EngineEndpointMaxTimestampVerify;
use hivenet_types::{
    Spoof,
    engine_api::{PayloadStatusKind, PayloadStatusV1},
    error::INVALID_FORKCHOICE_STATE,
};

fn genesis_forkchoice(hash: B256) -> ForkchoiceState {
    ForkchoiceState { head_block_hash: hash, safe_block_hash: hash, finalized_block_hash: B256::ZERO }
}

#[tokio::test]
async fn forkchoice_flows_through_proxy_and_is_snooped() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, true).await?;
    let proxy = client.proxy().expect("proxied client has a proxy");

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    proxy.add_request_callback(
        "engine_forkchoiceUpdatedV2",
        Arc::new(move |raw: &[u8]| {
            if request_param::<ForkchoiceState>(raw, 0).is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            None
        }),
    );

    let genesis = client.header_by_number(BlockTag::Latest).await?.expect("genesis header").hash;
    let state = genesis_forkchoice(genesis);
    let resp = client.forkchoice_updated(2, state, None).await?;

    assert_eq!(resp.payload_status.status, PayloadStatusKind::Valid);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(client.latest_forkchoice(), Some(state));
    assert_eq!(fake.chain().lock().unwrap().calls(), ["engine_forkchoiceUpdatedV2"]);
    fake.shutdown();
    Ok(())
}

#[tokio::test]
async fn queued_response_spoof_applies_once() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, true).await?;
    let proxy = client.proxy().expect("proxied client has a proxy");
    let genesis = client.header_by_number(BlockTag::Latest).await?.expect("genesis header").hash;

    let syncing = PayloadStatusV1::new(PayloadStatusKind::Syncing, None);
    proxy.add_response(Spoof::forkchoice_response("engine_forkchoiceUpdatedV2", &syncing, None));

    let spoofed = client.forkchoice_updated(2, genesis_forkchoice(genesis), None).await?;
    assert_eq!(spoofed.payload_status.status, PayloadStatusKind::Syncing);
    let honest = client.forkchoice_updated(2, genesis_forkchoice(genesis), None).await?;
    assert_eq!(honest.payload_status.status, PayloadStatusKind::Valid);
    assert_eq!(honest.payload_status.latest_valid_hash, Some(genesis));
    fake.shutdown();
    Ok(())
}

#[tokio::test]
async fn request_spoof_surfaces_engine_error_code() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, true).await?;
    let proxy = client.proxy().expect("proxied client has a proxy");
    let genesis = client.header_by_number(BlockTag::Latest).await?.expect("genesis header").hash;

    proxy.add_request(Spoof::new("engine_forkchoiceUpdatedV2").with_field("safeBlockHash", B256::repeat_byte(0xab)));

    let err = client.forkchoice_updated(2, genesis_forkchoice(genesis), None).await.unwrap_err();
    assert!(is_engine_error(&err, INVALID_FORKCHOICE_STATE), "unexpected error: {err:#}");
    fake.shutdown();
    Ok(())
}

#[tokio::test]
async fn proxy_rejects_requests_without_jwt() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, true).await?;
    let proxy = client.proxy().expect("proxied client has a proxy");

    let res = reqwest::Client::new()
        .post(proxy.url())
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "engine_exchangeCapabilities", "params": [[]]}))
        .send()
        .await?;
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(fake.chain().lock().unwrap().calls().is_empty());
    fake.shutdown();
    Ok(())
}

#[tokio::test]
async fn expired_endpoint_verifier_catches_late_calls() -> Result<()> {
    let fake = fake_el(shanghai()).await?;
    let client = execution_client(0, &fake, true).await?;
    let proxy = client.proxy().expect("proxied client has a proxy");
    let genesis = client.header_by_number(BlockTag::Latest).await?.expect("genesis header");

    let verifier = EngineEndpointMaxTimestampVerify::new("engine_forkchoiceUpdatedV2", genesis.timestamp)?;
    verifier.add_to_proxy(&proxy);
    assert!(verifier.verify().is_ok());

    let attributes = alloy_rpc_types_engine::PayloadAttributes {
        timestamp: genesis.timestamp + 1,
        prev_randao: B256::ZERO,
        suggested_fee_recipient: Default::default(),
        withdrawals: Some(Vec::new()),
        parent_beacon_block_root: None,
    };
    client.forkchoice_updated(2, genesis_forkchoice(genesis.hash), Some(attributes)).await?;

    assert_eq!(verifier.violations().len(), 1);
    assert!(verifier.verify().is_err());
    fake.shutdown();
    Ok(())
}

//! Shared helpers for the in-process integration tests.
//!
//! Every test spawns its own fake ELs on free ports and drops them at the
//! end, so tests never share chain state.

#![allow(dead_code)]

use std::{net::Ipv4Addr, sync::Arc};

use alloy_primitives::U256;
use color_eyre::Result;
use hivenet_execution::{ExecutionClient, ExecutionClientConfig};
use hivenet_node::ExternalClient;
use hivenet_test_support::{FakeExecutionLayer, InMemoryChain};
use hivenet_types::{ForkConfig, constants::DEFAULT_JWT_SECRET};

pub(crate) const GENESIS: u64 = 1_700_000_000;

pub(crate) fn shanghai() -> ForkConfig {
    ForkConfig { shanghai_timestamp: Some(0), ..Default::default() }
}

pub(crate) async fn fake_el(forks: ForkConfig) -> Result<FakeExecutionLayer> {
    FakeExecutionLayer::spawn(InMemoryChain::new(GENESIS, forks), DEFAULT_JWT_SECRET).await
}

/// Execution handle for `fake`, optionally behind a spoof proxy on loopback.
pub(crate) async fn execution_client(index: usize, fake: &FakeExecutionLayer, proxied: bool) -> Result<Arc<ExecutionClient>> {
    let config = ExecutionClientConfig {
        ttd: Some(U256::ZERO),
        engine_port: fake.port(),
        rpc_port: fake.port(),
        proxy_host: proxied.then(|| Ipv4Addr::LOCALHOST.into()),
        ..ExecutionClientConfig::new(index)
    };
    let managed = Arc::new(ExternalClient::new("geth", Ipv4Addr::LOCALHOST.into()));
    let client = Arc::new(ExecutionClient::new(config, managed));
    client.start().await?;
    Ok(client)
}

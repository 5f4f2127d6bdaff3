//! Testnet composition against a recording simulator, with every EL handle
//! pointed at one in-process fake.

mod common;

use std::{net::Ipv4Addr, sync::Arc};

use color_eyre::Result;
use common::{GENESIS, fake_el};
use hivenet_genesis::{bls, keys::DEFAULT_VALIDATOR_MNEMONIC};
use hivenet_node::{NodeDefinition, NodeDefinitions, Simulator};
use hivenet_scenario::{
    ReorgSetup, Scenario,
    suites::{BaseScenario, BuilderScenario},
};
use hivenet_test_support::RecordingSimulator;
use hivenet_testnet::{Environment, PreparedTestnet};
use hivenet_types::{ForkConfig, ForkName};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

fn el_only(n: usize) -> NodeDefinitions {
    NodeDefinitions((0..n).map(|_| NodeDefinition::new("geth", "")).collect())
}

#[tokio::test]
#[serial]
async fn partitioned_nodes_converge_after_joiner_starts() -> Result<()> {
    let forks = ForkConfig::at_genesis(ForkName::Capella);
    let fake = fake_el(forks).await?;
    bls::init()?;

    let base = BaseScenario { node_count: 5, validator_count: 8, ..Default::default() };
    let mut config = base.testnet_config(&el_only(5))?;
    config.forks = forks;
    config.node_definitions = Some(ReorgSetup { chain_weights: vec![2, 1] }.apply(&config.node_definitions())?);

    let mut env = Environment::new(Arc::new(base.validator_keys(DEFAULT_VALIDATOR_MNEMONIC)?));
    env.proxy_host = Some(Ipv4Addr::LOCALHOST.into());
    env.engine_port = fake.port();
    env.rpc_port = fake.port();

    let prepared = PreparedTestnet::prepare_at(env, &config, GENESIS)?;
    let sim = Arc::new(RecordingSimulator::new());
    let testnet = prepared.create(sim.clone() as Arc<dyn Simulator>, CancellationToken::new()).await?;

    assert_eq!(testnet.nodes.len(), 5);
    assert_eq!(testnet.nodes.running().len(), 4);
    assert_eq!(sim.started_of_type("geth").len(), 4);
    let subnets: Vec<_> = testnet.nodes.iter().map(|n| n.definition.subnet.clone()).collect();
    assert_eq!(subnets, ["0", "1", "0", "1", ""]);

    let joiner = ReorgSetup::start_joiner(&testnet, testnet.cancel_token()).await?;
    assert_eq!(joiner, 4);
    assert_eq!(testnet.nodes.running().len(), 5);
    assert_eq!(sim.started_of_type("geth").len(), 5);

    testnet.verify_el_heads().await?;
    for el in testnet.nodes.execution_clients().iter() {
        assert!(el.proxy().is_some(), "el {} has no proxy", el.index());
    }

    testnet.stop().await;
    for el in testnet.nodes.execution_clients().iter() {
        assert!(el.proxy().is_none_or(|p| p.is_cancelled()));
    }
    fake.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn builder_endpoint_reaches_beacon_and_validator_clients() -> Result<()> {
    bls::init()?;
    let scenario = BuilderScenario::new(
        BaseScenario { node_count: 1, validator_count: 8, ..Default::default() },
        Ipv4Addr::new(10, 1, 0, 2).into(),
    );
    let clients = NodeDefinitions(vec![NodeDefinition::new("geth", "lighthouse-bn")]);
    let config = scenario.testnet_config(&clients)?;
    let env = Environment::new(Arc::new(scenario.validator_keys(DEFAULT_VALIDATOR_MNEMONIC)?));

    let prepared = PreparedTestnet::prepare_at(env, &config, GENESIS)?;
    let sim = Arc::new(RecordingSimulator::new());
    let testnet = prepared.create(sim.clone() as Arc<dyn Simulator>, CancellationToken::new()).await?;

    let bn = &sim.started_of_type("lighthouse-bn")[0].bundle;
    assert_eq!(bn.get("HIVE_ETH2_BUILDER_ENDPOINT"), Some("http://10.1.0.2:18550"));
    let vc = &sim.started_of_type("lighthouse-vc")[0].bundle;
    assert_eq!(vc.get("HIVE_ETH2_BUILDER_ENDPOINT"), Some("http://10.1.0.2:18550"));
    assert_eq!(vc.files.keys().filter(|k| k.starts_with("/hive/input/keystores/")).count(), 8);
    assert_eq!(testnet.validators.count(), 8);
    assert_eq!(testnet.spec().fork_epoch(ForkName::Deneb), 1);
    testnet.stop().await;
    Ok(())
}

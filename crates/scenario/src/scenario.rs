//! The five-step scenario lifecycle and the driver running it against a testnet.

use std::{
    collections::BTreeMap,
    future::Future,
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use color_eyre::eyre::{self, WrapErr, eyre};
use hivenet_genesis::{ValidatorKeys, bls, keys::DEFAULT_VALIDATOR_MNEMONIC};
use hivenet_node::{NodeDefinitions, Simulator};
use hivenet_testnet::{Config, Environment, PreparedTestnet, Testnet, Validators};
use hivenet_types::constants::{PORT_ENGINE, PORT_ETH_RPC};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::verifier::EngineEndpointMaxTimestampVerify;

/// Extra time granted on top of a scenario's own timeout.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// A test run as `pre-fork -> wait for fork -> post-fork -> post-fork wait -> verify`.
///
/// Every step gets the same [`ScenarioContext`]; state a later step needs is
/// kept there (validator groups, endpoint verifiers) or in the scenario itself.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> String;

    /// Budget for the whole run, not counting [`RunOptions::grace`].
    fn timeout(&self) -> Duration;

    /// Testnet layout given the client combinations under test.
    fn testnet_config(&self, clients: &NodeDefinitions) -> eyre::Result<Config>;

    fn validator_keys(&self, mnemonic: &str) -> eyre::Result<ValidatorKeys>;

    async fn execute_pre_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()>;

    async fn wait_for_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()>;

    async fn execute_post_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()>;

    async fn execute_post_fork_wait(&self, ctx: &ScenarioContext) -> eyre::Result<()>;

    async fn verify(&self, ctx: &ScenarioContext) -> eyre::Result<()>;
}

/// Running testnet plus what steps share with each other.
pub struct ScenarioContext {
    pub testnet: Testnet,
    pub config: Config,
    pub cancel: CancellationToken,
    groups: Mutex<BTreeMap<String, Validators>>,
    verifiers: Mutex<Vec<EngineEndpointMaxTimestampVerify>>,
}

impl ScenarioContext {
    pub fn new(testnet: Testnet, config: Config, cancel: CancellationToken) -> Self {
        Self { testnet, config, cancel, groups: Mutex::default(), verifiers: Mutex::default() }
    }

    /// Remembers a set of validators under `name` for a later step.
    pub fn set_group(&self, name: impl Into<String>, validators: Validators) {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).insert(name.into(), validators);
    }

    pub fn group(&self, name: &str) -> Option<Validators> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Installs `verifier` on the proxy of every EL, running or not yet started.
    ///
    /// ELs without a proxy are skipped with a warning.
    pub fn add_verifier(&self, verifier: EngineEndpointMaxTimestampVerify) {
        for el in self.testnet.nodes.execution_clients().iter() {
            match el.proxy() {
                Some(proxy) => verifier.add_to_proxy(&proxy),
                None => warn!(node = el.index(), endpoint = verifier.endpoint(), "No proxy to verify engine calls on"),
            }
        }
        self.verifiers.lock().unwrap_or_else(PoisonError::into_inner).push(verifier);
    }

    pub fn verifiers(&self) -> Vec<EngineEndpointMaxTimestampVerify> {
        self.verifiers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Fails with the first endpoint violation observed by any verifier.
    pub fn verify_endpoints(&self) -> eyre::Result<()> {
        self.verifiers().iter().try_for_each(EngineEndpointMaxTimestampVerify::verify)
    }

    /// Bounds `fut` to `slots` slots of wall-clock time.
    pub async fn within_slots<T>(
        &self,
        slots: u64,
        what: &str,
        fut: impl Future<Output = eyre::Result<T>>,
    ) -> eyre::Result<T> {
        let limit = self.testnet.slots_duration(slots);
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| eyre!("timed out after {slots} slots waiting for {what}"))?
    }

    pub async fn within_epochs<T>(
        &self,
        epochs: u64,
        what: &str,
        fut: impl Future<Output = eyre::Result<T>>,
    ) -> eyre::Result<T> {
        self.within_slots(epochs.saturating_mul(self.testnet.spec().slots_per_epoch), what, fut).await
    }
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Host for the per-EL spoof proxies; verifiers need one.
    pub proxy_host: Option<IpAddr>,
    pub log_engine_calls: bool,
    /// Client verbosity, 0 (error) to 5 (trace).
    pub log_level: u8,
    pub mnemonic: String,
    pub engine_port: u16,
    pub rpc_port: u16,
    /// Genesis at a fixed time instead of shortly after preparation.
    pub genesis_time: Option<u64>,
    pub grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            proxy_host: None,
            log_engine_calls: false,
            log_level: 3,
            mnemonic: DEFAULT_VALIDATOR_MNEMONIC.to_string(),
            engine_port: PORT_ENGINE,
            rpc_port: PORT_ETH_RPC,
            genesis_time: None,
            grace: DEFAULT_GRACE,
        }
    }
}

/// Prepares and creates the testnet, runs every step under one deadline,
/// checks the endpoint verifiers and stops the testnet whatever the outcome.
pub async fn run(
    scenario: &dyn Scenario,
    clients: &NodeDefinitions,
    simulator: Arc<dyn Simulator>,
    options: RunOptions,
) -> eyre::Result<()> {
    let name = scenario.name();
    let deadline = Instant::now() + scenario.timeout() + options.grace;
    bls::init()?;

    let keys = Arc::new(scenario.validator_keys(&options.mnemonic).wrap_err("failed to derive validator keys")?);
    let config = scenario.testnet_config(clients)?;
    let env = Environment {
        proxy_host: options.proxy_host,
        log_engine_calls: options.log_engine_calls,
        log_level: options.log_level,
        engine_port: options.engine_port,
        rpc_port: options.rpc_port,
        ..Environment::new(keys)
    };
    let prepared = match options.genesis_time {
        Some(time) => PreparedTestnet::prepare_at(env, &config, time)?,
        None => PreparedTestnet::prepare(env, &config)?,
    };

    let cancel = CancellationToken::new();
    let testnet = tokio::time::timeout_at(deadline, prepared.create(simulator, cancel.clone()))
        .await
        .map_err(|_| eyre!("scenario {name} timed out while starting the testnet"))??;
    let ctx = ScenarioContext::new(testnet, config, cancel.clone());

    info!(scenario = %name, nodes = ctx.testnet.nodes.len(), "Running scenario");
    let outcome = match tokio::time::timeout_at(deadline, steps(scenario, &ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(eyre!("scenario {name} timed out")),
    };

    ctx.testnet.stop().await;
    match &outcome {
        Ok(()) => info!(scenario = %name, "Scenario passed"),
        Err(e) => warn!(scenario = %name, "Scenario failed: {e:#}"),
    }
    outcome
}

async fn steps(scenario: &dyn Scenario, ctx: &ScenarioContext) -> eyre::Result<()> {
    info!("Executing pre-fork actions");
    scenario.execute_pre_fork(ctx).await.wrap_err("pre-fork")?;
    info!("Waiting for fork");
    scenario.wait_for_fork(ctx).await.wrap_err("waiting for fork")?;
    info!("Executing post-fork actions");
    scenario.execute_post_fork(ctx).await.wrap_err("post-fork")?;
    scenario.execute_post_fork_wait(ctx).await.wrap_err("post-fork wait")?;
    info!("Verifying");
    scenario.verify(ctx).await.wrap_err("verification")?;
    ctx.verify_endpoints()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use hivenet_genesis::derive_validator_keys;
    use hivenet_node::NodeDefinition;
    use hivenet_test_support::{FakeExecutionLayer, InMemoryChain, RecordingSimulator};
    use hivenet_types::{ForkConfig, ForkName, constants::DEFAULT_JWT_SECRET};

    use super::*;
    use crate::verifier::ENGINE_NEW_PAYLOAD_V2;

    const GENESIS: u64 = 1_700_000_000;

    #[derive(Default)]
    struct Recorder {
        steps: Mutex<Vec<&'static str>>,
        fail_verify: bool,
        hang_post_fork: bool,
    }

    impl Recorder {
        fn record(&self, step: &'static str) {
            self.steps.lock().unwrap().push(step);
        }
    }

    #[async_trait]
    impl Scenario for Recorder {
        fn name(&self) -> String {
            "recorder".into()
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(2)
        }

        fn testnet_config(&self, clients: &NodeDefinitions) -> eyre::Result<Config> {
            Ok(Config {
                forks: ForkConfig::at_genesis(ForkName::Capella),
                validator_count: Some(4),
                node_definitions: Some(clients.clone()),
                genesis_execution_accounts: Some(BTreeMap::new()),
                ..Default::default()
            })
        }

        fn validator_keys(&self, mnemonic: &str) -> eyre::Result<ValidatorKeys> {
            derive_validator_keys(mnemonic, 0, 4)
        }

        async fn execute_pre_fork(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
            ctx.add_verifier(EngineEndpointMaxTimestampVerify::new(ENGINE_NEW_PAYLOAD_V2, 10)?);
            ctx.set_group("all", ctx.testnet.validators.clone());
            self.record("pre_fork");
            Ok(())
        }

        async fn wait_for_fork(&self, _ctx: &ScenarioContext) -> eyre::Result<()> {
            self.record("wait_for_fork");
            Ok(())
        }

        async fn execute_post_fork(&self, _ctx: &ScenarioContext) -> eyre::Result<()> {
            self.record("post_fork");
            if self.hang_post_fork {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn execute_post_fork_wait(&self, _ctx: &ScenarioContext) -> eyre::Result<()> {
            self.record("post_fork_wait");
            Ok(())
        }

        async fn verify(&self, ctx: &ScenarioContext) -> eyre::Result<()> {
            self.record("verify");
            assert_eq!(ctx.group("all").map(|v| v.count()), Some(4));
            assert_eq!(ctx.verifiers().len(), 1);
            if self.fail_verify { Err(eyre!("heads differ")) } else { Ok(()) }
        }
    }

    async fn setup() -> (FakeExecutionLayer, NodeDefinitions, RunOptions) {
        let fake = FakeExecutionLayer::spawn(
            InMemoryChain::new(GENESIS, ForkConfig::at_genesis(ForkName::Capella)),
            DEFAULT_JWT_SECRET,
        )
        .await
        .unwrap();
        let options = RunOptions {
            proxy_host: Some(Ipv4Addr::LOCALHOST.into()),
            engine_port: fake.port(),
            rpc_port: fake.port(),
            genesis_time: Some(GENESIS),
            grace: Duration::ZERO,
            ..Default::default()
        };
        (fake, NodeDefinitions(vec![NodeDefinition::new("geth", "")]), options)
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let (fake, clients, options) = setup().await;
        let scenario = Recorder::default();
        run(&scenario, &clients, Arc::new(RecordingSimulator::new()), options).await.unwrap();
        assert_eq!(
            *scenario.steps.lock().unwrap(),
            ["pre_fork", "wait_for_fork", "post_fork", "post_fork_wait", "verify"]
        );
        fake.shutdown();
    }

    #[tokio::test]
    async fn failing_step_is_reported_with_its_name() {
        let (fake, clients, options) = setup().await;
        let scenario = Recorder { fail_verify: true, ..Default::default() };
        let err = run(&scenario, &clients, Arc::new(RecordingSimulator::new()), options).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("verification"));
        assert!(msg.contains("heads differ"));
        fake.shutdown();
    }

    #[tokio::test]
    async fn hung_step_times_out() {
        let (fake, clients, options) = setup().await;
        let scenario = Recorder { hang_post_fork: true, ..Default::default() };
        let err = run(&scenario, &clients, Arc::new(RecordingSimulator::new()), options).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(*scenario.steps.lock().unwrap(), ["pre_fork", "wait_for_fork", "post_fork"]);
        fake.shutdown();
    }
}

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use hivenet_genesis::{bls, derive_validator_keys, keys::DEFAULT_VALIDATOR_MNEMONIC};
use hivenet_testnet::{Config as TestnetConfig, Environment, PreparedTestnet};
use tracing::info;

use super::write_bundle;
use crate::config::LogLevel;

#[derive(Parser, Clone, Debug, PartialEq)]
pub struct GenesisCmd {
    /// Directory receiving `execution/`, `beacon/` and `validator/`
    #[arg(long, short, default_value = "genesis")]
    pub out: PathBuf,

    /// Unix time of genesis; defaults to shortly after now
    #[arg(long)]
    pub genesis_time: Option<u64>,

    /// Mnemonic the validator keys are derived from
    #[arg(long, default_value = DEFAULT_VALIDATOR_MNEMONIC)]
    pub mnemonic: String,
}

impl GenesisCmd {
    pub fn run(&self, testnet: &TestnetConfig, log_level: LogLevel) -> eyre::Result<PreparedTestnet> {
        bls::init()?;
        let mut config = testnet.clone();
        config.fill_defaults();
        let keys = derive_validator_keys(&self.mnemonic, 0, config.validator_count())?;

        let mut env = Environment::new(Arc::new(keys));
        env.log_level = log_level.client_verbosity();
        let prepared = match self.genesis_time {
            Some(time) => PreparedTestnet::prepare_at(env, &config, time)?,
            None => PreparedTestnet::prepare(env, &config)?,
        };

        for (name, bundle) in [
            ("execution", &prepared.execution_bundle),
            ("beacon", &prepared.beacon_bundle),
            ("validator", &prepared.validator_bundle),
        ] {
            let dir = self.out.join(name);
            let written = write_bundle(&dir, bundle).wrap_err_with(|| format!("failed to write {name} bundle"))?;
            info!(bundle = name, files = written, dir = %dir.display(), "Wrote start bundle");
        }
        info!(
            genesis_time = prepared.genesis_state.inner().genesis_time(),
            el_genesis = %prepared.execution_genesis.hash,
            validators = prepared.keys.len(),
            "Genesis prepared"
        );
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hivenet_genesis::consensus::GENESIS_STATE_PATH;
    use hivenet_node::{NodeDefinition, NodeDefinitions};
    use hivenet_types::{ForkConfig, ForkName};

    use super::*;

    #[test]
    fn writes_bundles_for_a_small_testnet() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = GenesisCmd {
            out: dir.path().to_path_buf(),
            genesis_time: Some(1_700_000_000),
            mnemonic: DEFAULT_VALIDATOR_MNEMONIC.into(),
        };
        let testnet = TestnetConfig {
            forks: ForkConfig::at_genesis(ForkName::Capella),
            validator_count: Some(8),
            node_definitions: Some(NodeDefinitions(vec![NodeDefinition::new("geth", "lighthouse-bn")])),
            genesis_execution_accounts: Some(BTreeMap::new()),
            ..Default::default()
        };

        let prepared = cmd.run(&testnet, LogLevel::Info).unwrap();
        assert_eq!(prepared.keys.len(), 8);
        let state = dir.path().join("beacon").join(GENESIS_STATE_PATH.trim_start_matches('/'));
        assert!(std::fs::metadata(state).unwrap().len() > 0);
        assert!(dir.path().join("execution").join("genesis.json").exists());
    }
}

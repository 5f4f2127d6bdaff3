//! Named scenario suites.

use std::net::IpAddr;

use crate::{reorg::ReorgSetup, scenario::Scenario};

pub mod base;
pub mod builder;
pub mod reorg;

pub use base::BaseScenario;
pub use builder::BuilderScenario;
pub use reorg::ReorgScenario;

/// Every scenario the harness knows, in run order. Builders listen on `builder_host`.
pub fn catalogue(builder_host: IpAddr) -> Vec<Box<dyn Scenario>> {
    let base = BaseScenario::default();
    let mut scenarios: Vec<Box<dyn Scenario>> = vec![
        Box::new(BaseScenario { wait_for_blobs: true, ..base.clone() }),
        Box::new(BaseScenario {
            name: "test-deneb-genesis".into(),
            deneb_genesis: true,
            wait_for_blobs: true,
            wait_for_finality: true,
            ..base.clone()
        }),
        Box::new(BaseScenario {
            name: "test-deneb-withdrawals-and-exits".into(),
            genesis_execution_withdrawal_credentials_shares: 2,
            exit_validators_share: 4,
            epochs_after_fork: 2,
            ..base.clone()
        }),
        Box::new(BaseScenario {
            name: "test-deneb-genesis-exited-and-slashed".into(),
            deneb_genesis: true,
            genesis_exited_shares: 8,
            genesis_slashed_shares: 8,
            wait_for_finality: true,
            ..base.clone()
        }),
        Box::new(BaseScenario {
            name: "test-deneb-single-validating-node".into(),
            node_count: 3,
            validating_node_count: Some(1),
            wait_for_finality: true,
            ..base.clone()
        }),
        Box::new(ReorgScenario::new(
            BaseScenario { name: "test-deneb-reorg-weighted".into(), node_count: 5, epochs_after_fork: 2, ..base.clone() },
            ReorgSetup { chain_weights: vec![2, 1] },
        )),
    ];

    let builder = |name: &str| {
        let mut scenario = BuilderScenario::new(
            BaseScenario { name: name.into(), wait_for_blobs: true, epochs_after_fork: 2, ..base.clone() },
            builder_host,
        );
        scenario.verify_missed_slots_count = true;
        scenario
    };
    scenarios.push(Box::new(builder("test-builders-deneb-sanity")));
    scenarios.push(Box::new(BuilderScenario {
        error_on_header_request: true,
        ..builder("test-builders-deneb-error-on-header-request")
    }));
    scenarios.push(Box::new(BuilderScenario {
        error_on_payload_reveal: true,
        ..builder("test-builders-deneb-error-on-payload-reveal")
    }));
    scenarios.push(Box::new(BuilderScenario {
        invalid_payload_version: true,
        ..builder("test-builders-deneb-invalid-payload-version")
    }));
    scenarios
}

//! Scenario driver for composed testnets.
//!
//! A [`Scenario`] configures a testnet, then walks it through pre-fork
//! activity, the fork transition, post-fork load and a verification step.
//! [`run`] bounds the whole walk by the scenario timeout and tears the
//! testnet down whatever the outcome.

#![forbid(unsafe_code)]

pub mod reorg;
pub mod scenario;
pub mod spammer;
pub mod suites;
pub mod tx;
pub mod verifier;

pub use hivenet_testnet::{BlobberConfig, BuilderConfig};
pub use reorg::ReorgSetup;
pub use scenario::{RunOptions, Scenario, ScenarioContext, run};
pub use spammer::{BlobSpammer, TransactionSpammer};
pub use tx::{TransactionCreator, TransactionType};
pub use verifier::{EngineEndpointMaxTimestampVerify, engine_version_verifiers};

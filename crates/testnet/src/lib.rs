//! Testnet composition and verification.
//!
//! [`PreparedTestnet`] turns a [`Config`] into genesis artifacts and client
//! start bundles, then [`PreparedTestnet::create`] launches the nodes through
//! a simulator. The resulting [`Testnet`] offers slot-paced waits for chain
//! milestones and the checks tests assert on.

#![forbid(unsafe_code)]

pub mod block_tree;
pub mod config;
#[cfg(test)]
mod fake_beacon;
pub mod health;
pub mod node;
pub mod prepared;
pub mod results;
pub mod testnet;
pub mod validators;
pub mod verification;

pub use block_tree::BlockTree;
pub use config::{BlobberAction, BlobberConfig, BuilderConfig, Config};
pub use node::{NodeBundle, Nodes};
pub use prepared::{Environment, PreparedTestnet};
pub use results::{NodeResult, Results};
pub use testnet::Testnet;
pub use validators::{BeaconCache, Validator, Validators};
pub use verification::VerificationSlot;

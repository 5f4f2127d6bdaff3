//! Beacon and validator client handles.
//!
//! [`BeaconClient`] wraps the standard beacon REST API with the typed reads the
//! verifications need; [`ValidatorClient`] owns a tranche of validator keys and
//! signs the operations tests submit to the pool.

#![forbid(unsafe_code)]

pub mod api;
pub mod beacon;
pub mod block;
pub mod responses;
pub mod state;
pub mod validator;

#[cfg(test)]
mod fake;

pub use api::{BeaconApi, BlockId, StateId, VersionedResponse};
pub use beacon::{BeaconClient, BeaconClientConfig, BeaconClients, ValidatorId, shorten};
pub use block::{BlobSidecar, BlockHeaderAndInfo, VersionedSignedBeaconBlock};
pub use responses::{FinalityCheckpoints, GenesisData, NodeIdentity, ValidatorBalance, ValidatorResponse};
pub use state::VersionedBeaconState;
pub use validator::{BlsToExecutionChangeInfo, ValidatorClient, ValidatorClients, signing_root};

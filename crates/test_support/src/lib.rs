//! Shared fixtures for hivenet's unit and integration tests.
//!
//! [`InMemoryChain`] is a tiny deterministic execution layer: it builds
//! payloads from attributes, validates `newPayload` against its own state-root
//! rule and tracks forkchoice. It is reachable in-process through
//! [`InMemoryEngine`] or over HTTP through [`FakeExecutionLayer`].

pub mod chain;
pub mod engine;
pub mod server;
pub mod simulator;

pub use chain::{InMemoryChain, StoredBlock, next_state_root};
pub use engine::InMemoryEngine;
pub use server::FakeExecutionLayer;
pub use simulator::{RecordingSimulator, StartedClient};

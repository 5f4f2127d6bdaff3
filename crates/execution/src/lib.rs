//! Execution client handles: JSON-RPC transports, the versioned Engine API,
//! `eth_*` queries and the [`ExecutionClient`] that owns a spoof proxy.

pub mod client;
pub mod engine_api;
pub mod error;
pub mod eth_rpc;
pub mod transport;

pub use client::{EngineClient, ExecutionClient, ExecutionClientConfig, ExecutionClients};
pub use engine_api::{EngineApiClient, EngineCapabilities};
pub use error::{ExecutionError, engine_error_code, is_engine_error};
pub use eth_rpc::{BlockTag, EthRpcClient};

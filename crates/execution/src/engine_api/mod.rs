pub mod capabilities;
pub mod client;

pub use capabilities::EngineCapabilities;
pub use client::EngineApiClient;

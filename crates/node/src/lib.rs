//! Client containers: the simulator facade, managed client lifecycle and node definitions.

#![forbid(unsafe_code)]

pub mod definition;
pub mod managed;
pub mod simulator;

pub use definition::{NodeDefinition, NodeDefinitions, beacon_node_to_validator, client_family};
pub use managed::{ExternalClient, HiveManagedClient, ManagedClient, OptionsGenerator, static_options};
pub use simulator::{ClientInfo, HiveSimulator, Simulator};

#![forbid(unsafe_code)]
#![deny(trivial_casts, trivial_numeric_casts)]
#![allow(missing_docs)]

pub mod aliases;
pub mod beacon;
pub mod bundle;
pub mod constants;
pub mod engine_api;
pub mod error;
pub mod fork;
pub mod payload;
pub mod spec;
pub mod spoof;
pub mod state;

pub use bundle::{Params, StartBundle};
pub use error::{ErrorContext, HarnessError};
pub use fork::{ForkConfig, ForkName};
pub use spec::BeaconSpec;
pub use spoof::Spoof;

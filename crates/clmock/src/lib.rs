//! A consensus-layer stand-in that drives execution clients through the
//! Engine API, one block at a time.

pub mod callbacks;
pub mod config;
pub mod history;
pub mod mocker;
pub mod state;

pub use callbacks::{BlockContext, BlockProcessCallbacks, ExecutePayloadOutcome, ForkchoiceOutcome, NoCallbacks};
pub use config::ClMockerConfig;
pub use history::{ExecutedPayloadHistory, make_next_withdrawals};
pub use mocker::ClMocker;
pub use state::ClMockerState;

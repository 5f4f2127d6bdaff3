use std::time::Duration;

pub const DEFAULT_SLOTS_TO_SAFE: u64 = 1;
pub const DEFAULT_SLOTS_TO_FINALIZED: u64 = 2;
pub const DEFAULT_PAYLOAD_PRODUCTION_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs of a [`crate::ClMocker`].
///
/// The timestamp increment and the optimistic-import threshold have no
/// defaults; callers always state them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClMockerConfig {
    /// Seconds added to the parent timestamp for every produced payload.
    pub block_timestamp_increment: u64,
    /// Blocks after the first PoS block before non-`VALID` clients still get forkchoice updates.
    /// Zero means always optimistic.
    pub safe_slots_to_import_optimistically: u64,
    pub slots_to_safe: u64,
    pub slots_to_finalized: u64,
    /// Pause between requesting a payload and fetching it.
    pub payload_production_delay: Duration,
    pub rpc_timeout: Duration,
    /// Timestamp of the first PoS payload, when it must not follow the increment rule.
    pub transition_payload_timestamp: Option<u64>,
    /// Seed of the prev-randao generator.
    pub seed: u64,
}

impl ClMockerConfig {
    pub fn new(block_timestamp_increment: u64, safe_slots_to_import_optimistically: u64) -> Self {
        Self {
            block_timestamp_increment,
            safe_slots_to_import_optimistically,
            slots_to_safe: DEFAULT_SLOTS_TO_SAFE,
            slots_to_finalized: DEFAULT_SLOTS_TO_FINALIZED,
            payload_production_delay: DEFAULT_PAYLOAD_PRODUCTION_DELAY,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            transition_payload_timestamp: None,
            seed: 0,
        }
    }

    pub fn with_slots_to_safe(mut self, slots: u64) -> Self {
        self.slots_to_safe = slots;
        self
    }

    pub fn with_slots_to_finalized(mut self, slots: u64) -> Self {
        self.slots_to_finalized = slots;
        self
    }

    pub fn with_payload_production_delay(mut self, delay: Duration) -> Self {
        self.payload_production_delay = delay;
        self
    }

    pub fn with_transition_payload_timestamp(mut self, timestamp: u64) -> Self {
        self.transition_payload_timestamp = Some(timestamp);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

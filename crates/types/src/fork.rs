//! Fork schedule shared by the EL (timestamps) and CL (epochs) sides.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::aliases::{BlockTimestamp, Epoch};

/// Consensus-layer fork names, ordered by activation.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ForkName {
    #[default]
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
}

impl ForkName {
    pub const ALL: [ForkName; 5] =
        [ForkName::Phase0, ForkName::Altair, ForkName::Bellatrix, ForkName::Capella, ForkName::Deneb];

    pub fn previous(self) -> Option<ForkName> {
        match self {
            ForkName::Phase0 => None,
            ForkName::Altair => Some(ForkName::Phase0),
            ForkName::Bellatrix => Some(ForkName::Altair),
            ForkName::Capella => Some(ForkName::Bellatrix),
            ForkName::Deneb => Some(ForkName::Capella),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForkName::Phase0 => "phase0",
            ForkName::Altair => "altair",
            ForkName::Bellatrix => "bellatrix",
            ForkName::Capella => "capella",
            ForkName::Deneb => "deneb",
        }
    }

    /// First byte of the fork version; the remaining bytes are filled by the spec builder.
    pub fn version_byte(self) -> u8 {
        self as u8
    }

    pub fn altair_enabled(self) -> bool {
        self >= ForkName::Altair
    }

    pub fn bellatrix_enabled(self) -> bool {
        self >= ForkName::Bellatrix
    }

    pub fn capella_enabled(self) -> bool {
        self >= ForkName::Capella
    }

    pub fn deneb_enabled(self) -> bool {
        self >= ForkName::Deneb
    }
}

impl fmt::Display for ForkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForkName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phase0" | "base" => Ok(ForkName::Phase0),
            "altair" => Ok(ForkName::Altair),
            "bellatrix" | "merge" => Ok(ForkName::Bellatrix),
            "capella" => Ok(ForkName::Capella),
            "deneb" => Ok(ForkName::Deneb),
            other => Err(format!("unknown fork name: {other}")),
        }
    }
}

/// Execution-layer fork used to pick Engine API method versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionFork {
    Paris,
    Shanghai,
    Cancun,
}

impl ExecutionFork {
    /// Engine API method version for this fork (V1, V2, V3).
    pub fn engine_version(self) -> u8 {
        match self {
            ExecutionFork::Paris => 1,
            ExecutionFork::Shanghai => 2,
            ExecutionFork::Cancun => 3,
        }
    }
}

/// The fork schedule of a testnet.
///
/// Epoch fields drive the beacon spec; the time fields are derived from them once
/// the beacon genesis time is known and drive Engine API versioning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkConfig {
    pub altair_fork_epoch: Option<Epoch>,
    pub bellatrix_fork_epoch: Option<Epoch>,
    pub capella_fork_epoch: Option<Epoch>,
    pub deneb_fork_epoch: Option<Epoch>,
    pub shanghai_timestamp: Option<BlockTimestamp>,
    pub cancun_timestamp: Option<BlockTimestamp>,
}

impl ForkConfig {
    /// Every fork active from genesis up to and including `fork`.
    pub fn at_genesis(fork: ForkName) -> Self {
        let at = |f: ForkName| (fork >= f).then_some(0);
        Self {
            altair_fork_epoch: at(ForkName::Altair),
            bellatrix_fork_epoch: at(ForkName::Bellatrix),
            capella_fork_epoch: at(ForkName::Capella),
            deneb_fork_epoch: at(ForkName::Deneb),
            shanghai_timestamp: None,
            cancun_timestamp: None,
        }
    }

    pub fn fork_epoch(&self, fork: ForkName) -> Option<Epoch> {
        match fork {
            ForkName::Phase0 => Some(0),
            ForkName::Altair => self.altair_fork_epoch,
            ForkName::Bellatrix => self.bellatrix_fork_epoch,
            ForkName::Capella => self.capella_fork_epoch,
            ForkName::Deneb => self.deneb_fork_epoch,
        }
    }

    /// Highest fork whose activation epoch is at or before `epoch`.
    pub fn fork_at_epoch(&self, epoch: Epoch) -> ForkName {
        ForkName::ALL
            .into_iter()
            .rev()
            .find(|f| self.fork_epoch(*f).is_some_and(|e| e <= epoch))
            .unwrap_or(ForkName::Phase0)
    }

    pub fn genesis_fork(&self) -> ForkName {
        self.fork_at_epoch(0)
    }

    pub fn is_shanghai(&self, timestamp: BlockTimestamp) -> bool {
        self.shanghai_timestamp.is_some_and(|t| timestamp >= t)
    }

    pub fn is_cancun(&self, timestamp: BlockTimestamp) -> bool {
        self.cancun_timestamp.is_some_and(|t| timestamp >= t)
    }

    pub fn execution_fork_at(&self, timestamp: BlockTimestamp) -> ExecutionFork {
        if self.is_cancun(timestamp) {
            ExecutionFork::Cancun
        } else if self.is_shanghai(timestamp) {
            ExecutionFork::Shanghai
        } else {
            ExecutionFork::Paris
        }
    }

    pub fn new_payload_version(&self, timestamp: BlockTimestamp) -> u8 {
        self.execution_fork_at(timestamp).engine_version()
    }

    pub fn get_payload_version(&self, timestamp: BlockTimestamp) -> u8 {
        self.execution_fork_at(timestamp).engine_version()
    }

    /// forkchoiceUpdated is versioned by the later of the head and attributes timestamps.
    pub fn forkchoice_updated_version(
        &self,
        head_timestamp: BlockTimestamp,
        attributes_timestamp: Option<BlockTimestamp>,
    ) -> u8 {
        let ts = attributes_timestamp.map_or(head_timestamp, |a| a.max(head_timestamp));
        self.execution_fork_at(ts).engine_version()
    }

    /// Fills the execution timestamps from the CL epochs.
    pub fn with_execution_timestamps(
        mut self,
        beacon_genesis_time: u64,
        seconds_per_slot: u64,
        slots_per_epoch: u64,
    ) -> Self {
        let epoch_time = |e: Epoch| {
            e.checked_mul(seconds_per_slot)
                .and_then(|v| v.checked_mul(slots_per_epoch))
                .and_then(|v| v.checked_add(beacon_genesis_time))
        };
        self.shanghai_timestamp = self.capella_fork_epoch.and_then(epoch_time);
        self.cancun_timestamp = self.deneb_fork_epoch.and_then(epoch_time);
        self
    }

    /// Field-wise join where `other` takes precedence.
    pub fn join(&self, other: &ForkConfig) -> ForkConfig {
        ForkConfig {
            altair_fork_epoch: other.altair_fork_epoch.or(self.altair_fork_epoch),
            bellatrix_fork_epoch: other.bellatrix_fork_epoch.or(self.bellatrix_fork_epoch),
            capella_fork_epoch: other.capella_fork_epoch.or(self.capella_fork_epoch),
            deneb_fork_epoch: other.deneb_fork_epoch.or(self.deneb_fork_epoch),
            shanghai_timestamp: other.shanghai_timestamp.or(self.shanghai_timestamp),
            cancun_timestamp: other.cancun_timestamp.or(self.cancun_timestamp),
        }
    }
}

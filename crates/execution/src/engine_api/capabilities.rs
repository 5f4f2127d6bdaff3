use std::{collections::HashSet, time::Duration};

use color_eyre::eyre;

use crate::error::ExecutionError;

pub const ENGINE_NEW_PAYLOAD_V1: &str = "engine_newPayloadV1";
pub const ENGINE_NEW_PAYLOAD_V2: &str = "engine_newPayloadV2";
pub const ENGINE_NEW_PAYLOAD_V3: &str = "engine_newPayloadV3";
pub const ENGINE_NEW_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(8);

pub const ENGINE_GET_PAYLOAD_V1: &str = "engine_getPayloadV1";
pub const ENGINE_GET_PAYLOAD_V2: &str = "engine_getPayloadV2";
pub const ENGINE_GET_PAYLOAD_V3: &str = "engine_getPayloadV3";
pub const ENGINE_GET_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(2);

pub const ENGINE_FORKCHOICE_UPDATED_V1: &str = "engine_forkchoiceUpdatedV1";
pub const ENGINE_FORKCHOICE_UPDATED_V2: &str = "engine_forkchoiceUpdatedV2";
pub const ENGINE_FORKCHOICE_UPDATED_V3: &str = "engine_forkchoiceUpdatedV3";
pub const ENGINE_FORKCHOICE_UPDATED_TIMEOUT: Duration = Duration::from_secs(8);

pub const ENGINE_EXCHANGE_CAPABILITIES: &str = "engine_exchangeCapabilities";
pub const ENGINE_EXCHANGE_CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(1);

pub const FORKCHOICE_UPDATED_METHODS: [&str; 3] =
    [ENGINE_FORKCHOICE_UPDATED_V1, ENGINE_FORKCHOICE_UPDATED_V2, ENGINE_FORKCHOICE_UPDATED_V3];
pub const NEW_PAYLOAD_METHODS: [&str; 3] =
    [ENGINE_NEW_PAYLOAD_V1, ENGINE_NEW_PAYLOAD_V2, ENGINE_NEW_PAYLOAD_V3];
pub const GET_PAYLOAD_METHODS: [&str; 3] =
    [ENGINE_GET_PAYLOAD_V1, ENGINE_GET_PAYLOAD_V2, ENGINE_GET_PAYLOAD_V3];

/// Engine API methods the harness drives.
pub static HIVENET_CAPABILITIES: &[&str] = &[
    ENGINE_NEW_PAYLOAD_V1,
    ENGINE_NEW_PAYLOAD_V2,
    ENGINE_NEW_PAYLOAD_V3,
    ENGINE_GET_PAYLOAD_V1,
    ENGINE_GET_PAYLOAD_V2,
    ENGINE_GET_PAYLOAD_V3,
    ENGINE_FORKCHOICE_UPDATED_V1,
    ENGINE_FORKCHOICE_UPDATED_V2,
    ENGINE_FORKCHOICE_UPDATED_V3,
];

fn versioned(methods: &[&'static str; 3], version: u8) -> eyre::Result<&'static str> {
    match version {
        1..=3 => Ok(methods[usize::from(version) - 1]),
        _ => Err(ExecutionError::MethodNotSupported(format!("{} version {version}", methods[0])).into()),
    }
}

pub fn forkchoice_updated_method(version: u8) -> eyre::Result<&'static str> {
    versioned(&FORKCHOICE_UPDATED_METHODS, version)
}

pub fn new_payload_method(version: u8) -> eyre::Result<&'static str> {
    versioned(&NEW_PAYLOAD_METHODS, version)
}

pub fn get_payload_method(version: u8) -> eyre::Result<&'static str> {
    versioned(&GET_PAYLOAD_METHODS, version)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub new_payload_v1: bool,
    pub new_payload_v2: bool,
    pub new_payload_v3: bool,
    pub forkchoice_updated_v1: bool,
    pub forkchoice_updated_v2: bool,
    pub forkchoice_updated_v3: bool,
    pub get_payload_v1: bool,
    pub get_payload_v2: bool,
    pub get_payload_v3: bool,
}

impl EngineCapabilities {
    pub fn from_response_strings(capabilities: HashSet<String>) -> Self {
        Self {
            new_payload_v1: capabilities.contains(ENGINE_NEW_PAYLOAD_V1),
            new_payload_v2: capabilities.contains(ENGINE_NEW_PAYLOAD_V2),
            new_payload_v3: capabilities.contains(ENGINE_NEW_PAYLOAD_V3),
            forkchoice_updated_v1: capabilities.contains(ENGINE_FORKCHOICE_UPDATED_V1),
            forkchoice_updated_v2: capabilities.contains(ENGINE_FORKCHOICE_UPDATED_V2),
            forkchoice_updated_v3: capabilities.contains(ENGINE_FORKCHOICE_UPDATED_V3),
            get_payload_v1: capabilities.contains(ENGINE_GET_PAYLOAD_V1),
            get_payload_v2: capabilities.contains(ENGINE_GET_PAYLOAD_V2),
            get_payload_v3: capabilities.contains(ENGINE_GET_PAYLOAD_V3),
        }
    }

    /// Highest method version supported across all three engine calls.
    pub fn max_version(&self) -> u8 {
        if self.new_payload_v3 && self.forkchoice_updated_v3 && self.get_payload_v3 {
            3
        } else if self.new_payload_v2 && self.forkchoice_updated_v2 && self.get_payload_v2 {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_method_names() {
        assert_eq!(new_payload_method(1).unwrap(), "engine_newPayloadV1");
        assert_eq!(forkchoice_updated_method(3).unwrap(), "engine_forkchoiceUpdatedV3");
        assert_eq!(get_payload_method(2).unwrap(), "engine_getPayloadV2");
        assert!(new_payload_method(0).is_err());
        assert!(get_payload_method(4).is_err());
    }

    #[test]
    fn max_version_needs_all_methods() {
        let caps: HashSet<String> = HIVENET_CAPABILITIES[..8].iter().map(|s| s.to_string()).collect();
        let caps = EngineCapabilities::from_response_strings(caps);
        assert!(!caps.forkchoice_updated_v3);
        assert_eq!(caps.max_version(), 2);
    }
}

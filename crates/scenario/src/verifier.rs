//! Engine API checks installed on the spoof proxies.

use std::sync::{Arc, Mutex, PoisonError};

use alloy_primitives::U64;
use color_eyre::eyre::{self, eyre};
use hivenet_proxy::{Proxy, RequestCallback, message::request_param};
use serde::Deserialize;
use tracing::{error, warn};

pub const ENGINE_NEW_PAYLOAD_V1: &str = "engine_newPayloadV1";
pub const ENGINE_NEW_PAYLOAD_V2: &str = "engine_newPayloadV2";
pub const ENGINE_FORKCHOICE_UPDATED_V1: &str = "engine_forkchoiceUpdatedV1";
pub const ENGINE_FORKCHOICE_UPDATED_V2: &str = "engine_forkchoiceUpdatedV2";

#[derive(Deserialize)]
struct Timestamped {
    timestamp: U64,
}

/// Which positional parameter of the request carries the timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimestampSource {
    /// The payload of `newPayload`.
    Payload,
    /// The attributes of `forkchoiceUpdated`, absent on head-only updates.
    Attributes,
}

impl TimestampSource {
    fn for_endpoint(endpoint: &str) -> Option<Self> {
        if endpoint.starts_with("engine_newPayloadV") {
            Some(Self::Payload)
        } else if endpoint.starts_with("engine_forkchoiceUpdatedV") {
            Some(Self::Attributes)
        } else {
            None
        }
    }

    fn timestamp(self, raw: &[u8]) -> eyre::Result<Option<u64>> {
        let index = match self {
            Self::Payload => 0,
            Self::Attributes => 1,
        };
        let value: Option<Timestamped> = request_param(raw, index)?;
        Ok(value.map(|v| v.timestamp.to()))
    }
}

/// Fails when `endpoint` is called with a timestamp at or past `expiring_timestamp`.
///
/// Used to police that a client moves to the next Engine API version once
/// the fork introducing it activates.
#[derive(Clone, Debug)]
pub struct EngineEndpointMaxTimestampVerify {
    endpoint: String,
    expiring_timestamp: u64,
    source: TimestampSource,
    violations: Arc<Mutex<Vec<String>>>,
}

impl EngineEndpointMaxTimestampVerify {
    pub fn new(endpoint: impl Into<String>, expiring_timestamp: u64) -> eyre::Result<Self> {
        let endpoint = endpoint.into();
        let source = TimestampSource::for_endpoint(&endpoint)
            .ok_or_else(|| eyre!("invalid endpoint for verification: {endpoint}"))?;
        Ok(Self { endpoint, expiring_timestamp, source, violations: Arc::default() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn expiring_timestamp(&self) -> u64 {
        self.expiring_timestamp
    }

    /// Inspects one request to the endpoint.
    pub fn check(&self, raw: &[u8]) {
        let violation = match self.source.timestamp(raw) {
            Ok(Some(ts)) if ts >= self.expiring_timestamp => format!(
                "received directive using expired endpoint {}: timestamp {ts} >= {}",
                self.endpoint, self.expiring_timestamp
            ),
            Ok(_) => return,
            Err(e) => format!("unable to read timestamp of {} request: {e}", self.endpoint),
        };
        error!(endpoint = %self.endpoint, "{violation}");
        self.violations.lock().unwrap_or_else(PoisonError::into_inner).push(violation);
    }

    pub fn callback(&self) -> RequestCallback {
        let verifier = self.clone();
        Arc::new(move |raw: &[u8]| {
            verifier.check(raw);
            None
        })
    }

    pub fn add_to_proxy(&self, proxy: &Proxy) {
        proxy.add_request_callback(self.endpoint.clone(), self.callback());
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn verify(&self) -> eyre::Result<()> {
        let violations = self.violations();
        match violations.first() {
            None => Ok(()),
            Some(first) => {
                if violations.len() > 1 {
                    warn!(endpoint = %self.endpoint, count = violations.len(), "Multiple expired endpoint calls");
                }
                Err(eyre!("{first}"))
            }
        }
    }
}

/// Verifiers for the V2 endpoints expiring at Cancun, and the V1 ones at Shanghai.
pub fn engine_version_verifiers(
    shanghai_time: Option<u64>,
    cancun_time: Option<u64>,
) -> eyre::Result<Vec<EngineEndpointMaxTimestampVerify>> {
    let mut verifiers = Vec::new();
    if let Some(shanghai) = shanghai_time {
        verifiers.push(EngineEndpointMaxTimestampVerify::new(ENGINE_NEW_PAYLOAD_V1, shanghai)?);
        verifiers.push(EngineEndpointMaxTimestampVerify::new(ENGINE_FORKCHOICE_UPDATED_V1, shanghai)?);
    }
    if let Some(cancun) = cancun_time {
        verifiers.push(EngineEndpointMaxTimestampVerify::new(ENGINE_NEW_PAYLOAD_V2, cancun)?);
        verifiers.push(EngineEndpointMaxTimestampVerify::new(ENGINE_FORKCHOICE_UPDATED_V2, cancun)?);
    }
    Ok(verifiers)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(method: &str, params: serde_json::Value) -> Vec<u8> {
        json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}).to_string().into_bytes()
    }

    #[test]
    fn new_payload_past_expiry_is_recorded() {
        let verifier = EngineEndpointMaxTimestampVerify::new(ENGINE_NEW_PAYLOAD_V2, 100).unwrap();
        verifier.check(&request(ENGINE_NEW_PAYLOAD_V2, json!([{"timestamp": "0x63"}])));
        verifier.verify().unwrap();

        verifier.check(&request(ENGINE_NEW_PAYLOAD_V2, json!([{"timestamp": "0x64"}])));
        let err = verifier.verify().unwrap_err();
        assert!(err.to_string().contains("timestamp 100 >= 100"));
    }

    #[test]
    fn head_only_forkchoice_update_is_ignored() {
        let verifier = EngineEndpointMaxTimestampVerify::new(ENGINE_FORKCHOICE_UPDATED_V1, 10).unwrap();
        let state = json!({"headBlockHash": "0x01", "safeBlockHash": "0x00", "finalizedBlockHash": "0x00"});
        verifier.check(&request(ENGINE_FORKCHOICE_UPDATED_V1, json!([state.clone()])));
        verifier.check(&request(ENGINE_FORKCHOICE_UPDATED_V1, json!([state.clone(), null])));
        assert!(verifier.violations().is_empty());

        let attributes = json!({"timestamp": "0xff", "prevRandao": "0x00", "suggestedFeeRecipient": "0x00"});
        (verifier.callback())(&request(ENGINE_FORKCHOICE_UPDATED_V1, json!([state, attributes])));
        assert_eq!(verifier.violations().len(), 1);
    }

    #[test]
    fn only_timestamped_endpoints_are_supported() {
        assert!(EngineEndpointMaxTimestampVerify::new("engine_getPayloadV2", 0).is_err());
        let verifiers = engine_version_verifiers(None, Some(50)).unwrap();
        let endpoints: Vec<_> = verifiers.iter().map(|v| v.endpoint()).collect();
        assert_eq!(endpoints, [ENGINE_NEW_PAYLOAD_V2, ENGINE_FORKCHOICE_UPDATED_V2]);
    }
}

//! Partial JSON overrides applied by the Engine API proxy.

use std::collections::BTreeMap;

use color_eyre::eyre::{self, eyre};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine_api::PayloadStatusV1;

/// A partial object merged into a JSON-RPC message before it is forwarded.
///
/// On requests the fields land in the first positional parameter, on responses
/// in the `result` object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spoof {
    pub method: String,
    pub fields: BTreeMap<String, Value>,
}

impl Spoof {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(name.into(), value);
        self
    }

    /// Overrides the status fields of a `newPayload` response.
    pub fn payload_status(method: impl Into<String>, status: &PayloadStatusV1) -> Self {
        Spoof::new(method)
            .with_field("status", status.status)
            .with_field("latestValidHash", status.latest_valid_hash)
            .with_field("validationError", &status.validation_error)
    }

    /// Overrides a whole `forkchoiceUpdated` response.
    pub fn forkchoice_response(
        method: impl Into<String>,
        status: &PayloadStatusV1,
        payload_id: Option<alloy_rpc_types_engine::PayloadId>,
    ) -> Self {
        Spoof::new(method).with_field("payloadStatus", status).with_field("payloadId", payload_id)
    }

    /// Merges two spoofs for the same method, `b` winning on conflicting fields.
    pub fn combine(a: Option<Spoof>, b: Option<Spoof>) -> eyre::Result<Option<Spoof>> {
        match (a, b) {
            (None, b) => Ok(b),
            (a, None) => Ok(a),
            (Some(mut a), Some(b)) => {
                if a.method != b.method {
                    return Err(eyre!("spoof methods don't match: {} != {}", a.method, b.method));
                }
                a.fields.extend(b.fields);
                Ok(Some(a))
            }
        }
    }

    fn merge_into(&self, target: &mut Value) {
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        if let Value::Object(obj) = target {
            for (k, v) in &self.fields {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    /// Applies the spoof to a JSON-RPC request, returning the re-serialised message.
    pub fn apply_to_request(&self, raw: &[u8]) -> eyre::Result<Vec<u8>> {
        let mut msg: Value = serde_json::from_slice(raw)?;
        let params = msg
            .get_mut("params")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| eyre!("request for {} has no positional params", self.method))?;
        if params.is_empty() {
            params.push(Value::Null);
        }
        self.merge_into(&mut params[0]);
        Ok(serde_json::to_vec(&msg)?)
    }

    /// Applies the spoof to a JSON-RPC response, returning the re-serialised message.
    pub fn apply_to_response(&self, raw: &[u8]) -> eyre::Result<Vec<u8>> {
        let mut msg: Value = serde_json::from_slice(raw)?;
        let obj = msg.as_object_mut().ok_or_else(|| eyre!("response is not a JSON object"))?;
        let result = obj.entry("result").or_insert(Value::Null);
        self.merge_into(result);
        obj.remove("error");
        Ok(serde_json::to_vec(&msg)?)
    }
}

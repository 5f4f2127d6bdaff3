//! Helpers for picking apart raw JSON-RPC messages seen by callbacks.

use color_eyre::eyre::{self, eyre};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

/// Returns the `method` of a raw request, if it has one.
pub fn request_method(raw: &[u8]) -> Option<String> {
    let msg: Value = serde_json::from_slice(raw).ok()?;
    msg.get("method")?.as_str().map(str::to_owned)
}

/// Returns the `id` of a raw message, `null` when absent or unparsable.
pub fn message_id(raw: &[u8]) -> Value {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|msg| msg.get("id").cloned())
        .unwrap_or(Value::Null)
}

/// Decodes positional parameter `index` of a request.
///
/// A missing trailing parameter decodes as `null`, so `Option<T>` targets
/// accept both `[state]` and `[state, null]`.
pub fn request_param<T: DeserializeOwned>(raw: &[u8], index: usize) -> eyre::Result<T> {
    let msg: Value = serde_json::from_slice(raw)?;
    let params = msg
        .get("params")
        .and_then(Value::as_array)
        .ok_or_else(|| eyre!("request has no positional params"))?;
    let value = params.get(index).cloned().unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

/// Decodes the `result` of a response, failing on JSON-RPC errors.
pub fn response_result<T: DeserializeOwned>(raw: &[u8]) -> eyre::Result<T> {
    let msg: Value = serde_json::from_slice(raw)?;
    if let Some(err) = msg.get("error") {
        if !err.is_null() {
            return Err(eyre!("response carries an error: {err}"));
        }
    }
    let result = msg.get("result").cloned().unwrap_or(Value::Null);
    Ok(serde_json::from_value(result)?)
}

/// Builds a JSON-RPC error response body.
pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Vec<u8> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    });
    body.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use alloy_rpc_types_engine::{ForkchoiceState, PayloadAttributes};

    use super::*;

    const FCU: &[u8] = br#"{"jsonrpc":"2.0","id":7,"method":"engine_forkchoiceUpdatedV1","params":[{"headBlockHash":"0x0000000000000000000000000000000000000000000000000000000000000001","safeBlockHash":"0x0000000000000000000000000000000000000000000000000000000000000000","finalizedBlockHash":"0x0000000000000000000000000000000000000000000000000000000000000000"}]}"#;

    #[test]
    fn reads_method_id_and_params() {
        assert_eq!(request_method(FCU).as_deref(), Some("engine_forkchoiceUpdatedV1"));
        assert_eq!(message_id(FCU), json!(7));

        let state: ForkchoiceState = request_param(FCU, 0).unwrap();
        assert_eq!(state.head_block_hash.0[31], 1);
        let attrs: Option<PayloadAttributes> = request_param(FCU, 1).unwrap();
        assert!(attrs.is_none());
    }

    #[test]
    fn response_result_surfaces_errors() {
        let ok = br#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#;
        assert_eq!(response_result::<String>(ok).unwrap(), "0x10");

        let err = error_response(json!(1), -38002, "invalid forkchoice state");
        assert!(response_result::<String>(&err).is_err());
        assert_eq!(message_id(&err), json!(1));
    }
}

//! JSON-RPC envelopes and error mapping
//!
//! Every failure the dispatcher can produce is expressed here as a JSON-RPC
//! error object; nothing below the transport ever turns into an HTTP error.

use rust_mcp_sdk::schema::{
    JsonrpcErrorResponse, JsonrpcResultResponse, RequestId, Result as McpResult, RpcError,
};
use serde_json::{json, Value};

use crate::adapters::AdapterError;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Unknown, closed, or not yet initialized session.
pub const SESSION_ERROR: i32 = -32000;
/// The caller's token lacks the scope the method needs.
pub const UNAUTHORIZED: i32 = -32001;

pub fn is_json_rpc_error(value: &Value) -> bool {
    value.get("error").is_some()
}

pub fn adapter_error_to_json_rpc(id: Option<Value>, err: &AdapterError) -> Value {
    let data = Some(json!({
        "code": err.code(),
        "message": err.to_string(),
    }));

    match err {
        AdapterError::UnknownTool(_) => {
            json_rpc_error_with_data(id, METHOD_NOT_FOUND, "Method not found", data)
        }
        AdapterError::InvalidArguments(_) => {
            json_rpc_error_with_data(id, INVALID_PARAMS, "Invalid params", data)
        }
        _ => json_rpc_error_with_data(id, INTERNAL_ERROR, "Internal error", data),
    }
}

pub fn session_not_found(id: Option<Value>) -> Value {
    json_rpc_error(id, SESSION_ERROR, "Session not found")
}

pub fn session_not_initialized(id: Option<Value>) -> Value {
    json_rpc_error(id, SESSION_ERROR, "Session not initialized")
}

pub fn insufficient_scope(id: Option<Value>, method: &str, scope: &str) -> Value {
    json_rpc_error_with_data(
        id,
        UNAUTHORIZED,
        "Unauthorized",
        Some(json!({
            "code": "insufficient_scope",
            "message": format!("{method} requires scope '{scope}'"),
        })),
    )
}

pub fn invalid_params(id: Option<Value>, message: impl Into<String>) -> Value {
    json_rpc_error_with_data(
        id,
        INVALID_PARAMS,
        "Invalid params",
        Some(json!({ "code": "invalid_params", "message": message.into() })),
    )
}

pub fn json_rpc_error(id: Option<Value>, code: i32, message: &str) -> Value {
    json_rpc_error_with_data(id, code, message, None)
}

pub fn json_rpc_error_with_data(
    id: Option<Value>,
    code: i32,
    message: &str,
    data: Option<Value>,
) -> Value {
    let response = JsonrpcErrorResponse::new(
        RpcError {
            code: i64::from(code),
            data: data.clone(),
            message: message.to_string(),
        },
        id.as_ref().and_then(value_to_request_id),
    );

    serde_json::to_value(response).unwrap_or_else(|_| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message, "data": data }
        })
    })
}

pub fn json_rpc_result(id: Option<Value>, result: Value) -> Value {
    if let Some(request_id) = id.as_ref().and_then(value_to_request_id) {
        let extra = result.as_object().cloned();
        let response = JsonrpcResultResponse::new(request_id, McpResult { meta: None, extra });
        if let Ok(value) = serde_json::to_value(response) {
            return value;
        }
    }

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub fn value_to_request_id(value: &Value) -> Option<RequestId> {
    if let Some(string_id) = value.as_str() {
        return Some(RequestId::String(string_id.to_string()));
    }

    value.as_i64().map(RequestId::Integer)
}

pub fn request_id_to_value(id: RequestId) -> Value {
    match id {
        RequestId::String(value) => Value::String(value),
        RequestId::Integer(value) => Value::Number(value.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tool_maps_to_method_not_found_with_code() {
        let response =
            adapter_error_to_json_rpc(Some(json!(7)), &AdapterError::UnknownTool("nope".into()));
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["error"]["code"], json!(METHOD_NOT_FOUND));
        assert_eq!(response["error"]["data"]["code"], json!("tool_not_found"));
    }

    #[test]
    fn adapter_failures_carry_diagnostics() {
        let response = adapter_error_to_json_rpc(
            Some(json!("req-1")),
            &AdapterError::PathRejected("'../x' escapes the configured root".into()),
        );
        assert_eq!(response["id"], json!("req-1"));
        assert_eq!(response["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(response["error"]["message"], json!("Internal error"));
        assert_eq!(response["error"]["data"]["code"], json!("path_rejected"));
        assert!(response["error"]["data"]["message"]
            .as_str()
            .expect("message")
            .contains("escapes"));
    }

    #[test]
    fn result_preserves_correlation_id() {
        let response = json_rpc_result(Some(json!(42)), json!({ "tools": [] }));
        assert_eq!(response["jsonrpc"], json!("2.0"));
        assert_eq!(response["id"], json!(42));
        assert_eq!(response["result"]["tools"], json!([]));
    }

    #[test]
    fn error_without_id_is_still_an_envelope() {
        let response = json_rpc_error(None, PARSE_ERROR, "Parse error");
        assert_eq!(response["error"]["code"], json!(PARSE_ERROR));
        assert!(is_json_rpc_error(&response));
    }
}

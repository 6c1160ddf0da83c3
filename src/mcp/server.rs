//! Protocol dispatcher
//!
//! Decodes JSON-RPC messages, enforces the session state machine and the
//! caller's scopes, routes methods to the session's bound adapter and wraps
//! every outcome in a response envelope carrying the request's id. Transport
//! I/O happens in the HTTP layer; this module only returns values.

use std::sync::Arc;

use chrono::Utc;
use rust_mcp_sdk::schema::{
    CallToolRequest, GetPromptRequest, Implementation, InitializeRequest, InitializeResult,
    JsonrpcMessage, JsonrpcRequest, ListPromptsRequest, ListResourcesRequest, ListToolsRequest,
    PingRequest, ReadResourceRequest, ServerCapabilities, ServerCapabilitiesPrompts,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::{
    adapters::{JsonObject, KnowledgeAdapter},
    auth::AuthContext,
    exchange::AccessRecord,
    logging::token_hint,
    mcp::{
        content::{prompt_result, resource_contents, tool_result},
        rpc::{
            adapter_error_to_json_rpc, insufficient_scope, invalid_params, is_json_rpc_error,
            json_rpc_error, json_rpc_error_with_data, json_rpc_result, request_id_to_value,
            session_not_found, session_not_initialized, INTERNAL_ERROR, INVALID_REQUEST,
            METHOD_NOT_FOUND,
        },
    },
    session::{Session, SessionPhase},
    AppState,
};

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Per-request facts gathered by the transport.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub auth: AuthContext,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
}

impl CallContext {
    pub fn new(auth: AuthContext) -> Self {
        Self {
            auth,
            user_agent: None,
            remote_addr: None,
        }
    }
}

/// Handles a single message or a batch. `None` means nothing to send back
/// (notifications only).
pub async fn handle_payload(
    state: &AppState,
    session: &Arc<Session>,
    call: &CallContext,
    payload: Value,
) -> Option<Value> {
    match payload {
        Value::Array(items) => {
            if items.is_empty() {
                return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
            }

            let mut responses = Vec::new();
            for item in items {
                if let Some(response) = handle_json_rpc_value(state, session, call, item).await {
                    responses.push(response);
                }
            }

            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        payload => handle_json_rpc_value(state, session, call, payload).await,
    }
}

/// Answers a payload that arrived without a usable session: every request
/// gets "Session not found", notifications get nothing.
pub fn reject_without_session(payload: &Value) -> Option<Value> {
    let reject = |item: &Value| -> Option<Value> {
        let id = item.get("id").filter(|id| !id.is_null())?;
        Some(session_not_found(Some(id.clone())))
    };

    match payload {
        Value::Array(items) => {
            let responses: Vec<Value> = items.iter().filter_map(reject).collect();
            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        Value::Object(_) => reject(payload).or_else(|| {
            payload
                .get("method")
                .is_none()
                .then(|| json_rpc_error(None, INVALID_REQUEST, "Invalid Request"))
        }),
        _ => Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request")),
    }
}

/// True when the payload (or any batch member) is an `initialize` request.
pub fn contains_initialize(payload: &Value) -> bool {
    let is_initialize = |item: &Value| item.get("method").and_then(Value::as_str) == Some("initialize");
    match payload {
        Value::Array(items) => items.iter().any(is_initialize),
        item => is_initialize(item),
    }
}

pub async fn handle_json_rpc_value(
    state: &AppState,
    session: &Arc<Session>,
    call: &CallContext,
    payload: Value,
) -> Option<Value> {
    if !payload.is_object() {
        return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
    }

    let request_id = payload.get("id").cloned();
    let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(_) => return Some(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request")),
    };

    match parsed {
        JsonrpcMessage::Request(request) => {
            if let Err(error_response) = validate_request_shape(&request) {
                return Some(error_response);
            }

            let request_id = request_id_to_value(request.id);
            if request.method.trim().is_empty() {
                return Some(json_rpc_error(Some(request_id), INVALID_REQUEST, "Invalid Request"));
            }

            Some(
                handle_json_rpc_request(
                    state,
                    session,
                    call,
                    Some(request_id),
                    request.method,
                    request.params.map(Value::Object),
                )
                .await,
            )
        }
        JsonrpcMessage::Notification(notification) => {
            if !notification.method.trim().is_empty() {
                let _ = handle_json_rpc_request(
                    state,
                    session,
                    call,
                    None,
                    notification.method,
                    notification.params.map(Value::Object),
                )
                .await;
            }
            None
        }
        JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => {
            Some(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request"))
        }
    }
}

pub fn validate_request_shape(request: &JsonrpcRequest) -> Result<(), Value> {
    let request_id = Some(request_id_to_value(request.id.clone()));
    let Ok(payload) = serde_json::to_value(request) else {
        return Err(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request"));
    };

    let valid = match request.method.as_str() {
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "resources/list" => serde_json::from_value::<ListResourcesRequest>(payload).is_ok(),
        "resources/read" => serde_json::from_value::<ReadResourceRequest>(payload).is_ok(),
        "prompts/list" => serde_json::from_value::<ListPromptsRequest>(payload).is_ok(),
        "prompts/get" => serde_json::from_value::<GetPromptRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(invalid_params(request_id, format!("malformed {} request", request.method)))
    }
}

pub async fn handle_json_rpc_request(
    state: &AppState,
    session: &Arc<Session>,
    call: &CallContext,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
) -> Value {
    let _ordering = session.lock_requests().await;
    let audit_params = redact_audit_params(params.as_ref());

    let response = route(state, session, call, id, &method, params.as_ref()).await;

    if let Some(packet_key_hint) = &session.binding().packet_key_hint {
        record_packet_access(state, session, call, packet_key_hint, &method, params.as_ref()).await;
    }

    info!(
        session = %token_hint(session.token()),
        exchange = %session.binding().slug,
        principal = call.auth.principal.as_deref().unwrap_or("anonymous"),
        method = %method,
        params = %audit_params,
        outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
        "mcp action audited"
    );

    response
}

async fn route(
    state: &AppState,
    session: &Arc<Session>,
    call: &CallContext,
    id: Option<Value>,
    method: &str,
    params: Option<&Value>,
) -> Value {
    if session.phase() == SessionPhase::Closed {
        return session_not_found(id);
    }
    if let Some(scope) = call.auth.missing_scope_for(method) {
        return insufficient_scope(id, method, scope);
    }

    match method {
        "initialize" => return initialize(state, session, id, params),
        "ping" => return json_rpc_result(id, json!({})),
        _ if method.starts_with("notifications/") => return json_rpc_result(id, json!({})),
        _ => {}
    }

    let adapter = match session.adapter() {
        Some(adapter) if session.phase() == SessionPhase::Active => adapter,
        _ => return session_not_initialized(id),
    };

    match method {
        "tools/list" => json_rpc_result(id, json!({ "tools": adapter.list_tools().await })),
        "tools/call" => call_tool(adapter.as_ref(), id, params).await,
        "resources/list" => match adapter.list_resources().await {
            Ok(resources) => json_rpc_result(id, json!({ "resources": resources })),
            Err(err) => adapter_error_to_json_rpc(id, &err),
        },
        "resources/read" => read_resource(adapter.as_ref(), id, params).await,
        "prompts/list" => json_rpc_result(id, json!({ "prompts": adapter.list_prompts().await })),
        "prompts/get" => get_prompt(adapter.as_ref(), id, params).await,
        _ => json_rpc_error(id, METHOD_NOT_FOUND, "Method not found"),
    }
}

fn initialize(
    state: &AppState,
    session: &Arc<Session>,
    id: Option<Value>,
    params: Option<&Value>,
) -> Value {
    let protocol_version = match negotiate_protocol_version(params) {
        Ok(version) => version,
        Err(message) => return invalid_params(id, message),
    };

    let binding = session.binding();
    let Some(adapter) = state.provisioner.adapter_for(binding.exchange_id) else {
        return json_rpc_error_with_data(
            id,
            INTERNAL_ERROR,
            "Internal error",
            Some(json!({
                "code": "exchange_unavailable",
                "message": format!("exchange '{}' is not active", binding.slug),
            })),
        );
    };

    let client_info = params.and_then(|params| params.get("clientInfo")).cloned();
    if !session.activate(adapter, protocol_version.to_string(), client_info) {
        return session_not_found(id);
    }

    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Knowledge Exchange".to_string()),
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            resources: Some(ServerCapabilitiesResources {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
            prompts: Some(ServerCapabilitiesPrompts {
                list_changed: Some(false),
            }),
            ..Default::default()
        },
        protocol_version: protocol_version.to_string(),
        instructions: Some(format!(
            "Knowledge exchange '{}'. Use `search` to find items and `fetch` with a returned id to read one.",
            binding.slug
        )),
        meta: None,
    };

    match serde_json::to_value(initialize_result) {
        Ok(result) => json_rpc_result(id, result),
        Err(err) => json_rpc_error_with_data(
            id,
            INTERNAL_ERROR,
            "Internal error",
            Some(json!({ "code": "serialization_failed", "message": err.to_string() })),
        ),
    }
}

/// The offered version when supported, otherwise the latest one we speak.
pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, String> {
    let offered = params
        .and_then(|params| params.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| "initialize params.protocolVersion is required".to_string())?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|supported| *supported == offered)
        .unwrap_or(LATEST_PROTOCOL_VERSION))
}

fn arguments_object(params: Option<&Value>) -> Result<JsonObject, String> {
    match params.and_then(|params| params.get("arguments")) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(arguments)) => Ok(arguments.clone()),
        Some(_) => Err("arguments must be an object".to_string()),
    }
}

fn required_param<'a>(params: Option<&'a Value>, key: &str) -> Result<&'a str, String> {
    params
        .and_then(|params| params.get(key))
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| format!("params.{key} is required"))
}

async fn call_tool(
    adapter: &dyn KnowledgeAdapter,
    id: Option<Value>,
    params: Option<&Value>,
) -> Value {
    let (name, arguments) = match required_param(params, "name")
        .and_then(|name| Ok((name, arguments_object(params)?)))
    {
        Ok(parsed) => parsed,
        Err(message) => return invalid_params(id, message),
    };

    match adapter.execute_tool(name, arguments).await {
        Ok(output) => json_rpc_result(id, tool_result(output)),
        Err(err) => {
            warn!(tool = name, error = %err, "tool call failed");
            adapter_error_to_json_rpc(id, &err)
        }
    }
}

async fn read_resource(
    adapter: &dyn KnowledgeAdapter,
    id: Option<Value>,
    params: Option<&Value>,
) -> Value {
    let uri = match required_param(params, "uri") {
        Ok(uri) => uri,
        Err(message) => return invalid_params(id, message),
    };

    match adapter.read_resource(uri).await {
        Ok(contents) => json_rpc_result(id, json!({ "contents": [resource_contents(&contents)] })),
        Err(err) => adapter_error_to_json_rpc(id, &err),
    }
}

async fn get_prompt(
    adapter: &dyn KnowledgeAdapter,
    id: Option<Value>,
    params: Option<&Value>,
) -> Value {
    let (name, arguments) = match required_param(params, "name")
        .and_then(|name| Ok((name, arguments_object(params)?)))
    {
        Ok(parsed) => parsed,
        Err(message) => return invalid_params(id, message),
    };

    match adapter.get_prompt(name, &arguments).await {
        Ok(prompt) => json_rpc_result(id, prompt_result(prompt)),
        Err(err) => adapter_error_to_json_rpc(id, &err),
    }
}

async fn record_packet_access(
    state: &AppState,
    session: &Session,
    call: &CallContext,
    packet_key_hint: &str,
    method: &str,
    params: Option<&Value>,
) {
    let resource = ["name", "uri"]
        .iter()
        .find_map(|key| params.and_then(|params| params.get(*key)).and_then(Value::as_str))
        .map(str::to_string);

    let record = AccessRecord {
        exchange_id: session.binding().exchange_id,
        packet_key_hint: packet_key_hint.to_string(),
        method: method.to_string(),
        resource,
        user_agent: call.user_agent.clone(),
        remote_addr: call.remote_addr.clone(),
        at: Utc::now(),
    };

    info!(
        exchange = %session.binding().slug,
        packet_key = %record.packet_key_hint,
        method = %record.method,
        resource = record.resource.as_deref().unwrap_or("-"),
        "packet key access"
    );
    if let Err(err) = state.store.record_access(record).await {
        warn!(error = %err, "failed to record packet key access");
    }
}

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["token", "secret", "password", "credential"];
const SENSITIVE_KEYS: &[&str] = &["authorization", "bearer", "api_key", "apikey", "packet_key"];

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let redacted = if is_sensitive_key(key) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        redact_audit_value(item)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&normalized.as_str())
        || SENSITIVE_KEY_FRAGMENTS
            .iter()
            .any(|fragment| normalized.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_sensitive_fields_in_audit_params() {
        let params = json!({
            "name": "search",
            "arguments": {
                "query": "roadmap",
                "access_token": "should-not-appear",
                "api_key": "should-not-appear",
                "nested": { "client_secret": "should-not-appear" }
            }
        });

        let redacted = redact_audit_params(Some(&params));

        assert_eq!(redacted["name"], json!("search"));
        assert_eq!(redacted["arguments"]["query"], json!("roadmap"));
        assert_eq!(redacted["arguments"]["access_token"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["api_key"], json!("[REDACTED]"));
        assert_eq!(
            redacted["arguments"]["nested"]["client_secret"],
            json!("[REDACTED]")
        );
    }

    #[test]
    fn negotiates_each_supported_version() {
        for version in SUPPORTED_PROTOCOL_VERSIONS {
            let params = json!({ "protocolVersion": version });
            assert_eq!(negotiate_protocol_version(Some(&params)), Ok(*version));
        }
    }

    #[test]
    fn unsupported_version_gets_the_latest() {
        let params = json!({ "protocolVersion": "2031-01-01" });
        assert_eq!(
            negotiate_protocol_version(Some(&params)),
            Ok(LATEST_PROTOCOL_VERSION)
        );
        assert!(negotiate_protocol_version(Some(&json!({}))).is_err());
    }

    #[test]
    fn requests_without_session_get_session_errors() {
        let batch = json!([
            { "jsonrpc": "2.0", "id": 1, "method": "tools/list" },
            { "jsonrpc": "2.0", "method": "notifications/initialized" },
            { "jsonrpc": "2.0", "id": "b", "method": "ping" }
        ]);
        let responses = reject_without_session(&batch).expect("two responses");
        let responses = responses.as_array().expect("array");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], json!(-32000));
        assert_eq!(responses[1]["id"], json!("b"));

        assert!(reject_without_session(
            &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
        )
        .is_none());
    }

    #[test]
    fn detects_initialize_inside_batches() {
        assert!(contains_initialize(&json!({ "method": "initialize" })));
        assert!(contains_initialize(&json!([{ "method": "ping" }, { "method": "initialize" }])));
        assert!(!contains_initialize(&json!({ "method": "tools/list" })));
    }
}

//! Axum handlers for the metadata routes and the single-shot transport.
//!
//! Exchanges are addressed by slug (`/x/{slug}/...`) or by a single-use
//! packet key (`/p/{packet_key}/...`). Requests for a sandboxed exchange are
//! redirected to the sandbox instance.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, Path, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::{
    adapters::HealthStatus,
    auth::AuthContext,
    errors::AppError,
    exchange::Exchange,
    logging::token_hint,
    mcp::{
        rpc::{json_rpc_error, PARSE_ERROR},
        server::{contains_initialize, handle_payload, reject_without_session, CallContext},
    },
    registry::BackendTypeInfo,
    session::{ExchangeBinding, Session, SessionPhase},
    AppState,
};

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub protocol_versions: &'static [&'static str],
    pub mcp_endpoint: &'static str,
    pub sse_endpoint: &'static str,
    pub packet_mcp_endpoint: &'static str,
    pub packet_sse_endpoint: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.len(),
    })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        protocol_versions: crate::mcp::server::SUPPORTED_PROTOCOL_VERSIONS,
        mcp_endpoint: "/x/{slug}/mcp",
        sse_endpoint: "/x/{slug}/sse",
        packet_mcp_endpoint: "/p/{packet_key}/mcp",
        packet_sse_endpoint: "/p/{packet_key}/sse",
    })
}

pub async fn backends(State(state): State<AppState>) -> Json<Vec<BackendTypeInfo>> {
    Json(state.registry.supported_types())
}

/// How a request names its exchange.
#[derive(Debug, Clone)]
pub enum Entry {
    Slug(String),
    PacketKey(String),
}

pub(crate) async fn exchange_by_slug(state: &AppState, slug: &str) -> Result<Exchange, AppError> {
    state
        .store
        .get_by_slug(slug)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
        .ok_or_else(|| AppError::not_found("exchange_not_found", format!("no exchange '{slug}'")))
}

pub(crate) async fn redeem_packet_key(state: &AppState, key: &str) -> Result<Exchange, AppError> {
    let exchange = state
        .store
        .redeem_packet_key(key)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
        .ok_or_else(|| {
            AppError::not_found("packet_key_invalid", "packet key is invalid or already used")
        })?;
    tracing::info!(exchange = %exchange.slug, packet_key = %token_hint(key), "packet key redeemed");
    Ok(exchange)
}

/// `307` to the sandbox serving this exchange, when it is not served here.
pub(crate) fn sandbox_redirect(state: &AppState, exchange: &Exchange, path_and_query: &str) -> Option<Response> {
    let attachment = exchange.sandbox.as_ref()?;
    if state.provisioner.adapter_for(exchange.id).is_some() {
        return None;
    }
    let location = format!("http://{}:{}{path_and_query}", state.sandbox_host, attachment.port);
    tracing::debug!(exchange = %exchange.slug, location = %location, "redirecting to sandbox");
    Some(Redirect::temporary(&location).into_response())
}

pub(crate) fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

pub(crate) fn binding_for(exchange: &Exchange, entry: &Entry) -> ExchangeBinding {
    ExchangeBinding {
        exchange_id: exchange.id,
        slug: exchange.slug.clone(),
        packet_key_hint: match entry {
            Entry::Slug(_) => None,
            Entry::PacketKey(key) => Some(token_hint(key)),
        },
    }
}

/// A live session presented on `entry`. Sessions are only valid on the
/// route family that created them.
pub(crate) fn session_for_entry(state: &AppState, token: &str, entry: &Entry) -> Option<Arc<Session>> {
    let session = state.sessions.resolve(token)?;
    let binding = session.binding();
    let matches = match entry {
        Entry::Slug(slug) => binding.slug == *slug && binding.packet_key_hint.is_none(),
        Entry::PacketKey(key) => binding.packet_key_hint.as_deref() == Some(token_hint(key).as_str()),
    };
    matches.then_some(session)
}

pub(crate) fn call_context(parts: &Parts) -> CallContext {
    let auth = parts
        .extensions
        .get::<AuthContext>()
        .cloned()
        .unwrap_or_else(AuthContext::discovery);
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let remote_addr = header("x-forwarded-for")
        .and_then(|value| value.split(',').next().map(|first| first.trim().to_string()))
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });

    CallContext {
        auth,
        user_agent: header(header::USER_AGENT.as_str()),
        remote_addr,
    }
}

pub(crate) fn session_header(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) async fn read_body(body: Body) -> Result<Bytes, AppError> {
    to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::bad_request("body_too_large", "request body exceeds the size limit"))
}

fn json_response(payload: Option<Value>, session_token: Option<&str>) -> Response {
    let mut response = match payload {
        Some(payload) => (StatusCode::OK, Json(payload)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Some(token) = session_token.and_then(|token| HeaderValue::from_str(token).ok()) {
        response.headers_mut().insert(HEADER_SESSION_ID, token);
    }
    response
}

pub async fn exchange_mcp_post(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    single_shot(state, Entry::Slug(slug), request).await
}

pub async fn packet_mcp_post(
    State(state): State<AppState>,
    Path(packet_key): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    single_shot(state, Entry::PacketKey(packet_key), request).await
}

async fn single_shot(state: AppState, entry: Entry, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let call = call_context(&parts);
    let token = session_header(&parts);

    let slug_exchange = match &entry {
        Entry::Slug(slug) => {
            let exchange = exchange_by_slug(&state, slug).await?;
            if let Some(redirect) = sandbox_redirect(&state, &exchange, &path_and_query(&parts.uri)) {
                return Ok(redirect);
            }
            Some(exchange)
        }
        Entry::PacketKey(_) => None,
    };

    let body = read_body(body).await?;
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return Ok(json_response(Some(json_rpc_error(None, PARSE_ERROR, "Parse error")), None)),
    };

    let (session, created) = match token {
        Some(token) => match session_for_entry(&state, &token, &entry) {
            Some(session) => (session, false),
            None => return Ok(json_response(reject_without_session(&payload), None)),
        },
        None if contains_initialize(&payload) => {
            let exchange = match (&entry, slug_exchange) {
                (_, Some(exchange)) => exchange,
                (Entry::Slug(slug), None) => exchange_by_slug(&state, slug).await?,
                (Entry::PacketKey(key), None) => {
                    let exchange = redeem_packet_key(&state, key).await?;
                    if exchange.sandbox.is_some() {
                        let location = format!("/x/{}/mcp", exchange.slug);
                        if let Some(redirect) = sandbox_redirect(&state, &exchange, &location) {
                            return Ok(redirect);
                        }
                    }
                    exchange
                }
            };
            (state.sessions.create(binding_for(&exchange, &entry)), true)
        }
        None => return Ok(json_response(reject_without_session(&payload), None)),
    };

    let response = handle_payload(&state, &session, &call, payload).await;

    if created && session.phase() != SessionPhase::Active {
        state.sessions.close(session.token());
        return Ok(json_response(response, None));
    }
    Ok(json_response(response, Some(session.token())))
}

/// Explicit disconnect on either route family.
pub async fn disconnect(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    let token = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing_session", "Mcp-Session-Id header is required"))?;

    if state.sessions.close(token) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("session_not_found", "session not found"))
    }
}

pub async fn exchange_health(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    uri: Uri,
) -> Result<Response, AppError> {
    let exchange = exchange_by_slug(&state, &slug).await?;
    if let Some(redirect) = sandbox_redirect(&state, &exchange, &path_and_query(&uri)) {
        return Ok(redirect);
    }

    let Some(adapter) = state.provisioner.adapter_for(exchange.id) else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus::unhealthy(format!("exchange '{slug}' is not active"))),
        )
            .into_response());
    };

    let status = adapter.health_check().await;
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((code, Json(status)).into_response())
}

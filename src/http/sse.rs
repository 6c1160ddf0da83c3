//! Persistent stream transport.
//!
//! `GET .../sse` opens a server-sent-event stream whose first event is
//! `endpoint`, carrying the URL the client posts messages to. Responses to
//! those messages are delivered on the stream through the session's
//! deliver-or-buffer capability.

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use futures::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::handlers::{
    binding_for, call_context, exchange_by_slug, path_and_query, read_body, redeem_packet_key,
    sandbox_redirect, session_for_entry, Entry, HEADER_SESSION_ID,
};
use crate::{
    errors::AppError,
    logging::token_hint,
    mcp::{
        rpc::{json_rpc_error, session_not_found, PARSE_ERROR},
        server::handle_payload,
    },
    session::Session,
    AppState,
};

const QUERY_SESSION_ID: &str = "sessionId";

/// Detaches the stream from its session when the client goes away. Holds
/// only a weak handle so a closed session's channel can actually close.
struct StreamGuard {
    session: Arc<Session>,
    sender: mpsc::WeakSender<Value>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.upgrade() {
            self.session.detach_transport(&sender);
        }
        tracing::info!(session = %token_hint(self.session.token()), "stream detached");
    }
}

/// `messages_path` is the route-family prefix the client posts back to.
fn open_stream(state: &AppState, session: Arc<Session>, messages_path: &str) -> Response {
    let (sender, receiver) = mpsc::channel(state.sessions.settings().buffer_capacity.max(1));
    let weak = sender.downgrade();
    session.attach_transport(sender);

    let endpoint = format!(
        "{}{messages_path}/messages?{QUERY_SESSION_ID}={}",
        state.public_base_url,
        session.token()
    );
    let token = session.token().to_string();
    let closed = session.closed_signal();
    let guard = StreamGuard {
        session,
        sender: weak,
    };

    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let messages = ReceiverStream::new(receiver).map(move |message| {
        let _stream_guard = &guard;
        Ok::<_, Infallible>(Event::default().event("message").data(message.to_string()))
    });
    let events = first
        .chain(messages)
        .take_until(closed.cancelled_owned());

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&token) {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
    response
}

pub async fn exchange_sse(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
) -> Result<Response, AppError> {
    let exchange = exchange_by_slug(&state, &slug).await?;
    if let Some(redirect) = sandbox_redirect(&state, &exchange, &path_and_query(&uri)) {
        return Ok(redirect);
    }

    let messages_path = format!("/x/{slug}");
    let entry = Entry::Slug(slug);
    let session = match query.get(QUERY_SESSION_ID) {
        Some(token) => session_for_entry(&state, token, &entry)
            .ok_or_else(|| AppError::not_found("session_not_found", "session not found"))?,
        None => state.sessions.create(binding_for(&exchange, &entry)),
    };

    Ok(open_stream(&state, session, &messages_path))
}

pub async fn packet_sse(
    State(state): State<AppState>,
    Path(packet_key): Path<String>,
) -> Result<Response, AppError> {
    let exchange = redeem_packet_key(&state, &packet_key).await?;
    let location = format!("/x/{}/sse", exchange.slug);
    if let Some(redirect) = sandbox_redirect(&state, &exchange, &location) {
        return Ok(redirect);
    }

    let messages_path = format!("/p/{packet_key}");
    let session = state
        .sessions
        .create(binding_for(&exchange, &Entry::PacketKey(packet_key)));
    Ok(open_stream(&state, session, &messages_path))
}

/// Stream-bound messages. Accepted with `202`; the response travels on the
/// stream.
pub async fn exchange_messages(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, AppError> {
    stream_message(state, Entry::Slug(slug), query, request).await
}

pub async fn packet_messages(
    State(state): State<AppState>,
    Path(packet_key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, AppError> {
    stream_message(state, Entry::PacketKey(packet_key), query, request).await
}

async fn stream_message(
    state: AppState,
    entry: Entry,
    query: HashMap<String, String>,
    request: Request,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let call = call_context(&parts);
    let body = read_body(body).await?;

    let session = query
        .get(QUERY_SESSION_ID)
        .and_then(|token| session_for_entry(&state, token, &entry));
    let Some(session) = session else {
        return Ok((StatusCode::OK, Json(session_not_found(None))).into_response());
    };

    let response = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => handle_payload(&state, &session, &call, payload).await,
        Err(_) => Some(json_rpc_error(None, PARSE_ERROR, "Parse error")),
    };
    if let Some(response) = response {
        session.deliver(response);
    }

    Ok(StatusCode::ACCEPTED.into_response())
}

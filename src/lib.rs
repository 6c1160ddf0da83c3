use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod adapters;
pub mod auth;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod provisioning;
pub mod registry;
pub mod sandbox;
pub mod session;

use auth::TokenValidator;
use exchange::ExchangeStore;
use provisioning::Provisioner;
use registry::AdapterRegistry;
use session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ExchangeStore>,
    pub registry: Arc<AdapterRegistry>,
    pub sessions: Arc<SessionManager>,
    pub provisioner: Arc<Provisioner>,
    pub tokens: Arc<dyn TokenValidator>,
    pub public_base_url: Arc<str>,
    /// Host that sandboxed exchanges are reachable on.
    pub sandbox_host: Arc<str>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ExchangeStore>,
        registry: Arc<AdapterRegistry>,
        sessions: Arc<SessionManager>,
        provisioner: Arc<Provisioner>,
        tokens: Arc<dyn TokenValidator>,
        public_base_url: String,
        sandbox_host: String,
    ) -> Self {
        Self {
            store,
            registry,
            sessions,
            provisioner,
            tokens,
            public_base_url: Arc::<str>::from(public_base_url),
            sandbox_host: Arc::<str>::from(sandbox_host),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    use http::{handlers, sse};

    let exchanges = Router::new()
        .route(
            "/x/{slug}/mcp",
            post(handlers::exchange_mcp_post).delete(handlers::disconnect),
        )
        .route("/x/{slug}/sse", get(sse::exchange_sse))
        .route("/x/{slug}/messages", post(sse::exchange_messages))
        .route("/x/{slug}/health", get(handlers::exchange_health))
        .route(
            "/p/{packet_key}/mcp",
            post(handlers::packet_mcp_post).delete(handlers::disconnect),
        )
        .route("/p/{packet_key}/sse", get(sse::packet_sse))
        .route("/p/{packet_key}/messages", post(sse::packet_messages))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::resolve_bearer_token,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/.well-known/mcp", get(handlers::discovery))
        .route("/backends", get(handlers::backends))
        .merge(exchanges)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::{
        auth::{StaticTokenValidator, SCOPE_EXCHANGE_READ},
        config::{ApiToken, SessionSettings},
        exchange::{
            AccessRecord, Exchange, ExchangeStatus, InMemoryExchangeStore, SandboxAttachment,
            StoreError,
        },
        http::handlers::HEADER_SESSION_ID,
    };

    const TOKEN: &str = "reader-token-123";
    const PACKET_KEY: &str = "pk-docs-0001";

    struct Harness {
        app: Router,
        store: Arc<InMemoryExchangeStore>,
        sessions: Arc<SessionManager>,
        slug_lookups: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    /// Counts slug lookups so handlers can be held to one per request.
    struct CountingStore {
        inner: Arc<InMemoryExchangeStore>,
        slug_lookups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExchangeStore for CountingStore {
        async fn insert(&self, exchange: Exchange) -> Result<(), StoreError> {
            self.inner.insert(exchange).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Exchange>, StoreError> {
            self.inner.get(id).await
        }

        async fn get_by_slug(&self, slug: &str) -> Result<Option<Exchange>, StoreError> {
            self.slug_lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_by_slug(slug).await
        }

        async fn list(&self) -> Result<Vec<Exchange>, StoreError> {
            self.inner.list().await
        }

        async fn redeem_packet_key(&self, key: &str) -> Result<Option<Exchange>, StoreError> {
            self.inner.redeem_packet_key(key).await
        }

        async fn set_status(
            &self,
            id: Uuid,
            status: ExchangeStatus,
            error_message: Option<String>,
        ) -> Result<(), StoreError> {
            self.inner.set_status(id, status, error_message).await
        }

        async fn attach_sandbox(
            &self,
            id: Uuid,
            sandbox: Option<SandboxAttachment>,
        ) -> Result<(), StoreError> {
            self.inner.attach_sandbox(id, sandbox).await
        }

        async fn record_access(&self, record: AccessRecord) -> Result<(), StoreError> {
            self.inner.record_access(record).await
        }

        async fn delete(&self, id: Uuid) -> Result<Exchange, StoreError> {
            self.inner.delete(id).await
        }
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("notes.md"),
            "# Notes\nRemember the quarterly planning.\n",
        )
        .expect("write notes");

        let docs = Exchange::new("docs", "filesystem", json!({ "root_path": dir.path() }))
            .trusted()
            .with_packet_key(PACKET_KEY);
        let mut remote = Exchange::new("remote", "filesystem", json!({ "root_path": "/srv" }));
        remote.status = ExchangeStatus::Active;
        remote.sandbox = Some(SandboxAttachment {
            port: 9105,
            container_id: "c-remote".to_string(),
        });
        let docs_id = docs.id;

        let store = Arc::new(
            InMemoryExchangeStore::from_exchanges(vec![docs, remote]).expect("store"),
        );
        let slug_lookups = Arc::new(AtomicUsize::new(0));
        let counting: Arc<dyn ExchangeStore> = Arc::new(CountingStore {
            inner: Arc::clone(&store),
            slug_lookups: Arc::clone(&slug_lookups),
        });
        let registry = Arc::new(AdapterRegistry::with_builtin_backends());
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&registry),
            Arc::clone(&counting),
            None,
        ));
        provisioner
            .activate_exchange(docs_id)
            .await
            .expect("activate docs");

        let tokens = StaticTokenValidator::new(&[ApiToken {
            token: TOKEN.to_string(),
            scopes: vec![SCOPE_EXCHANGE_READ.to_string()],
        }]);
        let sessions = Arc::new(SessionManager::new(SessionSettings::default()));
        let state = AppState::new(
            counting,
            registry,
            Arc::clone(&sessions),
            provisioner,
            Arc::new(tokens),
            "http://exchange.test".to_string(),
            "127.0.0.1".to_string(),
        );

        Harness {
            app: build_app(state),
            store,
            sessions,
            slug_lookups,
            _dir: dir,
        }
    }

    fn rpc(uri: &str, session: Option<&str>, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(uri)
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(session) = session {
            builder = builder.header(HEADER_SESSION_ID, session);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    fn initialize_body(id: i64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone()
            .oneshot(request)
            .await
            .expect("request execution")
    }

    async fn json_body(response: Response) -> Value {
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&body).expect("json body")
    }

    fn session_of(response: &Response) -> String {
        response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .expect("session header")
            .to_string()
    }

    async fn open_session(app: &Router, uri: &str, token: Option<&str>) -> String {
        let response = send(app, rpc(uri, None, token, initialize_body(1))).await;
        assert_eq!(response.status(), StatusCode::OK);
        session_of(&response)
    }

    #[tokio::test]
    async fn health_is_public() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn discovery_and_backends_are_public() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            Request::builder()
                .uri("/.well-known/mcp")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["mcp_endpoint"], "/x/{slug}/mcp");

        let response = send(
            &harness.app,
            Request::builder()
                .uri("/backends")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;
        let body = json_body(response).await;
        let tags: Vec<&str> = body
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|entry| entry["tag"].as_str())
            .collect();
        assert_eq!(tags, ["composite", "filesystem", "gdrive", "github"]);
    }

    #[tokio::test]
    async fn initialize_opens_a_session() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            rpc("/x/docs/mcp", None, Some(TOKEN), initialize_body(1)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!session_of(&response).is_empty());
        let body = json_body(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
        assert!(body["result"]["capabilities"]["tools"].is_object());
        assert!(body["result"]["capabilities"]["prompts"].is_object());
    }

    #[tokio::test]
    async fn search_then_fetch_round_trip() {
        let harness = harness().await;
        let session = open_session(&harness.app, "/x/docs/mcp", Some(TOKEN)).await;

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                Some(TOKEN),
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": { "name": "search", "arguments": { "query": "quarterly" } }
                }),
            ),
        )
        .await;
        let body = json_body(response).await;
        let hits = body["result"]["structuredContent"]["results"]
            .as_array()
            .expect("results");
        assert_eq!(hits.len(), 1);
        let id = hits[0]["id"].as_str().expect("hit id").to_string();

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                Some(TOKEN),
                json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "tools/call",
                    "params": { "name": "fetch", "arguments": { "id": id } }
                }),
            ),
        )
        .await;
        let body = json_body(response).await;
        assert_eq!(
            body["result"]["structuredContent"]["text"],
            "# Notes\nRemember the quarterly planning.\n"
        );
        assert_eq!(body["result"]["isError"], false);
    }

    #[tokio::test]
    async fn requests_before_initialize_need_a_session() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                None,
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "id": 7, "method": "tools/list" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(HEADER_SESSION_ID).is_none());
        assert_eq!(json_body(response).await["error"]["code"], -32000);

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some("not-a-session"),
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "id": 8, "method": "tools/list" }),
            ),
        )
        .await;
        assert_eq!(json_body(response).await["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn invalid_token_is_unauthorized() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            rpc("/x/docs/mcp", None, Some("wrong-token"), initialize_body(1)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn anonymous_clients_can_discover_but_not_call_tools() {
        let harness = harness().await;
        let session = open_session(&harness.app, "/x/docs/mcp", None).await;

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                None,
                json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            ),
        )
        .await;
        let body = json_body(response).await;
        let names: Vec<&str> = body["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert!(names.contains(&"search"));
        assert!(names.contains(&"fetch"));

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                None,
                json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "tools/call",
                    "params": { "name": "search", "arguments": { "query": "notes" } }
                }),
            ),
        )
        .await;
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn packet_keys_are_single_use_and_audited() {
        let harness = harness().await;
        let uri = format!("/p/{PACKET_KEY}/mcp");
        let session = open_session(&harness.app, &uri, Some(TOKEN)).await;

        let again = send(&harness.app, rpc(&uri, None, Some(TOKEN), initialize_body(1))).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let response = send(
            &harness.app,
            rpc(
                &uri,
                Some(&session),
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            ),
        )
        .await;
        assert!(json_body(response).await["result"]["tools"].is_array());

        let on_slug_route = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
            ),
        )
        .await;
        assert_eq!(json_body(on_slug_route).await["error"]["code"], -32000);

        let methods: Vec<String> = harness
            .store
            .access_log()
            .into_iter()
            .map(|record| record.method)
            .collect();
        assert_eq!(methods, ["initialize", "tools/list"]);
    }

    #[tokio::test]
    async fn sandboxed_exchanges_are_redirected() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            rpc("/x/remote/mcp", None, Some(TOKEN), initialize_body(1)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).expect("location"),
            "http://127.0.0.1:9105/x/remote/mcp"
        );
    }

    #[tokio::test]
    async fn unknown_exchange_is_not_found() {
        let harness = harness().await;
        let response = send(
            &harness.app,
            rpc("/x/missing/mcp", None, Some(TOKEN), initialize_body(1)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let harness = harness().await;
        let request = Request::builder()
            .uri("/x/docs/mcp")
            .method("POST")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from("{not json"))
            .expect("request build");
        let response = send(&harness.app, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn delete_closes_the_session() {
        let harness = harness().await;
        let session = open_session(&harness.app, "/x/docs/mcp", Some(TOKEN)).await;

        let delete = || {
            Request::builder()
                .uri("/x/docs/mcp")
                .method("DELETE")
                .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                .header(HEADER_SESSION_ID, session.as_str())
                .body(Body::empty())
                .expect("request build")
        };

        assert_eq!(send(&harness.app, delete()).await.status(), StatusCode::NO_CONTENT);
        assert_eq!(send(&harness.app, delete()).await.status(), StatusCode::NOT_FOUND);

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "id": 4, "method": "ping" }),
            ),
        )
        .await;
        assert_eq!(json_body(response).await["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let harness = harness().await;
        let session = open_session(&harness.app, "/x/docs/mcp", Some(TOKEN)).await;
        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn exchange_health_reports_adapter_status() {
        let harness = harness().await;
        let request = Request::builder()
            .uri("/x/docs/health")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .expect("request build");
        let response = send(&harness.app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["healthy"], true);
    }

    #[tokio::test]
    async fn stream_transport_delivers_responses_as_events() {
        let harness = harness().await;
        let request = Request::builder()
            .uri("/x/docs/sse")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .expect("request build");
        let response = send(&harness.app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let session = session_of(&response);
        let mut body = response.into_body();

        let frame = body
            .frame()
            .await
            .expect("endpoint frame")
            .expect("frame ok")
            .into_data()
            .expect("data frame");
        let text = String::from_utf8_lossy(&frame).to_string();
        assert!(text.contains("event: endpoint"));
        assert!(text.contains(&format!(
            "http://exchange.test/x/docs/messages?sessionId={session}"
        )));

        let response = send(
            &harness.app,
            rpc(
                &format!("/x/docs/messages?sessionId={session}"),
                None,
                Some(TOKEN),
                initialize_body(5),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let frame = body
            .frame()
            .await
            .expect("message frame")
            .expect("frame ok")
            .into_data()
            .expect("data frame");
        let text = String::from_utf8_lossy(&frame).to_string();
        assert!(text.contains("event: message"));
        assert!(text.contains("\"protocolVersion\":\"2025-06-18\""));
    }

    async fn open_event_stream(app: &Router, uri: &str) -> (String, Body) {
        let request = Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .expect("request build");
        let response = send(app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let session = session_of(&response);
        let mut body = response.into_body();
        let frame = body
            .frame()
            .await
            .expect("endpoint frame")
            .expect("frame ok")
            .into_data()
            .expect("data frame");
        assert!(String::from_utf8_lossy(&frame).contains("event: endpoint"));
        (session, body)
    }

    /// Drains keep-alives until the stream ends, or gives up after a quiet
    /// period.
    async fn stream_ended(body: &mut Body) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), body.frame()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    #[tokio::test]
    async fn stream_ends_after_disconnect() {
        let harness = harness().await;
        let (session, mut body) = open_event_stream(&harness.app, "/x/docs/sse").await;

        let request = Request::builder()
            .uri("/x/docs/mcp")
            .method("DELETE")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(HEADER_SESSION_ID, session.as_str())
            .body(Body::empty())
            .expect("request build");
        assert_eq!(send(&harness.app, request).await.status(), StatusCode::NO_CONTENT);

        assert!(stream_ended(&mut body).await);
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams() {
        let harness = harness().await;
        let (_, mut body) = open_event_stream(&harness.app, "/x/docs/sse").await;

        assert_eq!(harness.sessions.shutdown(), 1);
        assert!(stream_ended(&mut body).await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_eviction_is_visible_over_http() {
        let harness = harness().await;
        let session = open_session(&harness.app, "/x/docs/mcp", Some(TOKEN)).await;
        let (_, mut body) = open_event_stream(&harness.app, "/x/docs/sse").await;

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(harness.sessions.sweep_idle().len(), 2);

        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                Some(TOKEN),
                json!({ "jsonrpc": "2.0", "id": 9, "method": "tools/list" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["error"]["code"], -32000);
        assert!(stream_ended(&mut body).await);
    }

    #[tokio::test]
    async fn packet_key_streams_post_to_their_own_route() {
        let harness = harness().await;
        let request = Request::builder()
            .uri(format!("/p/{PACKET_KEY}/sse"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .expect("request build");
        let response = send(&harness.app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let session = session_of(&response);
        let mut body = response.into_body();
        let frame = body
            .frame()
            .await
            .expect("endpoint frame")
            .expect("frame ok")
            .into_data()
            .expect("data frame");
        assert!(String::from_utf8_lossy(&frame).contains(&format!(
            "http://exchange.test/p/{PACKET_KEY}/messages?sessionId={session}"
        )));

        let on_slug_route = send(
            &harness.app,
            rpc(
                &format!("/x/docs/messages?sessionId={session}"),
                None,
                Some(TOKEN),
                initialize_body(2),
            ),
        )
        .await;
        assert_eq!(on_slug_route.status(), StatusCode::OK);
        assert_eq!(json_body(on_slug_route).await["error"]["code"], -32000);

        let response = send(
            &harness.app,
            rpc(
                &format!("/p/{PACKET_KEY}/messages?sessionId={session}"),
                None,
                Some(TOKEN),
                initialize_body(3),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn anonymous_unknown_method_is_method_not_found() {
        let harness = harness().await;
        let session = open_session(&harness.app, "/x/docs/mcp", None).await;
        let response = send(
            &harness.app,
            rpc(
                "/x/docs/mcp",
                Some(&session),
                None,
                json!({ "jsonrpc": "2.0", "id": 4, "method": "tools/explode" }),
            ),
        )
        .await;
        assert_eq!(json_body(response).await["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn initialize_looks_up_the_exchange_once() {
        let harness = harness().await;
        open_session(&harness.app, "/x/docs/mcp", Some(TOKEN)).await;
        assert_eq!(harness.slug_lookups.load(Ordering::SeqCst), 1);
    }
}

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::http::handlers::HEADER_SESSION_ID;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Logs one summary line per HTTP request. Session tokens are bearer-like
/// secrets, so only a short prefix is recorded.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let session = request
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(token_hint)
        .unwrap_or_default();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        session = %session,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    match status.as_u16() {
        401 => warn!(method = %method, path = %path, "authentication failure"),
        404 => warn!(method = %method, path = %path, "unknown exchange or route"),
        _ => {}
    }

    response
}

pub fn token_hint(token: &str) -> String {
    token.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::token_hint;

    #[test]
    fn token_hint_keeps_prefix_only() {
        assert_eq!(token_hint("0123456789abcdef"), "01234567");
        assert_eq!(token_hint("abc"), "abc");
    }
}

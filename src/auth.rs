use crate::server::SharedState;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

const BEARER_PREFIX: &str = "Bearer ";
const CHALLENGE: &str = r#"Bearer realm='sign', error="invalid_request""#;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unauthorized")]
pub struct Unauthorized;

impl IntoResponse for Unauthorized {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE))],
            self.to_string(),
        )
            .into_response()
    }
}

/// Compares presented bearer tokens against the single configured secret.
#[derive(Clone)]
pub struct AuthGate {
    secret: Arc<str>,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            tracing::warn!(
                "No access token configured, all classification requests will be rejected"
            );
        }
        Self {
            secret: Arc::from(secret),
        }
    }

    pub fn authorize(&self, provided: Option<&str>) -> Result<(), Unauthorized> {
        match provided {
            Some(token) if !token.is_empty() && token == &*self.secret => Ok(()),
            _ => Err(Unauthorized),
        }
    }
}

#[derive(Deserialize)]
struct AccessTokenQuery {
    access_token: Option<String>,
}

/// `Authorization: Bearer <token>` first, then the `access_token` query parameter.
pub fn bearer_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::to_string);

    from_header.or_else(|| {
        Query::<AccessTokenQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(query)| query.access_token)
    })
}

/// Runs before the body is read, so rejected requests never reach decoding.
pub async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, Unauthorized> {
    let headers = request.headers();
    tracing::info!(
        method = %request.method(),
        uri = %request.uri(),
        user_agent = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()),
        content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        "Incoming request"
    );

    let token = bearer_token(request.headers(), request.uri());
    if let Err(unauthorized) = state.auth.authorize(token.as_deref()) {
        tracing::warn!(
            "Rejected request to {}: missing or invalid bearer token",
            request.uri().path()
        );
        state.metrics.record_unauthorized(request.uri().path());
        state
            .metrics
            .record_request(request.uri().path(), StatusCode::UNAUTHORIZED.as_u16());
        return Err(unauthorized);
    }

    Ok(next.run(request).await)
}

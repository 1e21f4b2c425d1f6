use axum::{
    body::Body,
    extract::State,
    http::{header, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use crate::storage::PortalStore;
use std::sync::Arc;

use super::signaling::SignalingBroker;
use super::verifier::PaymentVerifier;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PortalStore>,
    pub auth: Option<AuthCredentials>,
    pub broker: SignalingBroker,
    pub verifier: Arc<dyn PaymentVerifier>,
}

#[derive(Clone)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl AuthCredentials {
    /// Check an `Authorization` header value against these credentials
    pub fn matches(&self, header_value: &str) -> bool {
        use base64::Engine;

        let Some(credentials) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let engine = base64::engine::general_purpose::STANDARD;
        let Ok(decoded) = engine.decode(credentials.trim()) else {
            return false;
        };
        let Ok(decoded_str) = String::from_utf8(decoded) else {
            return false;
        };
        decoded_str == format!("{}:{}", self.username, self.password)
    }
}

/// Auth middleware - validates HTTP Basic Auth
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    // If auth is not enabled, allow request
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| auth.matches(v))
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"schoolhub\"")],
            "Unauthorized",
        )
            .into_response()
    }
}

mod auth;
mod handlers;
pub mod payment;
pub mod signaling;
pub mod verifier;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use crate::storage::PortalStore;
use std::sync::Arc;
use tracing::info;

pub use auth::{AppState, AuthCredentials};
pub use signaling::SignalingBroker;
pub use verifier::{PaymentVerifier, PaymentsConfig, ProviderVerifier, Verification};

pub struct PortalServer {
    state: AppState,
    addr: String,
}

impl PortalServer {
    pub fn new(store: Arc<PortalStore>, addr: String) -> Self {
        Self {
            state: AppState {
                store,
                auth: None,
                broker: SignalingBroker::new(),
                verifier: Arc::new(ProviderVerifier::new(PaymentsConfig::default())),
            },
            addr,
        }
    }

    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.state.auth = Some(AuthCredentials { username, password });
        self
    }

    /// Share a broker with other servers or tests
    pub fn with_broker(mut self, broker: SignalingBroker) -> Self {
        self.state.broker = broker;
        self
    }

    /// Check payment callbacks with `verifier`
    pub fn with_verifier(mut self, verifier: Arc<dyn PaymentVerifier>) -> Self {
        self.state.verifier = verifier;
        self
    }

    pub fn broker(&self) -> &SignalingBroker {
        &self.state.broker
    }

    pub fn router(&self) -> Router {
        // Public endpoints (no auth required)
        let public_routes = Router::new()
            .route("/api/schools/:school_id/:collection", get(handlers::list_records))
            .route("/api/schools/:school_id/:collection/:id", get(handlers::get_record))
            .route("/api/stats", get(handlers::storage_stats))
            .route("/live/:peer_id", get(signaling::ws_handler))
            .route("/payments/callback", get(payment::payment_callback))
            .with_state(self.state.clone());

        // Protected endpoints (require auth if enabled)
        let protected_routes = Router::new()
            .route("/api/schools/:school_id/:collection", post(handlers::insert_record))
            .route(
                "/api/schools/:school_id/:collection/:id",
                axum::routing::patch(handlers::update_record).delete(handlers::delete_record),
            )
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::auth_middleware,
            ))
            .with_state(self.state.clone());

        public_routes
            .merge(protected_routes)
            .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10MB limit
    }

    pub async fn run(self) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        axum::serve(listener, app).await?;

        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

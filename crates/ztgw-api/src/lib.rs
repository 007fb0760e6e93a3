//! Administrative HTTP API: CRUD over endpoints/zones/routes plus bundle
//! assembly, exposed to the (out-of-scope, per spec §1) admin web UI.
//!
//! Grounded on `oisp-web::lib.rs` (`Router`, `Arc<AppState>`, a CORS layer,
//! JSON handlers split into their own module) generalized from read-only
//! telemetry endpoints to full CRUD with validation errors mapped onto HTTP
//! status codes.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use ztgw_ca::CertificateAuthority;
use ztgw_store::DataStore;

/// Administrative HTTP API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
        }
    }
}

/// Addressing handed to endpoints inside their signed configuration token
/// (spec §4.6): where to reach the resolver and proxy, and what server name
/// to expect on the proxy's certificate.
#[derive(Debug, Clone)]
pub struct GatewayAddressing {
    pub server_addr: String,
    pub proxy_addr: String,
    pub server_name: String,
    pub token_ttl: Duration,
}

/// Shared state handed to every handler.
pub struct AppState {
    pub store: Arc<DataStore>,
    pub ca: Arc<CertificateAuthority>,
    pub addressing: GatewayAddressing,
}

/// Build the administrative API's router. Kept separate from [`serve`] so
/// tests can drive it directly with `tower::ServiceExt::oneshot`.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(handlers::routes())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the administrative API until the listener errors out.
pub async fn serve(config: ApiConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = router(state);

    info!(%addr, "administrative API listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

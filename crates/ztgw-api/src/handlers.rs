//! Request/response DTOs and route handlers.
//!
//! Grounded on `oisp-web::api`'s handler module split: one `Json<T>`
//! response type per endpoint, `State(Arc<AppState>)` extraction, plain
//! functions registered onto the router in [`routes`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use ztgw_core::model::{Endpoint, RecordType, Role, Route, Zone, ZoneRecord};
use ztgw_store::StoreError;

use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/endpoints", get(list_endpoints))
        .route("/api/endpoints/clients", post(create_client))
        .route("/api/endpoints/services", post(create_service))
        .route("/api/endpoints/:cn", delete(delete_endpoint))
        .route("/api/endpoints/:cn/bundle", get(get_bundle))
        .route("/api/zones", get(list_zones))
        .route("/api/zones/:zone/access/:cn", post(authorize_endpoint))
        .route("/api/zones/:zone/access/:cn", delete(deauthorize_endpoint))
        .route("/api/routes", get(list_routes))
}

/// Errors surfaced by handlers, mapped onto HTTP status codes the way an
/// admin UI client would expect: 404 for missing resources, 409 for
/// referential-invariant violations, 500 for everything else (spec §7:
/// data-store write failures are "a 5xx-equivalent", with the in-memory
/// state already rolled back by `ztgw-store` before the handler returns).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("certificate authority error: {0}")]
    Ca(#[from] ztgw_ca::CaError),
    #[error("signed configuration error: {0}")]
    SignedConfig(#[from] ztgw_signedconfig::SignedConfigError),
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::Referential(_)) => StatusCode::CONFLICT,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Ca(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::SignedConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiResult<T> = Result<T, ApiError>;

// ---- Views ------------------------------------------------------------

#[derive(Serialize)]
pub struct EndpointView {
    pub cn: String,
    pub name: String,
    pub role: Role,
    pub platform: String,
    pub created_at: chrono::DateTime<Utc>,
    pub domains: Vec<String>,
}

impl From<Endpoint> for EndpointView {
    fn from(e: Endpoint) -> Self {
        Self {
            cn: e.cn,
            name: e.name,
            role: e.role,
            platform: e.platform,
            created_at: e.created_at,
            domains: e.domains,
        }
    }
}

#[derive(Serialize)]
pub struct ZoneView {
    pub name: String,
    pub service_cn: Option<String>,
    pub access_list: Vec<String>,
    pub record_labels: Vec<String>,
}

impl From<Zone> for ZoneView {
    fn from(z: Zone) -> Self {
        Self {
            name: z.name,
            service_cn: z.service_cn,
            access_list: z.access_list.into_iter().collect(),
            record_labels: z.records.into_keys().collect(),
        }
    }
}

#[derive(Serialize)]
pub struct RouteView {
    pub service_cn: String,
    pub host: String,
    pub port: u16,
    pub domains: Vec<String>,
    pub name: String,
}

impl From<Route> for RouteView {
    fn from(r: Route) -> Self {
        Self {
            service_cn: r.service_cn,
            host: r.host,
            port: r.port,
            domains: r.domains,
            name: r.name,
        }
    }
}

/// The four pieces a deployment bundle is assembled from (spec §4.5/§4.6).
/// Archive packaging and the endpoint binary itself are the external
/// collaborator named in spec §1; this is the contract that collaborator
/// consumes.
#[derive(Serialize)]
pub struct BundleResponse {
    pub cn: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
    pub config_token: String,
}

#[derive(Serialize)]
pub struct CreateEndpointResponse {
    pub cn: String,
    pub bundle: BundleResponse,
}

// ---- Requests -----------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

#[derive(Deserialize)]
pub struct ZoneRecordRequest {
    pub record_type: RecordType,
    pub value: String,
}

#[derive(Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    pub backend_host: String,
    pub backend_port: u16,
    pub domains: Vec<String>,
    #[serde(default)]
    pub records: HashMap<String, Vec<ZoneRecordRequest>>,
}

fn default_platform() -> String {
    "linux".to_string()
}

// ---- Handlers -----------------------------------------------------------

async fn list_endpoints(State(state): State<Arc<AppState>>) -> Json<Vec<EndpointView>> {
    Json(state.store.list_endpoints().await.into_iter().map(Into::into).collect())
}

async fn list_zones(State(state): State<Arc<AppState>>) -> Json<Vec<ZoneView>> {
    Json(state.store.list_zones().await.into_iter().map(Into::into).collect())
}

async fn list_routes(State(state): State<Arc<AppState>>) -> Json<Vec<RouteView>> {
    Json(state.store.list_routes().await.into_iter().map(Into::into).collect())
}

/// Issues client credentials, registers the endpoint, and returns a bundle.
/// Issuance is made atomic with registration the way spec §4.1 requires: if
/// the store write fails, the freshly-issued credential files are left on
/// disk (recoverable via `CertificateAuthority::load_endpoint`) but no
/// endpoint record is created, so a retry with the same CN cannot happen --
/// the caller must request a fresh CN instead of lingering in a half state.
async fn create_client(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateClientRequest>,
) -> ApiResult<Json<CreateEndpointResponse>> {
    let credential = state.ca.issue_endpoint(Role::Client, &req.name)?;

    let endpoint = Endpoint {
        cn: credential.cn.clone(),
        name: req.name,
        role: Role::Client,
        platform: req.platform,
        created_at: Utc::now(),
        domains: vec![],
    };
    state.store.create_endpoint(endpoint).await?;

    let bundle = assemble_bundle(&state, &credential.cn, Role::Client, vec![]).await?;
    Ok(Json(CreateEndpointResponse { cn: credential.cn, bundle }))
}

/// Issues service credentials, registers the endpoint, creates the route,
/// and creates one zone per requested domain with `service_cn` set and an
/// access list seeded with the service's own CN (spec §4.5).
async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateServiceRequest>,
) -> ApiResult<Json<CreateEndpointResponse>> {
    if req.domains.is_empty() {
        return Err(ApiError::BadRequest("a service requires at least one domain".to_string()));
    }

    let credential = state.ca.issue_endpoint(Role::Service, &req.name)?;
    let cn = credential.cn.clone();

    let endpoint = Endpoint {
        cn: cn.clone(),
        name: req.name.clone(),
        role: Role::Service,
        platform: req.platform,
        created_at: Utc::now(),
        domains: req.domains.clone(),
    };
    state.store.create_endpoint(endpoint).await?;

    state
        .store
        .create_route(Route {
            service_cn: cn.clone(),
            host: req.backend_host,
            port: req.backend_port,
            domains: req.domains.clone(),
            name: req.name,
        })
        .await?;

    for domain in &req.domains {
        let mut records: HashMap<String, Vec<ZoneRecord>> = HashMap::new();
        for (label, recs) in &req.records {
            records.insert(
                label.clone(),
                recs.iter()
                    .map(|r| ZoneRecord { record_type: r.record_type, value: r.value.clone() })
                    .collect(),
            );
        }

        let mut access_list = std::collections::HashSet::new();
        access_list.insert(cn.clone());

        state
            .store
            .create_zone(Zone {
                name: domain.clone(),
                records,
                service_cn: Some(cn.clone()),
                access_list,
            })
            .await?;
    }

    let bundle = assemble_bundle(&state, &cn, Role::Service, req.domains).await?;
    Ok(Json(CreateEndpointResponse { cn, bundle }))
}

async fn delete_endpoint(State(state): State<Arc<AppState>>, Path(cn): Path<String>) -> ApiResult<StatusCode> {
    state.store.delete_endpoint(&cn).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn authorize_endpoint(
    State(state): State<Arc<AppState>>,
    Path((zone, cn)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.store.authorize(&zone, &cn).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deauthorize_endpoint(
    State(state): State<Arc<AppState>>,
    Path((zone, cn)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.store.deauthorize(&zone, &cn).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Re-reads a previously-issued endpoint's credentials from disk and
/// reassembles its bundle, for clients that need to re-download (e.g. after
/// losing local state).
async fn get_bundle(State(state): State<Arc<AppState>>, Path(cn): Path<String>) -> ApiResult<Json<BundleResponse>> {
    let endpoint = state
        .store
        .endpoint(&cn)
        .await
        .ok_or_else(|| ApiError::Store(StoreError::NotFound(cn.clone())))?;

    let bundle = assemble_bundle(&state, &cn, endpoint.role, endpoint.domains).await?;
    Ok(Json(bundle))
}

async fn assemble_bundle(
    state: &AppState,
    cn: &str,
    role: Role,
    domains: Vec<String>,
) -> ApiResult<BundleResponse> {
    let credential = state.ca.load_endpoint(cn)?;

    let payload = ztgw_signedconfig::ConfigPayload {
        server: state.addressing.server_addr.clone(),
        proxy: state.addressing.proxy_addr.clone(),
        server_name: state.addressing.server_name.clone(),
        kind: role,
        domains,
        expires: Utc::now() + chrono::Duration::from_std(state.addressing.token_ttl).unwrap_or(chrono::Duration::days(365)),
    };
    let token = ztgw_signedconfig::sign(&payload, &state.ca)?;

    Ok(BundleResponse {
        cn: cn.to_string(),
        cert_pem: credential.cert_pem,
        key_pem: credential.key_pem,
        ca_cert_pem: credential.ca_cert_pem,
        config_token: token.as_str().to_string(),
    })
}

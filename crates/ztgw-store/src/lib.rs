//! Persisted registry of endpoints, zones, and routes, with the referential
//! invariants that keep them consistent (spec §3/§4.2).
//!
//! Mirrors `oisp-core::config`'s load/parse/persist shape for the on-disk
//! JSON documents, and the single-writer-behind-a-lock discipline of
//! `oisp-redirector::proxy::NatTable` for in-memory mutation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use ztgw_core::model::{normalize_zone_name, Endpoint, Role, Route, Zone};

/// Errors raised by the data store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("referential integrity violation: {0}")]
    Referential(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const ENDPOINTS_FILE: &str = "endpoints.json";
const ZONES_FILE: &str = "zones.json";
const ROUTES_FILE: &str = "routes.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    endpoints: HashMap<String, Endpoint>,
    #[serde(default)]
    zones: HashMap<String, Zone>,
    #[serde(default)]
    routes: HashMap<String, Route>,
}

/// Documents touched by a mutation, so only the affected files are rewritten.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Document {
    Endpoints,
    Zones,
    Routes,
}

/// The gateway's single source of truth for endpoints, zones, and routes.
///
/// Holds the in-memory registry behind a write-preferring `RwLock`; every
/// mutation applies in memory, persists the touched document(s), and rolls
/// the in-memory change back if the write fails (spec §7).
pub struct DataStore {
    registry: Arc<RwLock<Registry>>,
    data_dir: PathBuf,
}

impl DataStore {
    /// Load the three JSON documents from `data_dir` if present, else start
    /// with an empty registry.
    pub async fn load(data_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let endpoints = read_document(&data_dir.join(ENDPOINTS_FILE)).await?.unwrap_or_default();
        let zones = read_document(&data_dir.join(ZONES_FILE)).await?.unwrap_or_default();
        let routes = read_document(&data_dir.join(ROUTES_FILE)).await?.unwrap_or_default();

        info!(
            endpoints = endpoints.len(),
            zones = zones.len(),
            routes = routes.len(),
            "loaded data store"
        );

        Ok(Self {
            registry: Arc::new(RwLock::new(Registry { endpoints, zones, routes })),
            data_dir,
        })
    }

    // ---- Endpoints ----------------------------------------------------

    pub async fn create_endpoint(&self, endpoint: Endpoint) -> StoreResult<()> {
        let mut reg = self.registry.write().await;
        if reg.endpoints.contains_key(&endpoint.cn) {
            return Err(StoreError::AlreadyExists(endpoint.cn));
        }
        let cn = endpoint.cn.clone();
        reg.endpoints.insert(cn.clone(), endpoint);
        if let Err(err) = self.persist(&reg, Document::Endpoints).await {
            warn!(%cn, error = %err, "rolling back endpoint creation after write failure");
            reg.endpoints.remove(&cn);
            return Err(err);
        }
        Ok(())
    }

    /// Removes the endpoint and cascades: strips it from every zone access
    /// list, and if it is a service, deletes its route and every zone whose
    /// `service_cn` points at it (spec invariant 4).
    pub async fn delete_endpoint(&self, cn: &str) -> StoreResult<()> {
        let mut reg = self.registry.write().await;
        let removed = reg
            .endpoints
            .remove(cn)
            .ok_or_else(|| StoreError::NotFound(cn.to_string()))?;

        for zone in reg.zones.values_mut() {
            zone.access_list.remove(cn);
        }
        if removed.role == Role::Service {
            reg.routes.remove(cn);
            reg.zones.retain(|_, z| z.service_cn.as_deref() != Some(cn));
        }

        let result = self.persist_all(&reg).await;
        if let Err(err) = result {
            warn!(%cn, error = %err, "rolling back endpoint deletion after write failure");
            reg.endpoints.insert(cn.to_string(), removed);
            return Err(err);
        }
        Ok(())
    }

    pub async fn endpoint(&self, cn: &str) -> Option<Endpoint> {
        self.registry.read().await.endpoints.get(cn).cloned()
    }

    pub async fn list_endpoints(&self) -> Vec<Endpoint> {
        self.registry.read().await.endpoints.values().cloned().collect()
    }

    // ---- Routes ---------------------------------------------------------

    /// Requires the referenced service endpoint to exist (invariant 2).
    pub async fn create_route(&self, route: Route) -> StoreResult<()> {
        let mut reg = self.registry.write().await;
        if !reg.endpoints.contains_key(&route.service_cn) {
            return Err(StoreError::Referential(format!(
                "no endpoint with cn {}",
                route.service_cn
            )));
        }
        if reg.routes.contains_key(&route.service_cn) {
            return Err(StoreError::AlreadyExists(route.service_cn));
        }
        let cn = route.service_cn.clone();
        reg.routes.insert(cn.clone(), route);
        if let Err(err) = self.persist(&reg, Document::Routes).await {
            warn!(service_cn = %cn, error = %err, "rolling back route creation after write failure");
            reg.routes.remove(&cn);
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete_route(&self, service_cn: &str) -> StoreResult<()> {
        let mut reg = self.registry.write().await;
        let removed = reg
            .routes
            .remove(service_cn)
            .ok_or_else(|| StoreError::NotFound(service_cn.to_string()))?;

        if let Err(err) = self.persist(&reg, Document::Routes).await {
            warn!(%service_cn, error = %err, "rolling back route deletion after write failure");
            reg.routes.insert(service_cn.to_string(), removed);
            return Err(err);
        }
        Ok(())
    }

    pub async fn route(&self, service_cn: &str) -> Option<Route> {
        self.registry.read().await.routes.get(service_cn).cloned()
    }

    pub async fn list_routes(&self) -> Vec<Route> {
        self.registry.read().await.routes.values().cloned().collect()
    }

    // ---- Zones ------------------------------------------------------------

    /// Requires that if `service_cn` is set, a route under that CN already
    /// exists (invariant 3). Normalizes the zone name before storing it.
    pub async fn create_zone(&self, mut zone: Zone) -> StoreResult<()> {
        zone.name = normalize_zone_name(&zone.name);
        let mut reg = self.registry.write().await;

        if reg.zones.contains_key(&zone.name) {
            return Err(StoreError::AlreadyExists(zone.name));
        }
        if let Some(service_cn) = &zone.service_cn {
            if !reg.routes.contains_key(service_cn) {
                return Err(StoreError::Referential(format!(
                    "no route for service cn {service_cn}"
                )));
            }
        }

        let name = zone.name.clone();
        reg.zones.insert(name.clone(), zone);
        if let Err(err) = self.persist(&reg, Document::Zones).await {
            warn!(zone = %name, error = %err, "rolling back zone creation after write failure");
            reg.zones.remove(&name);
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete_zone(&self, name: &str) -> StoreResult<()> {
        let name = normalize_zone_name(name);
        let mut reg = self.registry.write().await;
        let removed = reg
            .zones
            .remove(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        if let Err(err) = self.persist(&reg, Document::Zones).await {
            warn!(zone = %name, error = %err, "rolling back zone deletion after write failure");
            reg.zones.insert(name, removed);
            return Err(err);
        }
        Ok(())
    }

    pub async fn zone(&self, name: &str) -> Option<Zone> {
        let name = normalize_zone_name(name);
        self.registry.read().await.zones.get(&name).cloned()
    }

    pub async fn list_zones(&self) -> Vec<Zone> {
        self.registry.read().await.zones.values().cloned().collect()
    }

    /// Longest-suffix zone match for a queried name, used by both the
    /// resolver (DNS lookups) and the proxy (hostname authorization).
    pub async fn find_zone_for_name(&self, query: &str) -> Option<Zone> {
        let query = normalize_zone_name(query);
        let reg = self.registry.read().await;
        reg.zones
            .values()
            .filter(|z| z.matches(&query))
            .max_by_key(|z| z.name.len())
            .cloned()
    }

    // ---- Access lists -----------------------------------------------------

    /// Requires the endpoint to exist (invariant 1).
    pub async fn authorize(&self, zone_name: &str, cn: &str) -> StoreResult<()> {
        let zone_name = normalize_zone_name(zone_name);
        let mut reg = self.registry.write().await;
        if !reg.endpoints.contains_key(cn) {
            return Err(StoreError::Referential(format!("no endpoint with cn {cn}")));
        }
        let zone = reg
            .zones
            .get_mut(&zone_name)
            .ok_or_else(|| StoreError::NotFound(zone_name.clone()))?;
        let inserted = zone.access_list.insert(cn.to_string());
        if !inserted {
            return Ok(());
        }

        if let Err(err) = self.persist(&reg, Document::Zones).await {
            warn!(zone = %zone_name, %cn, error = %err, "rolling back authorization after write failure");
            if let Some(zone) = reg.zones.get_mut(&zone_name) {
                zone.access_list.remove(cn);
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn deauthorize(&self, zone_name: &str, cn: &str) -> StoreResult<()> {
        let zone_name = normalize_zone_name(zone_name);
        let mut reg = self.registry.write().await;
        let zone = reg
            .zones
            .get_mut(&zone_name)
            .ok_or_else(|| StoreError::NotFound(zone_name.clone()))?;
        let removed = zone.access_list.remove(cn);
        if !removed {
            return Ok(());
        }

        if let Err(err) = self.persist(&reg, Document::Zones).await {
            warn!(zone = %zone_name, %cn, error = %err, "rolling back deauthorization after write failure");
            if let Some(zone) = reg.zones.get_mut(&zone_name) {
                zone.access_list.insert(cn.to_string());
            }
            return Err(err);
        }
        Ok(())
    }

    // ---- Persistence --------------------------------------------------------

    async fn persist(&self, reg: &Registry, doc: Document) -> StoreResult<()> {
        match doc {
            Document::Endpoints => {
                write_atomic(&self.data_dir.join(ENDPOINTS_FILE), &reg.endpoints).await
            }
            Document::Zones => write_atomic(&self.data_dir.join(ZONES_FILE), &reg.zones).await,
            Document::Routes => write_atomic(&self.data_dir.join(ROUTES_FILE), &reg.routes).await,
        }
    }

    async fn persist_all(&self, reg: &Registry) -> StoreResult<()> {
        write_atomic(&self.data_dir.join(ENDPOINTS_FILE), &reg.endpoints).await?;
        write_atomic(&self.data_dir.join(ZONES_FILE), &reg.zones).await?;
        write_atomic(&self.data_dir.join(ROUTES_FILE), &reg.routes).await?;
        Ok(())
    }
}

async fn read_document<T: for<'de> Deserialize<'de>>(path: &Path) -> StoreResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Write-to-temp-then-rename so a crash mid-write never leaves a document
/// truncated or half-written (spec §3/§4.2).
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

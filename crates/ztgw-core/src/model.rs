//! Endpoint / zone / route entities shared by the store, resolver, proxy and
//! administrative API.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role an endpoint plays in the gateway. Clients consume zones/routes;
/// services are the backends a route ultimately points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Service,
}

impl Role {
    /// CN prefix for this role, per spec ("c" for clients, "s" for services).
    pub fn cn_prefix(self) -> char {
        match self {
            Role::Client => 'c',
            Role::Service => 's',
        }
    }
}

/// A peer authorized to use the gateway, identified solely by its
/// certificate's Common Name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub cn: String,
    pub name: String,
    pub role: Role,
    pub platform: String,
    pub created_at: DateTime<Utc>,
    /// Domains this endpoint is entitled to serve. Empty for clients.
    #[serde(default)]
    pub domains: Vec<String>,
}

/// DNS record type supported by the authoritative resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Cname,
}

/// A single authoritative record under a zone label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub record_type: RecordType,
    pub value: String,
}

/// An authoritative private DNS zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Fully-qualified zone name, normalized (lower-case, no trailing dot).
    pub name: String,
    /// Label -> records. The zone apex is keyed by `"@"`; `"*"` is the
    /// wildcard label.
    #[serde(default)]
    pub records: HashMap<String, Vec<ZoneRecord>>,
    /// CN of the owning service endpoint, if any.
    #[serde(default)]
    pub service_cn: Option<String>,
    /// Endpoint CNs permitted to query/tunnel to this zone.
    #[serde(default)]
    pub access_list: HashSet<String>,
}

impl Zone {
    /// Records matching `queried_name`: exact label first, then wildcard.
    pub fn lookup(&self, queried_name: &str) -> Option<&[ZoneRecord]> {
        let label = if queried_name == self.name {
            "@".to_string()
        } else {
            let suffix = format!(".{}", self.name);
            queried_name.strip_suffix(&suffix)?.to_string()
        };
        self.records
            .get(&label)
            .or_else(|| self.records.get("*"))
            .map(|v| v.as_slice())
    }

    /// Whether `queried_name` is this zone or a subdomain of it.
    pub fn matches(&self, queried_name: &str) -> bool {
        queried_name == self.name || queried_name.ends_with(&format!(".{}", self.name))
    }
}

/// Mapping from a service endpoint's CN to its real backend address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub service_cn: String,
    pub host: String,
    pub port: u16,
    pub domains: Vec<String>,
    pub name: String,
}

/// Normalize a zone name the way the store keys it: lower-case, no trailing
/// dot.
pub fn normalize_zone_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize a queried DNS name the same way zone names are normalized, so
/// the two can be compared directly.
pub fn normalize_query_name(name: &str) -> String {
    normalize_zone_name(name)
}

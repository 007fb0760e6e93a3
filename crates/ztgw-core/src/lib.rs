//! ZT-Gateway core - shared data model, configuration, and error types
//!
//! This crate provides the foundational types used across the gateway:
//!
//! - **Model**: endpoint/zone/route entities and their invariants
//! - **Config**: TOML configuration loading with CLI/env overrides

pub mod config;
pub mod model;

pub use config::{GatewayConfig, GatewayConfigError};
pub use model::{Endpoint, RecordType, Role, Route, Zone, ZoneRecord};

/// Gateway protocol version, used for future wire compatibility checks.
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

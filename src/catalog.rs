use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ports::PortConfiguration;

pub const STANDARD_KEY: u32 = 0;
pub const DEFAULT_VARIANTS: u32 = 63;
pub const DEFAULT_SHIFT_STEP: u32 = 1000;

const STANDARD_PORTS: [(&str, u32); 14] = [
    ("http", 8080),
    ("https", 8443),
    ("jacorb", 3528),
    ("jacorb-ssl", 3529),
    ("jmx-connector-registry", 1090),
    ("jmx-connector-server", 1091),
    ("management-native", 9999),
    ("management-http", 9990),
    ("messaging", 5445),
    ("messaging-throughput", 5455),
    ("osgi-http", 8090),
    ("remoting", 4447),
    ("txn-recovery-environment", 4712),
    ("txn-status-manager", 4713),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub variants: u32,
    pub shift_step: u32,
    pub base_ports: BTreeMap<String, u32>,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            variants: DEFAULT_VARIANTS,
            shift_step: DEFAULT_SHIFT_STEP,
            base_ports: standard_ports(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog base configuration defines no ports")]
    EmptyBase,
    #[error("catalog shift step must be greater than zero")]
    ZeroShiftStep,
    #[error("catalog base configuration uses port {port} more than once")]
    DuplicatePort { port: u32 },
    #[error("no configuration in the catalog passed validation")]
    NoUsableConfiguration,
}

pub fn standard_ports() -> BTreeMap<String, u32> {
    STANDARD_PORTS
        .iter()
        .map(|(name, port)| (name.to_string(), *port))
        .collect()
}

pub fn standard_configuration() -> PortConfiguration {
    PortConfiguration::new(STANDARD_KEY, standard_ports())
}

/// Builds the catalog in key order: the base configuration followed by
/// `variants` copies shifted by `key * shift_step`.
///
/// A base that names the same port twice is rejected outright.
/// Candidates with ports outside the sane range, or sharing a port number
/// with an already accepted configuration, are left out so every accepted
/// configuration is disjoint from every other.
pub fn build_catalog(settings: &CatalogSettings) -> Result<Vec<PortConfiguration>, CatalogError> {
    if settings.base_ports.is_empty() {
        return Err(CatalogError::EmptyBase);
    }
    if settings.variants > 0 && settings.shift_step == 0 {
        return Err(CatalogError::ZeroShiftStep);
    }

    let base = PortConfiguration::new(STANDARD_KEY, settings.base_ports.clone());
    if let Some(port) = base.repeated_port() {
        return Err(CatalogError::DuplicatePort { port });
    }

    let mut claimed = BTreeSet::<u32>::new();
    let mut catalog = Vec::new();

    for key in STANDARD_KEY..=settings.variants {
        let candidate = base.shifted(key, key.saturating_mul(settings.shift_step));

        if !candidate.is_sane() {
            warn!(key, "skipping configuration with ports outside 1024-65535");
            continue;
        }

        if let Some(port) = candidate.ports().values().find(|port| claimed.contains(*port)) {
            warn!(key, port, "skipping configuration that reuses a claimed port");
            continue;
        }

        claimed.extend(candidate.ports().values().copied());
        catalog.push(candidate);
    }

    if catalog.is_empty() {
        return Err(CatalogError::NoUsableConfiguration);
    }

    info!(configurations = catalog.len(), "catalog built");
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_configuration_is_key_zero() {
        let standard = standard_configuration();
        assert_eq!(standard.key(), 0);
        assert_eq!(standard.port("http"), Some(8080));
        assert_eq!(standard.ports().len(), 14);
    }

    #[test]
    fn zero_variants_allows_zero_step() {
        let settings = CatalogSettings {
            variants: 0,
            shift_step: 0,
            base_ports: standard_ports(),
        };
        let catalog = build_catalog(&settings).unwrap();
        assert_eq!(catalog.len(), 1);
    }
}

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
    ops::RangeInclusive,
};

use serde::{Deserialize, Serialize};

/// Registered/user port range a configuration must stay inside.
pub const SANE_PORT_RANGE: RangeInclusive<u32> = 1024..=65535;

/// One allocatable unit: a catalog key plus a named set of port numbers.
///
/// Equality, ordering and hashing only look at `key`; the port map is fixed
/// once the configuration is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfiguration {
    key: u32,
    ports: BTreeMap<String, u32>,
}

impl PortConfiguration {
    pub fn new(key: u32, ports: BTreeMap<String, u32>) -> Self {
        Self { key, ports }
    }

    pub fn builder(key: u32) -> PortConfigurationBuilder {
        PortConfigurationBuilder::new(key)
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn ports(&self) -> &BTreeMap<String, u32> {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<u32> {
        self.ports.get(name).copied()
    }

    pub fn is_sane(&self) -> bool {
        self.ports.values().all(|port| SANE_PORT_RANGE.contains(port))
    }

    /// First port number bound to more than one name, if any.
    pub fn repeated_port(&self) -> Option<u32> {
        let mut seen = BTreeSet::new();
        self.ports.values().copied().find(|port| !seen.insert(*port))
    }

    /// Derives a configuration under `key` with every port moved by `offset`.
    pub fn shifted(&self, key: u32, offset: u32) -> Self {
        Self {
            key,
            ports: self
                .ports
                .iter()
                .map(|(name, port)| (name.clone(), port.saturating_add(offset)))
                .collect(),
        }
    }

    /// True when any port number of `self` also appears in `other`.
    pub fn overlaps(&self, other: &PortConfiguration) -> bool {
        self.ports
            .values()
            .any(|port| other.ports.values().any(|candidate| candidate == port))
    }
}

impl PartialEq for PortConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PortConfiguration {}

impl Hash for PortConfiguration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for PortConfiguration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PortConfiguration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for PortConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration {} [", self.key)?;
        for (index, (name, port)) in self.ports.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={port}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone)]
pub struct PortConfigurationBuilder {
    key: u32,
    ports: BTreeMap<String, u32>,
}

impl PortConfigurationBuilder {
    pub fn new(key: u32) -> Self {
        Self {
            key,
            ports: BTreeMap::new(),
        }
    }

    pub fn port(mut self, name: &str, port: u32) -> Self {
        self.ports.insert(name.to_string(), port);
        self
    }

    pub fn build(self) -> PortConfiguration {
        PortConfiguration::new(self.key, self.ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_ports_in_name_order() {
        let configuration = PortConfiguration::builder(4)
            .port("https", 12443)
            .port("http", 12080)
            .build();

        assert_eq!(
            configuration.to_string(),
            "configuration 4 [http=12080, https=12443]"
        );
    }

    #[test]
    fn equality_ignores_port_map() {
        let left = PortConfiguration::builder(1).port("http", 9080).build();
        let right = PortConfiguration::builder(1).port("http", 1).build();
        assert_eq!(left, right);
    }
}

use std::{path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    catalog::CatalogSettings,
    server::DEFAULT_BIND,
    store::{DEFAULT_LEASE_PERIOD, ReservationStore},
    sweeper::DEFAULT_SWEEP_INTERVAL,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub bind: String,
    pub lease_period_ms: u64,
    pub sweep_interval_ms: u64,
    pub probe_local_ports: bool,
    pub catalog: CatalogSettings,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("toml serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            lease_period_ms: DEFAULT_LEASE_PERIOD.as_millis() as u64,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            probe_local_ports: false,
            catalog: CatalogSettings::default(),
        }
    }
}

impl RegistrySettings {
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.lease_period_ms == 0 {
            return Err(SettingsError::Invalid {
                name: "lease_period_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(SettingsError::Invalid {
                name: "sweep_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn lease_period(&self) -> Duration {
        Duration::from_millis(self.lease_period_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Uninitialized store wired with these settings.
    pub fn build_store(&self) -> Arc<ReservationStore> {
        Arc::new(
            ReservationStore::new(self.catalog.clone())
                .with_lease_period(self.lease_period())
                .with_local_port_probe(self.probe_local_ports),
        )
    }
}

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    catalog::{STANDARD_KEY, standard_configuration},
    client::{ClientError, RegistryClient},
    ports::PortConfiguration,
};

pub const PLACEHOLDER_PREFIX: &str = "${port.";
pub const DEFAULT_EXPORT_PREFIX: &str = "portlease.export.";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry: {0}")]
    Client(#[from] ClientError),
    #[error("runtime: {0}")]
    Runtime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfiguratorKind {
    Shift,
    Reservation,
    None,
}

impl FromStr for ConfiguratorKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "shift" => Ok(Self::Shift),
            "reservation" => Ok(Self::Reservation),
            "none" => Ok(Self::None),
            _ => Err(format!("invalid configurator: {input}")),
        }
    }
}

impl fmt::Display for ConfiguratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shift => "shift",
            Self::Reservation => "reservation",
            Self::None => "none",
        })
    }
}

/// Decides which ports a provisioned distribution gets, and undoes whatever
/// that decision claimed once the tests are done.
pub trait PortConfigurator {
    fn kind(&self) -> ConfiguratorKind;

    /// `None` leaves the template untouched.
    fn configure(&self) -> Result<Option<PortConfiguration>, ProvisionError>;

    /// Best effort: failures are logged, never raised.
    fn cleanup(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpConfigurator;

impl PortConfigurator for NoOpConfigurator {
    fn kind(&self) -> ConfiguratorKind {
        ConfiguratorKind::None
    }

    fn configure(&self) -> Result<Option<PortConfiguration>, ProvisionError> {
        Ok(None)
    }

    fn cleanup(&self) {}
}

/// Standard port set moved by a fixed offset; no registry involved.
#[derive(Debug, Clone, Copy)]
pub struct PortShiftConfigurator {
    pub shift: u32,
}

impl PortConfigurator for PortShiftConfigurator {
    fn kind(&self) -> ConfiguratorKind {
        ConfiguratorKind::Shift
    }

    fn configure(&self) -> Result<Option<PortConfiguration>, ProvisionError> {
        Ok(Some(standard_configuration().shifted(STANDARD_KEY, self.shift)))
    }

    fn cleanup(&self) {}
}

/// Leases a configuration from the registry and hands it back on cleanup.
#[derive(Debug, Clone)]
pub struct ReservationConfigurator {
    pub client: RegistryClient,
    pub client_key: String,
    pub ttl: Option<Duration>,
}

impl ReservationConfigurator {
    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output, ProvisionError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|error| ProvisionError::Runtime(error.to_string()))?;
        Ok(runtime.block_on(future))
    }
}

impl PortConfigurator for ReservationConfigurator {
    fn kind(&self) -> ConfiguratorKind {
        ConfiguratorKind::Reservation
    }

    fn configure(&self) -> Result<Option<PortConfiguration>, ProvisionError> {
        info!(
            registry = self.client.address(),
            client_key = %self.client_key,
            "reserving port configuration"
        );
        let configuration = self.block_on(self.client.reserve(&self.client_key, self.ttl))??;
        info!(%configuration, "using reserved port configuration");
        Ok(Some(configuration))
    }

    fn cleanup(&self) {
        info!(
            registry = self.client.address(),
            client_key = %self.client_key,
            "releasing port configuration"
        );
        match self.block_on(self.client.release(&self.client_key)) {
            Ok(Ok(message)) => info!(%message, "registry release"),
            Ok(Err(error)) => error!(%error, "cannot release port configuration"),
            Err(error) => error!(%error, "cannot release port configuration"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub text: String,
    pub replaced: usize,
    pub unresolved: Vec<String>,
}

/// Replaces every `${port.<name>}` placeholder with the named port.
/// Placeholders naming an unknown port stay as they are and are listed in
/// `unresolved`.
pub fn substitute_ports(template: &str, configuration: &PortConfiguration) -> Substitution {
    let mut text = String::with_capacity(template.len());
    let mut replaced = 0;
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(PLACEHOLDER_PREFIX) {
        let after_prefix = &rest[start + PLACEHOLDER_PREFIX.len()..];
        let Some(end) = after_prefix.find('}') else {
            break;
        };

        text.push_str(&rest[..start]);
        let name = &after_prefix[..end];
        match configuration.port(name) {
            Some(port) => {
                text.push_str(&port.to_string());
                replaced += 1;
            }
            None => {
                text.push_str(&rest[start..start + PLACEHOLDER_PREFIX.len() + end + 1]);
                if !unresolved.iter().any(|known| known == name) {
                    unresolved.push(name.to_string());
                }
            }
        }
        rest = &after_prefix[end + 1..];
    }
    text.push_str(rest);

    Substitution {
        text,
        replaced,
        unresolved,
    }
}

/// `key=value` lines for downstream test code, sorted by key.
pub fn export_properties(configuration: &PortConfiguration, prefix: &str) -> String {
    let mut entries = BTreeMap::new();
    entries.insert(
        format!("{prefix}configuration.key"),
        configuration.key().to_string(),
    );
    for (name, port) in configuration.ports() {
        entries.insert(format!("{prefix}port.{name}"), port.to_string());
    }

    entries
        .into_iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub template: PathBuf,
    pub output: PathBuf,
    pub exports: PathBuf,
    pub export_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionSummary {
    pub configurator: ConfiguratorKind,
    pub configuration_key: Option<u32>,
    pub replaced: usize,
    pub unresolved: Vec<String>,
    pub output: String,
    pub exports: String,
}

/// Configures ports, rewrites the template into `output` and writes the
/// exported values. Once `configure` has claimed something, any later failure
/// still runs `cleanup` before the error is returned.
pub fn provision(
    configurator: &dyn PortConfigurator,
    request: &ProvisionRequest,
) -> Result<ProvisionSummary, ProvisionError> {
    let configuration = configurator.configure()?;

    match write_outputs(configuration.as_ref(), request) {
        Ok((replaced, unresolved)) => Ok(ProvisionSummary {
            configurator: configurator.kind(),
            configuration_key: configuration.as_ref().map(PortConfiguration::key),
            replaced,
            unresolved,
            output: request.output.display().to_string(),
            exports: request.exports.display().to_string(),
        }),
        Err(error) => {
            warn!(%error, "provisioning failed after configure; cleaning up");
            configurator.cleanup();
            Err(error)
        }
    }
}

pub fn teardown(configurator: &dyn PortConfigurator) {
    configurator.cleanup();
}

fn write_outputs(
    configuration: Option<&PortConfiguration>,
    request: &ProvisionRequest,
) -> Result<(usize, Vec<String>), ProvisionError> {
    let template = read_file(&request.template)?;

    let (text, replaced, unresolved, exports) = match configuration {
        Some(configuration) => {
            let substitution = substitute_ports(&template, configuration);
            if substitution.replaced == 0 {
                warn!(template = %request.template.display(), "port configuration produced no changes");
            }
            for name in &substitution.unresolved {
                warn!(name = %name, "template names a port the configuration does not define");
            }
            (
                substitution.text,
                substitution.replaced,
                substitution.unresolved,
                export_properties(configuration, &request.export_prefix),
            )
        }
        None => (template, 0, Vec::new(), String::new()),
    };

    write_file(&request.output, &text)?;
    write_file(&request.exports, &exports)?;
    info!(output = %request.output.display(), replaced, "configuration written");
    Ok((replaced, unresolved))
}

fn read_file(path: &Path) -> Result<String, ProvisionError> {
    std::fs::read_to_string(path).map_err(|source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, content: &str) -> Result<(), ProvisionError> {
    let io_error = |source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, content).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unterminated_placeholder_is_copied_verbatim() {
        let configuration = PortConfiguration::builder(0).port("http", 8080).build();
        let substitution = substitute_ports("port=${port.http", &configuration);
        assert_eq!(substitution.text, "port=${port.http");
        assert_eq!(substitution.replaced, 0);
    }

    #[test]
    fn configurator_kind_round_trips_through_display() {
        for kind in [
            ConfiguratorKind::Shift,
            ConfiguratorKind::Reservation,
            ConfiguratorKind::None,
        ] {
            assert_eq!(kind.to_string().parse::<ConfiguratorKind>(), Ok(kind));
        }
    }
}

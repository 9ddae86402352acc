use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::{
    ports::PortConfiguration,
    store::{ReservationStore, StoreSnapshot},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RegistryCommand {
    Health,
    Reserve {
        #[serde(default)]
        client_key: Option<String>,
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    Release {
        #[serde(default)]
        client_key: Option<String>,
    },
    Ban {
        key: u32,
    },
    Status,
}

/// HTTP-style status attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Status {
    Ok,
    BadRequest,
    InternalError,
    Unavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::InternalError => 500,
            Self::Unavailable => 503,
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Self::Ok),
            400 => Ok(Self::BadRequest),
            500 => Ok(Self::InternalError),
            503 => Ok(Self::Unavailable),
            _ => Err(format!("unsupported status code: {code}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Configuration { configuration: PortConfiguration },
    Message { message: String },
    Snapshot { snapshot: StoreSnapshot },
    Error { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryResponse {
    pub status: Status,
    pub body: ResponseBody,
}

impl RegistryResponse {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            body: ResponseBody::Message {
                message: message.into(),
            },
        }
    }

    pub fn error(status: Status, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ResponseBody::Error {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

pub const NOTHING_TO_RELEASE: &str =
    "No configuration was reserved, or reservation had already expired.";

/// Request/response façade over a shared [`ReservationStore`].
#[derive(Debug, Clone)]
pub struct RegistryService {
    store: Arc<ReservationStore>,
}

impl RegistryService {
    pub fn new(store: Arc<ReservationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }

    pub fn handle(&self, command: RegistryCommand) -> RegistryResponse {
        match command {
            RegistryCommand::Health => RegistryResponse::message("ok"),
            RegistryCommand::Reserve { client_key, ttl_ms } => {
                let Some(client_key) = required_client_key(client_key) else {
                    return missing_client_key();
                };

                let ttl = ttl_ms.map(Duration::from_millis);
                match self.store.reserve_or_renew(&client_key, ttl) {
                    Some(configuration) => RegistryResponse {
                        status: Status::Ok,
                        body: ResponseBody::Configuration {
                            configuration: configuration.as_ref().clone(),
                        },
                    },
                    None => {
                        warn!(client_key = %client_key, "no port configuration available");
                        RegistryResponse::error(
                            Status::Unavailable,
                            "unavailable",
                            "no port configuration is available",
                        )
                    }
                }
            }
            RegistryCommand::Release { client_key } => {
                let Some(client_key) = required_client_key(client_key) else {
                    return missing_client_key();
                };

                match self.store.release_held(&client_key) {
                    Some(released) => RegistryResponse::message(format!(
                        "Configuration {} was released.",
                        released.key()
                    )),
                    None => RegistryResponse::message(NOTHING_TO_RELEASE),
                }
            }
            RegistryCommand::Ban { key } => {
                self.store.ban_key(key);
                RegistryResponse::message(format!("Configuration {key} was banned."))
            }
            RegistryCommand::Status => RegistryResponse {
                status: Status::Ok,
                body: ResponseBody::Snapshot {
                    snapshot: self.store.snapshot(),
                },
            },
        }
    }

    /// Decodes one request line, handles it and encodes the response line.
    ///
    /// Store mutations commit inside `handle`; an encoding failure afterwards
    /// is still answered, with an internal error.
    pub fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<RegistryCommand>(line) {
            Ok(command) => self.handle(command),
            Err(error) => RegistryResponse::error(
                Status::BadRequest,
                "invalid_command",
                error.to_string(),
            ),
        };

        encode_response(&response)
    }
}

pub fn encode_response(response: &RegistryResponse) -> String {
    match serde_json::to_string(response) {
        Ok(encoded) => encoded,
        Err(error) => {
            error!(%error, "failed to encode registry response");
            internal_error_line(&error.to_string())
        }
    }
}

fn internal_error_line(message: &str) -> String {
    serde_json::json!({
        "status": Status::InternalError.code(),
        "body": {
            "kind": "error",
            "code": "internal_error",
            "message": message,
        },
    })
    .to_string()
}

fn required_client_key(client_key: Option<String>) -> Option<String> {
    client_key.filter(|key| !key.trim().is_empty())
}

fn missing_client_key() -> RegistryResponse {
    RegistryResponse::error(Status::BadRequest, "bad_request", "client key is required")
}

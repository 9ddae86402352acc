use std::time::Duration;

use thiserror::Error;

use crate::{
    ports::PortConfiguration,
    server::{ServerError, send_command},
    service::{RegistryCommand, RegistryResponse, ResponseBody, Status},
    store::StoreSnapshot,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach port registry at {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: ServerError,
    },
    #[error("port registry at {address} has no configuration available")]
    Unavailable { address: String },
    #[error("port registry rejected {operation} with status {status}: {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("port registry answered {operation} with an unexpected body: {body:?}")]
    Unexpected {
        operation: &'static str,
        body: ResponseBody,
    },
}

/// Typed client for the registry's line protocol.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    address: String,
}

impl RegistryClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Acquires (or renews) the lease for `client_key`.
    pub async fn reserve(
        &self,
        client_key: &str,
        ttl: Option<Duration>,
    ) -> Result<PortConfiguration, ClientError> {
        let response = self
            .send(RegistryCommand::Reserve {
                client_key: Some(client_key.to_string()),
                ttl_ms: ttl.map(|ttl| ttl.as_millis() as u64),
            })
            .await?;

        match (response.status, response.body) {
            (Status::Ok, ResponseBody::Configuration { configuration }) => Ok(configuration),
            (Status::Unavailable, _) => Err(ClientError::Unavailable {
                address: self.address.clone(),
            }),
            (status, body) => Err(unexpected("reserve", status, body)),
        }
    }

    /// Releases whatever the client holds and returns the registry's message.
    pub async fn release(&self, client_key: &str) -> Result<String, ClientError> {
        let response = self
            .send(RegistryCommand::Release {
                client_key: Some(client_key.to_string()),
            })
            .await?;
        expect_message("release", response)
    }

    pub async fn ban(&self, key: u32) -> Result<String, ClientError> {
        let response = self.send(RegistryCommand::Ban { key }).await?;
        expect_message("ban", response)
    }

    pub async fn health(&self) -> Result<String, ClientError> {
        let response = self.send(RegistryCommand::Health).await?;
        expect_message("health", response)
    }

    pub async fn status(&self) -> Result<StoreSnapshot, ClientError> {
        let response = self.send(RegistryCommand::Status).await?;
        match (response.status, response.body) {
            (Status::Ok, ResponseBody::Snapshot { snapshot }) => Ok(snapshot),
            (status, body) => Err(unexpected("status", status, body)),
        }
    }

    async fn send(&self, command: RegistryCommand) -> Result<RegistryResponse, ClientError> {
        send_command(self.address.as_str(), &command)
            .await
            .map_err(|source| ClientError::Transport {
                address: self.address.clone(),
                source,
            })
    }
}

fn expect_message(
    operation: &'static str,
    response: RegistryResponse,
) -> Result<String, ClientError> {
    match (response.status, response.body) {
        (Status::Ok, ResponseBody::Message { message }) => Ok(message),
        (status, body) => Err(unexpected(operation, status, body)),
    }
}

fn unexpected(operation: &'static str, status: Status, body: ResponseBody) -> ClientError {
    match body {
        ResponseBody::Error { message, .. } => ClientError::Rejected {
            operation,
            status: status.code(),
            message,
        },
        body => ClientError::Unexpected { operation, body },
    }
}

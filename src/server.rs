use std::net::SocketAddr;

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::oneshot,
    time::{Duration, sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::service::{RegistryCommand, RegistryResponse, RegistryService, Status, encode_response};

pub const DEFAULT_BIND: &str = "127.0.0.1:9080";

/// Longest accepted request line, newline excluded.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timeout waiting for registry response")]
    Timeout,
    #[error("registry closed the connection without responding")]
    ConnectionClosed,
}

/// Sends one command over a fresh connection and waits for its response.
pub async fn send_command(
    address: impl ToSocketAddrs,
    command: &RegistryCommand,
) -> Result<RegistryResponse, ServerError> {
    let mut stream = TcpStream::connect(address).await?;

    let payload = serde_json::to_string(command)?;
    stream.write_all(payload.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    let read = timeout(RESPONSE_TIMEOUT, reader.read_line(&mut response))
        .await
        .map_err(|_| ServerError::Timeout)??;
    if read == 0 {
        return Err(ServerError::ConnectionClosed);
    }

    Ok(serde_json::from_str(response.trim_end())?)
}

/// Accepts connections on `listener` until `shutdown_rx` fires, one task per
/// connection, all sharing `service`.
pub async fn serve(
    listener: TcpListener,
    service: RegistryService,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), ServerError> {
    info!(address = %listener.local_addr()?, "registry listening");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, peer, service).await {
                        warn!(%peer, %error, "connection handling failed");
                    }
                });
            }
        }
    }

    info!("registry stopped accepting connections");
    Ok(())
}

pub async fn bind(address: &str) -> Result<TcpListener, ServerError> {
    Ok(TcpListener::bind(address).await?)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: RegistryService,
) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let limit = (MAX_REQUEST_BYTES + 1) as u64;
        let read = (&mut reader).take(limit).read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        if read > MAX_REQUEST_BYTES && !line.ends_with('\n') {
            warn!(%peer, limit = MAX_REQUEST_BYTES, "request line too large, closing connection");
            let rejected = RegistryResponse::error(
                Status::BadRequest,
                "request_too_large",
                format!("request lines are limited to {MAX_REQUEST_BYTES} bytes"),
            );
            writer.write_all(encode_response(&rejected).as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            break;
        }

        let request = line.trim_end();
        if request.is_empty() {
            continue;
        }
        debug!(%peer, request, "registry request");

        let encoded = service.handle_line(request);
        writer.write_all(encoded.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

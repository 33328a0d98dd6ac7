use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::download::serve_download;
use super::listing::serve_file_list;
use super::message::{Message, MessageType};
use super::protocol::{Decoded, recv_msg_timeout, send_msg};
use super::registry::{ConnectionGuard, ConnectionRegistry};
use super::session::SessionLimits;
use super::upload::serve_upload;
use crate::TransferHooks;
use crate::config::ServerConfig;
use crate::error::{ProtocolError, TransferError};
use crate::storage::Storage;

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Cloneable control surface for a running [`FileServer`]
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ServerHandle {
    /// Stop accepting and close every live connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closing = self.registry.close_all();
        info!("Shutting down, closing {} connections", closing);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

/// Settings every connection handler needs
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    limits: SessionLimits,
    idle_timeout: Duration,
}

pub struct FileServer {
    listener: TcpListener,
    storage: Arc<Storage>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    settings: ConnectionSettings,
}

impl FileServer {
    /// Prepare storage and bind the listening socket
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let storage = Storage::open(&config.storage_dir)
            .await
            .with_context(|| format!("Failed to prepare storage at {}", config.storage_dir.display()))?;

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
        let local_addr = listener.local_addr()?;

        info!("Server started on {}", local_addr);
        info!("Files will be stored in: {}", storage.root().display());

        Ok(Self {
            listener,
            storage: Arc::new(storage),
            registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
            shutdown: CancellationToken::new(),
            settings: ConnectionSettings {
                limits: config.limits(),
                idle_timeout: config.idle_timeout(),
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Accept connections until [`ServerHandle::shutdown`] is called
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("Server stopped");
        Ok(())
    }

    fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let Some(guard) = self.registry.try_register(peer, &self.shutdown) else {
            warn!("Rejecting {}: connection limit reached", peer);
            tokio::spawn(async move {
                let _ = send_msg(&mut stream, &Message::error("Server busy")).await;
                let _ = stream.shutdown().await;
            });
            return;
        };

        let storage = Arc::clone(&self.storage);
        let settings = self.settings;
        tokio::spawn(async move {
            handle_connection(stream, peer, guard, storage, settings).await;
        });
    }
}

/// Serve requests on one connection until it closes, idles out, or the
/// server shuts down
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    storage: Arc<Storage>,
    settings: ConnectionSettings,
) {
    info!("New connection from {}", peer);
    let token = guard.token().clone();
    let hooks = TransferHooks {
        events: None,
        cancel: token.clone(),
    };
    let limits = settings.limits;

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => {
                debug!("Closing {}: server shutting down", peer);
                break;
            }
            frame = recv_msg_timeout(&mut stream, limits.max_frame_size, settings.idle_timeout) => frame,
        };

        let decoded = match frame {
            Ok(decoded) => decoded,
            Err(ProtocolError::Timeout(_)) => {
                info!("Closing idle connection from {}", peer);
                break;
            }
            Err(e) => {
                warn!("Error reading from {}: {}", peer, e);
                break;
            }
        };

        let result = match decoded {
            Decoded::EndOfStream => break,
            Decoded::Message(msg) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Abandoning request from {}: server shutting down", peer);
                        break;
                    }
                    result = dispatch(&mut stream, peer, &storage, msg, limits, &hooks) => result,
                }
            }
            Decoded::Malformed { msg_type, reason } => {
                warn!("Malformed {} from {}: {}", msg_type, peer, reason);
                let text = format!("Malformed {} payload: {}", msg_type, reason);
                // Only requests are answered; stray transfer frames are dropped
                let reply = match msg_type {
                    MessageType::UploadRequest => Some(Message::upload_response(false, text)),
                    MessageType::FileListRequest | MessageType::FileRequest => Some(Message::error(text)),
                    _ => None,
                };
                match reply {
                    Some(reply) => send_msg(&mut stream, &reply).await.map_err(TransferError::from),
                    None => Ok(()),
                }
            }
            Decoded::Unknown { code } => {
                warn!("Received unknown message type {} from {}", code, peer);
                Ok(())
            }
        };

        let Err(e) = result else { continue };
        if e.is_fatal() {
            info!("Dropping connection from {}: {}", peer, e);
            break;
        }
        if e.is_reported() {
            info!("Transfer with {} ended: {}", peer, e);
            continue;
        }

        warn!("Request from {} failed: {}", peer, e);
        if let Err(e) = send_msg(&mut stream, &Message::error(e.to_string())).await {
            warn!("Error replying to {}: {}", peer, e);
            break;
        }
    }

    drop(guard);
    let _ = stream.shutdown().await;
    info!("Connection closed with {}", peer);
}

async fn dispatch(
    stream: &mut TcpStream,
    peer: SocketAddr,
    storage: &Storage,
    msg: Message,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> std::result::Result<(), TransferError> {
    match msg {
        Message::FileListRequest => serve_file_list(stream, storage).await,
        Message::FileRequest(request) => {
            info!("{} requested {}", peer, request.filename);
            serve_download(stream, storage, request, limits, hooks).await
        }
        Message::UploadRequest(request) => {
            info!("{} is uploading {}", peer, request.filename);
            serve_upload(stream, storage, request, limits, hooks).await
        }
        other => {
            warn!("Ignoring unexpected {} from {}", other.msg_type(), peer);
            Ok(())
        }
    }
}

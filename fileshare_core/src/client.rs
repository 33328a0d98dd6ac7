//! Client side of the protocol: one connection, one request at a time.

use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::TransferError;
use crate::transfer::download::{DownloadOutcome, DownloadTarget, fetch_download};
use crate::transfer::listing::fetch_file_list;
use crate::transfer::message::FileEntry;
use crate::transfer::upload::{UploadOutcome, push_single_frame, push_upload};
use crate::transfer::utils::report_event;
use crate::{TransferEvent, TransferHooks};

pub struct FileClient {
    stream: Option<TcpStream>,
    addr: String,
    config: ClientConfig,
}

impl FileClient {
    /// Connect to a server at `addr` ("host:port")
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self, TransferError> {
        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransferError::Connect {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(TransferError::Connect {
                    addr: addr.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        info!("Connected to server at {}", addr);
        Ok(Self {
            stream: Some(stream),
            addr: addr.to_string(),
            config,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection; later requests fail with `NotConnected`
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("Disconnected from server");
        }
    }

    pub async fn list_files(&mut self) -> Result<Vec<FileEntry>, TransferError> {
        let limits = self.config.limits();
        let stream = self.stream.as_mut().ok_or(TransferError::NotConnected)?;
        let result = fetch_file_list(stream, limits).await;
        self.settle(result)
    }

    /// Download `filename` to `dest`, or into the configured download
    /// directory under the server's name for it
    pub async fn download_file(
        &mut self,
        filename: &str,
        dest: Option<&Path>,
        hooks: &TransferHooks,
    ) -> Result<DownloadOutcome, TransferError> {
        let target = match dest {
            Some(path) => DownloadTarget::File(path.to_path_buf()),
            None => DownloadTarget::Directory(self.config.download_dir.clone()),
        };
        let limits = self.config.limits();
        let stream = self.stream.as_mut().ok_or(TransferError::NotConnected)?;

        let result = fetch_download(stream, filename, &target, limits, hooks).await;
        let event = match &result {
            Ok(outcome) => TransferEvent::Completed {
                file_name: filename.to_string(),
                bytes: outcome.bytes,
                is_sending: false,
            },
            Err(e) => TransferEvent::Error(format!("Error downloading {}: {}", filename, e)),
        };
        report_event(hooks, event).await;
        self.settle(result)
    }

    /// Upload the file at `path` in chunks
    pub async fn upload_file(&mut self, path: &Path, hooks: &TransferHooks) -> Result<UploadOutcome, TransferError> {
        let limits = self.config.limits();
        let stream = self.stream.as_mut().ok_or(TransferError::NotConnected)?;

        let result = push_upload(stream, path, limits, hooks).await;
        let event = match &result {
            Ok(outcome) => TransferEvent::Completed {
                file_name: outcome.file_name.clone(),
                bytes: outcome.bytes,
                is_sending: true,
            },
            Err(e) => TransferEvent::Error(format!("Error uploading {}: {}", path.display(), e)),
        };
        report_event(hooks, event).await;
        self.settle(result)
    }

    /// Upload `data` as `filename` in a single frame
    pub async fn upload_bytes(&mut self, filename: &str, data: Vec<u8>) -> Result<UploadOutcome, TransferError> {
        let limits = self.config.limits();
        let stream = self.stream.as_mut().ok_or(TransferError::NotConnected)?;
        let result = push_single_frame(stream, filename, data, limits).await;
        self.settle(result)
    }

    /// Drop the connection if `result` leaves it out of step with the server
    fn settle<T>(&mut self, result: Result<T, TransferError>) -> Result<T, TransferError> {
        if let Err(e) = &result {
            if e.invalidates_connection() && self.stream.take().is_some() {
                warn!("Closing connection to {}: {}", self.addr, e);
            }
        }
        result
    }
}


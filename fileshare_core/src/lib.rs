use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod config;
pub mod error;
pub mod storage;
pub mod transfer;

pub use client::FileClient;
pub use config::{AppConfig, ClientConfig, ServerConfig};
pub use error::{ProtocolError, TransferError};
pub use storage::Storage;
pub use transfer::message::FileEntry;
pub use transfer::{DownloadOutcome, FileServer, ServerHandle, UploadOutcome};

//Report from a transfer to whoever is watching it
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        file_name: String,
        /// Percentage of chunks done (0.0 - 100.0)
        progress: f32,
        chunks_done: u64,
        total_chunks: u64,
        bytes_done: u64,
        speed: String,
        is_sending: bool,
    },
    Completed {
        file_name: String,
        bytes: u64,
        is_sending: bool,
    },
    Error(String),
}

/// Optional progress channel and cancellation for one transfer
#[derive(Debug, Clone)]
pub struct TransferHooks {
    pub events: Option<mpsc::Sender<TransferEvent>>,
    /// Checked before each chunk; cancelling aborts at the next boundary
    pub cancel: CancellationToken,
}

impl Default for TransferHooks {
    fn default() -> Self {
        Self {
            events: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl TransferHooks {
    pub fn with_events(events: mpsc::Sender<TransferEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

//! Per-transfer state shared by the download and upload exchanges.

use std::time::Duration;
use tracing::debug;

use super::constants::DEFAULT_MAX_FRAME_SIZE;
use super::message::chunk_count;

/// Lifecycle of one transfer on one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    MetadataSent,
    MetadataReceived,
    Streaming,
    AwaitingCompletion,
    Done,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }
}

/// Bounds applied to every blocking receive inside an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub read_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(super::constants::DEFAULT_READ_TIMEOUT_SECS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// One file transfer, owned by the session that created it
#[derive(Debug)]
pub struct Transfer {
    pub filename: String,
    pub file_size: u64,
    pub expected_chunks: u64,
    pub chunks_done: u64,
    pub bytes_done: u64,
    pub cancelled: bool,
    state: TransferState,
}

impl Transfer {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            file_size: 0,
            expected_chunks: 0,
            chunks_done: 0,
            bytes_done: 0,
            cancelled: false,
            state: TransferState::Requested,
        }
    }

    /// Record the size announced in the metadata exchange
    pub fn set_size(&mut self, file_size: u64) {
        self.file_size = file_size;
        self.expected_chunks = chunk_count(file_size);
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn advance(&mut self, next: TransferState) {
        if self.state.is_terminal() {
            return;
        }
        debug!("{}: {:?} -> {:?}", self.filename, self.state, next);
        self.state = next;
    }

    pub fn fail(&mut self) {
        self.advance(TransferState::Failed);
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_done == self.expected_chunks && self.bytes_done == self.file_size
    }
}

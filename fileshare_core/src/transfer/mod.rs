//! Framed TCP file transfer.
//!
//! This module provides:
//! - The frame codec and message types
//! - Lock-step chunk sending and receiving with per-chunk acknowledgment
//! - Download, upload and listing exchanges for both endpoints
//! - The multi-connection server

pub mod constants;
pub mod download;
pub mod listing;
pub mod message;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod server;
pub mod session;
pub mod upload;
pub mod utils;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use download::{DownloadOutcome, DownloadTarget};
pub use server::{FileServer, ServerHandle};
pub use session::{SessionLimits, TransferState};
pub use upload::UploadOutcome;

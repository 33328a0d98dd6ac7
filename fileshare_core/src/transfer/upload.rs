//! Upload exchanges: a file flows from the client to the server.
//!
//! Chunked (the normal path):
//!
//! ```text
//! client                                      server
//!   UploadRequest{filename, file_size, chunks} --->
//!                                      <---   UploadResponse{true, "Ready to receive .."}
//!   FileChunk{chunk_id, total_chunks, data}    --->
//!                                      <---   ChunkAck{chunk_id}
//!   TransferComplete{success, filename}        --->
//!                                      <---   UploadResponse{true, "File .. uploaded successfully"}
//! ```
//!
//! Single frame: `UploadRequest` carries the whole file in `file_data` and is
//! answered by one `UploadResponse`.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use super::message::{Message, UploadRequest, chunk_count};
use super::protocol::{Decoded, recv_msg_timeout, send_msg};
use super::receiver::{ReceiverRole, receive_chunks};
use super::sender::send_chunks;
use super::session::{SessionLimits, Transfer, TransferState};
use crate::TransferHooks;
use crate::error::TransferError;
use crate::storage::{PendingUpload, Storage};

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub file_name: String,
    pub bytes: u64,
    /// Confirmation text from the server
    pub message: String,
}

/// Serve one upload request.
///
/// Every failure the client should hear about is answered with an
/// unsuccessful `UploadResponse`. Only fatal errors and aborts the client
/// already knows about are returned.
pub async fn serve_upload<S>(
    stream: &mut S,
    storage: &Storage,
    request: UploadRequest,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pending = match storage.begin_upload(&request.filename) {
        Ok(pending) => pending,
        Err(e) => {
            warn!("Rejecting upload: {}", e);
            return respond(stream, false, e.to_string()).await;
        }
    };

    match (request.file_data, request.chunks) {
        (Some(data), _) if data.is_empty() => {
            let err = TransferError::InvalidUpload("empty file content".to_string());
            respond(stream, false, err.to_string()).await
        }
        (Some(data), _) => serve_single_frame(stream, &pending, &data).await,
        (None, Some(chunks)) => {
            let file_size = request.file_size.unwrap_or(0);
            serve_chunked(stream, &pending, file_size, chunks, limits, hooks).await
        }
        (None, None) => {
            let err = TransferError::InvalidUpload("no file content".to_string());
            respond(stream, false, err.to_string()).await
        }
    }
}

async fn serve_single_frame<S>(stream: &mut S, pending: &PendingUpload, data: &[u8]) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_staged(pending, data).await {
        warn!("Failed to store {}: {}", pending.file_name, e);
        pending.discard().await;
        return respond(stream, false, format!("Error saving {}: {}", pending.file_name, e)).await;
    }

    info!("Received {} ({} bytes)", pending.file_name, data.len());
    respond(stream, true, format!("File {} uploaded successfully", pending.file_name)).await
}

async fn write_staged(pending: &PendingUpload, data: &[u8]) -> std::io::Result<()> {
    let mut file = pending.create().await?;
    file.write_all(data).await?;
    file.flush().await?;
    drop(file);
    pending.commit().await
}

async fn serve_chunked<S>(
    stream: &mut S,
    pending: &PendingUpload,
    file_size: u64,
    chunks: u64,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if chunks != chunk_count(file_size) {
        let err = TransferError::InvalidUpload(format!("{} bytes cannot span {} chunks", file_size, chunks));
        return respond(stream, false, err.to_string()).await;
    }

    let mut file = match pending.create().await {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to stage {}: {}", pending.file_name, e);
            return respond(stream, false, format!("Error saving {}: {}", pending.file_name, e)).await;
        }
    };

    let mut transfer = Transfer::new(&pending.file_name);
    transfer.set_size(file_size);
    transfer.advance(TransferState::MetadataReceived);
    respond(stream, true, format!("Ready to receive {}", pending.file_name)).await?;
    info!("Receiving {} ({} bytes, {} chunks)", pending.file_name, file_size, chunks);

    let received = receive_chunks(stream, &mut file, &mut transfer, ReceiverRole::Upload, limits, hooks).await;
    drop(file);

    if let Err(e) = received {
        pending.discard().await;
        if e.is_fatal() || e.is_reported() {
            return Err(e);
        }
        warn!("Upload of {} failed: {}", pending.file_name, e);
        return respond(stream, false, e.to_string()).await;
    }

    if let Err(e) = pending.commit().await {
        warn!("Failed to store {}: {}", pending.file_name, e);
        pending.discard().await;
        return respond(stream, false, format!("Error saving {}: {}", pending.file_name, e)).await;
    }

    info!("Received {} ({} bytes)", pending.file_name, transfer.bytes_done);
    respond(stream, true, format!("File {} uploaded successfully", pending.file_name)).await
}

async fn respond<S>(stream: &mut S, success: bool, message: String) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
{
    send_msg(stream, &Message::upload_response(success, message)).await?;
    Ok(())
}

/// Upload the file at `path` in chunks, under its base name
pub async fn push_upload<S>(
    stream: &mut S,
    path: &Path,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<UploadOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidUpload(format!("no usable file name in {}", path.display())))?
        .to_string();
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut transfer = Transfer::new(&file_name);
    transfer.set_size(file_size);
    send_msg(
        stream,
        &Message::UploadRequest(UploadRequest {
            filename: file_name.clone(),
            file_data: None,
            file_size: Some(file_size),
            chunks: Some(transfer.expected_chunks),
        }),
    )
    .await?;

    await_upload_response(stream, limits).await?;
    transfer.advance(TransferState::MetadataSent);

    send_chunks(stream, &mut file, &mut transfer, limits, hooks).await?;

    send_msg(stream, &Message::transfer_complete(&file_name)).await?;
    transfer.advance(TransferState::AwaitingCompletion);

    let message = match await_upload_response(stream, limits).await {
        Ok(message) => message,
        Err(e) => {
            transfer.fail();
            return Err(e);
        }
    };
    transfer.advance(TransferState::Done);
    info!("Uploaded {} ({} bytes)", file_name, file_size);

    Ok(UploadOutcome {
        file_name,
        bytes: file_size,
        message,
    })
}

/// Upload `data` as a single frame (legacy form)
pub async fn push_single_frame<S>(
    stream: &mut S,
    filename: &str,
    data: Vec<u8>,
    limits: SessionLimits,
) -> Result<UploadOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = data.len() as u64;
    send_msg(
        stream,
        &Message::UploadRequest(UploadRequest {
            filename: filename.to_string(),
            file_data: Some(data),
            file_size: Some(bytes),
            chunks: Some(chunk_count(bytes)),
        }),
    )
    .await?;

    let message = await_upload_response(stream, limits).await?;
    Ok(UploadOutcome {
        file_name: filename.to_string(),
        bytes,
        message,
    })
}

/// Wait for a successful `UploadResponse` and return its message
async fn await_upload_response<S>(stream: &mut S, limits: SessionLimits) -> Result<String, TransferError>
where
    S: AsyncRead + Unpin,
{
    match recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await? {
        Decoded::Message(Message::UploadResponse(resp)) if resp.success => Ok(resp.message),
        Decoded::Message(Message::UploadResponse(resp)) => Err(TransferError::Remote(resp.message)),
        Decoded::Message(Message::Error(e)) => Err(TransferError::Remote(e.error)),
        Decoded::EndOfStream => Err(TransferError::ConnectionLost),
        Decoded::Malformed { msg_type, reason } => Err(TransferError::Malformed { msg_type, reason }),
        other => Err(TransferError::UnexpectedMessage {
            expected: "upload response",
            got: other.describe(),
        }),
    }
}

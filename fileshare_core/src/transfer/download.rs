//! Download exchange: a named file flows from the server to the client.
//!
//! ```text
//! client                          server
//!   FileRequest{filename}  --->
//!                          <---   FileResponse{filename, file_size, chunks}
//!   (for each chunk)
//!                          <---   FileChunk{chunk_id, total_chunks, data}
//!   ChunkAck{chunk_id}     --->
//!                          <---   TransferComplete{success, filename}
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::message::{FileMetadata, FileRequest, Message, chunk_count};
use super::protocol::{Decoded, recv_msg_timeout, send_msg};
use super::receiver::{ReceiverRole, abort, receive_chunks};
use super::sender::send_chunks;
use super::session::{SessionLimits, Transfer, TransferState};
use super::utils::{open_secure_file, sanitize_file_name};
use crate::TransferHooks;
use crate::error::TransferError;
use crate::storage::Storage;

/// Where a downloaded file should end up
#[derive(Debug, Clone)]
pub enum DownloadTarget {
    /// Save under the name the server reports, inside this directory
    Directory(PathBuf),
    /// Save at exactly this path
    File(PathBuf),
}

/// Result of a successful download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: u64,
}

/// Serve one download request.
///
/// A missing file is reported as [`TransferError::NotFound`] before anything
/// is written, leaving the caller to answer with an error frame.
pub async fn serve_download<S>(
    stream: &mut S,
    storage: &Storage,
    request: FileRequest,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transfer = Transfer::new(request.filename);
    let Some((mut file, file_size)) = storage.open_for_download(&transfer.filename).await? else {
        transfer.fail();
        return Err(TransferError::NotFound(transfer.filename));
    };

    transfer.set_size(file_size);
    let metadata = FileMetadata::new(&transfer.filename, file_size);
    info!(
        "Sending {} ({} bytes, {} chunks)",
        transfer.filename, file_size, metadata.chunks
    );
    send_msg(stream, &Message::FileResponse(metadata)).await?;
    transfer.advance(TransferState::MetadataSent);

    send_chunks(stream, &mut file, &mut transfer, limits, hooks).await?;

    send_msg(stream, &Message::transfer_complete(&transfer.filename)).await?;
    transfer.advance(TransferState::Done);
    info!("Sent {}", transfer.filename);
    Ok(())
}

/// Request `filename` and write it to `target`.
///
/// Content goes to a `.part` file next to the destination and is renamed
/// into place only after the server confirms completion.
pub async fn fetch_download<S>(
    stream: &mut S,
    filename: &str,
    target: &DownloadTarget,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<DownloadOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_msg(
        stream,
        &Message::FileRequest(FileRequest {
            filename: filename.to_string(),
        }),
    )
    .await?;

    let mut transfer = Transfer::new(filename);
    let metadata = match recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await? {
        Decoded::Message(Message::FileResponse(metadata)) => metadata,
        Decoded::Message(Message::Error(e)) => {
            return Err(match e.error.strip_prefix("File not found: ") {
                Some(name) => TransferError::NotFound(name.to_string()),
                None => TransferError::Remote(e.error),
            });
        }
        Decoded::EndOfStream => return Err(TransferError::ConnectionLost),
        Decoded::Malformed { msg_type, reason } => {
            return Err(TransferError::Malformed { msg_type, reason });
        }
        other => {
            return Err(TransferError::UnexpectedMessage {
                expected: "file response",
                got: other.describe(),
            });
        }
    };

    if metadata.chunks != chunk_count(metadata.file_size) {
        return Err(TransferError::ProtocolViolation(format!(
            "{} bytes cannot span {} chunks",
            metadata.file_size, metadata.chunks
        )));
    }
    transfer.set_size(metadata.file_size);
    transfer.advance(TransferState::MetadataReceived);
    debug!(
        "Receiving {} ({} bytes, {} chunks)",
        filename, metadata.file_size, metadata.chunks
    );

    // The first chunk (or the completion frame) is already on its way
    let dest = match resolve_destination(target, &metadata, filename).await {
        Ok(dest) => dest,
        Err(e) => return Err(abort_local(stream, &mut transfer, e, limits).await),
    };
    let part_path = part_path(&dest);
    let mut file = match open_secure_file(&part_path).await {
        Ok(file) => file,
        Err(e) => return Err(abort_local(stream, &mut transfer, TransferError::Io(e), limits).await),
    };

    let received = receive_chunks(stream, &mut file, &mut transfer, ReceiverRole::Download, limits, hooks).await;
    drop(file);
    if let Err(e) = received {
        remove_partial(&part_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&part_path, &dest).await {
        remove_partial(&part_path).await;
        return Err(TransferError::Io(e));
    }

    info!("Saved {} to {}", filename, dest.display());
    Ok(DownloadOutcome {
        path: dest,
        bytes: transfer.bytes_done,
        chunks: transfer.chunks_done,
    })
}

async fn resolve_destination(
    target: &DownloadTarget,
    metadata: &FileMetadata,
    requested: &str,
) -> Result<PathBuf, TransferError> {
    match target {
        DownloadTarget::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).await?;
            }
            Ok(path.clone())
        }
        DownloadTarget::Directory(dir) => {
            // Never trust the server's name beyond its base component
            let name = sanitize_file_name(&metadata.filename)
                .or_else(|| sanitize_file_name(requested))
                .ok_or_else(|| {
                    TransferError::ProtocolViolation(format!(
                        "unusable file name {:?}",
                        metadata.filename
                    ))
                })?;
            fs::create_dir_all(dir).await?;
            Ok(dir.join(name))
        }
    }
}

async fn abort_local<S>(
    stream: &mut S,
    transfer: &mut Transfer,
    err: TransferError,
    limits: SessionLimits,
) -> TransferError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Aborting download of {}: {}", transfer.filename, err);
    match abort(stream, transfer, ReceiverRole::Download, err, true, limits).await {
        Ok(()) => TransferError::Aborted(transfer.filename.clone()),
        Err(e) => e,
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!("Failed to remove partial file {:?}: {}", path, e);
    }
}

use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::constants::MAX_CHUNK_SIZE;
use super::message::{ChunkAck, Message};
use super::protocol::{Decoded, recv_msg_timeout, send_msg};
use super::session::{SessionLimits, Transfer, TransferState};
use super::utils::report_progress;
use crate::TransferHooks;
use crate::error::TransferError;

/// Which side of which exchange is receiving chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverRole {
    /// Client pulling a file from the server
    Download,
    /// Server accepting a file from a client
    Upload,
}

impl ReceiverRole {
    /// Frame that tells the sender to stop
    fn abort_notice(self, reason: &str) -> Message {
        match self {
            ReceiverRole::Download => Message::error(reason),
            ReceiverRole::Upload => Message::upload_response(false, reason),
        }
    }

    /// Error for an error frame sent by the other side
    fn peer_error(self, text: String) -> TransferError {
        match self {
            ReceiverRole::Download => TransferError::Remote(text),
            ReceiverRole::Upload => TransferError::PeerAborted(text),
        }
    }
}

/// Receive `transfer.expected_chunks` chunks into `sink`, acknowledging each,
/// then wait for the sender's completion frame.
pub async fn receive_chunks<S>(
    stream: &mut S,
    sink: &mut File,
    transfer: &mut Transfer,
    role: ReceiverRole,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transfer.advance(TransferState::Streaming);
    let start_time = Instant::now();

    while transfer.chunks_done < transfer.expected_chunks {
        if hooks.cancel.is_cancelled() {
            transfer.cancelled = true;
            // The next chunk is already on its way
            return abort(stream, transfer, role, TransferError::Cancelled, true, limits).await;
        }

        let frame = match recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await {
            Ok(frame) => frame,
            Err(e) => {
                transfer.fail();
                return Err(e.into());
            }
        };
        let chunk = match frame {
            Decoded::Message(Message::FileChunk(chunk)) => chunk,
            other => {
                transfer.fail();
                return Err(unexpected_frame(other, role, transfer));
            }
        };

        if let Err(e) = validate_chunk(transfer, chunk.chunk_id, chunk.total_chunks, chunk.data.len()) {
            transfer.fail();
            return Err(e);
        }

        if let Err(e) = sink.write_all(&chunk.data).await {
            warn!("Failed to write {}: {}", transfer.filename, e);
            return abort(stream, transfer, role, TransferError::Io(e), false, limits).await;
        }

        if let Err(e) = send_msg(stream, &Message::ChunkAck(ChunkAck { chunk_id: chunk.chunk_id })).await {
            transfer.fail();
            return Err(e.into());
        }

        transfer.chunks_done += 1;
        transfer.bytes_done += chunk.data.len() as u64;
        debug!(
            "Chunk {}/{} of {} received",
            transfer.chunks_done, transfer.expected_chunks, transfer.filename
        );
        report_progress(
            hooks,
            &transfer.filename,
            transfer.chunks_done,
            transfer.expected_chunks,
            transfer.bytes_done,
            start_time,
            false,
        )
        .await;
    }

    transfer.advance(TransferState::AwaitingCompletion);
    if let Err(e) = sink.flush().await {
        warn!("Failed to flush {}: {}", transfer.filename, e);
        // The completion frame is already on its way
        return abort(stream, transfer, role, TransferError::Io(e), true, limits).await;
    }

    let frame = match recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await {
        Ok(frame) => frame,
        Err(e) => {
            transfer.fail();
            return Err(e.into());
        }
    };
    let outcome = match frame {
        Decoded::Message(Message::TransferComplete(done)) if done.success => Ok(()),
        Decoded::Message(Message::TransferComplete(_)) => {
            Err(role.peer_error("sender reported an unsuccessful transfer".to_string()))
        }
        Decoded::Message(Message::Error(e)) => Err(role.peer_error(e.error)),
        Decoded::EndOfStream => Err(TransferError::ConnectionLost),
        other => Err(TransferError::IncompleteTransfer(format!(
            "expected transfer complete after {} chunks, got {}",
            transfer.chunks_done,
            other.describe()
        ))),
    };
    if let Err(e) = outcome {
        transfer.fail();
        return Err(e);
    }

    if !transfer.is_complete() {
        transfer.fail();
        return Err(TransferError::IncompleteTransfer(format!(
            "received {} of {} bytes",
            transfer.bytes_done, transfer.file_size
        )));
    }

    transfer.advance(TransferState::Done);
    Ok(())
}

/// Check a chunk against the transfer before any of it is written
fn validate_chunk(transfer: &Transfer, chunk_id: u64, total_chunks: u64, len: usize) -> Result<(), TransferError> {
    if chunk_id != transfer.chunks_done {
        return Err(TransferError::ProtocolViolation(format!(
            "expected chunk {}, got {}",
            transfer.chunks_done, chunk_id
        )));
    }
    if total_chunks != transfer.expected_chunks {
        return Err(TransferError::ProtocolViolation(format!(
            "chunk {} claims {} total chunks, expected {}",
            chunk_id, total_chunks, transfer.expected_chunks
        )));
    }
    if len > MAX_CHUNK_SIZE {
        return Err(TransferError::ProtocolViolation(format!(
            "chunk {} carries {} bytes (max {})",
            chunk_id, len, MAX_CHUNK_SIZE
        )));
    }
    if transfer.bytes_done + len as u64 > transfer.file_size {
        return Err(TransferError::ProtocolViolation(format!(
            "chunk {} overruns the announced size of {} bytes",
            chunk_id, transfer.file_size
        )));
    }
    Ok(())
}

/// Map a frame that arrived where a chunk was expected
fn unexpected_frame(frame: Decoded, role: ReceiverRole, transfer: &Transfer) -> TransferError {
    match frame {
        Decoded::Message(Message::TransferComplete(_)) => TransferError::IncompleteTransfer(format!(
            "transfer completed after {} of {} chunks",
            transfer.chunks_done, transfer.expected_chunks
        )),
        Decoded::Message(Message::Error(e)) => role.peer_error(e.error),
        Decoded::EndOfStream => TransferError::ConnectionLost,
        Decoded::Malformed { msg_type, reason } => TransferError::Malformed { msg_type, reason },
        other => TransferError::UnexpectedMessage {
            expected: "file chunk",
            got: other.describe(),
        },
    }
}

/// Stop the sender and report `err` as already handled.
///
/// With `in_flight` set, the one frame the sender has already committed to
/// is read and dropped so the connection is ready for the next request.
pub async fn abort<S>(
    stream: &mut S,
    transfer: &mut Transfer,
    role: ReceiverRole,
    err: TransferError,
    in_flight: bool,
    limits: SessionLimits,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transfer.fail();
    let reason = err.to_string();
    send_msg(stream, &role.abort_notice(&reason)).await?;

    // A cancelled upload means the server is going away; no point waiting
    let drain = in_flight && !(role == ReceiverRole::Upload && transfer.cancelled);
    if drain {
        let dropped = recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await?;
        if dropped == Decoded::EndOfStream {
            return Err(TransferError::ConnectionLost);
        }
        debug!("Discarded {} after aborting {}", dropped.describe(), transfer.filename);
    }

    match err {
        TransferError::Cancelled => Err(TransferError::Cancelled),
        _ => Err(TransferError::Aborted(reason)),
    }
}

use std::cmp::min;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

use super::constants::MAX_CHUNK_SIZE;
use super::message::{Chunk, Message};
use super::protocol::{Decoded, recv_msg_timeout, send_msg};
use super::session::{SessionLimits, Transfer, TransferState};
use super::utils::report_progress;
use crate::TransferHooks;
use crate::error::TransferError;

/// Stream `file` to the peer one chunk at a time.
///
/// Each chunk must be acknowledged before the next one is read. The caller
/// sends whatever closes the exchange once this returns `Ok`.
pub async fn send_chunks<S>(
    stream: &mut S,
    file: &mut File,
    transfer: &mut Transfer,
    limits: SessionLimits,
    hooks: &TransferHooks,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transfer.advance(TransferState::Streaming);
    let start_time = Instant::now();
    let mut buffer = vec![0u8; MAX_CHUNK_SIZE];

    for chunk_id in 0..transfer.expected_chunks {
        if hooks.cancel.is_cancelled() {
            transfer.cancelled = true;
            return abort(stream, transfer, TransferError::Cancelled).await;
        }

        let remaining = transfer.file_size - transfer.bytes_done;
        let len = min(remaining, MAX_CHUNK_SIZE as u64) as usize;
        if let Err(e) = file.read_exact(&mut buffer[..len]).await {
            warn!("Failed to read {}: {}", transfer.filename, e);
            return abort(stream, transfer, TransferError::Io(e)).await;
        }

        let chunk = Message::FileChunk(Chunk {
            chunk_id,
            total_chunks: transfer.expected_chunks,
            data: buffer[..len].to_vec(),
        });
        if let Err(e) = send_msg(stream, &chunk).await {
            transfer.fail();
            return Err(e.into());
        }

        if let Err(e) = await_ack(stream, chunk_id, limits).await {
            transfer.fail();
            return Err(e);
        }

        transfer.chunks_done += 1;
        transfer.bytes_done += len as u64;
        debug!(
            "Chunk {}/{} of {} acknowledged",
            transfer.chunks_done, transfer.expected_chunks, transfer.filename
        );
        report_progress(
            hooks,
            &transfer.filename,
            transfer.chunks_done,
            transfer.expected_chunks,
            transfer.bytes_done,
            start_time,
            true,
        )
        .await;
    }

    Ok(())
}

/// Wait for the acknowledgment of `chunk_id`
async fn await_ack<S>(stream: &mut S, chunk_id: u64, limits: SessionLimits) -> Result<(), TransferError>
where
    S: AsyncRead + Unpin,
{
    match recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await? {
        Decoded::Message(Message::ChunkAck(ack)) if ack.chunk_id == chunk_id => Ok(()),
        Decoded::Message(Message::ChunkAck(ack)) => Err(TransferError::ProtocolViolation(format!(
            "expected acknowledgment for chunk {}, got {}",
            chunk_id, ack.chunk_id
        ))),
        Decoded::Message(Message::Error(e)) => Err(TransferError::PeerAborted(e.error)),
        Decoded::Message(Message::UploadResponse(resp)) if !resp.success => {
            Err(TransferError::Remote(resp.message))
        }
        Decoded::EndOfStream => Err(TransferError::ConnectionLost),
        Decoded::Malformed { msg_type, reason } => Err(TransferError::Malformed { msg_type, reason }),
        other => Err(TransferError::UnexpectedMessage {
            expected: "chunk acknowledgment",
            got: other.describe(),
        }),
    }
}

/// Tell the peer the transfer is over and report why.
///
/// The peer is waiting for the next chunk, so nothing is in flight and the
/// connection stays in step.
async fn abort<S>(stream: &mut S, transfer: &mut Transfer, err: TransferError) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
{
    transfer.fail();
    let reason = err.to_string();
    send_msg(stream, &Message::error(&reason)).await?;

    match err {
        TransferError::Cancelled => Err(TransferError::Cancelled),
        _ => Err(TransferError::Aborted(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::constants::DEFAULT_MAX_FRAME_SIZE;
    use crate::transfer::message::ChunkAck;
    use crate::transfer::protocol::recv_msg;
    use tokio::io::AsyncWriteExt;

    async fn temp_file(dir: &tempfile::TempDir, data: &[u8]) -> (File, u64) {
        let path = dir.path().join("source.bin");
        let mut file = File::create(&path).await.unwrap();
        file.write_all(data).await.unwrap();
        file.flush().await.unwrap();
        (File::open(&path).await.unwrap(), data.len() as u64)
    }

    async fn next_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Message {
        match recv_msg(stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap() {
            Decoded::Message(msg) => msg,
            other => panic!("expected a message, got {}", other.describe()),
        }
    }

    #[tokio::test]
    async fn test_sends_every_chunk_after_ack() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..MAX_CHUNK_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();
        let (mut file, size) = temp_file(&dir, &data).await;
        let (mut local, mut peer) = tokio::io::duplex(256 * 1024);

        let peer_task = tokio::spawn(async move {
            let mut received = Vec::new();
            for expected_id in 0..3u64 {
                match next_frame(&mut peer).await {
                    Message::FileChunk(chunk) => {
                        assert_eq!(chunk.chunk_id, expected_id);
                        assert_eq!(chunk.total_chunks, 3);
                        received.extend_from_slice(&chunk.data);
                    }
                    other => panic!("unexpected {:?}", other.msg_type()),
                }
                send_msg(&mut peer, &Message::ChunkAck(ChunkAck { chunk_id: expected_id }))
                    .await
                    .unwrap();
            }
            received
        });

        let mut transfer = Transfer::new("source.bin");
        transfer.set_size(size);
        send_chunks(&mut local, &mut file, &mut transfer, SessionLimits::default(), &TransferHooks::default())
            .await
            .unwrap();

        assert_eq!(peer_task.await.unwrap(), data);
        assert!(transfer.is_complete());
    }

    #[tokio::test]
    async fn test_wrong_ack_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, size) = temp_file(&dir, b"hello").await;
        let (mut local, mut peer) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let _ = next_frame(&mut peer).await;
            send_msg(&mut peer, &Message::ChunkAck(ChunkAck { chunk_id: 7 }))
                .await
                .unwrap();
            // Keep the stream open until the sender gives up
            let _ = recv_msg(&mut peer, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let mut transfer = Transfer::new("source.bin");
        transfer.set_size(size);
        let err = send_chunks(&mut local, &mut file, &mut transfer, SessionLimits::default(), &TransferHooks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)), "{}", err);
        assert_eq!(transfer.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_sends_error_instead_of_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, size) = temp_file(&dir, b"hello").await;
        let (mut local, mut peer) = tokio::io::duplex(64 * 1024);

        let hooks = TransferHooks::default();
        hooks.cancel.cancel();

        let mut transfer = Transfer::new("source.bin");
        transfer.set_size(size);
        let err = send_chunks(&mut local, &mut file, &mut transfer, SessionLimits::default(), &hooks)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(transfer.cancelled);

        match next_frame(&mut peer).await {
            Message::Error(e) => assert_eq!(e.error, "Transfer cancelled"),
            other => panic!("unexpected {:?}", other.msg_type()),
        }
    }

    #[tokio::test]
    async fn test_peer_error_instead_of_ack() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, size) = temp_file(&dir, b"hello").await;
        let (mut local, mut peer) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let _ = next_frame(&mut peer).await;
            send_msg(&mut peer, &Message::error("Transfer cancelled")).await.unwrap();
            let _ = recv_msg(&mut peer, DEFAULT_MAX_FRAME_SIZE).await;
        });

        let mut transfer = Transfer::new("source.bin");
        transfer.set_size(size);
        let err = send_chunks(&mut local, &mut file, &mut transfer, SessionLimits::default(), &TransferHooks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::PeerAborted(ref m) if m == "Transfer cancelled"));
        assert!(err.is_reported());
    }
}

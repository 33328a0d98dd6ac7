use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::message::{FileEntry, FileList, Message};
use super::protocol::{Decoded, recv_msg_timeout, send_msg};
use super::session::SessionLimits;
use crate::error::TransferError;
use crate::storage::Storage;

/// Answer a list request with the current storage contents
pub async fn serve_file_list<S>(stream: &mut S, storage: &Storage) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
{
    let files = storage.list().await?;
    debug!("Listing {} files", files.len());
    send_msg(stream, &Message::FileListResponse(FileList { files })).await?;
    Ok(())
}

/// Ask the server for its file list
pub async fn fetch_file_list<S>(stream: &mut S, limits: SessionLimits) -> Result<Vec<FileEntry>, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_msg(stream, &Message::FileListRequest).await?;

    match recv_msg_timeout(stream, limits.max_frame_size, limits.read_timeout).await? {
        Decoded::Message(Message::FileListResponse(list)) => Ok(list.files),
        Decoded::Message(Message::Error(e)) => Err(TransferError::Remote(e.error)),
        Decoded::EndOfStream => Err(TransferError::ConnectionLost),
        Decoded::Malformed { msg_type, reason } => Err(TransferError::Malformed { msg_type, reason }),
        other => Err(TransferError::UnexpectedMessage {
            expected: "file list response",
            got: other.describe(),
        }),
    }
}

//! Frame codec.
//!
//! ```text
//! [type: u32 BE][length: u32 BE][payload: length bytes of JSON]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{HEADER_SIZE, READ_CHUNK_SIZE};
use super::message::{Message, MessageType};
use crate::error::ProtocolError;

/// Result of reading one frame from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(Message),
    /// Known type whose payload could not be parsed
    Malformed { msg_type: MessageType, reason: String },
    /// Type code outside the protocol; the payload was consumed
    Unknown { code: u32 },
    /// Peer closed (cleanly or not) before a complete frame arrived
    EndOfStream,
}

impl Decoded {
    /// Short description used in logs and "unexpected message" errors
    pub fn describe(&self) -> String {
        match self {
            Decoded::Message(msg) => msg.msg_type().to_string(),
            Decoded::Malformed { msg_type, .. } => format!("malformed {}", msg_type),
            Decoded::Unknown { code } => format!("unknown message type {}", code),
            Decoded::EndOfStream => "end of stream".to_string(),
        }
    }
}

/// Encode a message into a complete frame (header + payload)
pub fn encode_frame(msg: &Message) -> Result<Bytes, ProtocolError> {
    let payload = msg.payload()?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u32(msg.msg_type().code());
    frame.put_u32(len);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Parse a payload that has already been read off the wire
pub fn decode_payload(code: u32, payload: &[u8]) -> Decoded {
    let Some(msg_type) = MessageType::from_code(code) else {
        return Decoded::Unknown { code };
    };

    match Message::from_payload(msg_type, payload) {
        Ok(msg) => Decoded::Message(msg),
        Err(e) => Decoded::Malformed {
            msg_type,
            reason: e.to_string(),
        },
    }
}

/// Send a protocol message over a stream
pub async fn send_msg<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive one frame from a stream.
///
/// A peer disconnect at any point of the frame yields [`Decoded::EndOfStream`].
/// Only other I/O errors and oversized frames are reported as errors.
pub async fn recv_msg<R>(reader: &mut R, max_frame_size: usize) -> Result<Decoded, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if is_disconnect(&e) => return Ok(Decoded::EndOfStream),
        Err(e) => return Err(e.into()),
    }

    let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut payload = BytesMut::with_capacity(len);
    let mut buf = [0u8; READ_CHUNK_SIZE];
    while payload.len() < len {
        let want = std::cmp::min(len - payload.len(), READ_CHUNK_SIZE);
        match reader.read(&mut buf[..want]).await {
            Ok(0) => return Ok(Decoded::EndOfStream),
            Ok(n) => payload.extend_from_slice(&buf[..n]),
            Err(e) if is_disconnect(&e) => return Ok(Decoded::EndOfStream),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(decode_payload(code, &payload))
}

/// Receive one frame, failing with [`ProtocolError::Timeout`] if none arrives in time
pub async fn recv_msg_timeout<R>(
    reader: &mut R,
    max_frame_size: usize,
    timeout: Duration,
) -> Result<Decoded, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, recv_msg(reader, max_frame_size)).await {
        Ok(res) => res,
        Err(_) => Err(ProtocolError::Timeout(timeout)),
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

//! Message types carried by protocol frames.
//!
//! Every payload is a JSON object. File content travels as base64 text.
//! Payload structs use `#[serde(default)]`: a field missing from an otherwise
//! well-formed object takes its type's default, so handlers must treat empty
//! strings and zero counts as "absent".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed type codes of the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    FileListRequest = 1,
    FileListResponse = 2,
    FileRequest = 3,
    FileResponse = 4,
    UploadRequest = 5,
    UploadResponse = 6,
    Error = 7,
    FileChunk = 8,
    ChunkAck = 9,
    TransferComplete = 10,
}

impl MessageType {
    pub fn from_code(code: u32) -> Option<Self> {
        let msg_type = match code {
            1 => MessageType::FileListRequest,
            2 => MessageType::FileListResponse,
            3 => MessageType::FileRequest,
            4 => MessageType::FileResponse,
            5 => MessageType::UploadRequest,
            6 => MessageType::UploadResponse,
            7 => MessageType::Error,
            8 => MessageType::FileChunk,
            9 => MessageType::ChunkAck,
            10 => MessageType::TransferComplete,
            _ => return None,
        };
        Some(msg_type)
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::FileListRequest => "file list request",
            MessageType::FileListResponse => "file list response",
            MessageType::FileRequest => "file request",
            MessageType::FileResponse => "file response",
            MessageType::UploadRequest => "file upload request",
            MessageType::UploadResponse => "file upload response",
            MessageType::Error => "error",
            MessageType::FileChunk => "file chunk",
            MessageType::ChunkAck => "chunk acknowledgment",
            MessageType::TransferComplete => "transfer complete",
        };
        f.write_str(name)
    }
}

/// One entry of a file list response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub size_formatted: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileList {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRequest {
    pub filename: String,
}

/// Download metadata: sent by the server before any chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    pub filename: String,
    pub file_size: u64,
    pub chunks: u64,
}

impl FileMetadata {
    pub fn new(filename: impl Into<String>, file_size: u64) -> Self {
        Self {
            filename: filename.into(),
            file_size,
            chunks: chunk_count(file_size),
        }
    }
}

/// Upload request.
///
/// With `file_data` present the whole content travels in this frame and the
/// server answers with a single [`UploadResponse`]. Without it the request
/// announces a chunked upload of `file_size` bytes in `chunks` chunks; a
/// request carrying neither is invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadRequest {
    pub filename: String,
    #[serde(
        with = "base64_data_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Chunk {
    pub chunk_id: u64,
    pub total_chunks: u64,
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkAck {
    pub chunk_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferComplete {
    pub success: bool,
    pub filename: String,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FileListRequest,
    FileListResponse(FileList),
    FileRequest(FileRequest),
    FileResponse(FileMetadata),
    UploadRequest(UploadRequest),
    UploadResponse(UploadResponse),
    Error(ErrorMessage),
    FileChunk(Chunk),
    ChunkAck(ChunkAck),
    TransferComplete(TransferComplete),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::FileListRequest => MessageType::FileListRequest,
            Message::FileListResponse(_) => MessageType::FileListResponse,
            Message::FileRequest(_) => MessageType::FileRequest,
            Message::FileResponse(_) => MessageType::FileResponse,
            Message::UploadRequest(_) => MessageType::UploadRequest,
            Message::UploadResponse(_) => MessageType::UploadResponse,
            Message::Error(_) => MessageType::Error,
            Message::FileChunk(_) => MessageType::FileChunk,
            Message::ChunkAck(_) => MessageType::ChunkAck,
            Message::TransferComplete(_) => MessageType::TransferComplete,
        }
    }

    /// Serialize the payload part of the frame
    pub fn payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Message::FileListRequest => Ok(b"{}".to_vec()),
            Message::FileListResponse(p) => serde_json::to_vec(p),
            Message::FileRequest(p) => serde_json::to_vec(p),
            Message::FileResponse(p) => serde_json::to_vec(p),
            Message::UploadRequest(p) => serde_json::to_vec(p),
            Message::UploadResponse(p) => serde_json::to_vec(p),
            Message::Error(p) => serde_json::to_vec(p),
            Message::FileChunk(p) => serde_json::to_vec(p),
            Message::ChunkAck(p) => serde_json::to_vec(p),
            Message::TransferComplete(p) => serde_json::to_vec(p),
        }
    }

    /// Parse a payload for a known message type
    pub fn from_payload(msg_type: MessageType, payload: &[u8]) -> serde_json::Result<Self> {
        let msg = match msg_type {
            MessageType::FileListRequest => Message::FileListRequest,
            MessageType::FileListResponse => Message::FileListResponse(serde_json::from_slice(payload)?),
            MessageType::FileRequest => Message::FileRequest(serde_json::from_slice(payload)?),
            MessageType::FileResponse => Message::FileResponse(serde_json::from_slice(payload)?),
            MessageType::UploadRequest => Message::UploadRequest(serde_json::from_slice(payload)?),
            MessageType::UploadResponse => Message::UploadResponse(serde_json::from_slice(payload)?),
            MessageType::Error => Message::Error(serde_json::from_slice(payload)?),
            MessageType::FileChunk => Message::FileChunk(serde_json::from_slice(payload)?),
            MessageType::ChunkAck => Message::ChunkAck(serde_json::from_slice(payload)?),
            MessageType::TransferComplete => {
                Message::TransferComplete(serde_json::from_slice(payload)?)
            }
        };
        Ok(msg)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Message::Error(ErrorMessage { error: text.into() })
    }

    pub fn upload_response(success: bool, message: impl Into<String>) -> Self {
        Message::UploadResponse(UploadResponse {
            success,
            message: message.into(),
        })
    }

    pub fn transfer_complete(filename: impl Into<String>) -> Self {
        Message::TransferComplete(TransferComplete {
            success: true,
            filename: filename.into(),
        })
    }
}

/// Number of chunks needed for `file_size` bytes: ceil(size / MAX_CHUNK_SIZE)
pub fn chunk_count(file_size: u64) -> u64 {
    file_size.div_ceil(super::constants::MAX_CHUNK_SIZE as u64)
}

mod base64_data {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_data_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

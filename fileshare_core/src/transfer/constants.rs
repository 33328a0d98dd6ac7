/// Default TCP port for the file server
pub const TRANSFER_PORT: u16 = 9000;

/// Default bind address for the file server
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default storage directory (relative to the working directory)
pub const DEFAULT_STORAGE_DIR: &str = "storage";

/// Frame header: message type (u32 BE) + payload length (u32 BE)
pub const HEADER_SIZE: usize = 8;

/// Maximum payload bytes carried by one chunk frame (64KB)
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Granularity of socket reads while filling a payload buffer (8KB).
/// Not related to MAX_CHUNK_SIZE.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default upper bound on a single frame payload (64MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum file name length in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Default number of concurrently served connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default timeout for any blocking receive inside an exchange
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default time a server connection may sit idle between requests
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default timeout for establishing a client connection
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Name of the staging directory for uploads inside the storage root
pub const INCOMING_DIR: &str = ".incoming";

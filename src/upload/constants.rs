use std::time::Duration;

/// 单个分片大小 4MB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Number of file tasks allowed in the `uploading` state at once.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Chunk bodies are handed to the HTTP client in pieces of this size so that
/// progress is reported while a chunk is still in flight.
pub const PROGRESS_PIECE_SIZE: usize = 64 * 1024;

pub const ATTACHMENT_TOKEN_HEADER: &str = "X-Attachment-Token";

pub const GATEWAY_READY_TIMEOUT: Duration = Duration::from_secs(15);
pub const GATEWAY_POLL_INTERVAL: Duration = Duration::from_millis(100);

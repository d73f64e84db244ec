mod client;
mod constants;
mod delegate;
mod errors;
mod manager;
mod manager_worker;
mod progress_stream;
mod runtime;
mod scheduler;
mod task;
mod traits;
pub mod types;
mod worker;

pub use client::ResumableClient;
pub use constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT, GATEWAY_POLL_INTERVAL,
    GATEWAY_READY_TIMEOUT,
};
pub use delegate::{DesktopBridge, RunnerEvent};
pub use errors::{Result, UploadError};
pub use manager::{UploadManager, UploadManagerBuilder, UploadManagerHandle, UploadedReceiver};
pub use progress_stream::{ChunkProgressStream, piece_stream};
pub use task::{UploadFile, UploadTask, basename_from_path};
pub use traits::{ChunkProgress, ChunkTransport, GatewayProbe, TaskRunner};
pub use types::{
    AttachmentDescriptor, Category, SessionMeta, TaskId, TaskSource, TaskStats, TaskStatus, UploadConfig,
    UploadEvent,
};

use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use super::delegate::RunnerEvent;
use super::errors::Result;
use super::types::{AttachmentDescriptor, Category, SessionMeta, TaskId};

/// Receives the number of bytes of the current chunk handed to the network so far.
pub type ChunkProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Resumable-upload protocol as seen by the task state machine.
///
/// Every call except `abort_session` takes a cancellation token; a fired token
/// makes the call return `UploadError::Cancelled`.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 创建上传会话，返回 uploadId
    async fn init_session(&self, meta: &SessionMeta, cancel: &CancellationToken) -> Result<String>;

    /// Bytes the server already holds for the session.
    async fn get_status(&self, upload_id: &str, cancel: &CancellationToken) -> Result<u64>;

    /// Sends `chunk` as the byte range starting at `offset`.
    async fn upload_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
        on_progress: ChunkProgress,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn complete_session(&self, upload_id: &str, cancel: &CancellationToken) -> Result<AttachmentDescriptor>;

    /// Best effort; failures are logged and swallowed.
    async fn abort_session(&self, upload_id: &str);
}

/// Native background runner that uploads filesystem paths on the desktop shell.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn start(&self, task_id: TaskId, path: &str, category: Category) -> Result<()>;

    async fn pause(&self, task_id: TaskId) -> Result<()>;

    async fn resume(&self, task_id: TaskId) -> Result<()>;

    async fn cancel(&self, task_id: TaskId) -> Result<()>;

    /// Progress events for every task the runner owns.
    fn subscribe(&self) -> broadcast::Receiver<RunnerEvent>;
}

/// Local gateway the desktop runner depends on.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    /// Resolves to the gateway base URL once it is reachable.
    async fn ensure_ready(&self) -> Result<String>;
}

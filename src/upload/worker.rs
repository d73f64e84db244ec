use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use super::errors::{Result, UploadError};
use super::runtime::RunControl;
use super::task::UploadFile;
use super::traits::{ChunkProgress, ChunkTransport};
use super::types::{AttachmentDescriptor, Category, SessionMeta, TaskId};

/// How one run of a file task ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskOutcome {
    Done(AttachmentDescriptor),
    Paused,
    Canceled,
    Failed(String),
}

/// Messages sent from background runs back to the manager loop.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// 会话已创建
    Session {
        task_id: TaskId,
        upload_id: String,
    },
    /// 续传探测完成，从服务端的 offset 开始
    Started {
        task_id: TaskId,
        size: u64,
        bytes_sent: u64,
    },
    Progress {
        task_id: TaskId,
        bytes_sent: u64,
    },
    Finished {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    /// 桌面端路径任务启动失败
    PathFailed {
        task_id: TaskId,
        error: String,
    },
}

/// Snapshot of the runtime handed to a run at admission.
#[derive(Debug, Clone)]
pub(crate) struct FileJob {
    pub(crate) task_id: TaskId,
    pub(crate) file: UploadFile,
    pub(crate) category: Category,
    pub(crate) upload_id: Option<String>,
}

pub(crate) struct UploadWorker {
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) control: Arc<RunControl>,
    pub(crate) chunk_size: usize,
    pub(crate) updates: mpsc::UnboundedSender<WorkerMessage>,
}

impl UploadWorker {
    /// Drives the task through init, status probe, chunk loop and completion.
    pub(crate) async fn run(self, job: FileJob) -> TaskOutcome {
        match self.drive(&job).await {
            Ok(outcome) => outcome,
            Err(err) => self.classify(err),
        }
    }

    /// User-initiated aborts never surface as failures.
    fn classify(&self, err: UploadError) -> TaskOutcome {
        if err.is_cancelled() {
            if self.control.is_cancel_requested() {
                return TaskOutcome::Canceled;
            }
            if self.control.is_pause_requested() {
                return TaskOutcome::Paused;
            }
        }

        TaskOutcome::Failed(err.to_string())
    }

    async fn drive(&self, job: &FileJob) -> Result<TaskOutcome> {
        let task_id = job.task_id;
        let size = job.file.len();
        if size == 0 {
            return Err(UploadError::EmptyFile);
        }

        // init（或复用已有 uploadId）
        let upload_id = match &job.upload_id {
            Some(upload_id) => upload_id.clone(),
            None => {
                let meta = SessionMeta {
                    category: job.category,
                    original_name: job.file.name.clone(),
                    mime_type: job.file.mime_type.clone(),
                    size,
                };
                let token = self.control.operation_token();
                let upload_id = self.transport
                    .init_session(&meta, &token)
                    .await
                    .map_err(|err| wrap(err, UploadError::SessionInit))?;

                info!(%task_id, %upload_id, "upload session created");
                self.send(WorkerMessage::Session { task_id, upload_id: upload_id.clone() });
                upload_id
            }
        };

        // 会话清理由管理器负责（它知道 uploadId 何时可用）
        if self.control.is_cancel_requested() {
            return Ok(TaskOutcome::Canceled);
        }

        // status（断点续传：从已上传字节继续）
        let token = self.control.operation_token();
        let mut offset = self.transport
            .get_status(&upload_id, &token)
            .await
            .map_err(|err| wrap(err, UploadError::StatusProbe))?;

        if self.control.is_cancel_requested() {
            return Ok(TaskOutcome::Canceled);
        }

        self.send(WorkerMessage::Started { task_id, size, bytes_sent: offset });
        if offset > 0 {
            info!(%task_id, %upload_id, offset, size, "resuming upload");
        }

        while offset < size {
            if self.control.is_cancel_requested() {
                return Ok(TaskOutcome::Canceled);
            }
            if self.control.is_pause_requested() {
                return Ok(TaskOutcome::Paused);
            }

            let start = offset;
            let end = size.min(start + self.chunk_size as u64);
            let chunk = job.file.data.slice(start as usize..end as usize);
            let length = chunk.len() as u64;

            let updates = self.updates.clone();
            let on_progress: ChunkProgress = Arc::new(move |loaded| {
                let _ = updates.send(WorkerMessage::Progress {
                    task_id,
                    bytes_sent: size.min(start + loaded),
                });
            });

            let token = self.control.operation_token();
            self.transport
                .upload_chunk(&upload_id, start, chunk, on_progress, &token)
                .await
                .map_err(|err| wrap(err, |source| UploadError::ChunkTransfer { offset: start, source }))?;

            offset = start + length;
            debug!(%task_id, offset, size, "chunk confirmed");
            self.send(WorkerMessage::Progress { task_id, bytes_sent: offset });
        }

        if self.control.is_cancel_requested() {
            return Ok(TaskOutcome::Canceled);
        }

        let token = self.control.operation_token();
        let attachment = self.transport
            .complete_session(&upload_id, &token)
            .await
            .map_err(|err| wrap(err, UploadError::Completion))?;

        Ok(TaskOutcome::Done(attachment))
    }

    fn send(&self, message: WorkerMessage) {
        let _ = self.updates.send(message);
    }
}

/// Tags a failure with the step it happened in; cancellations pass through untouched.
fn wrap(err: UploadError, step: impl FnOnce(Box<UploadError>) -> UploadError) -> UploadError {
    if err.is_cancelled() {
        err
    } else {
        step(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    /// Minimal in-memory server: accepts everything, records chunk offsets.
    #[derive(Default)]
    struct MemoryTransport {
        received: Mutex<u64>,
        chunks: Mutex<Vec<(u64, usize)>>,
        reject_init: bool,
        fail_chunk_at: Option<u64>,
    }

    #[async_trait]
    impl ChunkTransport for MemoryTransport {
        async fn init_session(&self, _meta: &SessionMeta, _cancel: &CancellationToken) -> Result<String> {
            if self.reject_init {
                return Err(UploadError::server_error(400, "size over limit"));
            }
            Ok("session-1".to_string())
        }

        async fn get_status(&self, _upload_id: &str, _cancel: &CancellationToken) -> Result<u64> {
            Ok(*self.received.lock().unwrap())
        }

        async fn upload_chunk(
            &self,
            _upload_id: &str,
            offset: u64,
            chunk: Bytes,
            on_progress: ChunkProgress,
            cancel: &CancellationToken,
        ) -> Result<()> {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if self.fail_chunk_at == Some(offset) {
                return Err(UploadError::server_error(500, "disk full"));
            }
            on_progress(chunk.len() as u64 / 2);
            on_progress(chunk.len() as u64);
            self.chunks.lock().unwrap().push((offset, chunk.len()));
            *self.received.lock().unwrap() = offset + chunk.len() as u64;
            Ok(())
        }

        async fn complete_session(&self, upload_id: &str, _cancel: &CancellationToken) -> Result<AttachmentDescriptor> {
            Ok(serde_json::from_value(serde_json::json!({ "_id": upload_id })).unwrap())
        }

        async fn abort_session(&self, _upload_id: &str) {}
    }

    fn job(size: usize, upload_id: Option<&str>) -> FileJob {
        FileJob {
            task_id: TaskId::new(),
            file: UploadFile::new("clip.mp4", vec![0u8; size]),
            category: Category::Video,
            upload_id: upload_id.map(str::to_string),
        }
    }

    fn worker(
        transport: Arc<MemoryTransport>,
        control: Arc<RunControl>,
    ) -> (UploadWorker, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let worker = UploadWorker { transport, control, chunk_size: 4, updates };
        (worker, rx)
    }

    #[tokio::test]
    async fn test_uploads_every_chunk_in_order() {
        let transport = Arc::new(MemoryTransport::default());
        let (worker, mut rx) = worker(transport.clone(), Arc::new(RunControl::new()));

        let outcome = worker.run(job(10, None)).await;
        assert!(matches!(outcome, TaskOutcome::Done(ref a) if a.id == "session-1"));
        assert_eq!(*transport.chunks.lock().unwrap(), vec![(0, 4), (4, 4), (8, 2)]);

        let mut last = 0;
        while let Ok(message) = rx.try_recv() {
            if let WorkerMessage::Progress { bytes_sent, .. } = message {
                assert!(bytes_sent >= last);
                last = bytes_sent;
            }
        }
        assert_eq!(last, 10);
    }

    #[tokio::test]
    async fn test_resumes_from_reported_offset() {
        let transport = Arc::new(MemoryTransport::default());
        *transport.received.lock().unwrap() = 8;
        let (worker, mut rx) = worker(transport.clone(), Arc::new(RunControl::new()));

        let outcome = worker.run(job(10, Some("session-1"))).await;
        assert!(matches!(outcome, TaskOutcome::Done(_)));
        assert_eq!(*transport.chunks.lock().unwrap(), vec![(8, 2)]);

        match rx.try_recv().unwrap() {
            WorkerMessage::Started { size, bytes_sent, .. } => {
                assert_eq!(size, 10);
                assert_eq!(bytes_sent, 8);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_init_rejection_fails_without_chunks() {
        let transport = Arc::new(MemoryTransport { reject_init: true, ..Default::default() });
        let (worker, _rx) = worker(transport.clone(), Arc::new(RunControl::new()));

        let outcome = worker.run(job(10, None)).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed("Failed to create upload session: size over limit".to_string())
        );
        assert!(transport.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_failure_is_reported() {
        let transport = Arc::new(MemoryTransport { fail_chunk_at: Some(4), ..Default::default() });
        let (worker, _rx) = worker(transport, Arc::new(RunControl::new()));

        let outcome = worker.run(job(10, None)).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed("Failed to upload chunk at offset 4: disk full".to_string())
        );
    }

    #[tokio::test]
    async fn test_pause_and_cancel_are_not_failures() {
        let control = Arc::new(RunControl::new());
        control.request_pause();
        let (worker, _rx) = worker(Arc::new(MemoryTransport::default()), control);
        assert_eq!(worker.run(job(10, Some("session-1"))).await, TaskOutcome::Paused);

        let transport = Arc::new(MemoryTransport::default());
        let control = Arc::new(RunControl::new());
        control.request_cancel();
        let (worker, _rx) = self::worker(transport.clone(), control);
        assert_eq!(worker.run(job(10, None)).await, TaskOutcome::Canceled);
        assert!(transport.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_fails() {
        let (worker, _rx) = worker(Arc::new(MemoryTransport::default()), Arc::new(RunControl::new()));
        assert_eq!(worker.run(job(0, None)).await, TaskOutcome::Failed("File is empty".to_string()));
    }
}

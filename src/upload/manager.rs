use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use super::delegate::DesktopBridge;
use super::errors::{Result, UploadError};
use super::manager_worker::UploadManagerWorker;
use super::task::{UploadFile, UploadTask};
use super::traits::ChunkTransport;
use super::types::{AttachmentDescriptor, Category, ManagerCommand, TaskId, TaskStats, UploadConfig, UploadEvent};

/// Cheap, cloneable front end of the upload manager.
#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    snapshot_rx: watch::Receiver<Vec<UploadTask>>,
}

/// 上传管理器句柄 - 包含管理器和工作线程
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    /// Stops the manager loop; unfinished runs are cancelled.
    ///
    /// Clones of the manager keep the loop alive until they are dropped too.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.manager);
        self.worker_handle.await
            .map_err(|err| UploadError::internal_error(format!("Worker panic: {}", err)))
    }
}

pub struct UploadManagerBuilder {
    transport: Arc<dyn ChunkTransport>,
    config: UploadConfig,
    desktop: Option<DesktopBridge>,
}

impl UploadManagerBuilder {
    pub fn config(mut self, config: UploadConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables path uploads through the desktop shell.
    pub fn desktop(mut self, bridge: DesktopBridge) -> Self {
        self.desktop = Some(bridge);
        self
    }

    /// Spawns the manager loop on the current runtime.
    pub fn spawn(self) -> UploadManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());

        let worker_handle = tokio::spawn(UploadManagerWorker::run(
            self.transport,
            self.config,
            self.desktop,
            command_rx,
            event_tx.clone(),
            snapshot_tx,
        ));

        let manager = UploadManager {
            command_tx,
            event_tx,
            snapshot_rx,
        };

        UploadManagerHandle {
            manager,
            worker_handle,
        }
    }
}

impl UploadManager {
    pub fn builder(transport: Arc<dyn ChunkTransport>) -> UploadManagerBuilder {
        UploadManagerBuilder {
            transport,
            config: UploadConfig::default(),
            desktop: None,
        }
    }

    /// Manager with default config and no desktop bridge.
    pub fn new(transport: Arc<dyn ChunkTransport>) -> UploadManagerHandle {
        Self::builder(transport).spawn()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::ManagerShutdown)?;

        // 等待响应
        reply_rx
            .await
            .map_err(|_| UploadError::ManagerShutdown)
    }

    /// Adds in-memory files as `queued` tasks, newest batch first.
    pub async fn enqueue_files(&self, files: Vec<UploadFile>, category: Category) -> Result<Vec<TaskId>> {
        self.request(|reply| ManagerCommand::EnqueueFiles { files, category, reply }).await
    }

    /// Adds filesystem paths handled by the desktop runner. Blank paths are skipped.
    pub async fn enqueue_paths<I, S>(&self, paths: I, category: Category) -> Result<Vec<TaskId>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        self.request(|reply| ManagerCommand::EnqueuePaths { paths, category, reply }).await
    }

    pub async fn pause_task(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::PauseTask { task_id, reply }).await?
    }

    pub async fn resume_task(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::ResumeTask { task_id, reply }).await?
    }

    /// Cancelling a task that is already done or canceled is a no-op.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::CancelTask { task_id, reply }).await?
    }

    /// Drops `done` and `canceled` tasks; returns how many were removed.
    pub async fn clear_finished(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearFinished { reply }).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<UploadTask>> {
        self.request(|reply| ManagerCommand::GetTask { task_id, reply }).await
    }

    pub async fn tasks(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| ManagerCommand::GetAllTasks { reply }).await
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        self.request(|reply| ManagerCommand::GetStats { reply }).await
    }

    /// Task list as last published; updated on every mutation.
    pub fn watch_tasks(&self) -> watch::Receiver<Vec<UploadTask>> {
        self.snapshot_rx.clone()
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    /// Finished attachments only.
    pub fn subscribe_uploaded(&self) -> UploadedReceiver {
        UploadedReceiver {
            receiver: self.event_tx.subscribe(),
        }
    }
}

/// Yields `(task, attachment)` for each upload that completes.
pub struct UploadedReceiver {
    receiver: broadcast::Receiver<UploadEvent>,
}

impl UploadedReceiver {
    pub async fn recv(&mut self) -> Result<(TaskId, AttachmentDescriptor), broadcast::error::RecvError> {
        loop {
            if let UploadEvent::Uploaded { task_id, attachment } = self.receiver.recv().await? {
                return Ok((task_id, attachment));
            }
        }
    }
}

use std::sync::Arc;
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use super::delegate::{self, DesktopBridge, RunnerCommand, RunnerEvent};
use super::errors::{Result, UploadError};
use super::runtime::{PathTaskRuntime, RunControl, RuntimeRegistry, TaskRuntime};
use super::scheduler::Scheduler;
use super::task::{UploadFile, UploadTask, basename_from_path};
use super::traits::ChunkTransport;
use super::types::{Category, ManagerCommand, TaskId, TaskSource, TaskStats, TaskStatus, UploadConfig, UploadEvent};
use super::worker::{FileJob, TaskOutcome, UploadWorker, WorkerMessage};

/// Owns the task list and every runtime; all mutations happen on this task.
pub(crate) struct UploadManagerWorker {
    transport: Arc<dyn ChunkTransport>,
    config: UploadConfig,
    desktop: Option<DesktopBridge>,

    /// 最新入队的任务排在最前
    tasks: Vec<UploadTask>,
    runtimes: RuntimeRegistry,
    scheduler: Scheduler,

    event_tx: broadcast::Sender<UploadEvent>,
    snapshot_tx: watch::Sender<Vec<UploadTask>>,
    update_tx: mpsc::UnboundedSender<WorkerMessage>,
    update_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    runner_rx: Option<broadcast::Receiver<RunnerEvent>>,
    runner_tx: Option<mpsc::UnboundedSender<RunnerCommand>>,
}

impl UploadManagerWorker {
    pub(crate) async fn run(
        transport: Arc<dyn ChunkTransport>,
        config: UploadConfig,
        desktop: Option<DesktopBridge>,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
        snapshot_tx: watch::Sender<Vec<UploadTask>>,
    ) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let runner_rx = desktop.as_ref().map(|bridge| bridge.runner.subscribe());
        let runner_tx = desktop.as_ref().map(|bridge| delegate::spawn_runner_commands(bridge.runner.clone()));
        let mut worker = Self {
            transport,
            scheduler: Scheduler::new(config.concurrency),
            config,
            desktop,
            tasks: Vec::new(),
            runtimes: RuntimeRegistry::new(),
            event_tx,
            snapshot_tx,
            update_tx,
            update_rx,
            runner_rx,
            runner_tx,
        };

        // 主事件循环：命令、上传进度、桌面端事件
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => worker.handle_command(command),
                    None => break,
                },
                Some(message) = worker.update_rx.recv() => {
                    worker.handle_worker_message(message);
                }
                event = next_runner_event(&mut worker.runner_rx) => {
                    worker.handle_runner_event(event);
                }
            }

            worker.pump();
        }

        info!(
            tasks = worker.tasks.len(),
            runtimes = worker.runtimes.len(),
            in_flight = worker.scheduler.in_flight_len(),
            "upload manager shutting down"
        );
        worker.runtimes.clear();
    }

    /// Admits queued file tasks while slots are free.
    fn pump(&mut self) {
        for task_id in self.scheduler.admit(&self.tasks) {
            self.start_file_task(task_id);
        }
    }

    fn start_file_task(&mut self, task_id: TaskId) {
        let control = Arc::new(RunControl::new());
        let job = match self.runtimes.get_mut(&task_id) {
            Some(TaskRuntime::File(runtime)) => {
                runtime.run = Some(control.clone());
                Some(FileJob {
                    task_id,
                    file: runtime.file.clone(),
                    category: runtime.category,
                    upload_id: runtime.upload_id.clone(),
                })
            }
            _ => None,
        };

        let Some(job) = job else {
            self.scheduler.finish(&task_id);
            self.update_task(task_id, |task| {
                task.status = TaskStatus::Failed;
                task.error = Some("Upload runtime is missing".to_string());
            });
            return;
        };

        let worker = UploadWorker {
            transport: self.transport.clone(),
            control,
            chunk_size: self.config.chunk_size,
            updates: self.update_tx.clone(),
        };

        // 无论结果如何（包括 panic）都要回报 Finished，释放并发槽位
        let run = tokio::spawn(worker.run(job));
        let updates = self.update_tx.clone();
        tokio::spawn(async move {
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(err) => TaskOutcome::Failed(format!("Upload task panicked: {}", err)),
            };
            let _ = updates.send(WorkerMessage::Finished { task_id, outcome });
        });

        info!(%task_id, "upload admitted");
        self.update_task(task_id, |task| {
            task.status = TaskStatus::Uploading;
            task.error = None;
        });
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::EnqueueFiles { files, category, reply } => {
                let _ = reply.send(self.enqueue_files(files, category));
            }
            ManagerCommand::EnqueuePaths { paths, category, reply } => {
                let _ = reply.send(self.enqueue_paths(paths, category));
            }
            ManagerCommand::PauseTask { task_id, reply } => {
                let result = self.pause_task(task_id);
                let _ = reply.send(result);
            }
            ManagerCommand::ResumeTask { task_id, reply } => {
                let result = self.resume_task(task_id);
                let _ = reply.send(result);
            }
            ManagerCommand::CancelTask { task_id, reply } => {
                let result = self.cancel_task(task_id);
                let _ = reply.send(result);
            }
            ManagerCommand::ClearFinished { reply } => {
                let _ = reply.send(self.clear_finished());
            }
            ManagerCommand::GetTask { task_id, reply } => {
                let _ = reply.send(self.find(task_id).cloned());
            }
            ManagerCommand::GetAllTasks { reply } => {
                let _ = reply.send(self.tasks.clone());
            }
            ManagerCommand::GetStats { reply } => {
                let _ = reply.send(TaskStats::from_tasks(&self.tasks));
            }
        }
    }

    fn enqueue_files(&mut self, files: Vec<UploadFile>, category: Category) -> Vec<TaskId> {
        let now = Utc::now();
        let mut batch = Vec::with_capacity(files.len());

        for file in files {
            let task_id = TaskId::new();
            batch.push(UploadTask::new(task_id, TaskSource::File, file.name.clone(), category, file.len(), now));
            self.runtimes.insert(task_id, TaskRuntime::file(file, category));
        }

        debug!(count = batch.len(), %category, "files enqueued");
        self.prepend(batch)
    }

    fn enqueue_paths(&mut self, paths: Vec<String>, category: Category) -> Vec<TaskId> {
        let now = Utc::now();
        let mut batch = Vec::new();
        let mut jobs = Vec::new();

        for path in paths {
            let path = path.trim();
            if path.is_empty() {
                continue;
            }

            let task_id = TaskId::new();
            let runtime = PathTaskRuntime { path: path.to_string(), category };
            batch.push(UploadTask::new(task_id, TaskSource::Path, basename_from_path(path), category, 0, now));
            jobs.push(runtime.job(task_id));
            self.runtimes.insert(task_id, TaskRuntime::Path(runtime));
        }

        let task_ids = self.prepend(batch);
        if task_ids.is_empty() {
            return task_ids;
        }

        if let Some(bridge) = self.desktop.clone() {
            tokio::spawn(delegate::start_paths(bridge, jobs, self.update_tx.clone()));
        } else {
            warn!(count = task_ids.len(), "path uploads requested without a desktop bridge");
            let error = UploadError::PathUploadUnsupported.to_string();
            for task_id in &task_ids {
                self.update_task(*task_id, |task| {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.clone());
                });
            }
        }

        task_ids
    }

    fn pause_task(&mut self, task_id: TaskId) -> Result<()> {
        let (source, status) = self.lookup(task_id)?;
        if !matches!(status, TaskStatus::Queued | TaskStatus::Uploading) {
            return Err(UploadError::InvalidState { task_id, action: "pause", status });
        }

        match source {
            TaskSource::File => {
                if let Some(TaskRuntime::File(runtime)) = self.runtimes.get(&task_id) {
                    if let Some(run) = &runtime.run {
                        run.request_pause();
                    }
                }
            }
            TaskSource::Path => {
                self.send_runner(RunnerCommand::Pause(task_id));
            }
        }

        info!(%task_id, "upload paused");
        self.update_task(task_id, |task| task.status = TaskStatus::Paused);
        Ok(())
    }

    fn resume_task(&mut self, task_id: TaskId) -> Result<()> {
        let (source, status) = self.lookup(task_id)?;
        if status != TaskStatus::Paused {
            return Err(UploadError::InvalidState { task_id, action: "resume", status });
        }

        match source {
            TaskSource::File => {
                // 下次准入时创建新的 RunControl，旧标志不会带过去
                if let Some(TaskRuntime::File(runtime)) = self.runtimes.get_mut(&task_id) {
                    runtime.run = None;
                }
                self.update_task(task_id, |task| {
                    task.status = TaskStatus::Queued;
                    task.error = None;
                });
            }
            TaskSource::Path => {
                self.send_runner(RunnerCommand::Resume(task_id));
                self.update_task(task_id, |task| {
                    task.status = TaskStatus::Uploading;
                    task.error = None;
                });
            }
        }

        info!(%task_id, "upload resumed");
        Ok(())
    }

    fn cancel_task(&mut self, task_id: TaskId) -> Result<()> {
        let (source, status) = self.lookup(task_id)?;
        if status.is_terminal() {
            return Ok(());
        }

        let mut session = None;
        match source {
            TaskSource::File => {
                if let Some(TaskRuntime::File(runtime)) = self.runtimes.get(&task_id) {
                    if let Some(run) = &runtime.run {
                        run.request_cancel();
                    }
                    session = runtime.upload_id.clone();
                }
            }
            TaskSource::Path => {
                self.send_runner(RunnerCommand::Cancel(task_id));
            }
        }

        self.update_task(task_id, |task| task.status = TaskStatus::Canceled);
        self.runtimes.remove(&task_id);
        info!(%task_id, "upload canceled");

        if let Some(upload_id) = session {
            self.abort_session(task_id, upload_id);
        }

        Ok(())
    }

    fn clear_finished(&mut self) -> usize {
        let removed: Vec<TaskId> = self.tasks
            .iter()
            .filter(|task| task.status.is_terminal())
            .map(|task| task.id)
            .collect();

        if removed.is_empty() {
            return 0;
        }

        self.tasks.retain(|task| !task.status.is_terminal());
        for task_id in &removed {
            self.runtimes.remove(task_id);
        }

        let count = removed.len();
        self.emit(UploadEvent::Cleared { removed });
        self.publish();
        count
    }

    fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Session { task_id, upload_id } => {
                if let Some(TaskRuntime::File(runtime)) = self.runtimes.get_mut(&task_id) {
                    runtime.upload_id = Some(upload_id.clone());
                }

                match self.status_of(task_id) {
                    Some(status) if !status.is_terminal() => {
                        self.update_task(task_id, |task| task.upload_id = Some(upload_id));
                    }
                    _ => {
                        // 会话在取消之后才建立，补一次清理
                        self.abort_session(task_id, upload_id);
                    }
                }
            }
            WorkerMessage::Started { task_id, size, bytes_sent } => {
                if self.status_of(task_id) == Some(TaskStatus::Uploading) {
                    self.update_task(task_id, |task| {
                        task.size = size;
                        task.set_bytes_sent(bytes_sent);
                    });
                }
            }
            WorkerMessage::Progress { task_id, bytes_sent } => {
                let current = match self.find(task_id) {
                    Some(task) if matches!(task.status, TaskStatus::Uploading | TaskStatus::Paused) => task.bytes_sent,
                    _ => return,
                };

                if bytes_sent > current {
                    self.update_task(task_id, |task| task.set_bytes_sent(bytes_sent));
                }
            }
            WorkerMessage::Finished { task_id, outcome } => {
                self.scheduler.finish(&task_id);
                if let Some(TaskRuntime::File(runtime)) = self.runtimes.get_mut(&task_id) {
                    runtime.run = None;
                }
                self.finish_file_task(task_id, outcome);
            }
            WorkerMessage::PathFailed { task_id, error } => {
                if self.status_of(task_id).is_some_and(|status| !status.is_terminal()) {
                    self.update_task(task_id, |task| {
                        task.status = TaskStatus::Failed;
                        task.error = Some(error);
                    });
                }
            }
        }
    }

    fn finish_file_task(&mut self, task_id: TaskId, outcome: TaskOutcome) {
        let Some(status) = self.status_of(task_id) else {
            return;
        };

        match outcome {
            TaskOutcome::Done(attachment) => {
                if status == TaskStatus::Canceled {
                    return;
                }

                self.update_task(task_id, |task| {
                    task.status = TaskStatus::Done;
                    task.bytes_sent = task.size;
                    task.error = None;
                });
                self.runtimes.remove(&task_id);
                info!(%task_id, attachment_id = %attachment.id, "upload done");
                self.emit(UploadEvent::Uploaded { task_id, attachment });
            }
            TaskOutcome::Paused => {
                if status == TaskStatus::Uploading {
                    self.update_task(task_id, |task| task.status = TaskStatus::Paused);
                }
            }
            TaskOutcome::Canceled => {
                if !status.is_terminal() {
                    self.update_task(task_id, |task| task.status = TaskStatus::Canceled);
                }
                self.runtimes.remove(&task_id);
            }
            TaskOutcome::Failed(error) => {
                if status == TaskStatus::Uploading {
                    warn!(%task_id, error = %error, "upload failed");
                    self.update_task(task_id, |task| {
                        task.status = TaskStatus::Failed;
                        task.error = Some(error);
                    });
                }
            }
        }
    }

    /// Best-effort abort; runs outside the manager loop.
    fn abort_session(&self, task_id: TaskId, upload_id: String) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            debug!(%task_id, %upload_id, "aborting upload session");
            transport.abort_session(&upload_id).await;
        });
    }

    fn send_runner(&self, command: RunnerCommand) {
        if let Some(runner_tx) = &self.runner_tx {
            if runner_tx.send(command).is_err() {
                warn!(?command, "runner command channel closed");
            }
        }
    }

    fn handle_runner_event(&mut self, event: RunnerEvent) {
        let task_id = event.task_id;
        match self.find(task_id) {
            Some(task) if task.source == TaskSource::Path && !task.status.is_terminal() => {}
            _ => return,
        }

        let mut attachment = None;
        let Some(task) = self.update_task(task_id, |task| attachment = delegate::apply_event(task, &event)) else {
            return;
        };

        if task.status.is_terminal() {
            self.runtimes.remove(&task_id);
        }
        if let Some(attachment) = attachment {
            info!(%task_id, attachment_id = %attachment.id, "path upload done");
            self.emit(UploadEvent::Uploaded { task_id, attachment });
        }
    }

    /// Appends a batch at the front of the list, keeping its order.
    fn prepend(&mut self, batch: Vec<UploadTask>) -> Vec<TaskId> {
        let task_ids: Vec<TaskId> = batch.iter().map(|task| task.id).collect();
        if task_ids.is_empty() {
            return task_ids;
        }

        for task in &batch {
            self.emit(UploadEvent::TaskAdded { task: task.clone() });
        }
        self.tasks.splice(0..0, batch);
        self.publish();

        task_ids
    }

    /// Applies `apply`, refreshes `updated_at` and notifies observers.
    fn update_task(&mut self, task_id: TaskId, apply: impl FnOnce(&mut UploadTask)) -> Option<UploadTask> {
        let task = self.tasks.iter_mut().find(|task| task.id == task_id)?;
        apply(task);
        task.touch();

        let snapshot = task.clone();
        self.emit(UploadEvent::TaskUpdated { task: snapshot.clone() });
        self.publish();
        Some(snapshot)
    }

    fn find(&self, task_id: TaskId) -> Option<&UploadTask> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    fn status_of(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.find(task_id).map(|task| task.status)
    }

    fn lookup(&self, task_id: TaskId) -> Result<(TaskSource, TaskStatus)> {
        self.find(task_id)
            .map(|task| (task.source, task.status))
            .ok_or(UploadError::TaskNotFound(task_id))
    }

    fn emit(&self, event: UploadEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.event_tx.send(event);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.tasks.clone());
    }
}

/// Next runner event; pending forever once the runner stream is gone.
async fn next_runner_event(runner_rx: &mut Option<broadcast::Receiver<RunnerEvent>>) -> RunnerEvent {
    loop {
        let received = match runner_rx.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => return std::future::pending().await,
        };

        match received {
            Ok(event) => return event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "runner events lagged");
            }
            Err(RecvError::Closed) => {
                warn!("runner event stream closed");
                *runner_rx = None;
            }
        }
    }
}

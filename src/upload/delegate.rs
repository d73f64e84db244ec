use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use super::traits::{GatewayProbe, TaskRunner};
use super::task::UploadTask;
use super::types::{AttachmentDescriptor, Category, TaskId, TaskStatus};
use super::worker::WorkerMessage;

/// Progress report from the native runner for one path task.
///
/// Every field except `task_id` is optional; absent fields leave the task as is.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEvent {
    pub task_id: TaskId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub bytes_sent: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentDescriptor>,
}

/// Desktop shell services used by path tasks.
#[derive(Clone)]
pub struct DesktopBridge {
    pub gateway: Arc<dyn GatewayProbe>,
    pub runner: Arc<dyn TaskRunner>,
}

impl DesktopBridge {
    pub fn new(gateway: Arc<dyn GatewayProbe>, runner: Arc<dyn TaskRunner>) -> Self {
        Self { gateway, runner }
    }
}

/// What the runner needs to start one path task.
#[derive(Debug, Clone)]
pub(crate) struct PathJob {
    pub(crate) task_id: TaskId,
    pub(crate) path: String,
    pub(crate) category: Category,
}

/// Waits for the gateway, then hands every path to the runner.
///
/// A gateway failure fails the whole batch; a start failure fails only its task.
pub(crate) async fn start_paths(
    bridge: DesktopBridge,
    jobs: Vec<PathJob>,
    updates: mpsc::UnboundedSender<WorkerMessage>,
) {
    if let Err(err) = bridge.gateway.ensure_ready().await {
        warn!(error = %err, tasks = jobs.len(), "gateway unavailable, failing path uploads");
        let error = err.to_string();
        for job in jobs {
            let _ = updates.send(WorkerMessage::PathFailed { task_id: job.task_id, error: error.clone() });
        }
        return;
    }

    for PathJob { task_id, path, category } in jobs {
        match bridge.runner.start(task_id, &path, category).await {
            Ok(()) => info!(%task_id, path = %path, %category, "path upload started"),
            Err(err) => {
                warn!(%task_id, path = %path, error = %err, "runner failed to start path upload");
                let _ = updates.send(WorkerMessage::PathFailed { task_id, error: err.to_string() });
            }
        }
    }
}

/// Control call forwarded to the native runner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RunnerCommand {
    Pause(TaskId),
    Resume(TaskId),
    Cancel(TaskId),
}

/// Spawns the task that forwards control calls to the runner one at a time,
/// in the order they were issued. It stops once the sender is dropped.
pub(crate) fn spawn_runner_commands(runner: Arc<dyn TaskRunner>) -> mpsc::UnboundedSender<RunnerCommand> {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            let (task_id, result) = match command {
                RunnerCommand::Pause(task_id) => (task_id, runner.pause(task_id).await),
                RunnerCommand::Resume(task_id) => (task_id, runner.resume(task_id).await),
                RunnerCommand::Cancel(task_id) => (task_id, runner.cancel(task_id).await),
            };

            if let Err(err) = result {
                warn!(%task_id, ?command, error = %err, "runner rejected control call");
            }
        }
    });

    command_tx
}

/// Mirrors a runner event onto the task. Returns the attachment when the
/// runner reports the upload as done.
pub(crate) fn apply_event(task: &mut UploadTask, event: &RunnerEvent) -> Option<AttachmentDescriptor> {
    let status = event
        .status
        .as_deref()
        .and_then(TaskStatus::from_runner)
        .unwrap_or(TaskStatus::Uploading);

    if let Some(total) = event.total_bytes {
        task.size = total;
    }
    if let Some(sent) = event.bytes_sent {
        task.set_bytes_sent(sent);
    }
    if event.upload_id.is_some() {
        task.upload_id = event.upload_id.clone();
    }
    task.error = event.error.clone();
    task.status = status;

    if status == TaskStatus::Done {
        if task.size > 0 {
            task.bytes_sent = task.size;
        }
        return event.attachment.clone();
    }

    None
}

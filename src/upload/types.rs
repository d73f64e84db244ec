use std::str::FromStr;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_EVENT_CAPACITY};
use super::errors::{Result, UploadError};
use super::task::{UploadFile, UploadTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side handling class of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Image,
    Video,
    Document,
    Script,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Image => "image",
            Category::Video => "video",
            Category::Document => "document",
            Category::Script => "script",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "image" => Ok(Category::Image),
            "video" => Ok(Category::Video),
            "document" => Ok(Category::Document),
            "script" => Ok(Category::Script),
            other => Err(UploadError::InvalidCategory(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// 内存中的文件内容
    File,
    /// 由桌面端后台任务读取的本地路径
    Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已取消
    Canceled,
    /// 已完成
    Done,
    /// 失败
    Failed,
}

impl TaskStatus {
    /// `Done` and `Canceled` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Canceled)
    }

    /// Parses the status strings reported by the desktop task runner.
    pub fn from_runner(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(TaskStatus::Queued),
            "uploading" => Some(TaskStatus::Uploading),
            "paused" => Some(TaskStatus::Paused),
            "canceled" | "cancelled" => Some(TaskStatus::Canceled),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Aggregate counters over the task list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub uploading: usize,
    pub queued: usize,
    pub paused: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn from_tasks(tasks: &[UploadTask]) -> Self {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

        Self {
            total: tasks.len(),
            uploading: count(TaskStatus::Uploading),
            queued: count(TaskStatus::Queued),
            paused: count(TaskStatus::Paused),
            failed: count(TaskStatus::Failed),
        }
    }
}

/// Attachment record returned by the server once a session completes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Metadata sent when a resumable session is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub category: Category,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 新任务加入列表
    TaskAdded {
        task: UploadTask,
    },

    /// 任务字段变更（状态、进度、错误）
    TaskUpdated {
        task: UploadTask,
    },

    /// 任务完成，携带服务端返回的附件
    Uploaded {
        task_id: TaskId,
        attachment: AttachmentDescriptor,
    },

    /// 清除了 done/canceled 的任务
    Cleared {
        removed: Vec<TaskId>,
    },
}

/// 上传管理器命令
pub enum ManagerCommand {
    EnqueueFiles {
        files: Vec<UploadFile>,
        category: Category,
        reply: oneshot::Sender<Vec<TaskId>>,
    },

    EnqueuePaths {
        paths: Vec<String>,
        category: Category,
        reply: oneshot::Sender<Vec<TaskId>>,
    },

    PauseTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    ResumeTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    CancelTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 清除所有 <Done/Canceled> 状态的任务
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },

    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    GetAllTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    GetStats {
        reply: oneshot::Sender<TaskStats>,
    },
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// 分块大小
    pub chunk_size: usize,

    /// 最大并发数
    pub concurrency: usize,

    /// 事件通道容量
    pub event_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use super::delegate::PathJob;
use super::task::UploadFile;
use super::types::{Category, TaskId};

/// Control flags of one admission of a file task.
///
/// A fresh instance is created every time the scheduler admits the task, so a
/// resumed task never inherits the flags of the run it replaced.
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    pause_requested: AtomicBool,
    cancel_requested: AtomicBool,
    token: CancellationToken,
}

impl RunControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
        self.token.cancel();
    }

    pub(crate) fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Fresh token for a single network call; fires with the run.
    pub(crate) fn operation_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

#[derive(Debug)]
pub(crate) struct FileTaskRuntime {
    pub(crate) file: UploadFile,
    pub(crate) category: Category,
    pub(crate) upload_id: Option<String>,
    pub(crate) run: Option<Arc<RunControl>>,
}

#[derive(Debug)]
pub(crate) struct PathTaskRuntime {
    pub(crate) path: String,
    pub(crate) category: Category,
}

impl PathTaskRuntime {
    pub(crate) fn job(&self, task_id: TaskId) -> PathJob {
        PathJob {
            task_id,
            path: self.path.clone(),
            category: self.category,
        }
    }
}

/// Execution state the task list does not expose.
#[derive(Debug)]
pub(crate) enum TaskRuntime {
    File(FileTaskRuntime),
    Path(PathTaskRuntime),
}

impl TaskRuntime {
    pub(crate) fn file(file: UploadFile, category: Category) -> Self {
        TaskRuntime::File(FileTaskRuntime {
            file,
            category,
            upload_id: None,
            run: None,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct RuntimeRegistry {
    entries: HashMap<TaskId, TaskRuntime>,
}

impl RuntimeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, task_id: TaskId, runtime: TaskRuntime) {
        self.entries.insert(task_id, runtime);
    }

    pub(crate) fn get(&self, task_id: &TaskId) -> Option<&TaskRuntime> {
        self.entries.get(task_id)
    }

    pub(crate) fn get_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskRuntime> {
        self.entries.get_mut(task_id)
    }

    pub(crate) fn remove(&mut self, task_id: &TaskId) -> Option<TaskRuntime> {
        self.entries.remove(task_id)
    }

    /// Drops every entry, firing the tokens of runs still in flight.
    pub(crate) fn clear(&mut self) {
        for runtime in self.entries.values() {
            if let TaskRuntime::File(FileTaskRuntime { run: Some(run), .. }) = runtime {
                run.request_cancel();
            }
        }
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use pdh_upload::upload::{ChunkProgress, GatewayProbe, SessionMeta};
use pdh_upload::{
    AttachmentDescriptor, Category, ChunkTransport, Result, RunnerEvent, TaskId, TaskRunner, UploadError,
    UploadManager, UploadTask,
};

pub const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Init { name: String, size: u64 },
    Status { upload_id: String },
    Chunk { upload_id: String, offset: u64, len: usize },
    Complete { upload_id: String },
    Abort { upload_id: String },
}

/// In-memory resumable upload server.
///
/// A gated server holds every chunk call until [`FakeServer::release_chunks`]
/// or [`FakeServer::open_gate`] lets it through; a fired cancellation token
/// releases a waiting call with `UploadError::Cancelled`.
///
/// Init calls can be held the same way with [`FakeServer::gated_init`]. Those
/// ignore cancellation: the session is created once the gate opens, as when a
/// response is already on its way back.
#[derive(Default)]
pub struct FakeServer {
    received: Mutex<HashMap<String, u64>>,
    calls: Mutex<Vec<Call>>,
    next_session: AtomicUsize,
    reject_init: Mutex<Option<String>>,
    gate: Option<Semaphore>,
    waiting: AtomicUsize,
    init_gate: Option<Semaphore>,
    init_waiting: AtomicUsize,
    stall_aborts: AtomicBool,
    active_chunks: AtomicUsize,
    max_active_chunks: AtomicUsize,
    chunk_delay: Duration,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    pub fn gated_init() -> Arc<Self> {
        Arc::new(Self {
            init_gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    pub fn with_chunk_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunk_delay: delay,
            ..Default::default()
        })
    }

    pub fn reject_init(&self, message: Option<&str>) {
        *self.reject_init.lock().unwrap() = message.map(str::to_string);
    }

    pub fn release_init(&self, count: usize) {
        if let Some(gate) = &self.init_gate {
            gate.add_permits(count);
        }
    }

    /// Init calls currently held at the init gate.
    pub fn init_waiting(&self) -> usize {
        self.init_waiting.load(Ordering::SeqCst)
    }

    /// Recorded aborts never return afterwards.
    pub fn stall_aborts(&self) {
        self.stall_aborts.store(true, Ordering::SeqCst);
    }

    pub fn release_chunks(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Lets every current and future chunk call through.
    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.close();
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn chunk_offsets(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Chunk { offset, .. } => Some(offset),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    pub fn aborts(&self) -> usize {
        self.count(|call| matches!(call, Call::Abort { .. }))
    }

    pub fn total_received(&self) -> u64 {
        self.received.lock().unwrap().values().sum()
    }

    /// Chunk calls currently held at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn max_active_chunks(&self) -> usize {
        self.max_active_chunks.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pass_gate(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let passed = tokio::select! {
            _ = cancel.cancelled() => false,
            permit = gate.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
                true
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        if passed { Ok(()) } else { Err(UploadError::Cancelled) }
    }
}

#[async_trait]
impl ChunkTransport for FakeServer {
    async fn init_session(&self, meta: &SessionMeta, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.record(Call::Init { name: meta.original_name.clone(), size: meta.size });
        if let Some(gate) = &self.init_gate {
            self.init_waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            self.init_waiting.fetch_sub(1, Ordering::SeqCst);
        }

        if let Some(message) = self.reject_init.lock().unwrap().clone() {
            return Err(UploadError::server_error(400, message));
        }

        let upload_id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        self.received.lock().unwrap().insert(upload_id.clone(), 0);
        Ok(upload_id)
    }

    async fn get_status(&self, upload_id: &str, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.record(Call::Status { upload_id: upload_id.to_string() });
        Ok(self.received.lock().unwrap().get(upload_id).copied().unwrap_or(0))
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
        on_progress: ChunkProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.pass_gate(cancel).await?;

        let expected = self.received.lock().unwrap().get(upload_id).copied().unwrap_or(0);
        if offset != expected {
            return Err(UploadError::server_error(409, format!("Offset mismatch: expected {}", expected)));
        }

        let active = self.active_chunks.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_chunks.fetch_max(active, Ordering::SeqCst);

        let len = chunk.len();
        on_progress(len as u64 / 2);
        let finished = if self.chunk_delay.is_zero() {
            true
        } else {
            tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(self.chunk_delay) => true,
            }
        };
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
        if !finished {
            return Err(UploadError::Cancelled);
        }
        on_progress(len as u64);

        self.received.lock().unwrap().insert(upload_id.to_string(), offset + len as u64);
        self.record(Call::Chunk { upload_id: upload_id.to_string(), offset, len });
        Ok(())
    }

    async fn complete_session(&self, upload_id: &str, cancel: &CancellationToken) -> Result<AttachmentDescriptor> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.record(Call::Complete { upload_id: upload_id.to_string() });
        let size = self.received.lock().unwrap().get(upload_id).copied().unwrap_or(0);
        let session: usize = upload_id.trim_start_matches("session-").parse().unwrap_or(0);
        let attachment_id = format!("{:024x}", session);
        let attachment = serde_json::json!({
            "_id": attachment_id,
            "size": size,
            "url": format!("/attachments/{}", attachment_id),
        });

        serde_json::from_value(attachment).map_err(|err| UploadError::InvalidResponse(err.to_string()))
    }

    async fn abort_session(&self, upload_id: &str) {
        self.record(Call::Abort { upload_id: upload_id.to_string() });
        self.received.lock().unwrap().remove(upload_id);
        if self.stall_aborts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerCall {
    Start { task_id: TaskId, path: String, category: Category },
    Pause(TaskId),
    Resume(TaskId),
    Cancel(TaskId),
}

/// Desktop runner double: records commands, emits whatever events a test pushes.
pub struct FakeRunner {
    events: broadcast::Sender<RunnerEvent>,
    calls: Mutex<Vec<RunnerCall>>,
    failing_paths: Mutex<HashSet<String>>,
    stall_controls: AtomicBool,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            failing_paths: Mutex::new(HashSet::new()),
            stall_controls: AtomicBool::new(false),
        })
    }

    pub fn fail_start_for(&self, path: &str) {
        self.failing_paths.lock().unwrap().insert(path.to_string());
    }

    /// Pause, resume and cancel are recorded, then never return.
    pub fn stall_controls(&self) {
        self.stall_controls.store(true, Ordering::SeqCst);
    }

    async fn control(&self, call: RunnerCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.stall_controls.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    pub fn emit(&self, event: RunnerEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, RunnerCall::Start { .. })).count()
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn start(&self, task_id: TaskId, path: &str, category: Category) -> Result<()> {
        self.calls.lock().unwrap().push(RunnerCall::Start { task_id, path: path.to_string(), category });
        if self.failing_paths.lock().unwrap().contains(path) {
            return Err(UploadError::internal_error(format!("cannot open {}", path)));
        }
        Ok(())
    }

    async fn pause(&self, task_id: TaskId) -> Result<()> {
        self.control(RunnerCall::Pause(task_id)).await
    }

    async fn resume(&self, task_id: TaskId) -> Result<()> {
        self.control(RunnerCall::Resume(task_id)).await
    }

    async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.control(RunnerCall::Cancel(task_id)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }
}

pub struct FakeGateway {
    ready: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeGateway {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self { ready: AtomicBool::new(true), calls: AtomicUsize::new(0) })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self { ready: AtomicBool::new(false), calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl GatewayProbe for FakeGateway {
    async fn ensure_ready(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.ready.load(Ordering::SeqCst) {
            Ok("http://127.0.0.1:17890".to_string())
        } else {
            Err(UploadError::GatewayUnavailable("Local gateway is not ready, please try again later".to_string()))
        }
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Waits until the published task list holds `task_id` in a state matching `predicate`.
pub async fn wait_for_task(
    manager: &UploadManager,
    task_id: TaskId,
    predicate: impl Fn(&UploadTask) -> bool,
) -> UploadTask {
    let mut tasks = manager.watch_tasks();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        tasks.wait_for(|tasks| tasks.iter().any(|task| task.id == task_id && predicate(task))),
    )
    .await
    .expect("task did not reach the expected state in time")
    .expect("manager stopped");

    snapshot
        .iter()
        .find(|task| task.id == task_id)
        .cloned()
        .expect("task is in the snapshot")
}

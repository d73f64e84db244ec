use std::collections::HashSet;
use super::task::UploadTask;
use super::types::{TaskId, TaskSource, TaskStatus};

/// Greedy admission of queued file tasks under a fixed concurrency bound.
#[derive(Debug)]
pub(crate) struct Scheduler {
    concurrency: usize,
    in_flight: HashSet<TaskId>,
}

impl Scheduler {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            in_flight: HashSet::new(),
        }
    }

    /// Picks the queued file tasks to start now and marks them in flight.
    ///
    /// Running tasks are the union of `uploading` file tasks and the in-flight
    /// set, so a run that is still unwinding after a pause keeps its slot.
    pub(crate) fn admit(&mut self, tasks: &[UploadTask]) -> Vec<TaskId> {
        let running = tasks
            .iter()
            .filter(|t| t.source == TaskSource::File && t.status == TaskStatus::Uploading)
            .map(|t| t.id)
            .chain(self.in_flight.iter().copied())
            .collect::<HashSet<_>>()
            .len();

        let available = self.concurrency.saturating_sub(running);
        if available == 0 {
            return Vec::new();
        }

        let admitted: Vec<TaskId> = tasks
            .iter()
            .filter(|t| t.source == TaskSource::File && t.status == TaskStatus::Queued)
            .filter(|t| !self.in_flight.contains(&t.id))
            .take(available)
            .map(|t| t.id)
            .collect();

        self.in_flight.extend(admitted.iter().copied());
        admitted
    }

    pub(crate) fn finish(&mut self, task_id: &TaskId) -> bool {
        self.in_flight.remove(task_id)
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

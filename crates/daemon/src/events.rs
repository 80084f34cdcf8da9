//! Job notifications and the server-wide event bus.
//!
//! A [`crate::job::Job`] records [`JobEvent`]s in its outbox while it changes.
//! The manager drains them after every step, attaches the job's queue position,
//! and turns them into [`ServerEvent`]s, which are published on the [`EventBus`]
//! in the order the mutations happened.

use crate::jobs::{EncodingState, JobProperties, JobState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Something a job reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StateChanged {
        state: JobState,
        encoding_state: EncodingState,
    },
    Progress,
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Notification broadcast to every subscribed watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "kebab-case")]
pub enum ServerEvent {
    JobCreated {
        index: usize,
        job: JobProperties,
    },
    JobChanged {
        index: usize,
        job: JobProperties,
    },
    JobStateChanged {
        index: usize,
        id: Uuid,
        state: JobState,
        encoding_state: EncodingState,
    },
    JobProgress {
        index: usize,
        id: Uuid,
        frames_processed: u64,
        frames_total: u64,
        frames_in_queue: usize,
        frames_in_process: usize,
        max_threads: usize,
        fps: f64,
        seconds_to_finish: Option<f64>,
    },
    JobLog {
        id: Uuid,
        level: LogLevel,
        text: String,
    },
    JobsSwapped {
        first: Uuid,
        second: Uuid,
    },
    JobsDeleted {
        ids: Vec<Uuid>,
    },
    ShowWindow,
    ServerClosing,
}

impl ServerEvent {
    /// Progress event built from a job snapshot.
    pub fn progress(index: usize, job: &JobProperties) -> Self {
        ServerEvent::JobProgress {
            index,
            id: job.id,
            frames_processed: job.frames_processed,
            frames_total: job.frames_total,
            frames_in_queue: job.frames_in_queue,
            frames_in_process: job.frames_in_process,
            max_threads: job.max_threads,
            fps: job.fps,
            seconds_to_finish: job.seconds_to_finish,
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus for [`ServerEvent`]s.
///
/// Slow receivers lag and lose the oldest events; they can recover with a
/// fresh `get-jobs-info`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ServerEvent) {
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

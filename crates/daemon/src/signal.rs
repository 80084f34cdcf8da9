//! Completion signals from frame producers and subprocess tasks.
//!
//! Anything that finishes asynchronously on behalf of a job reports back through a
//! [`SignalSink`]. Signals are consumed on the engine loop only, so the job state
//! machine never runs concurrently with itself.

use crate::frames::Frame;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "termination by signal"),
        }
    }
}

/// Event reported for one job run.
#[derive(Debug)]
pub enum SignalKind {
    /// A requested frame was computed.
    FrameReady(Frame),
    /// A requested frame could not be computed.
    FrameFailed { frame: u64, reason: String },
    /// A buffer passed to the subprocess was fully written to its stdin.
    BytesWritten(usize),
    /// Writing to the subprocess stdin failed.
    WriteFailed(String),
    /// One line of subprocess stderr.
    ProcessLog(String),
    /// The subprocess exited.
    ProcessFinished(ProcessExit),
}

/// A signal addressed to a specific run of a specific job.
#[derive(Debug)]
pub struct JobSignal {
    pub job_id: Uuid,
    /// Run generation; signals from an earlier run are ignored.
    pub run: u64,
    pub kind: SignalKind,
}

/// Sending half of the signal channel, bound to one job run.
#[derive(Debug, Clone)]
pub struct SignalSink {
    job_id: Uuid,
    run: u64,
    tx: mpsc::UnboundedSender<JobSignal>,
}

impl SignalSink {
    pub fn new(job_id: Uuid, run: u64, tx: mpsc::UnboundedSender<JobSignal>) -> Self {
        Self { job_id, run, tx }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    /// Deliver a signal; silently dropped once the engine has stopped.
    pub fn send(&self, kind: SignalKind) {
        let _ = self.tx.send(JobSignal {
            job_id: self.job_id,
            run: self.run,
            kind,
        });
    }

    pub fn frame_ready(&self, frame: Frame) {
        self.send(SignalKind::FrameReady(frame));
    }

    pub fn frame_failed(&self, frame: u64, reason: impl Into<String>) {
        self.send(SignalKind::FrameFailed {
            frame,
            reason: reason.into(),
        });
    }
}

/// Create the engine's signal channel.
pub fn signal_channel() -> (
    mpsc::UnboundedSender<JobSignal>,
    mpsc::UnboundedReceiver<JobSignal>,
) {
    mpsc::unbounded_channel()
}

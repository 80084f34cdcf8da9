//! Per-job state machine.
//!
//! A [`Job`] turns out-of-order frame completions into an in-order byte stream on
//! an encoder's stdin. It is driven entirely from the engine loop: operations
//! (`start`, `pause`, `abort`) are called by the manager, and asynchronous
//! results arrive through [`Job::handle_signal`]. State changes are recorded in
//! an outbox drained with [`Job::take_events`].
//!
//! Frame bookkeeping for a run over `first..=last`:
//!
//! ```text
//!   first        first + processed    next_write        next_request      last
//!     |  written       | pending write    |  cache / in flight |  not requested |
//! ```
//!
//! At most `look_ahead` frames past the written frontier are ever requested, and
//! the cache can only hold requested frames, so it never outgrows the plan's
//! `cached_frames_limit`.

use crate::concurrency::EncodingPlan;
use crate::config::PartialOutputPolicy;
use crate::encode::process::{ManagedProcess, ProcessError, ProcessLauncher, ProcessSpec};
use crate::encode::sanity::SanityError;
use crate::encode::variables::{TemplateError, VariableTable};
use crate::events::{JobEvent, LogLevel};
use crate::frames::{Frame, FrameProducer, FrameProducerFactory, ProducerError};
use crate::header::{header_writer, HeaderWriter};
use crate::jobs::{frames_in_range, EncodingState, JobProperties, JobState, JobType};
use crate::signal::{JobSignal, ProcessExit, SignalKind, SignalSink};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors returned by job operations that are illegal in the current state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Cannot {operation} job {id} while it is {state}")]
    InvalidState {
        id: Uuid,
        state: JobState,
        operation: &'static str,
    },

    #[error("Job {id} ({job_type}) cannot be paused")]
    PauseNotSupported { id: Uuid, job_type: JobType },
}

/// Reasons a run fails before any frame is written.
#[derive(Debug, Error)]
enum StartError {
    #[error("Encoder sanity check failed: {0}")]
    Sanity(#[from] SanityError),

    #[error("{0}")]
    Producer(#[from] ProducerError),

    #[error("Invalid arguments: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid frame range: {0}")]
    Range(String),

    #[error("Shell command is empty")]
    EmptyCommand,

    #[error("{0}")]
    Launch(#[from] ProcessError),
}

/// Collaborators shared by every job.
#[derive(Clone)]
pub struct JobEnvironment {
    pub producers: Arc<dyn FrameProducerFactory>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub signals: mpsc::UnboundedSender<JobSignal>,
    pub plan: EncodingPlan,
}

impl JobEnvironment {
    pub fn new(
        producers: Arc<dyn FrameProducerFactory>,
        launcher: Arc<dyn ProcessLauncher>,
        signals: mpsc::UnboundedSender<JobSignal>,
        plan: EncodingPlan,
    ) -> Self {
        Self {
            producers,
            launcher,
            signals,
            plan,
        }
    }

    fn sink(&self, job_id: Uuid, run: u64) -> SignalSink {
        SignalSink::new(job_id, run, self.signals.clone())
    }
}

/// Run time that excludes paused periods.
#[derive(Debug, Default)]
struct RunTimer {
    resumed_at: Option<Instant>,
    accumulated: Duration,
}

impl RunTimer {
    fn resume(&mut self) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(at) = self.resumed_at.take() {
            self.accumulated += at.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accumulated + self.resumed_at.map(|at| at.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    frames: u64,
}

/// Resources of an encode run.
struct Pipeline {
    producer: Box<dyn FrameProducer>,
    header: Box<dyn HeaderWriter>,
    sink: SignalSink,
    first: u64,
    last: u64,
    next_request: u64,
    next_write: u64,
    cache: BTreeMap<u64, Frame>,
    cache_limit: usize,
    look_ahead: u64,
    pending: Option<PendingWrite>,
    bytes_to_write: usize,
    bytes_written: usize,
}

impl Pipeline {
    fn in_flight(&self) -> u64 {
        self.next_request - self.next_write - self.cache.len() as u64
    }
}

pub struct Job {
    props: JobProperties,
    env: JobEnvironment,
    run: u64,
    pipeline: Option<Pipeline>,
    process: Option<ManagedProcess>,
    launched: bool,
    timer: RunTimer,
    outbox: Vec<JobEvent>,
}

impl Job {
    pub fn new(props: JobProperties, env: JobEnvironment) -> Self {
        Self {
            props,
            env,
            run: 0,
            pipeline: None,
            process: None,
            launched: false,
            timer: RunTimer::default(),
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.props.id
    }

    pub fn state(&self) -> JobState {
        self.props.job_state
    }

    pub fn encoding_state(&self) -> EncodingState {
        self.props.encoding_state
    }

    pub fn job_type(&self) -> JobType {
        self.props.job_type
    }

    pub fn properties(&self) -> &JobProperties {
        &self.props
    }

    pub fn depends_on(&self) -> &[Uuid] {
        &self.props.depends_on_job_ids
    }

    /// Current run generation.
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Frames cached but not yet written.
    pub fn cached_frames(&self) -> usize {
        self.pipeline.as_ref().map(|p| p.cache.len()).unwrap_or(0)
    }

    /// Whether the job holds a subprocess handle.
    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn take_events(&mut self) -> Vec<JobEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Copy the user-editable settings from `props`; state and progress stay.
    ///
    /// A paused job keeps its live encoder and frame range, so only its
    /// dependencies are taken.
    pub fn apply_settings(&mut self, props: &JobProperties) {
        self.props.depends_on_job_ids = props.depends_on_job_ids.clone();
        if self.props.job_state == JobState::Paused {
            return;
        }
        self.props.job_type = props.job_type;
        self.props.script_name = props.script_name.clone();
        self.props.script_text = props.script_text.clone();
        self.props.encoding_header_type = props.encoding_header_type;
        self.props.executable_path = props.executable_path.clone();
        self.props.arguments = props.arguments.clone();
        self.props.shell_command = props.shell_command.clone();
        self.props.output_path = props.output_path.clone();
        self.props.first_frame = props.first_frame;
        self.props.last_frame = props.last_frame;
        self.props.frames_total = self.props.configured_frames_total().unwrap_or(0);
    }

    /// First setting in `props` that differs from what a paused job's
    /// pipeline was built from. `None` when the job is not paused.
    pub fn locked_setting_change(&self, props: &JobProperties) -> Option<&'static str> {
        if self.props.job_state != JobState::Paused {
            return None;
        }
        let cur = &self.props;
        if cur.job_type != props.job_type {
            Some("job_type")
        } else if cur.script_name != props.script_name || cur.script_text != props.script_text {
            Some("script")
        } else if cur.encoding_header_type != props.encoding_header_type {
            Some("encoding_header_type")
        } else if cur.executable_path != props.executable_path {
            Some("executable_path")
        } else if cur.arguments != props.arguments {
            Some("arguments")
        } else if cur.shell_command != props.shell_command {
            Some("shell_command")
        } else if cur.output_path != props.output_path {
            Some("output_path")
        } else if cur.first_frame != props.first_frame || cur.last_frame != props.last_frame {
            Some("frame range")
        } else {
            None
        }
    }

    pub fn set_dependencies(&mut self, ids: Vec<Uuid>) {
        self.props.depends_on_job_ids = ids;
    }

    /// Mark a waiting job as blocked by a failed dependency.
    pub fn set_dependency_not_met(&mut self) {
        if self.props.job_state == JobState::Waiting {
            info!(job_id = %self.props.id, "Dependency failed, job will not run");
            self.transition(JobState::DependencyNotMet, EncodingState::Idle);
        }
    }

    /// Start a waiting job or resume a paused one.
    pub fn start(&mut self) -> Result<(), JobError> {
        match self.props.job_state {
            JobState::Waiting => {
                self.begin_run();
                Ok(())
            }
            JobState::Paused => {
                self.resume();
                Ok(())
            }
            state => Err(JobError::InvalidState {
                id: self.props.id,
                state,
                operation: "start",
            }),
        }
    }

    /// Stop requesting frames and let in-flight work drain.
    pub fn pause(&mut self) -> Result<(), JobError> {
        match self.props.job_state {
            JobState::Running if self.props.job_type != JobType::EncodeScriptCli => {
                Err(JobError::PauseNotSupported {
                    id: self.props.id,
                    job_type: self.props.job_type,
                })
            }
            JobState::Running => {
                info!(job_id = %self.props.id, "Pausing job");
                self.transition(JobState::Pausing, self.props.encoding_state);
                self.check_paused();
                Ok(())
            }
            JobState::Pausing | JobState::Paused => Ok(()),
            state => Err(JobError::InvalidState {
                id: self.props.id,
                state,
                operation: "pause",
            }),
        }
    }

    /// Cancel the job from any non-terminal state. Repeated calls are no-ops.
    pub fn abort(&mut self) {
        match self.props.job_state {
            JobState::Waiting | JobState::DependencyNotMet => {
                info!(job_id = %self.props.id, "Job aborted before it started");
                self.transition(JobState::Aborted, EncodingState::Idle);
            }
            JobState::Running | JobState::Pausing | JobState::Paused => {
                info!(job_id = %self.props.id, "Aborting job");
                self.release_frames();
                let grace = self.env.plan.abort_timeout;
                match self.process.as_mut() {
                    Some(process) => {
                        process.terminate(grace);
                        self.transition(JobState::Aborting, EncodingState::Aborting);
                    }
                    None => self.finish(JobState::Aborted),
                }
            }
            JobState::Aborting
            | JobState::FailedCleanUp
            | JobState::CompletedCleanUp
            | JobState::Aborted
            | JobState::Failed
            | JobState::Completed => {}
        }
    }

    /// Return a finished job to `Waiting` with its progress cleared.
    pub fn reset(&mut self) -> Result<(), JobError> {
        let state = self.props.job_state;
        if state.is_active() || state == JobState::Paused {
            return Err(JobError::InvalidState {
                id: self.props.id,
                state,
                operation: "reset",
            });
        }
        self.props.frames_processed = 0;
        self.props.frames_total = self.props.configured_frames_total().unwrap_or(0);
        self.props.frames_in_queue = 0;
        self.props.frames_in_process = 0;
        self.props.fps = 0.0;
        self.props.seconds_to_finish = None;
        self.props.error_reason = None;
        self.transition(JobState::Waiting, EncodingState::Idle);
        self.outbox.push(JobEvent::Progress);
        Ok(())
    }

    /// Apply an asynchronous result. Signals from an earlier run are ignored.
    pub fn handle_signal(&mut self, run: u64, kind: SignalKind) {
        if run != self.run {
            debug!(job_id = %self.props.id, run, current = self.run, "Ignoring signal from a previous run");
            return;
        }
        match kind {
            SignalKind::FrameReady(frame) => self.on_frame_ready(frame),
            SignalKind::FrameFailed { frame, reason } => {
                if self.is_streaming() {
                    self.fail_running(
                        format!("Frame {} failed: {}", frame, reason),
                        EncodingState::Aborting,
                    );
                }
            }
            SignalKind::BytesWritten(n) => self.on_bytes_written(n),
            SignalKind::WriteFailed(reason) => {
                if self.is_streaming() {
                    self.fail_running(
                        format!("Writing to encoder failed: {}", reason),
                        EncodingState::EncoderCrashed,
                    );
                }
            }
            SignalKind::ProcessLog(line) => {
                debug!(job_id = %self.props.id, "{}", line);
                self.log(LogLevel::Debug, line);
            }
            SignalKind::ProcessFinished(exit) => self.on_process_finished(exit),
        }
    }

    fn is_streaming(&self) -> bool {
        matches!(self.props.job_state, JobState::Running | JobState::Pausing)
    }

    fn begin_run(&mut self) {
        self.run += 1;
        self.launched = false;
        self.props.frames_processed = 0;
        self.props.frames_total = self.props.configured_frames_total().unwrap_or(0);
        self.props.fps = 0.0;
        self.props.seconds_to_finish = None;
        self.props.error_reason = None;
        self.timer = RunTimer::default();
        self.timer.resume();

        info!(
            job_id = %self.props.id,
            job_type = %self.props.job_type,
            run = self.run,
            "Starting job"
        );
        self.transition(JobState::Running, EncodingState::CheckingEncoderSanity);

        let result = match self.props.job_type {
            JobType::EncodeScriptCli => self.start_encode(),
            JobType::RunProcess => self.start_process(),
            JobType::RunShellCommand => self.start_shell(),
        };

        if let Err(e) = result {
            let reason = e.to_string();
            error!(job_id = %self.props.id, reason = %reason, "Job failed to start");
            self.props.error_reason = Some(reason.clone());
            self.log(LogLevel::Error, reason);
            if matches!(e, StartError::Launch(_)) {
                self.set_encoding(EncodingState::EncoderCrashed);
            }
            self.release_frames();
            self.finish(JobState::Failed);
        }
    }

    fn start_encode(&mut self) -> Result<(), StartError> {
        let program = self.env.launcher.resolve(&self.props.executable_path)?;
        let producer = self
            .env
            .producers
            .open(&self.props.script_text, &self.props.script_name)?;
        let clip = producer.clip_info().clone();

        let Some((first, last)) =
            resolve_range(self.props.first_frame, self.props.last_frame, clip.num_frames)?
        else {
            info!(job_id = %self.props.id, "Empty frame range, nothing to encode");
            self.props.frames_total = 0;
            self.transition(JobState::CompletedCleanUp, EncodingState::Idle);
            self.finish(JobState::Completed);
            return Ok(());
        };
        let total = frames_in_range(first, last);
        self.props.frames_total = total;

        let variables = VariableTable::for_job(
            Some(&clip),
            &self.props.script_name,
            total,
            self.props.output_path.as_deref(),
        );
        let args = variables.expand_arguments(&self.props.arguments)?;

        self.set_encoding(EncodingState::StartingEncoder);
        let sink = self.env.sink(self.props.id, self.run);
        let spec = ProcessSpec::new(program, args).with_stdin();
        info!(job_id = %self.props.id, command = %spec.display_command(), frames = total, "Launching encoder");
        let process = self.env.launcher.launch(&spec, sink.clone())?;
        self.process = Some(process);
        self.launched = true;

        let plan = &self.env.plan;
        let look_ahead = plan.max_threads.min(plan.cached_frames_limit).max(1);
        self.props.max_threads = look_ahead;

        let header = header_writer(self.props.encoding_header_type, &clip);
        let header_bytes = header
            .need_video_header()
            .then(|| header.video_header(total));

        self.pipeline = Some(Pipeline {
            producer,
            header,
            sink,
            first,
            last,
            next_request: first,
            next_write: first,
            cache: BTreeMap::new(),
            cache_limit: plan.cached_frames_limit,
            look_ahead: look_ahead as u64,
            pending: None,
            bytes_to_write: 0,
            bytes_written: 0,
        });

        match header_bytes {
            Some(bytes) => {
                self.set_encoding(EncodingState::WritingHeader);
                self.write_buffer(bytes, 0);
            }
            None => self.set_encoding(EncodingState::WaitingForFrames),
        }
        self.request_frames();
        Ok(())
    }

    fn start_process(&mut self) -> Result<(), StartError> {
        let program = self.env.launcher.resolve(&self.props.executable_path)?;
        let variables = VariableTable::for_job(
            None,
            &self.props.script_name,
            0,
            self.props.output_path.as_deref(),
        );
        let args = variables.expand_arguments(&self.props.arguments)?;
        self.launch_command(ProcessSpec::new(program, args))
    }

    fn start_shell(&mut self) -> Result<(), StartError> {
        if self.props.shell_command.trim().is_empty() {
            return Err(StartError::EmptyCommand);
        }
        let spec = ProcessSpec::shell(&self.props.shell_command);
        self.launch_command(spec)
    }

    fn launch_command(&mut self, spec: ProcessSpec) -> Result<(), StartError> {
        self.set_encoding(EncodingState::StartingEncoder);
        info!(job_id = %self.props.id, command = %spec.display_command(), "Launching process");
        let sink = self.env.sink(self.props.id, self.run);
        let process = self.env.launcher.launch(&spec, sink)?;
        self.process = Some(process);
        self.launched = true;
        self.set_encoding(EncodingState::Finishing);
        Ok(())
    }

    fn resume(&mut self) {
        info!(job_id = %self.props.id, "Resuming job");
        self.timer.resume();
        self.transition(JobState::Running, self.props.encoding_state);
        self.request_frames();
    }

    /// Issue frame requests up to the look-ahead bound.
    fn request_frames(&mut self) {
        if self.props.job_state != JobState::Running {
            return;
        }
        let frontier_offset = self.props.frames_processed;
        let Some(p) = self.pipeline.as_mut() else {
            return;
        };
        let frontier = p.first + frontier_offset;
        while p.next_request <= p.last && p.next_request < frontier + p.look_ahead {
            p.producer.request_frame(p.next_request, p.sink.clone());
            p.next_request += 1;
        }
        self.mirror_stats();
    }

    fn on_frame_ready(&mut self, frame: Frame) {
        if !self.is_streaming() {
            debug!(job_id = %self.props.id, frame = frame.number, "Discarding frame, job is not streaming");
            return;
        }
        let Some(p) = self.pipeline.as_mut() else {
            return;
        };
        let n = frame.number;
        if n < p.first || n > p.last || n >= p.next_request {
            warn!(job_id = %self.props.id, frame = n, "Dropping frame outside the requested range");
            return;
        }
        if n < p.next_write || p.cache.contains_key(&n) {
            warn!(job_id = %self.props.id, frame = n, "Dropping duplicate frame");
            return;
        }
        p.cache.insert(n, frame);
        debug_assert!(
            p.cache.len() <= p.cache_limit,
            "frame cache exceeded its limit while look-ahead is bounded"
        );
        self.flush();
        self.check_paused();
    }

    /// Write the contiguous cached run starting at `next_write` as one buffer.
    fn flush(&mut self) {
        let Some(p) = self.pipeline.as_mut() else {
            return;
        };
        if p.pending.is_some() {
            return;
        }
        let mut buf = Vec::new();
        let mut count = 0u64;
        while let Some(frame) = p.cache.remove(&p.next_write) {
            if p.header.need_frame_prefix() {
                buf.extend_from_slice(&p.header.frame_prefix(&frame));
            }
            buf.extend_from_slice(&frame.data);
            if p.header.need_frame_postfix() {
                buf.extend_from_slice(&p.header.frame_postfix(&frame));
            }
            p.next_write += 1;
            count += 1;
        }
        if count == 0 {
            return;
        }
        self.set_encoding(EncodingState::WritingFrame);
        self.write_buffer(buf, count);
    }

    fn write_buffer(&mut self, bytes: Vec<u8>, frames: u64) {
        let Some(p) = self.pipeline.as_mut() else {
            return;
        };
        p.pending = Some(PendingWrite { frames });
        p.bytes_to_write += bytes.len();

        let accepted = self
            .process
            .as_ref()
            .map(|process| process.write(bytes))
            .unwrap_or(false);
        if !accepted {
            self.fail_running(
                "Encoder stdin is closed".to_string(),
                EncodingState::EncoderCrashed,
            );
        }
    }

    fn on_bytes_written(&mut self, n: usize) {
        if !self.is_streaming() {
            return;
        }
        let Some(p) = self.pipeline.as_mut() else {
            return;
        };
        p.bytes_written += n;
        let Some(pending) = p.pending else {
            warn!(job_id = %self.props.id, bytes = n, "Write completion without a pending write");
            return;
        };
        if p.bytes_written < p.bytes_to_write {
            return;
        }
        p.pending = None;
        let all_written = p.next_write > p.last;

        if pending.frames > 0 {
            self.props.frames_processed += pending.frames;
            debug_assert!(self.props.frames_processed <= self.props.frames_total);
            self.update_rate();
            self.mirror_stats();
            self.outbox.push(JobEvent::Progress);
        }

        if all_written {
            debug!(job_id = %self.props.id, "All frames written, closing encoder input");
            if let Some(process) = self.process.as_mut() {
                process.close_stdin();
            }
            self.set_encoding(EncodingState::Finishing);
            return;
        }

        self.set_encoding(EncodingState::WaitingForFrames);
        self.flush();
        self.request_frames();
        self.check_paused();
    }

    fn on_process_finished(&mut self, exit: ProcessExit) {
        self.process = None;
        match self.props.job_state {
            JobState::Running | JobState::Pausing | JobState::Paused => {
                let is_encode = self.props.job_type == JobType::EncodeScriptCli;
                let finishing = self.props.encoding_state == EncodingState::Finishing;
                if exit.success() && (!is_encode || finishing) {
                    info!(job_id = %self.props.id, "Job completed");
                    self.transition(JobState::CompletedCleanUp, self.props.encoding_state);
                    self.release_frames();
                    self.finish(JobState::Completed);
                } else {
                    let reason = if !is_encode {
                        format!("Process failed with {}", exit)
                    } else if finishing {
                        format!("Encoder failed with {}", exit)
                    } else {
                        format!("Encoder exited unexpectedly with {}", exit)
                    };
                    error!(job_id = %self.props.id, reason = %reason, "Job failed");
                    self.props.error_reason = Some(reason.clone());
                    self.log(LogLevel::Error, reason);
                    self.set_encoding(EncodingState::EncoderCrashed);
                    self.release_frames();
                    self.finish(JobState::Failed);
                }
            }
            JobState::Aborting => self.finish(JobState::Aborted),
            JobState::FailedCleanUp => self.finish(JobState::Failed),
            JobState::CompletedCleanUp => self.finish(JobState::Completed),
            state => {
                debug!(job_id = %self.props.id, state = %state, "Process exit ignored");
            }
        }
    }

    /// Tear down a streaming run after an error; the job fails once the process is gone.
    fn fail_running(&mut self, reason: String, encoding: EncodingState) {
        error!(job_id = %self.props.id, reason = %reason, "Job failed");
        self.props.error_reason = Some(reason.clone());
        self.log(LogLevel::Error, reason);
        self.release_frames();
        let grace = self.env.plan.abort_timeout;
        match self.process.as_mut() {
            Some(process) => {
                process.terminate(grace);
                self.transition(JobState::FailedCleanUp, encoding);
            }
            None => self.finish(JobState::Failed),
        }
    }

    fn check_paused(&mut self) {
        if self.props.job_state != JobState::Pausing
            || self.props.encoding_state == EncodingState::Finishing
        {
            return;
        }
        let drained = self
            .pipeline
            .as_ref()
            .map(|p| p.pending.is_none() && p.cache.is_empty() && p.in_flight() == 0)
            .unwrap_or(true);
        if drained {
            self.timer.stop();
            self.mirror_stats();
            info!(job_id = %self.props.id, frames = self.props.frames_processed, "Job paused");
            self.transition(JobState::Paused, self.props.encoding_state);
        }
    }

    /// Cancel outstanding frames and drop the cache.
    fn release_frames(&mut self) {
        if let Some(mut p) = self.pipeline.take() {
            p.producer.cancel();
            if !p.cache.is_empty() {
                debug!(job_id = %self.props.id, frames = p.cache.len(), "Discarding cached frames");
            }
        }
        self.props.frames_in_queue = 0;
        self.props.frames_in_process = 0;
    }

    fn finish(&mut self, state: JobState) {
        self.release_frames();
        self.process = None;
        self.timer.stop();
        if state == JobState::Completed {
            self.props.seconds_to_finish = Some(0.0);
        } else {
            self.props.seconds_to_finish = None;
        }
        info!(job_id = %self.props.id, state = %state, "Job finished");
        self.transition(state, EncodingState::Idle);

        if matches!(state, JobState::Aborted | JobState::Failed) {
            self.apply_partial_output_policy();
        }
    }

    fn apply_partial_output_policy(&mut self) {
        if self.env.plan.partial_output != PartialOutputPolicy::Delete
            || self.props.job_type != JobType::EncodeScriptCli
            || !self.launched
        {
            return;
        }
        let Some(path) = self.props.output_path.clone() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(job_id = %self.props.id, path = %path.display(), "Removed partial output");
                self.log(
                    LogLevel::Info,
                    format!("Removed partial output {}", path.display()),
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(job_id = %self.props.id, path = %path.display(), error = %e, "Failed to remove partial output");
            }
        }
    }

    fn update_rate(&mut self) {
        let secs = self.timer.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let fps = self.props.frames_processed as f64 / secs;
        self.props.fps = fps;
        let remaining = self
            .props
            .frames_total
            .saturating_sub(self.props.frames_processed);
        self.props.seconds_to_finish = (fps > 0.0).then(|| remaining as f64 / fps);
    }

    fn mirror_stats(&mut self) {
        if let Some(p) = self.pipeline.as_ref() {
            let stats = p.producer.stats();
            self.props.frames_in_queue = stats.frames_in_queue;
            self.props.frames_in_process = stats.frames_in_process;
        }
    }

    fn transition(&mut self, state: JobState, encoding: EncodingState) {
        if self.props.job_state == state && self.props.encoding_state == encoding {
            return;
        }
        self.props.job_state = state;
        self.props.encoding_state = encoding;
        self.outbox.push(JobEvent::StateChanged {
            state,
            encoding_state: encoding,
        });
    }

    fn set_encoding(&mut self, encoding: EncodingState) {
        self.transition(self.props.job_state, encoding);
    }

    fn log(&mut self, level: LogLevel, message: String) {
        self.outbox.push(JobEvent::Log { level, message });
    }
}

/// Resolve a configured range against the clip length; `None` means empty.
fn resolve_range(
    first: u64,
    last: i64,
    num_frames: u64,
) -> Result<Option<(u64, u64)>, StartError> {
    let last = if last < 0 {
        match num_frames.checked_sub(1) {
            Some(end) => end,
            None => return Ok(None),
        }
    } else {
        let last = last as u64;
        if last >= num_frames {
            return Err(StartError::Range(format!(
                "last frame {} is beyond the end of the clip ({} frames)",
                last, num_frames
            )));
        }
        last
    };
    if first > last {
        return Ok(None);
    }
    Ok(Some((first, last)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::EncodingHeaderType;
    use crate::testing::{test_env, FakeProcess, ManualState, RecordingLauncher, TestEnv};
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct Harness {
        job: Job,
        launcher: Arc<RecordingLauncher>,
        producer: Arc<ManualState>,
        fake: Option<FakeProcess>,
        _signals: mpsc::UnboundedReceiver<JobSignal>,
    }

    impl Harness {
        fn new(props: JobProperties, plan: EncodingPlan) -> Self {
            let TestEnv {
                env,
                launcher,
                producer,
                signals,
            } = test_env(plan);
            let mut props = props;
            props.id = Uuid::new_v4();
            Self {
                job: Job::new(props, env),
                launcher,
                producer,
                fake: None,
                _signals: signals,
            }
        }

        fn encode(first: u64, last: i64, plan: EncodingPlan) -> Self {
            let mut props = JobProperties::encode("clip.vpy", "clip = blank", "enc", "-o {o} -");
            props.output_path = Some("/tmp/out.bin".into());
            props.first_frame = first;
            props.last_frame = last;
            Self::new(props, plan)
        }

        fn start(&mut self) {
            self.job.start().unwrap();
            self.fake = self.launcher.take_last();
        }

        fn signal(&mut self, kind: SignalKind) {
            let run = self.job.run();
            self.job.handle_signal(run, kind);
        }

        fn deliver(&mut self, n: u64) {
            self.signal(SignalKind::FrameReady(frame(n)));
        }

        /// Buffers written since the last call.
        fn written(&mut self) -> Vec<Vec<u8>> {
            self.fake
                .as_mut()
                .and_then(|f| f.written())
                .unwrap_or_default()
        }

        /// Acknowledge every buffer written so far, returning them.
        fn complete_writes(&mut self) -> Vec<Vec<u8>> {
            let mut all = Vec::new();
            loop {
                let batch = self.written();
                if batch.is_empty() {
                    return all;
                }
                for buf in batch {
                    self.signal(SignalKind::BytesWritten(buf.len()));
                    all.push(buf);
                }
            }
        }

        fn requested(&self) -> Vec<u64> {
            self.producer.requested()
        }

        fn exit(&mut self, code: Option<i32>) {
            self.signal(SignalKind::ProcessFinished(ProcessExit { code }));
        }

        fn states(&mut self) -> Vec<(JobState, EncodingState)> {
            self.job
                .take_events()
                .into_iter()
                .filter_map(|e| match e {
                    JobEvent::StateChanged {
                        state,
                        encoding_state,
                    } => Some((state, encoding_state)),
                    _ => None,
                })
                .collect()
        }
    }

    fn frame(n: u64) -> Frame {
        Frame {
            number: n,
            data: vec![n as u8; 2],
        }
    }

    fn frame_bytes(frames: &[u64]) -> Vec<u8> {
        frames.iter().flat_map(|&n| vec![n as u8; 2]).collect()
    }

    #[test]
    fn test_start_requires_waiting_or_paused() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        assert_eq!(h.job.state(), JobState::Running);
        assert!(matches!(
            h.job.start(),
            Err(JobError::InvalidState {
                state: JobState::Running,
                ..
            })
        ));
    }

    #[test]
    fn test_start_launches_encoder_with_substituted_arguments() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        let fake = h.fake.as_ref().expect("encoder launched");
        assert_eq!(fake.spec.program, std::path::PathBuf::from("enc"));
        assert_eq!(fake.spec.args, vec!["-o", "/tmp/out.bin", "-"]);
        assert!(fake.spec.pipe_stdin);
        assert_eq!(h.job.properties().frames_total, 10);
        assert_eq!(h.job.encoding_state(), EncodingState::WaitingForFrames);
        assert_eq!(
            h.states(),
            vec![
                (JobState::Running, EncodingState::CheckingEncoderSanity),
                (JobState::Running, EncodingState::StartingEncoder),
                (JobState::Running, EncodingState::WaitingForFrames),
            ]
        );
    }

    #[test]
    fn test_look_ahead_is_bounded_by_max_threads() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(2, 4));
        h.start();
        assert_eq!(h.requested(), vec![0, 1]);

        h.deliver(1);
        assert_eq!(h.requested(), vec![0, 1]);
        assert!(h.written().is_empty());

        h.deliver(0);
        // writing, but nothing acknowledged yet
        assert_eq!(h.requested(), vec![0, 1]);

        let written = h.complete_writes();
        assert_eq!(written, vec![frame_bytes(&[0, 1])]);
        assert_eq!(h.requested(), vec![0, 1, 2, 3]);
        assert_eq!(h.job.properties().frames_processed, 2);
    }

    #[test]
    fn test_out_of_order_frames_flush_in_one_pass() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(8, 16));
        h.start();
        for n in 0..3 {
            h.deliver(n);
            h.complete_writes();
        }
        assert_eq!(h.job.properties().frames_processed, 3);

        h.deliver(5);
        h.deliver(4);
        assert!(h.written().is_empty());
        assert_eq!(h.job.cached_frames(), 2);

        h.deliver(3);
        let written = h.written();
        assert_eq!(written, vec![frame_bytes(&[3, 4, 5])]);
        assert_eq!(h.job.cached_frames(), 0);

        h.signal(SignalKind::BytesWritten(written[0].len()));
        assert_eq!(h.job.properties().frames_processed, 6);
    }

    #[test]
    fn test_no_second_write_while_one_is_pending() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.deliver(0);
        h.deliver(1);
        h.deliver(2);
        // 1 and 2 wait behind the pending write of 0
        assert_eq!(h.written(), vec![frame_bytes(&[0])]);
        assert_eq!(h.job.cached_frames(), 2);

        h.signal(SignalKind::BytesWritten(2));
        assert_eq!(h.written(), vec![frame_bytes(&[1, 2])]);
    }

    #[test]
    fn test_partial_write_completion_waits_for_remaining_bytes() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.deliver(0);
        h.deliver(1);
        h.signal(SignalKind::BytesWritten(1));
        assert_eq!(h.job.properties().frames_processed, 0);
        h.signal(SignalKind::BytesWritten(1));
        assert_eq!(h.job.properties().frames_processed, 1);
    }

    #[test]
    fn test_foreign_and_duplicate_frames_are_dropped() {
        let mut h = Harness::encode(10, 19, EncodingPlan::fixed(4, 8));
        h.start();
        assert_eq!(h.requested(), vec![10, 11, 12, 13]);

        h.deliver(3);
        h.deliver(50);
        h.deliver(15);
        assert_eq!(h.job.cached_frames(), 0);
        assert_eq!(h.job.state(), JobState::Running);

        h.deliver(11);
        h.deliver(11);
        assert_eq!(h.job.cached_frames(), 1);
    }

    #[test]
    fn test_successful_encode_completes_after_exit() {
        let mut h = Harness::encode(0, 2, EncodingPlan::fixed(4, 8));
        h.start();
        for n in [2, 0, 1] {
            h.deliver(n);
        }
        let written: Vec<u8> = h.complete_writes().concat();
        assert_eq!(written, frame_bytes(&[0, 1, 2]));
        assert_eq!(h.job.encoding_state(), EncodingState::Finishing);
        assert!(h.fake.as_mut().unwrap().stdin_closed());
        assert_eq!(h.job.state(), JobState::Running);

        h.states();
        h.exit(Some(0));
        assert_eq!(h.job.state(), JobState::Completed);
        assert_eq!(
            h.states(),
            vec![
                (JobState::CompletedCleanUp, EncodingState::Finishing),
                (JobState::Completed, EncodingState::Idle),
            ]
        );
        assert!(!h.job.has_process());
        assert_eq!(h.job.properties().frames_processed, 3);
    }

    #[test]
    fn test_y4m_header_and_frame_prefix() {
        let mut props = JobProperties::encode("clip.vpy", "clip", "enc", "-");
        props.encoding_header_type = EncodingHeaderType::Y4m;
        props.first_frame = 0;
        props.last_frame = 1;
        let mut h = Harness::new(props, EncodingPlan::fixed(2, 4));
        h.start();
        assert_eq!(h.job.encoding_state(), EncodingState::WritingHeader);

        h.deliver(0);
        h.deliver(1);
        let written = h.complete_writes();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], b"YUV4MPEG2 W2 H1 F25:1 Ip A0:0 Cmono\n");
        assert_eq!(written[1], b"FRAME\n\0\0FRAME\n\x01\x01");
        // the header does not count as progress
        assert_eq!(h.job.properties().frames_processed, 2);
    }

    #[test]
    fn test_encoder_crash_freezes_progress() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.deliver(0);
        h.deliver(1);
        h.complete_writes();
        h.deliver(2);
        h.states();

        h.exit(Some(1));
        assert_eq!(h.job.state(), JobState::Failed);
        assert_eq!(h.job.properties().frames_processed, 2);
        assert_eq!(
            h.states(),
            vec![
                (JobState::Running, EncodingState::EncoderCrashed),
                (JobState::Failed, EncodingState::Idle),
            ]
        );
        assert!(h
            .job
            .properties()
            .error_reason
            .as_deref()
            .unwrap()
            .contains("exit code 1"));
        assert!(h.producer.was_cancelled());
    }

    #[test]
    fn test_frame_failure_waits_for_process_then_fails() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.deliver(1);
        h.signal(SignalKind::FrameFailed {
            frame: 0,
            reason: "script error".into(),
        });
        assert_eq!(h.job.state(), JobState::FailedCleanUp);
        assert_eq!(h.job.cached_frames(), 0);
        assert!(h.producer.was_cancelled());
        assert_eq!(
            h.fake.as_mut().unwrap().terminate_requested(),
            Some(Duration::from_millis(3000))
        );

        // late frames are ignored during clean-up
        h.deliver(2);
        h.exit(None);
        assert_eq!(h.job.state(), JobState::Failed);
        assert_eq!(
            h.job.properties().error_reason.as_deref(),
            Some("Frame 0 failed: script error")
        );
    }

    #[test]
    fn test_write_failure_is_an_encoder_crash() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.deliver(0);
        h.signal(SignalKind::WriteFailed("broken pipe".into()));
        assert_eq!(h.job.state(), JobState::FailedCleanUp);
        assert_eq!(h.job.encoding_state(), EncodingState::EncoderCrashed);
        h.exit(Some(1));
        assert_eq!(h.job.state(), JobState::Failed);
    }

    #[test]
    fn test_pause_drains_then_resumes() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(2, 4));
        h.start();
        h.job.pause().unwrap();
        assert_eq!(h.job.state(), JobState::Pausing);

        h.deliver(0);
        h.deliver(1);
        h.complete_writes();
        assert_eq!(h.job.state(), JobState::Paused);
        assert_eq!(h.requested(), vec![0, 1]);
        assert_eq!(h.job.properties().frames_processed, 2);

        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Running);
        assert_eq!(h.requested(), vec![0, 1, 2, 3]);
        // same run, same encoder
        assert_eq!(h.launcher.launch_count(), 0);
        assert_eq!(h.job.run(), 1);
    }

    #[test]
    fn test_paused_job_only_takes_dependency_changes() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(2, 4));
        h.start();
        h.job.pause().unwrap();
        h.deliver(0);
        h.deliver(1);
        h.complete_writes();
        assert_eq!(h.job.state(), JobState::Paused);

        let mut edited = h.job.properties().clone();
        edited.last_frame = 0;
        assert_eq!(h.job.locked_setting_change(&edited), Some("frame range"));
        edited.last_frame = 9;
        edited.arguments = "-o other -".to_string();
        assert_eq!(h.job.locked_setting_change(&edited), Some("arguments"));

        let dep = Uuid::new_v4();
        edited.depends_on_job_ids = vec![dep];
        h.job.apply_settings(&edited);
        let props = h.job.properties();
        assert_eq!(props.depends_on_job_ids, vec![dep]);
        assert_eq!(props.arguments, "-o {o} -");
        assert_eq!(props.frames_total, 10);
        assert_eq!(props.frames_processed, 2);
    }

    #[test]
    fn test_pause_during_last_frames_still_completes() {
        let mut h = Harness::encode(0, 1, EncodingPlan::fixed(1, 1));
        h.start();
        h.deliver(0);
        h.complete_writes();
        // frame 1 requested, in flight
        h.job.pause().unwrap();
        assert_eq!(h.job.state(), JobState::Pausing);
        h.deliver(1);
        h.complete_writes();
        // everything written: the job finishes instead of pausing
        assert_eq!(h.job.encoding_state(), EncodingState::Finishing);
        assert_eq!(h.job.state(), JobState::Pausing);
        h.exit(Some(0));
        assert_eq!(h.job.state(), JobState::Completed);
    }

    #[test]
    fn test_pause_rejected_for_process_jobs_and_idle_jobs() {
        let mut h = Harness::new(JobProperties::shell("sleep 1"), EncodingPlan::fixed(1, 1));
        assert!(matches!(
            h.job.pause(),
            Err(JobError::InvalidState { .. })
        ));
        h.start();
        assert!(matches!(
            h.job.pause(),
            Err(JobError::PauseNotSupported { .. })
        ));
    }

    #[test]
    fn test_abort_running_job_terminates_encoder() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.deliver(2);
        h.job.abort();
        assert_eq!(h.job.state(), JobState::Aborting);
        assert_eq!(h.job.cached_frames(), 0);
        assert!(h.producer.was_cancelled());
        assert!(h.fake.as_mut().unwrap().terminate_requested().is_some());

        h.job.abort();
        assert_eq!(h.job.state(), JobState::Aborting);

        h.exit(None);
        assert_eq!(h.job.state(), JobState::Aborted);
        assert!(!h.job.has_process());

        h.job.abort();
        assert_eq!(h.job.state(), JobState::Aborted);
    }

    #[test]
    fn test_abort_paused_job() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(1, 1));
        h.start();
        h.job.pause().unwrap();
        h.deliver(0);
        h.complete_writes();
        assert_eq!(h.job.state(), JobState::Paused);
        h.job.abort();
        assert_eq!(h.job.state(), JobState::Aborting);
        h.exit(None);
        assert_eq!(h.job.state(), JobState::Aborted);
    }

    #[test]
    fn test_abort_waiting_job_is_immediate() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.job.abort();
        assert_eq!(h.job.state(), JobState::Aborted);
        assert_eq!(h.launcher.launch_count(), 0);
    }

    #[test]
    fn test_signals_from_previous_run_are_ignored() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        h.job.abort();
        h.exit(None);
        h.job.reset().unwrap();
        h.start();
        assert_eq!(h.job.run(), 2);

        // exit of the first encoder arriving late
        h.job.handle_signal(
            1,
            SignalKind::ProcessFinished(ProcessExit { code: Some(1) }),
        );
        assert_eq!(h.job.state(), JobState::Running);
    }

    #[test]
    fn test_missing_executable_fails_without_launch() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.launcher.mark_missing("enc");
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
        assert_eq!(h.launcher.launch_count(), 0);
        assert!(h
            .job
            .properties()
            .error_reason
            .as_deref()
            .unwrap()
            .contains("not found"));
    }

    #[test]
    fn test_configuration_errors_fail_the_job() {
        let mut h = Harness::encode(0, 100, EncodingPlan::fixed(4, 8));
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
        assert!(h
            .job
            .properties()
            .error_reason
            .as_deref()
            .unwrap()
            .starts_with("Invalid frame range"));

        let mut props = JobProperties::encode("clip.vpy", "clip", "enc", "--size {width}");
        props.last_frame = 5;
        let mut h = Harness::new(props, EncodingPlan::fixed(4, 8));
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
        assert_eq!(h.launcher.launch_count(), 0);

        let props = JobProperties::encode("clip.vpy", "", "enc", "-");
        let mut h = Harness::new(props, EncodingPlan::fixed(4, 8));
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
    }

    #[test]
    fn test_launch_failure_is_an_encoder_crash() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        *h.launcher.refuse_launch.lock().unwrap() = true;
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
        assert!(h
            .states()
            .contains(&(JobState::Running, EncodingState::EncoderCrashed)));
    }

    #[test]
    fn test_zero_length_range_completes_immediately() {
        let mut h = Harness::encode(5, 4, EncodingPlan::fixed(4, 8));
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Completed);
        assert_eq!(h.launcher.launch_count(), 0);
        assert_eq!(h.job.properties().frames_total, 0);
    }

    #[test]
    fn test_open_ended_range_uses_clip_length() {
        let mut h = Harness::encode(90, -1, EncodingPlan::fixed(4, 8));
        h.start();
        assert_eq!(h.job.properties().frames_total, 10);
    }

    #[test]
    fn test_shell_job_runs_to_completion() {
        let mut h = Harness::new(JobProperties::shell("echo hi"), EncodingPlan::fixed(1, 1));
        h.start();
        let fake = h.fake.as_ref().unwrap();
        assert!(!fake.spec.pipe_stdin);
        assert_eq!(fake.spec.args.last().map(String::as_str), Some("echo hi"));
        assert_eq!(h.job.encoding_state(), EncodingState::Finishing);

        h.signal(SignalKind::ProcessLog("hi".into()));
        h.exit(Some(0));
        assert_eq!(h.job.state(), JobState::Completed);
    }

    #[test]
    fn test_process_job_failure() {
        let mut h = Harness::new(
            JobProperties::process("tool", "--input {sn}.txt"),
            EncodingPlan::fixed(1, 1),
        );
        h.start();
        assert_eq!(h.fake.as_ref().unwrap().spec.args, vec!["--input", ".txt"]);
        h.exit(Some(2));
        assert_eq!(h.job.state(), JobState::Failed);
        assert_eq!(
            h.job.properties().error_reason.as_deref(),
            Some("Process failed with exit code 2")
        );
    }

    #[test]
    fn test_empty_shell_command_fails() {
        let mut h = Harness::new(JobProperties::shell("  "), EncodingPlan::fixed(1, 1));
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut h = Harness::encode(0, 9, EncodingPlan::fixed(4, 8));
        h.start();
        assert!(h.job.reset().is_err());
        h.deliver(0);
        h.complete_writes();
        h.exit(Some(1));
        assert_eq!(h.job.state(), JobState::Failed);

        h.job.reset().unwrap();
        assert_eq!(h.job.state(), JobState::Waiting);
        assert_eq!(h.job.properties().frames_processed, 0);
        assert!(h.job.properties().error_reason.is_none());
    }

    #[test]
    fn test_partial_output_deleted_by_policy() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("partial.mkv");
        std::fs::write(&out, b"partial").unwrap();

        let mut plan = EncodingPlan::fixed(4, 8);
        plan.partial_output = PartialOutputPolicy::Delete;
        let mut props = JobProperties::encode("clip.vpy", "clip", "enc", "-o {o}");
        props.output_path = Some(out.clone());
        props.last_frame = 9;

        let mut h = Harness::new(props.clone(), plan.clone());
        h.start();
        h.job.abort();
        assert!(out.exists());
        h.exit(None);
        assert!(!out.exists());

        // a job that never launched its encoder leaves the path alone
        std::fs::write(&out, b"unrelated").unwrap();
        let mut h = Harness::new(props, plan);
        h.launcher.mark_missing("enc");
        h.job.start().unwrap();
        assert_eq!(h.job.state(), JobState::Failed);
        assert!(out.exists());
    }

    #[test]
    fn test_partial_output_kept_by_default() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("partial.mkv");
        std::fs::write(&out, b"partial").unwrap();
        let mut props = JobProperties::encode("clip.vpy", "clip", "enc", "-");
        props.output_path = Some(out.clone());
        props.last_frame = 9;

        let mut h = Harness::new(props, EncodingPlan::fixed(4, 8));
        h.start();
        h.exit(Some(1));
        assert_eq!(h.job.state(), JobState::Failed);
        assert!(out.exists());
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(0, -1, 10).unwrap(), Some((0, 9)));
        assert_eq!(resolve_range(3, 5, 10).unwrap(), Some((3, 5)));
        assert_eq!(resolve_range(0, -1, 0).unwrap(), None);
        assert_eq!(resolve_range(6, 5, 10).unwrap(), None);
        assert!(resolve_range(0, 10, 10).is_err());
    }

    fn permutation(len: u64) -> impl Strategy<Value = Vec<u64>> {
        Just((0..len).collect::<Vec<u64>>()).prop_shuffle()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_any_completion_order_writes_in_frame_order(
            order in (1u64..24).prop_flat_map(permutation),
            ack_every in 1usize..4,
        ) {
            let len = order.len() as u64;
            let mut h = Harness::encode(0, len as i64 - 1, EncodingPlan::fixed(len as usize, len as usize));
            h.start();

            let mut stream = Vec::new();
            let mut last_processed = 0;
            for (i, n) in order.iter().enumerate() {
                h.deliver(*n);
                prop_assert!(h.job.cached_frames() <= len as usize);
                if i % ack_every == 0 {
                    stream.extend(h.complete_writes().concat());
                }
                let processed = h.job.properties().frames_processed;
                prop_assert!(processed >= last_processed);
                prop_assert!(processed <= h.job.properties().frames_total);
                last_processed = processed;
            }
            stream.extend(h.complete_writes().concat());

            let expected: Vec<u64> = (0..len).collect();
            prop_assert_eq!(stream, frame_bytes(&expected));
            prop_assert_eq!(h.job.encoding_state(), EncodingState::Finishing);
            h.exit(Some(0));
            prop_assert_eq!(h.job.state(), JobState::Completed);
        }

        #[test]
        fn prop_cache_stays_within_limit(
            threads in 1usize..6,
            extra in 0usize..6,
            seed in prop::collection::vec(0u8..8, 1..40),
        ) {
            let plan = EncodingPlan::fixed(threads, threads + extra);
            let limit = plan.cached_frames_limit;
            let mut h = Harness::encode(0, 39, plan);
            h.start();

            // deliver requested frames in a scrambled order, acking now and then
            for step in seed {
                let requested = h.requested();
                let pending: Vec<u64> = requested
                    .into_iter()
                    .filter(|n| *n >= h.job.properties().frames_processed)
                    .collect();
                if let Some(n) = pending.iter().rev().nth(step as usize % pending.len().max(1)) {
                    h.deliver(*n);
                }
                prop_assert!(h.job.cached_frames() <= limit);
                if step % 3 == 0 {
                    h.complete_writes();
                }
            }
        }
    }
}

//! Job data model shared by the engine, the persistence layer and the wire protocol.
//!
//! [`JobProperties`] is the flat, serializable snapshot of a job. It is what gets
//! written to the settings store and what watchers receive; a [`crate::job::Job`]
//! can always be rebuilt from it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Pipe frames computed from a script into an encoder's stdin.
    #[default]
    EncodeScriptCli,
    /// Run an executable and wait for it to exit.
    RunProcess,
    /// Run a command line through the platform shell.
    RunShellCommand,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::EncodeScriptCli => write!(f, "encode_script_cli"),
            JobType::RunProcess => write!(f, "run_process"),
            JobType::RunShellCommand => write!(f, "run_shell_command"),
        }
    }
}

/// Outer lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, eligible to start once its dependencies complete.
    #[default]
    Waiting,
    /// An upstream job failed or was aborted.
    DependencyNotMet,
    /// Actively executing.
    Running,
    /// Draining in-flight frames before pausing.
    Pausing,
    /// Encoder idle, waiting to be resumed.
    Paused,
    /// Tearing down after an abort request.
    Aborting,
    /// Aborted by request.
    Aborted,
    /// Finished with an error.
    Failed,
    /// Failed; waiting for the subprocess to go away.
    FailedCleanUp,
    /// Succeeded; releasing resources.
    CompletedCleanUp,
    /// Finished successfully.
    Completed,
}

impl JobState {
    /// Convert state to its wire/log name
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::DependencyNotMet => "dependency_not_met",
            JobState::Running => "running",
            JobState::Pausing => "pausing",
            JobState::Paused => "paused",
            JobState::Aborting => "aborting",
            JobState::Aborted => "aborted",
            JobState::Failed => "failed",
            JobState::FailedCleanUp => "failed_clean_up",
            JobState::CompletedCleanUp => "completed_clean_up",
            JobState::Completed => "completed",
        }
    }

    /// States in which the job occupies the single execution slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Running
                | JobState::Pausing
                | JobState::Aborting
                | JobState::FailedCleanUp
                | JobState::CompletedCleanUp
        )
    }

    /// Final states; only `reset` leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }

    /// States that are on their way to another state without outside input.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            JobState::Pausing
                | JobState::Aborting
                | JobState::FailedCleanUp
                | JobState::CompletedCleanUp
        )
    }

    /// Whether the job's settings may be changed in this state.
    pub fn is_modifiable(&self) -> bool {
        !matches!(
            self,
            JobState::Running | JobState::Pausing | JobState::Aborting
        )
    }

    /// Whether a dependent job can no longer expect this job to complete.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            JobState::Failed
                | JobState::FailedCleanUp
                | JobState::Aborted
                | JobState::Aborting
                | JobState::DependencyNotMet
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inner state of the encode pipeline; meaningful only while the job is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncodingState {
    #[default]
    Idle,
    CheckingEncoderSanity,
    StartingEncoder,
    WritingHeader,
    WaitingForFrames,
    WritingFrame,
    EncoderCrashed,
    Finishing,
    Aborting,
}

impl EncodingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingState::Idle => "idle",
            EncodingState::CheckingEncoderSanity => "checking_encoder_sanity",
            EncodingState::StartingEncoder => "starting_encoder",
            EncodingState::WritingHeader => "writing_header",
            EncodingState::WaitingForFrames => "waiting_for_frames",
            EncodingState::WritingFrame => "writing_frame",
            EncodingState::EncoderCrashed => "encoder_crashed",
            EncodingState::Finishing => "finishing",
            EncodingState::Aborting => "aborting",
        }
    }
}

impl std::fmt::Display for EncodingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container header written in front of the raw frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncodingHeaderType {
    #[default]
    #[serde(rename = "none")]
    NoHeader,
    Y4m,
}

/// Aggregate state of a job's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependenciesState {
    /// Every dependency completed.
    Complete,
    /// At least one dependency is still pending.
    Incomplete,
    /// At least one dependency can no longer complete.
    Failed,
}

/// Flat snapshot of every job field, used for persistence and wire transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobProperties {
    /// Unique job identifier; nil means "assign one on creation".
    pub id: Uuid,
    pub job_type: JobType,
    pub job_state: JobState,
    pub encoding_state: EncodingState,
    pub script_name: String,
    pub script_text: String,
    pub encoding_header_type: EncodingHeaderType,
    pub executable_path: String,
    /// Argument template; see [`crate::encode::variables`].
    pub arguments: String,
    pub shell_command: String,
    /// Encoder output, if the job declares one.
    pub output_path: Option<PathBuf>,
    pub depends_on_job_ids: Vec<Uuid>,
    pub first_frame: u64,
    /// Last frame to encode, inclusive; negative means the clip's last frame.
    pub last_frame: i64,
    pub frames_total: u64,
    pub frames_processed: u64,
    pub frames_in_queue: usize,
    pub frames_in_process: usize,
    pub max_threads: usize,
    pub fps: f64,
    pub seconds_to_finish: Option<f64>,
    pub error_reason: Option<String>,
}

impl Default for JobProperties {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            job_type: JobType::EncodeScriptCli,
            job_state: JobState::Waiting,
            encoding_state: EncodingState::Idle,
            script_name: String::new(),
            script_text: String::new(),
            encoding_header_type: EncodingHeaderType::NoHeader,
            executable_path: String::new(),
            arguments: String::new(),
            shell_command: String::new(),
            output_path: None,
            depends_on_job_ids: Vec::new(),
            first_frame: 0,
            last_frame: -1,
            frames_total: 0,
            frames_processed: 0,
            frames_in_queue: 0,
            frames_in_process: 0,
            max_threads: 0,
            fps: 0.0,
            seconds_to_finish: None,
            error_reason: None,
        }
    }
}

impl JobProperties {
    /// Encode job for the given script and encoder command.
    pub fn encode(
        script_name: impl Into<String>,
        script_text: impl Into<String>,
        executable_path: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            job_type: JobType::EncodeScriptCli,
            script_name: script_name.into(),
            script_text: script_text.into(),
            executable_path: executable_path.into(),
            arguments: arguments.into(),
            ..Self::default()
        }
    }

    /// Job that runs an executable with the given argument string.
    pub fn process(executable_path: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            job_type: JobType::RunProcess,
            executable_path: executable_path.into(),
            arguments: arguments.into(),
            ..Self::default()
        }
    }

    /// Job that runs a shell command line.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            job_type: JobType::RunShellCommand,
            shell_command: command.into(),
            ..Self::default()
        }
    }

    /// Builder-style dependency list.
    pub fn depending_on(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.depends_on_job_ids = ids.into_iter().collect();
        self
    }

    /// Frames in the configured range, if the range is already concrete.
    pub fn configured_frames_total(&self) -> Option<u64> {
        if self.last_frame < 0 {
            return None;
        }
        Some(frames_in_range(self.first_frame, self.last_frame as u64))
    }

    /// Fold states that cannot survive a restart into their resting equivalents.
    ///
    /// A job whose subprocess died with the previous server instance cannot be
    /// resumed, so it comes back as aborted and needs a manual reset.
    pub fn normalized_for_load(mut self) -> Self {
        self.job_state = match self.job_state {
            JobState::Running | JobState::Pausing | JobState::Paused | JobState::Aborting => {
                JobState::Aborted
            }
            JobState::FailedCleanUp => JobState::Failed,
            JobState::CompletedCleanUp => JobState::Completed,
            other => other,
        };
        self.encoding_state = EncodingState::Idle;
        self.frames_in_queue = 0;
        self.frames_in_process = 0;
        self
    }
}

/// Number of frames in the inclusive range `first..=last`; zero when `last < first`.
pub fn frames_in_range(first: u64, last: u64) -> u64 {
    if last < first {
        0
    } else {
        last - first + 1
    }
}

/// Reusable encoder settings saved by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EncodingPreset {
    pub name: String,
    pub encoding_header_type: EncodingHeaderType,
    pub executable_path: String,
    pub arguments: String,
}

//! JSON envelopes exchanged with watchers over the control socket.
//!
//! Requests carry a `command` tag; replies and broadcast events carry a
//! `message` tag, so a client can tell them apart with one untagged enum
//! ([`ServerMessage`]).

use crate::events::ServerEvent;
use crate::jobs::{EncodingPreset, JobProperties};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Port the control server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 1984;

/// Name under which the control server identifies itself.
pub const SERVICE_NAME: &str = "framejob";

/// Liveness query answered with [`PONG`], sent as a plain text frame.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ClientRequest {
    GetJobsInfo,
    Subscribe,
    Unsubscribe,
    CreateJob { job: JobProperties },
    ChangeJob { job: JobProperties },
    SwapJobs { first: Uuid, second: Uuid },
    DeleteJobs { ids: Vec<Uuid> },
    StartWaitingJobs,
    PauseActiveJobs,
    ResumePausedJobs,
    AbortActiveJobs,
    ResetJobs { ids: Vec<Uuid> },
    GetPresets,
    SavePreset { preset: EncodingPreset },
    DeletePreset { name: String },
    ShowWindow,
    CloseServer,
}

impl ClientRequest {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::GetJobsInfo => "get-jobs-info",
            ClientRequest::Subscribe => "subscribe",
            ClientRequest::Unsubscribe => "unsubscribe",
            ClientRequest::CreateJob { .. } => "create-job",
            ClientRequest::ChangeJob { .. } => "change-job",
            ClientRequest::SwapJobs { .. } => "swap-jobs",
            ClientRequest::DeleteJobs { .. } => "delete-jobs",
            ClientRequest::StartWaitingJobs => "start-waiting-jobs",
            ClientRequest::PauseActiveJobs => "pause-active-jobs",
            ClientRequest::ResumePausedJobs => "resume-paused-jobs",
            ClientRequest::AbortActiveJobs => "abort-active-jobs",
            ClientRequest::ResetJobs { .. } => "reset-jobs",
            ClientRequest::GetPresets => "get-presets",
            ClientRequest::SavePreset { .. } => "save-preset",
            ClientRequest::DeletePreset { .. } => "delete-preset",
            ClientRequest::ShowWindow => "show-window",
            ClientRequest::CloseServer => "close-server",
        }
    }
}

/// Direct answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "kebab-case")]
pub enum ServerReply {
    JobsInfo { jobs: Vec<JobProperties> },
    Created { job: JobProperties },
    Ok { command: String },
    Presets { presets: Vec<EncodingPreset> },
    Error { reason: String },
}

impl ServerReply {
    pub fn ok(request: &ClientRequest) -> Self {
        ServerReply::Ok {
            command: request.name().to_string(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ServerReply::Error {
            reason: reason.into(),
        }
    }
}

/// Anything a client may receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Reply(ServerReply),
    Event(ServerEvent),
}

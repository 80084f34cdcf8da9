//! framejob server
//!
//! Background service that keeps a persistent queue of encode and process
//! jobs, runs them one at a time, and exposes the queue to watchers over a
//! WebSocket control port.

pub mod concurrency;
pub mod control_client;
pub mod control_server;
pub mod daemon;
pub mod encode;
pub mod engine;
pub mod events;
pub mod frames;
pub mod header;
pub mod instance_lock;
pub mod job;
pub mod jobs;
pub mod jobs_manager;
pub mod protocol;
pub mod signal;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use concurrency::{derive_plan, EncodingPlan};
pub use control_client::{server_url, ClientError, ControlClient};
pub use control_server::{ControlServer, ServerError};
pub use daemon::{Collaborators, Daemon, DaemonError};
pub use engine::{Engine, EngineError, EngineHandle};
pub use events::{EventBus, LogLevel, ServerEvent};
pub use framejob_config as config;
pub use framejob_config::Config;
pub use instance_lock::{InstanceError, SingleInstanceGuard};
pub use job::{Job, JobEnvironment, JobError};
pub use jobs::{
    DependenciesState, EncodingHeaderType, EncodingPreset, EncodingState, JobProperties, JobState,
    JobType,
};
pub use jobs_manager::{JobsManager, ManagerError};
pub use protocol::{ClientRequest, ServerMessage, ServerReply, DEFAULT_PORT, SERVICE_NAME};
pub use store::{JsonFileStore, SettingsStore, StoreError};

//! The engine task: sole owner of the [`JobsManager`].
//!
//! Everything that mutates jobs runs here, one input at a time. Remote commands
//! arrive as [`EngineCommand`]s with a oneshot reply, asynchronous job results
//! as [`JobSignal`]s. After every input the manager's events are published on
//! the [`EventBus`] and a dirty job list is saved.

use crate::events::{EventBus, ServerEvent};
use crate::jobs::{EncodingPreset, JobProperties};
use crate::jobs_manager::{JobsManager, ManagerError};
use crate::signal::JobSignal;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Commands that may be queued before the engine applies back-pressure.
const COMMAND_QUEUE: usize = 64;

/// Extra time allowed after the abort grace period for kills to be reported.
const SHUTDOWN_SLACK: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine has stopped")]
    Stopped,

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

pub enum EngineCommand {
    JobsInfo {
        reply: oneshot::Sender<Vec<JobProperties>>,
    },
    CreateJob {
        job: JobProperties,
        reply: Reply<JobProperties>,
    },
    ChangeJob {
        job: JobProperties,
        reply: Reply<()>,
    },
    SwapJobs {
        first: Uuid,
        second: Uuid,
        reply: Reply<()>,
    },
    DeleteJobs {
        ids: Vec<Uuid>,
        reply: Reply<()>,
    },
    ResetJobs {
        ids: Vec<Uuid>,
        reply: Reply<()>,
    },
    StartWaitingJobs {
        reply: oneshot::Sender<()>,
    },
    PauseActiveJobs {
        reply: oneshot::Sender<()>,
    },
    ResumePausedJobs {
        reply: oneshot::Sender<()>,
    },
    AbortActiveJobs {
        reply: oneshot::Sender<()>,
    },
    Presets {
        reply: oneshot::Sender<Vec<EncodingPreset>>,
    },
    SavePreset {
        preset: EncodingPreset,
        reply: Reply<()>,
    },
    DeletePreset {
        name: String,
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable async facade over the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    bus: EventBus,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn jobs_info(&self) -> Result<Vec<JobProperties>, EngineError> {
        self.request(|reply| EngineCommand::JobsInfo { reply }).await
    }

    pub async fn create_job(&self, job: JobProperties) -> Result<JobProperties, EngineError> {
        Ok(self
            .request(|reply| EngineCommand::CreateJob { job, reply })
            .await??)
    }

    pub async fn change_job(&self, job: JobProperties) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineCommand::ChangeJob { job, reply })
            .await??)
    }

    pub async fn swap_jobs(&self, first: Uuid, second: Uuid) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineCommand::SwapJobs {
                first,
                second,
                reply,
            })
            .await??)
    }

    pub async fn delete_jobs(&self, ids: Vec<Uuid>) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineCommand::DeleteJobs { ids, reply })
            .await??)
    }

    pub async fn reset_jobs(&self, ids: Vec<Uuid>) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineCommand::ResetJobs { ids, reply })
            .await??)
    }

    pub async fn start_waiting_jobs(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::StartWaitingJobs { reply })
            .await
    }

    pub async fn pause_active_jobs(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::PauseActiveJobs { reply })
            .await
    }

    pub async fn resume_paused_jobs(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::ResumePausedJobs { reply })
            .await
    }

    pub async fn abort_active_jobs(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::AbortActiveJobs { reply })
            .await
    }

    pub async fn presets(&self) -> Result<Vec<EncodingPreset>, EngineError> {
        self.request(|reply| EngineCommand::Presets { reply }).await
    }

    pub async fn save_preset(&self, preset: EncodingPreset) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineCommand::SavePreset { preset, reply })
            .await??)
    }

    pub async fn delete_preset(&self, name: String) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| EngineCommand::DeletePreset { name, reply })
            .await??)
    }

    /// Abort running work, save and stop the engine. Resolves once it has.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.bus.subscribe()
    }

    /// Publish an event that does not originate from a job.
    pub fn publish(&self, event: ServerEvent) {
        self.bus.publish(event);
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

pub struct Engine {
    manager: JobsManager,
    commands: mpsc::Receiver<EngineCommand>,
    signals: mpsc::UnboundedReceiver<JobSignal>,
    bus: EventBus,
    abort_timeout: Duration,
}

impl Engine {
    /// Wrap a manager; `signals` must be the receiver of the manager's signal channel.
    pub fn new(
        manager: JobsManager,
        signals: mpsc::UnboundedReceiver<JobSignal>,
        bus: EventBus,
        abort_timeout: Duration,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = EngineHandle {
            commands: tx,
            bus: bus.clone(),
        };
        let engine = Self {
            manager,
            commands: rx,
            signals,
            bus,
            abort_timeout,
        };
        (engine, handle)
    }

    /// Run until shutdown is requested or every handle is dropped.
    pub async fn run(mut self) {
        info!(jobs = self.manager.len(), "Engine started");
        loop {
            tokio::select! {
                Some(signal) = self.signals.recv() => {
                    self.manager.handle_signal(signal);
                }
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.apply(command),
                    None => {
                        debug!("All engine handles dropped");
                        self.shutdown().await;
                        return;
                    }
                },
            }
            self.finish_step();
        }
    }

    fn apply(&mut self, command: EngineCommand) {
        let m = &mut self.manager;
        // a dropped reply receiver only means the caller went away
        match command {
            EngineCommand::JobsInfo { reply } => {
                let _ = reply.send(m.jobs_info());
            }
            EngineCommand::CreateJob { job, reply } => {
                let _ = reply.send(m.create_job(job));
            }
            EngineCommand::ChangeJob { job, reply } => {
                let _ = reply.send(m.change_job(job));
            }
            EngineCommand::SwapJobs {
                first,
                second,
                reply,
            } => {
                let _ = reply.send(m.swap_jobs(first, second));
            }
            EngineCommand::DeleteJobs { ids, reply } => {
                let _ = reply.send(m.delete_jobs(&ids));
            }
            EngineCommand::ResetJobs { ids, reply } => {
                let _ = reply.send(m.reset_jobs(&ids));
            }
            EngineCommand::StartWaitingJobs { reply } => {
                m.start_waiting_jobs();
                let _ = reply.send(());
            }
            EngineCommand::PauseActiveJobs { reply } => {
                m.pause_active_jobs();
                let _ = reply.send(());
            }
            EngineCommand::ResumePausedJobs { reply } => {
                m.resume_paused_jobs();
                let _ = reply.send(());
            }
            EngineCommand::AbortActiveJobs { reply } => {
                m.abort_active_jobs();
                let _ = reply.send(());
            }
            EngineCommand::Presets { reply } => {
                let _ = reply.send(m.presets().to_vec());
            }
            EngineCommand::SavePreset { preset, reply } => {
                let _ = reply.send(m.save_preset(preset));
            }
            EngineCommand::DeletePreset { name, reply } => {
                let _ = reply.send(m.delete_preset(&name));
            }
            EngineCommand::Shutdown { reply } => {
                // handled by the loop
                let _ = reply.send(());
            }
        }
    }

    fn finish_step(&mut self) {
        for event in self.manager.take_events() {
            self.bus.publish(event);
        }
        if self.manager.is_dirty() {
            if let Err(e) = self.manager.save_jobs() {
                error!(error = %e, "Failed to save jobs");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Engine shutting down");
        self.manager.abort_active_jobs();
        self.finish_step();

        let deadline = Instant::now() + self.abort_timeout + SHUTDOWN_SLACK;
        while self.manager.has_active_job() {
            match tokio::time::timeout_at(deadline, self.signals.recv()).await {
                Ok(Some(signal)) => {
                    self.manager.handle_signal(signal);
                    self.finish_step();
                }
                Ok(None) | Err(_) => {
                    warn!("Jobs still active at shutdown");
                    break;
                }
            }
        }

        if let Err(e) = self.manager.save_jobs() {
            error!(error = %e, "Failed to save jobs");
        }
        self.bus.publish(ServerEvent::ServerClosing);
        info!("Engine stopped");
    }
}

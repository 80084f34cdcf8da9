//! Daemon startup and lifetime for the framejob server
//!
//! Wires the collaborators together: instance lock, control port, frame
//! producer, process launcher, settings store, engine task and control server.

use crate::concurrency::{derive_plan, EncodingPlan};
use crate::config::{Config, ConfigError};
use crate::control_server::{ControlServer, ServerError};
use crate::encode::{ProcessLauncher, SystemLauncher};
use crate::engine::{Engine, EngineError, EngineHandle};
use crate::events::EventBus;
use crate::frames::{BlankClipFactory, FrameProducerFactory, ProducerError};
use crate::instance_lock::{InstanceError, SingleInstanceGuard};
use crate::job::JobEnvironment;
use crate::jobs_manager::{JobsManager, ManagerError};
use crate::signal::signal_channel;
use crate::store::{JsonFileStore, SettingsStore};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid control server address
    #[error("Invalid server address '{0}'")]
    Address(String),

    /// Frame producer could not be configured
    #[error("Frame producer error: {0}")]
    Producer(#[from] ProducerError),

    /// Another server holds the instance lock
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Control server error
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Loading persisted state failed
    #[error("Failed to load state: {0}")]
    Manager(#[from] ManagerError),
}

/// Replaceable collaborators of the engine.
pub struct Collaborators {
    pub producers: Arc<dyn FrameProducerFactory>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub store: Arc<dyn SettingsStore>,
}

impl Collaborators {
    /// Blank-clip producer, system processes and JSON files in the state dir.
    pub fn from_config(config: &Config, plan: &EncodingPlan) -> Result<Self, DaemonError> {
        Ok(Self {
            producers: Arc::new(BlankClipFactory::from_config(
                &config.producer,
                plan.max_threads,
            )?),
            launcher: Arc::new(SystemLauncher),
            store: Arc::new(JsonFileStore::new(&config.storage.state_dir)),
        })
    }
}

/// A started server: the engine is running, the port is bound.
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived pipeline limits
    pub plan: EncodingPlan,
    engine: EngineHandle,
    engine_task: JoinHandle<()>,
    server: ControlServer,
    listener: TcpListener,
    _guard: Option<SingleInstanceGuard>,
}

impl Daemon {
    /// Full startup sequence:
    /// 1. Acquire the single-instance lock
    /// 2. Bind the control port
    /// 3. Build the collaborators and load persisted jobs and presets
    /// 4. Spawn the engine task
    pub async fn start(config: Config) -> Result<Self, DaemonError> {
        let guard = SingleInstanceGuard::acquire(config.lock_file())?;
        let plan = derive_plan(&config);
        let collaborators = Collaborators::from_config(&config, &plan)?;
        Self::start_with(config, collaborators, Some(guard)).await
    }

    /// Startup with explicit collaborators; the caller owns instance locking.
    pub async fn start_with(
        config: Config,
        collaborators: Collaborators,
        guard: Option<SingleInstanceGuard>,
    ) -> Result<Self, DaemonError> {
        let addr = bind_address(&config)?;
        let listener = ControlServer::bind(addr).await?;
        let plan = derive_plan(&config);
        info!(
            max_threads = plan.max_threads,
            cached_frames_limit = plan.cached_frames_limit,
            state_dir = %config.storage.state_dir.display(),
            "Starting framejob server"
        );

        let (signals_tx, signals_rx) = signal_channel();
        let env = JobEnvironment::new(
            collaborators.producers,
            collaborators.launcher,
            signals_tx,
            plan.clone(),
        );
        let mut manager = JobsManager::new(env, collaborators.store);
        manager.load_jobs()?;
        manager.load_presets()?;

        let (engine, handle) =
            Engine::new(manager, signals_rx, EventBus::default(), plan.abort_timeout);
        let engine_task = tokio::spawn(engine.run());
        let server = ControlServer::new(handle.clone());

        Ok(Self {
            config,
            plan,
            engine: handle,
            engine_task,
            server,
            listener,
            _guard: guard,
        })
    }

    pub fn engine(&self) -> EngineHandle {
        self.engine.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DaemonError> {
        Ok(self.listener.local_addr().map_err(ServerError::Io)?)
    }

    /// Serve until a client sends `close-server` or `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), DaemonError> {
        let close = self.server.close_requested();
        let stop = self.server.stop_token();
        let server_task = tokio::spawn(self.server.serve(self.listener));

        tokio::select! {
            _ = close.cancelled() => info!("Close requested by a client"),
            _ = shutdown => info!("Shutdown signal received"),
        }

        match self.engine.shutdown().await {
            Ok(()) | Err(EngineError::Stopped) => {}
            Err(e) => warn!(error = %e, "Engine shutdown failed"),
        }
        if let Err(e) = self.engine_task.await {
            warn!(error = %e, "Engine task ended abnormally");
        }

        stop.cancel();
        match server_task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Server task ended abnormally"),
        }
        info!("framejob server stopped");
        Ok(())
    }
}

fn bind_address(config: &Config) -> Result<SocketAddr, DaemonError> {
    let text = format!("{}:{}", config.server.host, config.server.port);
    text.parse().map_err(|_| DaemonError::Address(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_client::{server_url, ControlClient};
    use crate::events::ServerEvent;
    use crate::jobs::{EncodingHeaderType, JobProperties, JobState};
    use crate::protocol::{ClientRequest, ServerReply};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn create_test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.port = 0;
        config.storage.state_dir = dir.path().join("state");
        config.encoding.max_threads = 2;
        config.encoding.abort_timeout_ms = 200;
        config.producer.width = 4;
        config.producer.height = 2;
        config.producer.subsampling = "gray".to_string();
        config.producer.num_frames = 5;
        config
    }

    #[test]
    fn test_bind_address() {
        let mut config = Config::default();
        config.server.port = 1234;
        assert_eq!(
            bind_address(&config).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 1234))
        );
        config.server.host = "not a host".to_string();
        assert!(matches!(
            bind_address(&config),
            Err(DaemonError::Address(_))
        ));
    }

    #[tokio::test]
    async fn test_second_instance_is_refused() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let first = Daemon::start(config.clone()).await.unwrap();
        assert_eq!(first.plan.max_threads, 2);

        let second = Daemon::start(config).await;
        assert!(matches!(
            second,
            Err(DaemonError::Instance(InstanceError::AlreadyRunning { .. }))
        ));
    }

    #[tokio::test]
    async fn test_invalid_producer_config_fails_startup() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.producer.subsampling = "411".to_string();
        assert!(matches!(
            Daemon::start(config).await,
            Err(DaemonError::Producer(_))
        ));
    }

    async fn wait_for_state(client: &mut ControlClient, id: Uuid, wanted: JobState) {
        let wait = async {
            loop {
                if let ServerEvent::JobStateChanged { id: got, state, .. } =
                    client.next_event().await.unwrap()
                {
                    if got == id && state == wanted {
                        return;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("job did not reach the expected state");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encode_end_to_end() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let daemon = Daemon::start(config.clone()).await.unwrap();
        let url = server_url("127.0.0.1", daemon.local_addr().unwrap().port());
        let run = tokio::spawn(daemon.run(std::future::pending()));

        let mut client = ControlClient::connect(&url).await.unwrap();
        client.request(&ClientRequest::Subscribe).await.unwrap();

        let output = dir.path().join("out.y4m");
        let mut job = JobProperties::encode("blank.vpy", "blank", "sh", "-c \"cat > {o}\"");
        job.encoding_header_type = EncodingHeaderType::Y4m;
        job.output_path = Some(output.clone());
        let ServerReply::Created { job } = client
            .request(&ClientRequest::CreateJob { job })
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        client
            .request(&ClientRequest::StartWaitingJobs)
            .await
            .unwrap();
        wait_for_state(&mut client, job.id, JobState::Completed).await;

        let bytes = std::fs::read(&output).unwrap();
        let header = b"YUV4MPEG2 W4 H2 F24:1 Ip A0:0 Cmono\n";
        assert!(bytes.starts_with(header));
        assert_eq!(bytes.len(), header.len() + 5 * (b"FRAME\n".len() + 8));

        let reply = client.request(&ClientRequest::CloseServer).await.unwrap();
        assert!(matches!(reply, ServerReply::Ok { .. }));
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let saved: Vec<JobProperties> =
            serde_json::from_str(&std::fs::read_to_string(config.jobs_file()).unwrap()).unwrap();
        assert_eq!(saved[0].job_state, JobState::Completed);
        assert_eq!(saved[0].frames_processed, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_aborts_running_job() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let daemon = Daemon::start(config.clone()).await.unwrap();
        let url = server_url("127.0.0.1", daemon.local_addr().unwrap().port());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(daemon.run(async {
            let _ = stop_rx.await;
        }));

        let mut client = ControlClient::connect(&url).await.unwrap();
        client.request(&ClientRequest::Subscribe).await.unwrap();
        let ServerReply::Created { job } = client
            .request(&ClientRequest::CreateJob {
                job: JobProperties::shell("sleep 30"),
            })
            .await
            .unwrap()
        else {
            panic!("expected created");
        };
        client
            .request(&ClientRequest::StartWaitingJobs)
            .await
            .unwrap();
        wait_for_state(&mut client, job.id, JobState::Running).await;

        stop_tx.send(()).unwrap();
        wait_for_state(&mut client, job.id, JobState::Aborted).await;
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let saved: Vec<JobProperties> =
            serde_json::from_str(&std::fs::read_to_string(config.jobs_file()).unwrap()).unwrap();
        assert_eq!(saved[0].job_state, JobState::Aborted);
    }
}

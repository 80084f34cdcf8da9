//! Managed child processes for encoders and external commands.
//!
//! A [`ManagedProcess`] is a handle to a spawned child whose I/O is driven by
//! background tasks. Completed stdin writes, stderr lines and the exit status
//! all come back as signals through the job's [`SignalSink`].

use crate::encode::sanity::{resolve_executable, SanityError};
use crate::signal::{ProcessExit, SignalKind, SignalSink};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Error type for launching processes
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to start the process
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Open a pipe to the child's stdin for frame data.
    pub pipe_stdin: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            pipe_stdin: false,
        }
    }

    pub fn with_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }

    /// Run `command` through the platform shell.
    #[cfg(not(windows))]
    pub fn shell(command: &str) -> Self {
        Self::new("sh", vec!["-c".to_string(), command.to_string()])
    }

    /// Run `command` through the platform shell.
    #[cfg(windows)]
    pub fn shell(command: &str) -> Self {
        Self::new("cmd", vec!["/C".to_string(), command.to_string()])
    }

    pub fn display_command(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Handle to a running child process.
///
/// Dropping the handle kills the child without a grace period.
#[derive(Debug)]
pub struct ManagedProcess {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    terminate: Option<oneshot::Sender<Duration>>,
}

impl ManagedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue `bytes` for the child's stdin. Completion is signalled with
    /// `BytesWritten`. Returns false if stdin is already closed.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        match &self.stdin {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Close stdin once all queued bytes are written, signalling end of stream.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Close stdin, give the child `grace` to exit on its own, then kill it.
    pub fn terminate(&mut self, grace: Duration) {
        self.close_stdin();
        if let Some(tx) = self.terminate.take() {
            let _ = tx.send(grace);
        }
    }
}

/// Starts processes on behalf of jobs.
pub trait ProcessLauncher: Send + Sync {
    /// Locate an executable before anything is launched.
    fn resolve(&self, program: &str) -> Result<PathBuf, SanityError>;

    fn launch(&self, spec: &ProcessSpec, sink: SignalSink) -> Result<ManagedProcess, ProcessError>;
}

/// Launcher backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn resolve(&self, program: &str) -> Result<PathBuf, SanityError> {
        resolve_executable(program)
    }

    fn launch(&self, spec: &ProcessSpec, sink: SignalSink) -> Result<ManagedProcess, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(job_id = %sink.job_id(), pid = ?pid, command = %spec.display_command(), "Process started");

        let stdin = child.stdin.take().map(|mut pipe| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let sink = sink.clone();
            tokio::spawn(async move {
                while let Some(buf) = rx.recv().await {
                    let len = buf.len();
                    let result = async {
                        pipe.write_all(&buf).await?;
                        pipe.flush().await
                    }
                    .await;
                    match result {
                        Ok(()) => sink.send(SignalKind::BytesWritten(len)),
                        Err(e) => {
                            sink.send(SignalKind::WriteFailed(e.to_string()));
                            break;
                        }
                    }
                }
                // dropping the pipe closes the child's stdin
            });
            tx
        });

        let stderr_task = child.stderr.take().map(|pipe| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => sink.send(SignalKind::ProcessLog(line)),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(job_id = %sink.job_id(), error = %e, "Failed to read process stderr");
                            break;
                        }
                    }
                }
            })
        });

        let (terminate_tx, terminate_rx) = oneshot::channel::<Duration>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                request = terminate_rx => {
                    let grace = request.unwrap_or(Duration::ZERO);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            debug!(job_id = %sink.job_id(), "Grace period over, killing process");
                            if let Err(e) = child.start_kill() {
                                warn!(job_id = %sink.job_id(), error = %e, "Failed to kill process");
                            }
                            child.wait().await
                        }
                    }
                }
            };

            // let trailing stderr lines arrive before the exit
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
            }

            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(job_id = %sink.job_id(), error = %e, "Failed to wait for process");
                    ProcessExit { code: None }
                }
            };
            sink.send(SignalKind::ProcessFinished(exit));
        });

        Ok(ManagedProcess {
            pid,
            stdin,
            terminate: Some(terminate_tx),
        })
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::signal::{signal_channel, JobSignal};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn next_kind(rx: &mut mpsc::UnboundedReceiver<JobSignal>) -> SignalKind {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("signal within timeout")
            .expect("channel open")
            .kind
    }

    #[tokio::test]
    async fn test_stdin_is_written_and_exit_reported() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.bin");
        let (tx, mut rx) = signal_channel();
        let sink = SignalSink::new(Uuid::new_v4(), 1, tx);

        let spec = ProcessSpec::shell(&format!("cat > '{}'", out.display())).with_stdin();
        let mut process = SystemLauncher.launch(&spec, sink).unwrap();
        assert!(process.pid().is_some());

        assert!(process.write(b"hello ".to_vec()));
        assert!(process.write(b"world".to_vec()));
        process.close_stdin();
        assert!(!process.write(b"late".to_vec()));

        let mut written = Vec::new();
        loop {
            match next_kind(&mut rx).await {
                SignalKind::BytesWritten(n) => written.push(n),
                SignalKind::ProcessFinished(exit) => {
                    assert!(exit.success());
                    break;
                }
                other => panic!("unexpected signal {:?}", other),
            }
        }
        assert_eq!(written, vec![6, 5]);
        assert_eq!(std::fs::read(&out).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_stderr_lines_and_exit_code() {
        let (tx, mut rx) = signal_channel();
        let sink = SignalSink::new(Uuid::new_v4(), 1, tx);

        let spec = ProcessSpec::shell("echo first >&2; echo second >&2; exit 3");
        let _process = SystemLauncher.launch(&spec, sink).unwrap();

        let mut lines = Vec::new();
        loop {
            match next_kind(&mut rx).await {
                SignalKind::ProcessLog(line) => lines.push(line),
                SignalKind::ProcessFinished(exit) => {
                    assert_eq!(exit.code, Some(3));
                    break;
                }
                other => panic!("unexpected signal {:?}", other),
            }
        }
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        let (tx, mut rx) = signal_channel();
        let sink = SignalSink::new(Uuid::new_v4(), 1, tx);

        let spec = ProcessSpec::shell("trap '' TERM; sleep 30");
        let mut process = SystemLauncher.launch(&spec, sink).unwrap();
        process.terminate(Duration::from_millis(50));

        match next_kind(&mut rx).await {
            SignalKind::ProcessFinished(exit) => assert!(!exit.success()),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_graceful_exit_within_grace() {
        let (tx, mut rx) = signal_channel();
        let sink = SignalSink::new(Uuid::new_v4(), 1, tx);

        // cat exits by itself once stdin closes
        let spec = ProcessSpec::new("cat", Vec::new()).with_stdin();
        let mut process = SystemLauncher.launch(&spec, sink).unwrap();
        process.terminate(Duration::from_secs(5));

        match next_kind(&mut rx).await {
            SignalKind::ProcessFinished(exit) => assert!(exit.success()),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = signal_channel();
        let sink = SignalSink::new(Uuid::new_v4(), 1, tx);
        let spec = ProcessSpec::new("/nonexistent/encoder", Vec::new());
        assert!(matches!(
            SystemLauncher.launch(&spec, sink),
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[test]
    fn test_display_command() {
        let spec = ProcessSpec::new("x264", vec!["--demuxer".into(), "y4m".into()]);
        assert_eq!(spec.display_command(), "x264 --demuxer y4m");
    }
}

//! One server per machine, enforced with an advisory lock file.
//!
//! The lock is held for as long as the [`SingleInstanceGuard`] lives; the
//! operating system releases it when the process exits, however it exits.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Another instance is already running (lock {path}{})", pid_suffix(.pid))]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("Lock file error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|p| format!(", pid {}", p)).unwrap_or_default()
}

#[derive(Debug)]
pub struct SingleInstanceGuard {
    _file: File,
    path: PathBuf,
}

impl SingleInstanceGuard {
    /// Take the exclusive lock at `path`, recording this process id in it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, InstanceError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| InstanceError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let pid = read_pid(&mut file);
                debug!(path = %path.display(), ?pid, "Lock held by another process");
                return Err(InstanceError::AlreadyRunning {
                    path: path.clone(),
                    pid,
                });
            }
            Err(TryLockError::Error(e)) => return Err(io_err(e)),
        }

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        info!(path = %path.display(), "Acquired single-instance lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

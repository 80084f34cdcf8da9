//! Settings store for the persisted job list and encoding presets.
//!
//! The store only loads and saves whole collections; the manager decides when.

use crate::jobs::{EncodingPreset, JobProperties};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing a settings file failed.
    #[error("Settings I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A settings file does not contain valid JSON for its collection.
    #[error("Malformed settings file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Serializing a collection failed.
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable persistence for jobs and presets.
pub trait SettingsStore: Send + Sync {
    fn load_jobs(&self) -> Result<Vec<JobProperties>, StoreError>;
    fn save_jobs(&self, jobs: &[JobProperties]) -> Result<(), StoreError>;
    fn load_presets(&self) -> Result<Vec<EncodingPreset>, StoreError>;
    fn save_presets(&self, presets: &[EncodingPreset]) -> Result<(), StoreError>;
}

/// JSON files `jobs.json` and `presets.json` inside a state directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.dir.join("jobs.json")
    }

    pub fn presets_path(&self) -> PathBuf {
        self.dir.join("presets.json")
    }
}

impl SettingsStore for JsonFileStore {
    fn load_jobs(&self) -> Result<Vec<JobProperties>, StoreError> {
        read_collection(&self.jobs_path())
    }

    fn save_jobs(&self, jobs: &[JobProperties]) -> Result<(), StoreError> {
        write_collection(&self.jobs_path(), jobs)
    }

    fn load_presets(&self) -> Result<Vec<EncodingPreset>, StoreError> {
        read_collection(&self.presets_path())
    }

    fn save_presets(&self, presets: &[EncodingPreset]) -> Result<(), StoreError> {
        write_collection(&self.presets_path(), presets)
    }
}

/// Read a JSON array; a missing file is an empty collection.
fn read_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a JSON array atomically.
///
/// The data goes to `<path>.tmp` first and is renamed over `path`, so a crash
/// mid-write never leaves a truncated file behind.
fn write_collection<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let json = serde_json::to_vec_pretty(items)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<Vec<JobProperties>>,
    presets: Mutex<Vec<EncodingPreset>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<JobProperties>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
            presets: Mutex::new(Vec::new()),
        }
    }

    /// Jobs as last saved.
    pub fn saved_jobs(&self) -> Vec<JobProperties> {
        lock(&self.jobs).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SettingsStore for MemoryStore {
    fn load_jobs(&self) -> Result<Vec<JobProperties>, StoreError> {
        Ok(lock(&self.jobs).clone())
    }

    fn save_jobs(&self, jobs: &[JobProperties]) -> Result<(), StoreError> {
        *lock(&self.jobs) = jobs.to_vec();
        Ok(())
    }

    fn load_presets(&self) -> Result<Vec<EncodingPreset>, StoreError> {
        Ok(lock(&self.presets).clone())
    }

    fn save_presets(&self, presets: &[EncodingPreset]) -> Result<(), StoreError> {
        *lock(&self.presets) = presets.to_vec();
        Ok(())
    }
}

use crate::runtime::retry::RetryPolicy;
use crate::runtime::lock;
use super::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Version tag written into checkpoint files.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Durable record of the offset up to which every sink is consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCheckpoint {
    pub offset: u64,
    /// Aggregate at `offset`, used to re-seed the reducer on restart.
    pub sum: i64,
    pub event_count: u64,
    pub committed_at_ms: u64,
}

impl OffsetCheckpoint {
    pub fn from_snapshot(snapshot: &Snapshot, committed_at_ms: u64) -> Self {
        Self {
            offset: snapshot.offset,
            sum: snapshot.sum,
            event_count: snapshot.event_count,
            committed_at_ms,
        }
    }
}

/// Failure reading the checkpoint at startup.
#[derive(Debug, Error)]
pub enum CheckpointLoadError {
    #[error("failed to read checkpoint {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("checkpoint {path} failed checksum verification")]
    ChecksumMismatch { path: PathBuf },
    #[error("checkpoint {path} uses unsupported format version {format}")]
    UnsupportedFormat { path: PathBuf, format: u32 },
}

/// Failure making a checkpoint durable.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write checkpoint {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("checkpoint store rejected write: {0}")]
    Rejected(String),
    #[error("checkpoint offset {attempted} would regress durable offset {durable}")]
    Regression { durable: u64, attempted: u64 },
    #[error("checkpoint persistence failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Storage for the single current checkpoint.
pub trait CheckpointStore: Send {
    fn load(&self) -> Result<Option<OffsetCheckpoint>, CheckpointLoadError>;
    fn persist(&mut self, checkpoint: &OffsetCheckpoint) -> Result<(), PersistError>;
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    format: u32,
    checkpoint: OffsetCheckpoint,
    checksum: String,
}

/// JSON checkpoint file replaced atomically (temp file, fsync, rename) on every persist.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> PersistError {
        PersistError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<OffsetCheckpoint>, CheckpointLoadError> {
        let payload = match fs::read(&self.path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointLoadError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let file: CheckpointFile =
            serde_json::from_slice(&payload).map_err(|source| CheckpointLoadError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if file.format != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointLoadError::UnsupportedFormat {
                path: self.path.clone(),
                format: file.format,
            });
        }
        let expected = checksum(&file.checkpoint).map_err(|source| CheckpointLoadError::Parse {
            path: self.path.clone(),
            source,
        })?;
        if expected != file.checksum {
            return Err(CheckpointLoadError::ChecksumMismatch {
                path: self.path.clone(),
            });
        }
        Ok(Some(file.checkpoint))
    }

    fn persist(&mut self, checkpoint: &OffsetCheckpoint) -> Result<(), PersistError> {
        let file = CheckpointFile {
            format: CHECKPOINT_FORMAT_VERSION,
            checkpoint: *checkpoint,
            checksum: checksum(checkpoint)?,
        };
        let payload = serde_json::to_vec_pretty(&file)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let temp = self.temp_path();
        let mut handle = File::create(&temp).map_err(|err| self.io_error(err))?;
        handle
            .write_all(&payload)
            .and_then(|_| handle.sync_all())
            .map_err(|err| self.io_error(err))?;
        fs::rename(&temp, &self.path).map_err(|err| self.io_error(err))?;
        Ok(())
    }
}

/// Hex SHA-256 over the canonical JSON encoding of the checkpoint.
pub fn checksum(checkpoint: &OffsetCheckpoint) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(checkpoint)?;
    Ok(to_hex(&Sha256::digest(&canonical)))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

/// In-process store with failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<MemoryCheckpointState>>,
}

#[derive(Debug, Default)]
struct MemoryCheckpointState {
    current: Option<OffsetCheckpoint>,
    history: Vec<OffsetCheckpoint>,
    failures_remaining: u32,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: OffsetCheckpoint) -> Self {
        let store = Self::default();
        lock(&store.state).current = Some(checkpoint);
        store
    }

    /// Makes the next `count` persists fail.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).failures_remaining = count;
    }

    pub fn current(&self) -> Option<OffsetCheckpoint> {
        lock(&self.state).current
    }

    /// Every checkpoint successfully persisted through this handle, in order.
    pub fn history(&self) -> Vec<OffsetCheckpoint> {
        lock(&self.state).history.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<OffsetCheckpoint>, CheckpointLoadError> {
        Ok(lock(&self.state).current)
    }

    fn persist(&mut self, checkpoint: &OffsetCheckpoint) -> Result<(), PersistError> {
        let mut state = lock(&self.state);
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(PersistError::Rejected("injected failure".into()));
        }
        state.current = Some(*checkpoint);
        state.history.push(*checkpoint);
        Ok(())
    }
}

/// Read side of the durable offset, consulted before committing broker positions.
#[derive(Debug, Clone, Default)]
pub struct OffsetGate {
    next_offset: Arc<AtomicU64>,
}

impl OffsetGate {
    pub fn durable_offset(&self) -> Option<u64> {
        self.next_offset.load(Ordering::Acquire).checked_sub(1)
    }

    fn advance(&self, offset: u64) {
        self.next_offset
            .fetch_max(offset.saturating_add(1), Ordering::AcqRel);
    }
}

/// Loads the resume point once and persists checkpoints after full sink acknowledgement.
pub struct OffsetManager {
    store: Box<dyn CheckpointStore>,
    retry: RetryPolicy,
    loaded: Option<OffsetCheckpoint>,
    durable: Option<OffsetCheckpoint>,
    gate: OffsetGate,
    durable_claim: bool,
}

impl OffsetManager {
    pub fn open(
        store: Box<dyn CheckpointStore>,
        retry: RetryPolicy,
    ) -> Result<Self, CheckpointLoadError> {
        let loaded = store.load()?;
        let gate = OffsetGate::default();
        if let Some(checkpoint) = &loaded {
            gate.advance(checkpoint.offset);
        }
        Ok(Self {
            store,
            retry,
            loaded,
            durable: loaded,
            gate,
            durable_claim: true,
        })
    }

    /// Checkpoint found at startup.
    pub fn load(&self) -> Option<OffsetCheckpoint> {
        self.loaded
    }

    pub fn durable(&self) -> Option<&OffsetCheckpoint> {
        self.durable.as_ref()
    }

    pub fn gate(&self) -> OffsetGate {
        self.gate.clone()
    }

    /// False once a persist exhausted its retries and no later persist succeeded.
    pub fn is_durable(&self) -> bool {
        self.durable_claim
    }

    /// Persists a fully acknowledged checkpoint, retrying per policy.
    pub fn persist(&mut self, checkpoint: OffsetCheckpoint) -> Result<(), PersistError> {
        if let Some(durable) = &self.durable {
            if checkpoint.offset < durable.offset {
                return Err(PersistError::Regression {
                    durable: durable.offset,
                    attempted: checkpoint.offset,
                });
            }
            if checkpoint.offset == durable.offset && self.durable_claim {
                return Ok(());
            }
        }
        let never = AtomicBool::new(false);
        let store = &mut self.store;
        match self.retry.run(&never, |_| store.persist(&checkpoint)) {
            Ok(_) => {
                self.durable = Some(checkpoint);
                self.durable_claim = true;
                self.gate.advance(checkpoint.offset);
                Ok(())
            }
            Err(err) => {
                self.durable_claim = false;
                let attempts = err.attempts();
                let last = err
                    .into_last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                Err(PersistError::Exhausted { attempts, last })
            }
        }
    }
}

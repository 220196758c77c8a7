use crate::event_model::clock::WallClock;
use crate::runtime::lock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Severity levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rotation policy for file and in-memory outputs (default 64 MiB × 5 files).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 64 << 20,
            max_files: 5,
        }
    }
}

/// Accumulated log lines for one in-memory segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// Where formatted lines end up.
#[derive(Debug)]
enum LogOutput {
    Stderr,
    File {
        path: PathBuf,
        handle: File,
        bytes_written: usize,
    },
    Memory {
        files: VecDeque<LogFile>,
        active: LogFile,
    },
}

/// JSON-line logger with rotation.
#[derive(Debug)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    output: LogOutput,
}

impl JsonLineLogger {
    pub fn stderr() -> Self {
        Self::with_output(LogOutput::Stderr, LogRotationPolicy::default())
    }

    /// Keeps lines in memory segments; used by tests to inspect output.
    pub fn memory(policy: LogRotationPolicy) -> Self {
        Self::with_output(
            LogOutput::Memory {
                files: VecDeque::new(),
                active: LogFile::default(),
            },
            policy,
        )
    }

    /// Appends to `path`, rotating to `path.1` … `path.N` when it outgrows the policy.
    pub fn file(path: impl Into<PathBuf>, policy: LogRotationPolicy) -> Result<Self, LoggingError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LoggingError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let handle = open_append(&path)?;
        let bytes_written = handle
            .metadata()
            .map(|meta| meta.len() as usize)
            .unwrap_or(0);
        Ok(Self::with_output(
            LogOutput::File {
                path,
                handle,
                bytes_written,
            },
            policy,
        ))
    }

    fn with_output(output: LogOutput, policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            output,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    /// Applies a runtime log-level override.
    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits one JSON-line record.
    pub fn log(&mut self, ts_ms: u64, level: LogLevel, entry: LogEntry<'_>) -> Result<(), LoggingError> {
        if level < self.current_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            module: entry.module,
            component: entry.component,
            offset: entry.offset,
            message: entry.message,
        };
        let line = serde_json::to_string(&record)?;
        self.write_line(line)
    }

    /// In-memory segments, oldest first, ending with the active one. Empty for other outputs.
    pub fn files(&self) -> Vec<&LogFile> {
        match &self.output {
            LogOutput::Memory { files, active } => {
                files.iter().chain(std::iter::once(active)).collect()
            }
            _ => Vec::new(),
        }
    }

    fn write_line(&mut self, line: String) -> Result<(), LoggingError> {
        let policy = self.policy;
        match &mut self.output {
            LogOutput::Stderr => {
                let mut stderr = io::stderr().lock();
                writeln!(stderr, "{line}").map_err(|source| LoggingError::Io {
                    path: PathBuf::from("<stderr>"),
                    source,
                })
            }
            LogOutput::Memory { files, active } => {
                if active.bytes_written + line.len() > policy.max_bytes && !active.lines.is_empty() {
                    files.push_back(std::mem::take(active));
                    while files.len() > policy.max_files {
                        files.pop_front();
                    }
                }
                active.bytes_written = active.bytes_written.saturating_add(line.len());
                active.lines.push(line);
                Ok(())
            }
            LogOutput::File {
                path,
                handle,
                bytes_written,
            } => {
                let needed = line.len() + 1;
                if *bytes_written > 0 && *bytes_written + needed > policy.max_bytes {
                    rotate_files(path, policy.max_files)?;
                    *handle = open_append(path)?;
                    *bytes_written = 0;
                }
                writeln!(handle, "{line}").map_err(|source| LoggingError::Io {
                    path: path.clone(),
                    source,
                })?;
                *bytes_written += needed;
                Ok(())
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Shifts `path.N-1` → `path.N` … `path` → `path.1`, dropping the oldest.
fn rotate_files(path: &Path, max_files: usize) -> Result<(), LoggingError> {
    let numbered = |index: usize| {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    };
    if max_files == 0 {
        return fs::remove_file(path).map_err(|source| LoggingError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    for index in (1..max_files).rev() {
        let from = numbered(index);
        if from.exists() {
            fs::rename(&from, numbered(index + 1)).map_err(|source| LoggingError::Io {
                path: from.clone(),
                source,
            })?;
        }
    }
    fs::rename(path, numbered(1)).map_err(|source| LoggingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Errors surfaced while writing JSON-line logs.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write log {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Fields of one record besides timestamp and level.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    pub module: &'a str,
    pub component: &'a str,
    pub offset: Option<u64>,
    pub message: &'a str,
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    module: &'a str,
    component: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    message: &'a str,
}

/// Cloneable handle shared by every activity. Write failures are counted, never propagated.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<JsonLineLogger>>,
    clock: Arc<dyn WallClock>,
    module: &'static str,
    dropped: Arc<AtomicU64>,
}

impl Logger {
    pub fn new(logger: JsonLineLogger, clock: Arc<dyn WallClock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
            clock,
            module: "tallyline",
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Same sink, records tagged with another module name.
    pub fn scoped(&self, module: &'static str) -> Self {
        Self {
            module,
            ..self.clone()
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        lock(&self.inner).set_level(level);
    }

    pub fn level(&self) -> LogLevel {
        lock(&self.inner).level()
    }

    pub fn log(&self, level: LogLevel, component: &str, offset: Option<u64>, message: &str) {
        let ts = self.clock.now_ms();
        let entry = LogEntry {
            module: self.module,
            component,
            offset,
            message,
        };
        if lock(&self.inner).log(ts, level, entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, component, None, message);
    }

    pub fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, component, None, message);
    }

    pub fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, component, None, message);
    }

    pub fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, component, None, message);
    }

    /// Records that could not be written.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Every line held by an in-memory logger, oldest first.
    pub fn captured_lines(&self) -> Vec<String> {
        lock(&self.inner)
            .files()
            .into_iter()
            .flat_map(|file| file.lines().iter().cloned())
            .collect()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

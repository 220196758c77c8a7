//! Downstream destinations for committed snapshots.

pub mod append_log;
pub mod dispatcher;
pub mod document_store;
pub mod mongo;

pub use append_log::{read_records, AppendLogSink, AppendRecord};
pub use dispatcher::{
    DispatchError, DispatchReport, SinkDispatcher, SkipList, TargetOutcome, TargetReport,
};
pub use document_store::{
    AggregateDocument, AggregateFields, DocumentStore, FileDocumentStore, MutableStoreSink,
};
pub use mongo::MongoStore;

use crate::event_model::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DOCUMENT_ID: &str = "aggregate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SinkKind {
    MutableStore,
    AppendLog,
}

impl SinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SinkKind::MutableStore => "MUTABLE_STORE",
            SinkKind::AppendLog => "APPEND_LOG",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection descriptor, tagged by sink kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SinkDestination {
    MutableStore {
        /// `file://<dir>` or a `mongodb://` / `mongodb+srv://` connection string.
        uri: String,
        database: String,
        collection: String,
        #[serde(default = "default_document_id")]
        document_id: String,
    },
    AppendLog {
        path: PathBuf,
    },
}

fn default_document_id() -> String {
    DEFAULT_DOCUMENT_ID.to_string()
}

impl SinkDestination {
    pub fn kind(&self) -> SinkKind {
        match self {
            SinkDestination::MutableStore { .. } => SinkKind::MutableStore,
            SinkDestination::AppendLog { .. } => SinkKind::AppendLog,
        }
    }
}

/// Static sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkTarget {
    pub id: String,
    #[serde(flatten)]
    pub destination: SinkDestination,
}

impl SinkTarget {
    pub fn kind(&self) -> SinkKind {
        self.destination.kind()
    }
}

/// Acknowledgement of one snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    Written,
    /// The sink already reflects this offset; nothing was written.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected write: {0}")]
    Rejected(String),
    #[error("sink i/o failure on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("sink payload encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid sink configuration: {0}")]
    Config(String),
}

/// One downstream destination. Writes must be idempotent per snapshot offset.
pub trait SnapshotSink: Send {
    fn id(&self) -> &str;

    fn kind(&self) -> SinkKind;

    fn write(&mut self, snapshot: &Snapshot) -> Result<WriteAck, SinkError>;

    /// Releases connections. Called once at shutdown.
    fn close(&mut self) {}
}

/// Transport knobs shared by network-backed sinks.
#[derive(Debug, Clone, Default)]
pub struct SinkEnvironment {
    /// Server selection and connect timeout, unless the uri sets its own.
    pub request_timeout: Option<Duration>,
}

/// Builds the sink implementation for a configured target.
pub fn open_sink(target: &SinkTarget, env: &SinkEnvironment) -> Result<Box<dyn SnapshotSink>, SinkError> {
    match &target.destination {
        SinkDestination::AppendLog { path } => {
            Ok(Box::new(AppendLogSink::open(target.id.clone(), path)?))
        }
        SinkDestination::MutableStore {
            uri,
            database,
            collection,
            document_id,
        } => {
            let store: Box<dyn DocumentStore> = if let Some(root) = uri.strip_prefix("file://") {
                Box::new(FileDocumentStore::new(root, database, collection))
            } else if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
                Box::new(MongoStore::connect(
                    uri,
                    database,
                    collection,
                    env.request_timeout,
                )?)
            } else {
                let scheme = uri.split_once("://").map_or("<none>", |(scheme, _)| scheme);
                return Err(SinkError::Config(format!(
                    "sink {}: unsupported store uri scheme `{scheme}` (expected file:// or mongodb://)",
                    target.id
                )));
            };
            Ok(Box::new(MutableStoreSink::new(
                target.id.clone(),
                document_id.clone(),
                store,
            )))
        }
    }
}

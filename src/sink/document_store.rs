use super::{SinkError, SinkKind, SnapshotSink, WriteAck};
use crate::event_model::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// The single aggregate row kept in the mutable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateFields {
    pub sum: i64,
    pub offset: u64,
    pub event_count: u64,
    pub taken_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: AggregateFields,
}

impl AggregateDocument {
    pub fn from_snapshot(id: impl Into<String>, snapshot: &Snapshot) -> Self {
        Self {
            id: id.into(),
            fields: AggregateFields {
                sum: snapshot.sum,
                offset: snapshot.offset,
                event_count: snapshot.event_count,
                taken_at_ms: snapshot.taken_at_ms,
            },
        }
    }
}

/// Keyed document storage supporting upsert.
pub trait DocumentStore: Send {
    fn upsert(&mut self, document: &AggregateDocument) -> Result<(), SinkError>;

    fn find(&self, id: &str) -> Result<Option<AggregateDocument>, SinkError>;

    fn describe(&self) -> String;
}

/// Collection kept as one JSON file `<root>/<database>/<collection>.json`, rewritten atomically.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    path: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl AsRef<Path>, database: &str, collection: &str) -> Self {
        Self {
            path: root
                .as_ref()
                .join(database)
                .join(format!("{collection}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_collection(&self) -> Result<BTreeMap<String, AggregateDocument>, SinkError> {
        match fs::read(&self.path) {
            Ok(payload) => Ok(serde_json::from_slice(&payload)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

impl DocumentStore for FileDocumentStore {
    fn upsert(&mut self, document: &AggregateDocument) -> Result<(), SinkError> {
        let mut collection = self.read_collection()?;
        collection.insert(document.id.clone(), document.clone());
        let payload = serde_json::to_vec_pretty(&collection)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let temp = self.path.with_extension("json.tmp");
        let mut handle = File::create(&temp).map_err(|err| self.io_error(err))?;
        handle
            .write_all(&payload)
            .and_then(|_| handle.sync_all())
            .map_err(|err| self.io_error(err))?;
        fs::rename(&temp, &self.path).map_err(|err| self.io_error(err))
    }

    fn find(&self, id: &str) -> Result<Option<AggregateDocument>, SinkError> {
        Ok(self.read_collection()?.remove(id))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Upserts the aggregate under a fixed document id.
///
/// The stored document's offset is read once before the first write, so a
/// restarted process never moves the document back to an older snapshot.
pub struct MutableStoreSink {
    id: String,
    document_id: String,
    store: Box<dyn DocumentStore>,
    last_written: Option<u64>,
    primed: bool,
}

impl MutableStoreSink {
    pub fn new(id: impl Into<String>, document_id: impl Into<String>, store: Box<dyn DocumentStore>) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            store,
            last_written: None,
            primed: false,
        }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }
}

impl SnapshotSink for MutableStoreSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::MutableStore
    }

    fn write(&mut self, snapshot: &Snapshot) -> Result<WriteAck, SinkError> {
        if !self.primed {
            self.last_written = self
                .store
                .find(&self.document_id)?
                .map(|existing| existing.fields.offset);
            self.primed = true;
        }
        if self.last_written.is_some_and(|last| last >= snapshot.offset) {
            return Ok(WriteAck::Duplicate);
        }
        let document = AggregateDocument::from_snapshot(self.document_id.clone(), snapshot);
        self.store.upsert(&document)?;
        self.last_written = Some(snapshot.offset);
        Ok(WriteAck::Written)
    }
}

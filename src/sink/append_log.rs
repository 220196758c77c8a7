use super::{SinkError, SinkKind, SnapshotSink, WriteAck};
use crate::event_model::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One line of the append log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRecord {
    pub sum: i64,
    pub offset: u64,
    pub taken_at_ms: u64,
}

impl From<&Snapshot> for AppendRecord {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            sum: snapshot.sum,
            offset: snapshot.offset,
            taken_at_ms: snapshot.taken_at_ms,
        }
    }
}

/// JSON-lines file, one record per committed snapshot, deduplicated by offset.
///
/// On open the file is scanned for the highest appended offset so suppression
/// survives restarts. A torn trailing line left by a crash is cut off.
pub struct AppendLogSink {
    id: String,
    path: PathBuf,
    file: File,
    last_offset: Option<u64>,
    /// File length after the last complete append.
    committed_len: u64,
}

impl AppendLogSink {
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let io_error = |source| SinkError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        let (last_offset, committed_len) = scan(&file).map_err(io_error)?;
        if file.metadata().map_err(io_error)?.len() != committed_len {
            file.set_len(committed_len).map_err(io_error)?;
        }
        Ok(Self {
            id: id.into(),
            path,
            file,
            last_offset,
            committed_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest offset already present in the log.
    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    fn append(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        self.file.sync_data()
    }
}

impl SnapshotSink for AppendLogSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::AppendLog
    }

    fn write(&mut self, snapshot: &Snapshot) -> Result<WriteAck, SinkError> {
        if self.last_offset.is_some_and(|last| last >= snapshot.offset) {
            return Ok(WriteAck::Duplicate);
        }
        let mut line = serde_json::to_vec(&AppendRecord::from(snapshot))?;
        line.push(b'\n');
        if let Err(source) = self.append(&line) {
            // Drop whatever part of the line made it to disk.
            let _ = self.file.set_len(self.committed_len);
            return Err(SinkError::Io {
                path: self.path.clone(),
                source,
            });
        }
        self.committed_len += line.len() as u64;
        self.last_offset = Some(snapshot.offset);
        Ok(WriteAck::Written)
    }

    fn close(&mut self) {
        let _ = self.file.sync_all();
    }
}

/// Highest parseable offset and the length up to the last newline-terminated line.
fn scan(file: &File) -> io::Result<(Option<u64>, u64)> {
    let mut reader = BufReader::new(file);
    let mut last_offset = None;
    let mut good_len = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 || !line.ends_with('\n') {
            break;
        }
        // Complete but unparseable lines are left in place.
        if let Ok(record) = serde_json::from_str::<AppendRecord>(line.trim_end()) {
            last_offset = last_offset.max(Some(record.offset));
        }
        good_len += read as u64;
    }
    Ok((last_offset, good_len))
}

/// Reads every record of an append log, failing on the first malformed line.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AppendRecord>, SinkError> {
    let path = path.as_ref();
    let io_error = |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_error)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

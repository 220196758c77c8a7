use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tallyline::event_model::{
    MemoryCheckpointStore, OffsetCheckpoint, Snapshot, SystemWallClock,
};
use tallyline::observability::{JsonLineLogger, LogRotationPolicy, Logger};
use tallyline::runtime::{Pipeline, PipelineError, PipelineHandle, PipelineParts, RetryPolicy};
use tallyline::sink::{
    read_records, AppendLogSink, DocumentStore, FileDocumentStore, MutableStoreSink, SinkError,
    SinkKind, SnapshotSink, WriteAck,
};
use tallyline::source::{MemoryBroker, OffsetReset, Subscription};
use tempfile::{tempdir, TempDir};

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

/// Sink wrapper whose availability the test toggles.
struct Switchable {
    inner: Box<dyn SnapshotSink>,
    down: Arc<AtomicBool>,
}

impl SnapshotSink for Switchable {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> SinkKind {
        self.inner.kind()
    }

    fn write(&mut self, snapshot: &Snapshot) -> Result<WriteAck, SinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("connection refused".into()));
        }
        self.inner.write(snapshot)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

struct Harness {
    _dir: TempDir,
    broker: MemoryBroker,
    checkpoints: MemoryCheckpointStore,
    store: FileDocumentStore,
    log_path: PathBuf,
    log_down: Arc<AtomicBool>,
    logger: Logger,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path(), "mongo", "test");
        let log_path = dir.path().join("output_stream.jsonl");
        Self {
            _dir: dir,
            broker: MemoryBroker::new(),
            checkpoints: MemoryCheckpointStore::new(),
            store,
            log_path,
            log_down: Arc::new(AtomicBool::new(false)),
            logger: Logger::new(
                JsonLineLogger::memory(LogRotationPolicy::default()),
                Arc::new(SystemWallClock),
            ),
        }
    }

    fn publish(&self, values: &[i64]) {
        for value in values {
            self.broker
                .publish_json(&json!({"payload": {"op": "c", "after": {"value": value}}}));
        }
    }

    fn start(&self) -> PipelineHandle {
        let sinks: Vec<Box<dyn SnapshotSink>> = vec![
            Box::new(MutableStoreSink::new(
                "store",
                "aggregate",
                Box::new(self.store.clone()),
            )),
            Box::new(Switchable {
                inner: Box::new(AppendLogSink::open("log", &self.log_path).unwrap()),
                down: Arc::clone(&self.log_down),
            }),
        ];
        let mut parts = PipelineParts::new(
            Box::new(self.broker.clone()),
            Subscription {
                topic: "mongo.test.values".into(),
                group_id: "0".into(),
                session_timeout: Duration::from_secs(6),
                offset_reset: OffsetReset::Earliest,
            },
            sinks,
            Box::new(self.checkpoints.clone()),
            Arc::new(SystemWallClock),
            self.logger.clone(),
        );
        parts.commit_interval = Duration::from_millis(10);
        parts.connect_retry = RetryPolicy::immediate(3);
        parts.sink_retry = RetryPolicy::immediate(2);
        parts.checkpoint_retry = RetryPolicy::immediate(2);
        Pipeline::start(parts).unwrap()
    }

    fn stored(&self) -> Option<(i64, u64)> {
        self.store
            .find("aggregate")
            .unwrap()
            .map(|doc| (doc.fields.sum, doc.fields.offset))
    }

    fn log_offsets(&self) -> Vec<u64> {
        read_records(&self.log_path)
            .unwrap()
            .iter()
            .map(|record| record.offset)
            .collect()
    }
}

fn durable_offset(handle: &PipelineHandle) -> Option<u64> {
    handle.durable_checkpoint().map(|cp| cp.offset)
}

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn events_flow_to_both_sinks_and_checkpoint() {
    let harness = Harness::new();
    harness.publish(&[5, 3, -2]);
    let handle = harness.start();
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(2));

    assert_eq!(handle.aggregate().sum, 6);
    assert_eq!(harness.stored(), Some((6, 2)));
    assert_eq!(harness.log_offsets().last(), Some(&2));
    assert_eq!(handle.metrics().events_applied(), 3);
    assert!(handle.render_metrics().contains("tallyline_checkpoint_offset 2"));
    wait_for(TIMEOUT, || harness.broker.committed_offset() == Some(3));

    let report = handle.shutdown(Duration::from_secs(2)).unwrap();
    assert!(report.durable);
    assert_eq!(report.final_checkpoint.map(|cp| (cp.offset, cp.sum)), Some((2, 6)));
    assert_eq!(report.abandoned_offset, None);
}

#[test]
fn malformed_records_are_counted_and_skipped() {
    let harness = Harness::new();
    harness.publish(&[4]);
    harness.broker.publish(b"{broken".to_vec());
    harness.broker.publish_tombstone();
    harness.publish(&[6]);
    let handle = harness.start();
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(3));
    assert_eq!(handle.aggregate().sum, 10);
    assert_eq!(handle.metrics().decode_errors(), 1);
    assert_eq!(handle.metrics().tombstones(), 1);
    assert!(!handle.is_halted());
    assert!(harness
        .logger
        .captured_lines()
        .iter()
        .any(|line| line.contains("\"offset\":1") && line.contains("failed to decode")));
    handle.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn sink_outage_holds_checkpoint_until_recovery() {
    let harness = Harness::new();
    harness.log_down.store(true, Ordering::SeqCst);
    harness.publish(&[1, 2, 3]);
    let handle = harness.start();

    wait_for(TIMEOUT, || {
        handle.metrics().sink_acked_offset("store") == Some(2)
            && handle.health().stalled_sinks() == vec!["log"]
    });
    thread::sleep(Duration::from_millis(50));
    assert_eq!(handle.durable_checkpoint(), None);
    assert_eq!(harness.broker.committed_offset(), None);
    assert!(!handle.health().ready);

    // Ingestion keeps going while the sink is down.
    harness.publish(&[4]);
    wait_for(TIMEOUT, || handle.aggregate().sum == 10);
    assert_eq!(handle.durable_checkpoint(), None);

    harness.log_down.store(false, Ordering::SeqCst);
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(3));
    assert_eq!(harness.log_offsets(), vec![3]);
    assert_eq!(harness.stored(), Some((10, 3)));
    wait_for(TIMEOUT, || handle.health().ready);
    handle.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn skipped_sink_lets_checkpoint_advance() {
    let harness = Harness::new();
    harness.log_down.store(true, Ordering::SeqCst);
    harness.publish(&[2, 2]);
    let handle = harness.start();
    assert!(matches!(
        handle.skip_sink("nope"),
        Err(PipelineError::UnknownSink(id)) if id == "nope"
    ));
    handle.skip_sink("log").unwrap();
    assert_eq!(handle.skipped_sinks(), vec!["log".to_string()]);
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(1));
    assert!(harness.log_offsets().is_empty());

    handle.unskip_sink("log").unwrap();
    harness.log_down.store(false, Ordering::SeqCst);
    harness.publish(&[1]);
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(2));
    assert_eq!(harness.log_offsets(), vec![2]);
    handle.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn restart_resumes_from_checkpoint_without_duplicates() {
    let harness = Harness::new();
    harness.publish(&[5, 3, -2]);
    let first = harness.start();
    wait_for(TIMEOUT, || durable_offset(&first) == Some(2));
    first.abort().unwrap();

    harness.publish(&[10, 1]);
    let second = harness.start();
    wait_for(TIMEOUT, || durable_offset(&second) == Some(4));
    assert_eq!(second.aggregate().sum, 17);
    assert_eq!(second.aggregate().event_count, 5);
    assert_eq!(second.metrics().events_applied(), 2);
    assert_eq!(harness.stored(), Some((17, 4)));

    let offsets = harness.log_offsets();
    assert!(
        offsets.windows(2).all(|pair| pair[0] < pair[1]),
        "log offsets must strictly increase: {offsets:?}"
    );
    assert_eq!(offsets.last(), Some(&4));
    second.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn crash_between_sink_write_and_checkpoint_is_idempotent() {
    let harness = Harness::new();
    harness.publish(&[5, 3, -2, 4]);
    // Sinks already reflect offset 3; the checkpoint only reached offset 1.
    let ahead = Snapshot {
        sum: 10,
        offset: 3,
        event_count: 4,
        taken_at_ms: 0,
    };
    MutableStoreSink::new("store", "aggregate", Box::new(harness.store.clone()))
        .write(&ahead)
        .unwrap();
    AppendLogSink::open("log", &harness.log_path)
        .unwrap()
        .write(&ahead)
        .unwrap();
    let harness = Harness {
        checkpoints: MemoryCheckpointStore::with_checkpoint(OffsetCheckpoint {
            offset: 1,
            sum: 8,
            event_count: 2,
            committed_at_ms: 0,
        }),
        ..harness
    };

    let handle = harness.start();
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(3));
    assert_eq!(handle.aggregate().sum, 10);
    assert_eq!(harness.log_offsets(), vec![3]);
    assert_eq!(harness.stored(), Some((10, 3)));
    handle.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn graceful_shutdown_with_stalled_sink_keeps_last_checkpoint() {
    let harness = Harness::new();
    harness.publish(&[7]);
    let handle = harness.start();
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(0));

    harness.log_down.store(true, Ordering::SeqCst);
    harness.publish(&[8]);
    wait_for(TIMEOUT, || handle.aggregate().sum == 15);
    let report = handle.shutdown(Duration::from_millis(300)).unwrap();
    assert_eq!(report.final_checkpoint.map(|cp| cp.offset), Some(0));
    assert_eq!(report.aggregate.sum, 15);
    assert_eq!(harness.checkpoints.current().map(|cp| cp.offset), Some(0));
    assert_eq!(harness.broker.committed_offset(), Some(1));
}

#[test]
fn abort_returns_promptly() {
    let harness = Harness::new();
    harness.log_down.store(true, Ordering::SeqCst);
    harness.publish(&[1, 2]);
    let handle = harness.start();
    wait_for(TIMEOUT, || handle.aggregate().sum == 3);
    let started = Instant::now();
    let report = handle.abort().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.final_checkpoint, None);
    assert!(harness.checkpoints.history().is_empty());
}

#[test]
fn failed_checkpoint_write_is_retried_while_idle() {
    let harness = Harness::new();
    // Exhausts the first persist attempt (two tries per persist).
    harness.checkpoints.fail_next(2);
    harness.publish(&[5, 3, -2]);
    let handle = harness.start();

    wait_for(TIMEOUT, || handle.metrics().checkpoint_persist_failures() >= 1);
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(2));
    assert_eq!(harness.checkpoints.current().map(|cp| (cp.offset, cp.sum)), Some((2, 6)));
    assert!(!handle.health().has_reason("checkpoint_not_durable"));
    assert!(harness
        .logger
        .captured_lines()
        .iter()
        .any(|line| line.contains("checkpoint persisted after earlier failure")));

    let report = handle.shutdown(Duration::from_secs(2)).unwrap();
    assert!(report.durable);
    assert_eq!(report.final_checkpoint.map(|cp| cp.offset), Some(2));
}

#[test]
fn graceful_shutdown_persists_checkpoint_left_behind_by_store_outage() {
    let harness = Harness::new();
    harness.checkpoints.fail_next(u32::MAX);
    harness.publish(&[5, 3, -2]);
    let handle = harness.start();

    wait_for(TIMEOUT, || {
        handle.metrics().sink_acked_offset("log") == Some(2)
            && handle.metrics().checkpoint_persist_failures() >= 2
    });
    assert_eq!(handle.durable_checkpoint(), None);
    assert!(handle.health().has_reason("checkpoint_not_durable"));

    // The store recovers while no new events arrive.
    harness.checkpoints.fail_next(0);
    let report = handle.shutdown(Duration::from_secs(2)).unwrap();
    assert!(report.durable);
    assert_eq!(report.final_checkpoint.map(|cp| cp.offset), Some(2));
    assert_eq!(harness.checkpoints.current().map(|cp| cp.offset), Some(2));
}

#[test]
fn unskipped_sink_catches_up_without_new_events() {
    let harness = Harness::new();
    harness.log_down.store(true, Ordering::SeqCst);
    harness.publish(&[4, 4]);
    let handle = harness.start();
    handle.skip_sink("log").unwrap();
    wait_for(TIMEOUT, || durable_offset(&handle) == Some(1));
    thread::sleep(Duration::from_millis(50));
    assert!(harness.log_offsets().is_empty());

    harness.log_down.store(false, Ordering::SeqCst);
    handle.unskip_sink("log").unwrap();
    wait_for(TIMEOUT, || harness.log_offsets() == vec![1]);
    assert_eq!(handle.metrics().sink_acked_offset("log"), Some(1));
    assert_eq!(handle.aggregate().last_offset, Some(1));
    handle.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn broker_outage_is_reported_by_source_component() {
    let harness = Harness::new();
    harness.publish(&[1]);
    let handle = harness.start();
    wait_for(TIMEOUT, || handle.aggregate().sum == 1);

    harness.broker.fail_next_connects(1_000);
    harness.broker.expire_sessions();
    wait_for(TIMEOUT, || handle.is_halted());

    let lines = harness.logger.captured_lines();
    let halt: serde_json::Value = lines
        .iter()
        .find(|line| line.contains("source unavailable"))
        .map(|line| serde_json::from_str(line).unwrap())
        .expect("halt record");
    assert_eq!(halt["component"], "source");
    assert_eq!(halt["level"], "ERROR");
    assert!(!lines
        .iter()
        .any(|line| line.contains("\"component\":\"reducer\"")));
    assert!(handle.health().has_reason("ingest_halted"));
    handle.abort().unwrap();
}

use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tallyline::event_model::{
    ManualClock, MemoryCheckpointStore, OffsetCheckpoint, OffsetManager,
};
use tallyline::observability::{JsonLineLogger, LogRotationPolicy, Logger};
use tallyline::runtime::RetryPolicy;
use tallyline::source::{
    ConnectError, MemoryBroker, OffsetReset, SourceAdapter, SourceItem, SourceOptions,
    Subscription,
};

fn subscription(offset_reset: OffsetReset) -> Subscription {
    Subscription {
        topic: "mongo.test.values".into(),
        group_id: "0".into(),
        session_timeout: Duration::from_millis(6_000),
        offset_reset,
    }
}

fn options(resume_after: Option<u64>, retry: RetryPolicy) -> SourceOptions {
    let clock = Arc::new(ManualClock::new(77));
    SourceOptions {
        subscription: subscription(OffsetReset::Earliest),
        resume_after,
        retry,
        clock: clock.clone(),
        cancel: Arc::new(AtomicBool::new(false)),
        logger: Logger::new(JsonLineLogger::memory(LogRotationPolicy::default()), clock),
    }
}

fn publish_values(broker: &MemoryBroker, values: &[i64]) {
    for value in values {
        broker.publish_json(&json!({"op": "c", "after": {"value": value}}));
    }
}

fn collect(adapter: &mut SourceAdapter, count: usize) -> Vec<SourceItem> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut items = Vec::new();
    while items.len() < count {
        assert!(Instant::now() < deadline, "only received {items:?}");
        if let Some(item) = adapter.poll(Duration::from_millis(20)).unwrap() {
            items.push(item);
        }
    }
    items
}

fn offsets(items: &[SourceItem]) -> Vec<u64> {
    items.iter().map(SourceItem::offset).collect()
}

#[test]
fn fresh_start_reads_from_earliest() {
    let broker = MemoryBroker::new();
    publish_values(&broker, &[5, 3, -2]);
    let mut adapter =
        SourceAdapter::connect(Box::new(broker.clone()), options(None, RetryPolicy::immediate(1)))
            .unwrap();
    let items = collect(&mut adapter, 3);
    assert_eq!(offsets(&items), vec![0, 1, 2]);
    match &items[0] {
        SourceItem::Event(event) => {
            assert_eq!(event.value(), 5);
            assert_eq!(event.timestamp_ms(), 77);
        }
        other => panic!("unexpected item {other:?}"),
    }
    assert_eq!(adapter.last_delivered(), Some(2));
}

#[test]
fn resume_starts_strictly_after_checkpoint() {
    let broker = MemoryBroker::new();
    publish_values(&broker, &[1, 2, 3, 4, 5]);
    let mut adapter = SourceAdapter::connect(
        Box::new(broker.clone()),
        options(Some(2), RetryPolicy::immediate(1)),
    )
    .unwrap();
    assert_eq!(offsets(&collect(&mut adapter, 2)), vec![3, 4]);
}

#[test]
fn latest_reset_skips_existing_records() {
    let broker = MemoryBroker::new();
    publish_values(&broker, &[1, 2]);
    let mut opts = options(None, RetryPolicy::immediate(1));
    opts.subscription = subscription(OffsetReset::Latest);
    let mut adapter = SourceAdapter::connect(Box::new(broker.clone()), opts).unwrap();
    assert!(adapter.poll(Duration::from_millis(20)).unwrap().is_none());
    publish_values(&broker, &[3]);
    assert_eq!(offsets(&collect(&mut adapter, 1)), vec![2]);
}

#[test]
fn rebalance_resumes_without_duplicates() {
    let broker = MemoryBroker::new();
    publish_values(&broker, &[1, 2, 3]);
    let mut adapter =
        SourceAdapter::connect(Box::new(broker.clone()), options(None, RetryPolicy::immediate(3)))
            .unwrap();
    let mut seen = offsets(&collect(&mut adapter, 2));
    broker.expire_sessions();
    publish_values(&broker, &[4, 5]);
    seen.extend(offsets(&collect(&mut adapter, 3)));
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert_eq!(adapter.reconnects(), 1);
    assert!(adapter.is_connected());
    assert_eq!(broker.connect_count(), 2);
}

#[test]
fn transient_connect_failures_are_retried() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2);
    let adapter =
        SourceAdapter::connect(Box::new(broker.clone()), options(None, RetryPolicy::immediate(3)))
            .unwrap();
    assert!(adapter.is_connected());
    assert_eq!(broker.connect_count(), 3);
}

#[test]
fn unreachable_broker_exhausts_retries() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(10);
    let err = SourceAdapter::connect(Box::new(broker.clone()), options(None, RetryPolicy::immediate(2)))
        .err()
        .expect("connect must fail");
    assert!(matches!(err, ConnectError::Exhausted { attempts: 2, .. }));
}

#[test]
fn tombstones_and_garbage_are_surfaced_with_offsets() {
    let broker = MemoryBroker::new();
    broker.publish_tombstone();
    broker.publish(b"not json".to_vec());
    publish_values(&broker, &[9]);
    let mut adapter =
        SourceAdapter::connect(Box::new(broker.clone()), options(None, RetryPolicy::immediate(1)))
            .unwrap();
    let items = collect(&mut adapter, 3);
    assert_eq!(items[0], SourceItem::Tombstone { offset: 0 });
    assert!(matches!(&items[1], SourceItem::Undecodable(err) if err.offset == 1));
    assert!(matches!(&items[2], SourceItem::Event(event) if event.value() == 9));
}

#[test]
fn retention_gap_moves_start_forward() {
    let broker = MemoryBroker::new();
    publish_values(&broker, &[1, 2, 3, 4]);
    broker.truncate_before(3);
    let mut adapter = SourceAdapter::connect(
        Box::new(broker.clone()),
        options(Some(0), RetryPolicy::immediate(1)),
    )
    .unwrap();
    assert_eq!(offsets(&collect(&mut adapter, 1)), vec![3]);
}

#[test]
fn broker_commit_never_passes_durable_checkpoint() {
    let broker = MemoryBroker::new();
    publish_values(&broker, &[1, 2, 3, 4]);
    let mut adapter =
        SourceAdapter::connect(Box::new(broker.clone()), options(None, RetryPolicy::immediate(1)))
            .unwrap();
    collect(&mut adapter, 4);

    let mut offsets =
        OffsetManager::open(Box::new(MemoryCheckpointStore::new()), RetryPolicy::immediate(1)).unwrap();
    let gate = offsets.gate();
    assert!(!adapter.commit_durable(&gate).unwrap());
    assert_eq!(broker.committed_offset(), None);

    offsets
        .persist(OffsetCheckpoint {
            offset: 1,
            sum: 3,
            event_count: 2,
            committed_at_ms: 0,
        })
        .unwrap();
    assert!(adapter.commit_durable(&gate).unwrap());
    assert_eq!(broker.committed_offset(), Some(2));
    assert!(!adapter.commit_durable(&gate).unwrap(), "nothing new to commit");
    adapter.close();
}

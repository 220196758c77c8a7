use super::broker::{
    Broker, BrokerSession, ConnectError, FetchError, RawRecord, StartPosition, Subscription,
};
use crate::runtime::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const MAX_BATCH: usize = 500;

#[derive(Debug, Default)]
struct PartitionLog {
    records: VecDeque<RawRecord>,
    next_offset: u64,
    low_watermark: u64,
    committed: Option<u64>,
    connect_failures: u32,
    connects: u32,
    epoch: u64,
}

#[derive(Debug, Default)]
struct Shared {
    log: Mutex<PartitionLog>,
    cv: Condvar,
}

/// Single-partition in-process broker. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Empty topic whose first record gets offset 0.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first_offset: u64) -> Self {
        let broker = Self::default();
        {
            let mut log = lock(&broker.shared.log);
            log.next_offset = first_offset;
            log.low_watermark = first_offset;
        }
        broker
    }

    /// Appends a record value and returns its offset.
    pub fn publish(&self, value: impl Into<Vec<u8>>) -> u64 {
        self.append(Some(value.into()))
    }

    pub fn publish_json(&self, value: &serde_json::Value) -> u64 {
        self.append(Some(value.to_string().into_bytes()))
    }

    pub fn publish_tombstone(&self) -> u64 {
        self.append(None)
    }

    /// Drops records below `offset`, as retention would.
    pub fn truncate_before(&self, offset: u64) {
        let mut log = lock(&self.shared.log);
        while log.records.front().is_some_and(|r| r.offset < offset) {
            log.records.pop_front();
        }
        log.low_watermark = log.low_watermark.max(offset.min(log.next_offset));
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.shared.log).connect_failures = count;
    }

    /// Invalidates every open session, as a rebalance would.
    pub fn expire_sessions(&self) {
        lock(&self.shared.log).epoch += 1;
        self.shared.cv.notify_all();
    }

    /// Group position last committed: the first offset not yet durable downstream.
    pub fn committed_offset(&self) -> Option<u64> {
        lock(&self.shared.log).committed
    }

    pub fn connect_count(&self) -> u32 {
        lock(&self.shared.log).connects
    }

    pub fn end_offset(&self) -> u64 {
        lock(&self.shared.log).next_offset
    }

    fn append(&self, value: Option<Vec<u8>>) -> u64 {
        let mut log = lock(&self.shared.log);
        let offset = log.next_offset;
        log.records.push_back(RawRecord {
            offset,
            key: None,
            value,
            timestamp_ms: None,
        });
        log.next_offset += 1;
        self.shared.cv.notify_all();
        offset
    }
}

impl Broker for MemoryBroker {
    fn connect(&mut self, subscription: &Subscription) -> Result<Box<dyn BrokerSession>, ConnectError> {
        let mut log = lock(&self.shared.log);
        log.connects += 1;
        if log.connect_failures > 0 {
            log.connect_failures -= 1;
            return Err(ConnectError::Unreachable {
                endpoint: format!("memory://{}", subscription.topic),
                reason: "injected connect failure".into(),
            });
        }
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            position: log.low_watermark,
            epoch: log.epoch,
        }))
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    position: u64,
    epoch: u64,
}

impl MemorySession {
    fn check_epoch(&self, log: &PartitionLog) -> Result<(), FetchError> {
        if log.epoch != self.epoch {
            return Err(FetchError::SessionLost("consumer group rebalanced".into()));
        }
        Ok(())
    }
}

impl BrokerSession for MemorySession {
    fn seek(&mut self, position: StartPosition) -> Result<(), FetchError> {
        let log = lock(&self.shared.log);
        self.check_epoch(&log)?;
        self.position = match position {
            StartPosition::Earliest => log.low_watermark,
            StartPosition::Latest => log.next_offset,
            StartPosition::After(offset) => offset.saturating_add(1).max(log.low_watermark),
        };
        Ok(())
    }

    fn fetch(&mut self, max_wait: Duration) -> Result<Vec<RawRecord>, FetchError> {
        let deadline = Instant::now() + max_wait;
        let mut log = lock(&self.shared.log);
        loop {
            self.check_epoch(&log)?;
            // Retention may have moved past the position.
            self.position = self.position.max(log.low_watermark);
            let batch: Vec<RawRecord> = log
                .records
                .iter()
                .filter(|r| r.offset >= self.position)
                .take(MAX_BATCH)
                .cloned()
                .collect();
            if let Some(last) = batch.last() {
                self.position = last.offset + 1;
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (next, _) = self
                .shared
                .cv
                .wait_timeout(log, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            log = next;
        }
    }

    fn commit(&mut self, next_offset: u64) -> Result<(), FetchError> {
        let mut log = lock(&self.shared.log);
        self.check_epoch(&log)?;
        log.committed = Some(log.committed.map_or(next_offset, |c| c.max(next_offset)));
        Ok(())
    }

    fn close(self: Box<Self>) {}
}

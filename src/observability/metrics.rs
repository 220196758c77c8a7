use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct SinkCounters {
    write_failures: AtomicU64,
    /// Acked offset + 1; zero until the first acknowledgement.
    acked_next: AtomicU64,
}

/// Lock-free pipeline counters and gauges. The sink set is fixed at construction.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_applied: AtomicU64,
    events_replayed: AtomicU64,
    decode_errors: AtomicU64,
    tombstones: AtomicU64,
    snapshots_taken: AtomicU64,
    ticks_merged: AtomicU64,
    snapshots_committed: AtomicU64,
    checkpoint_next: AtomicU64,
    checkpoint_persist_failures: AtomicU64,
    broker_reconnects: AtomicU64,
    commit_lag_ms: AtomicU64,
    sinks: BTreeMap<String, SinkCounters>,
}

impl PipelineMetrics {
    pub fn new<I, S>(sink_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sinks: sink_ids
                .into_iter()
                .map(|id| (id.into(), SinkCounters::default()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn record_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.events_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tombstone(&self) {
        self.tombstones.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_taken(&self) {
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_merged(&self) {
        self.ticks_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_committed(&self, checkpoint_offset: u64) {
        self.snapshots_committed.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_next
            .fetch_max(checkpoint_offset.saturating_add(1), Ordering::Relaxed);
    }

    /// Seeds the checkpoint gauge from the checkpoint loaded at startup.
    pub fn record_resumed(&self, checkpoint_offset: u64) {
        self.checkpoint_next
            .fetch_max(checkpoint_offset.saturating_add(1), Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.checkpoint_persist_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.broker_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Time between a snapshot being taken and it becoming the durable checkpoint.
    pub fn set_commit_lag_ms(&self, lag_ms: u64) {
        self.commit_lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self, sink: &str) {
        if let Some(counters) = self.sinks.get(sink) {
            counters.write_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sink_ack(&self, sink: &str, offset: u64) {
        if let Some(counters) = self.sinks.get(sink) {
            counters
                .acked_next
                .fetch_max(offset.saturating_add(1), Ordering::Relaxed);
        }
    }

    pub fn events_applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    pub fn events_replayed(&self) -> u64 {
        self.events_replayed.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn tombstones(&self) -> u64 {
        self.tombstones.load(Ordering::Relaxed)
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken.load(Ordering::Relaxed)
    }

    pub fn ticks_merged(&self) -> u64 {
        self.ticks_merged.load(Ordering::Relaxed)
    }

    pub fn snapshots_committed(&self) -> u64 {
        self.snapshots_committed.load(Ordering::Relaxed)
    }

    pub fn checkpoint_offset(&self) -> Option<u64> {
        self.checkpoint_next.load(Ordering::Relaxed).checked_sub(1)
    }

    pub fn checkpoint_persist_failures(&self) -> u64 {
        self.checkpoint_persist_failures.load(Ordering::Relaxed)
    }

    pub fn broker_reconnects(&self) -> u64 {
        self.broker_reconnects.load(Ordering::Relaxed)
    }

    pub fn commit_lag_ms(&self) -> u64 {
        self.commit_lag_ms.load(Ordering::Relaxed)
    }

    pub fn sink_write_failures(&self, sink: &str) -> u64 {
        self.sinks
            .get(sink)
            .map_or(0, |c| c.write_failures.load(Ordering::Relaxed))
    }

    pub fn sink_acked_offset(&self, sink: &str) -> Option<u64> {
        self.sinks
            .get(sink)
            .and_then(|c| c.acked_next.load(Ordering::Relaxed).checked_sub(1))
    }

    /// Prometheus text exposition. Offsets not yet reached render as -1.
    pub fn render_metrics(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("tallyline_events_applied_total", self.events_applied()),
            ("tallyline_events_replayed_total", self.events_replayed()),
            ("tallyline_decode_errors_total", self.decode_errors()),
            ("tallyline_tombstones_total", self.tombstones()),
            ("tallyline_snapshots_taken_total", self.snapshots_taken()),
            ("tallyline_ticks_merged_total", self.ticks_merged()),
            ("tallyline_snapshots_committed_total", self.snapshots_committed()),
            (
                "tallyline_checkpoint_persist_failures_total",
                self.checkpoint_persist_failures(),
            ),
            ("tallyline_broker_reconnects_total", self.broker_reconnects()),
        ];
        for (name, value) in counters {
            let _ = writeln!(out, "# TYPE {name} counter\n{name} {value}");
        }
        let _ = writeln!(
            out,
            "# TYPE tallyline_checkpoint_offset gauge\ntallyline_checkpoint_offset {}",
            gauge(self.checkpoint_offset())
        );
        let _ = writeln!(
            out,
            "# TYPE tallyline_commit_lag_ms gauge\ntallyline_commit_lag_ms {}",
            self.commit_lag_ms()
        );
        let _ = writeln!(out, "# TYPE tallyline_sink_write_failures_total counter");
        for (id, counters) in &self.sinks {
            let _ = writeln!(
                out,
                "tallyline_sink_write_failures_total{{sink=\"{id}\"}} {}",
                counters.write_failures.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# TYPE tallyline_sink_acked_offset gauge");
        for (id, counters) in &self.sinks {
            let acked = counters.acked_next.load(Ordering::Relaxed).checked_sub(1);
            let _ = writeln!(
                out,
                "tallyline_sink_acked_offset{{sink=\"{id}\"}} {}",
                gauge(acked)
            );
        }
        out
    }
}

fn gauge(offset: Option<u64>) -> i128 {
    offset.map_or(-1, i128::from)
}

/// Extracts metric names (without labels) from Prometheus exposition text.
pub fn scrape_metric_names(exposition: &str) -> Vec<String> {
    exposition
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            trimmed
                .split(|c: char| c == '{' || c.is_whitespace())
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}

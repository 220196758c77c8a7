use crate::runtime::lock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Mutex;

pub const INGEST_HALTED_REASON: &str = "ingest_halted";
pub const CHECKPOINT_NOT_DURABLE_REASON: &str = "checkpoint_not_durable";
pub const SOURCE_DISCONNECTED_REASON: &str = "source_disconnected";
pub const SINK_STALLED_PREFIX: &str = "sink_stalled:";

/// Operator-visible readiness reasons, set and cleared by the activities.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    reasons: Mutex<BTreeSet<String>>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ingest_halted(&self, halted: bool) {
        self.toggle(INGEST_HALTED_REASON.to_string(), halted);
    }

    pub fn set_checkpoint_durable(&self, durable: bool) {
        self.toggle(CHECKPOINT_NOT_DURABLE_REASON.to_string(), !durable);
    }

    pub fn set_source_connected(&self, connected: bool) {
        self.toggle(SOURCE_DISCONNECTED_REASON.to_string(), !connected);
    }

    pub fn set_sink_stalled(&self, sink: &str, stalled: bool) {
        self.toggle(format!("{SINK_STALLED_PREFIX}{sink}"), stalled);
    }

    /// Current readiness report; reasons come back in deterministic order.
    pub fn report(&self) -> HealthReport {
        let reasons: Vec<String> = lock(&self.reasons).iter().cloned().collect();
        HealthReport {
            ready: reasons.is_empty(),
            reasons,
        }
    }

    fn toggle(&self, reason: String, present: bool) {
        let mut reasons = lock(&self.reasons);
        if present {
            reasons.insert(reason);
        } else {
            reasons.remove(&reason);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub reasons: Vec<String>,
}

impl HealthReport {
    pub fn has_reason(&self, reason: &str) -> bool {
        self.reasons.iter().any(|r| r == reason)
    }

    pub fn stalled_sinks(&self) -> Vec<&str> {
        self.reasons
            .iter()
            .filter_map(|r| r.strip_prefix(SINK_STALLED_PREFIX))
            .collect()
    }
}

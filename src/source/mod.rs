//! Source adapter: broker session management, decoding, and resume positioning.

pub mod broker;
pub mod decode;
pub mod memory;
pub mod rest_proxy;

pub use broker::{
    Broker, BrokerSession, ConnectError, FetchError, OffsetReset, RawRecord, SecurityProtocol,
    StartPosition, Subscription,
};
pub use decode::{decode_record, DecodeError, DecodeFailure, Decoded};
pub use memory::MemoryBroker;
pub use rest_proxy::{normalize_endpoint, RestProxyBroker};

use crate::event_model::change_event::ChangeEvent;
use crate::event_model::checkpoint::OffsetGate;
use crate::event_model::clock::WallClock;
use crate::observability::logging::{LogLevel, Logger};
use crate::runtime::retry::{RetryError, RetryPolicy};
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// One consumed offset, decoded or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    Event(ChangeEvent),
    Tombstone { offset: u64 },
    Undecodable(DecodeError),
}

impl SourceItem {
    pub fn offset(&self) -> u64 {
        match self {
            SourceItem::Event(event) => event.offset(),
            SourceItem::Tombstone { offset } => *offset,
            SourceItem::Undecodable(err) => err.offset,
        }
    }
}

/// Construction inputs for [`SourceAdapter::connect`].
pub struct SourceOptions {
    pub subscription: Subscription,
    /// Durable checkpoint offset; delivery starts strictly after it.
    pub resume_after: Option<u64>,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn WallClock>,
    pub cancel: Arc<AtomicBool>,
    pub logger: Logger,
}

/// Owns the broker session and yields offsets in ascending order exactly once,
/// across reconnects and rebalances.
pub struct SourceAdapter {
    broker: Box<dyn Broker>,
    session: Option<Box<dyn BrokerSession>>,
    subscription: Subscription,
    initial_position: StartPosition,
    retry: RetryPolicy,
    clock: Arc<dyn WallClock>,
    cancel: Arc<AtomicBool>,
    logger: Logger,
    buffered: VecDeque<RawRecord>,
    last_delivered: Option<u64>,
    committed_next: Option<u64>,
    reconnects: u64,
}

impl SourceAdapter {
    /// Connects with retry and seeks to the resume position.
    pub fn connect(broker: Box<dyn Broker>, options: SourceOptions) -> Result<Self, ConnectError> {
        let initial_position = match options.resume_after {
            Some(offset) => StartPosition::After(offset),
            None => options.subscription.offset_reset.start_position(),
        };
        let mut adapter = Self {
            broker,
            session: None,
            subscription: options.subscription,
            initial_position,
            retry: options.retry,
            clock: options.clock,
            cancel: options.cancel,
            logger: options.logger.scoped("source"),
            buffered: VecDeque::new(),
            last_delivered: None,
            committed_next: options.resume_after.map(|offset| offset + 1),
            reconnects: 0,
        };
        adapter.establish()?;
        adapter.logger.info(
            "adapter",
            &format!(
                "subscribed to {} as group {} starting {:?}",
                adapter.subscription.topic, adapter.subscription.group_id, initial_position
            ),
        );
        Ok(adapter)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn last_delivered(&self) -> Option<u64> {
        self.last_delivered
    }

    /// Next consumed offset, waiting up to `max_wait`. `Ok(None)` when nothing
    /// arrived or the session was just re-established.
    pub fn poll(&mut self, max_wait: Duration) -> Result<Option<SourceItem>, ConnectError> {
        loop {
            while let Some(record) = self.buffered.pop_front() {
                if self.last_delivered.is_some_and(|last| record.offset <= last) {
                    continue;
                }
                self.last_delivered = Some(record.offset);
                return Ok(Some(self.decode(&record)));
            }
            if self.session.is_none() {
                self.establish()?;
                return Ok(None);
            }
            let fetched = match self.session.as_mut() {
                Some(session) => session.fetch(max_wait),
                None => continue,
            };
            match fetched {
                Ok(records) if records.is_empty() => return Ok(None),
                Ok(records) => self.buffered.extend(records),
                Err(err) => {
                    self.logger
                        .log(LogLevel::Warn, "adapter", self.last_delivered, &err.to_string());
                    self.drop_session();
                    self.reconnects += 1;
                    self.establish()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Commits the group position up to the durable checkpoint, never beyond it.
    /// Returns whether a commit was sent.
    pub fn commit_durable(&mut self, gate: &OffsetGate) -> Result<bool, FetchError> {
        let Some(durable) = gate.durable_offset() else {
            return Ok(false);
        };
        let next = durable + 1;
        if self.committed_next.is_some_and(|committed| committed >= next) {
            return Ok(false);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        session.commit(next)?;
        self.committed_next = Some(next);
        Ok(true)
    }

    /// Releases the broker session.
    pub fn close(mut self) {
        self.drop_session();
        self.logger.info("adapter", "broker session closed");
    }

    fn decode(&self, record: &RawRecord) -> SourceItem {
        match decode_record(record, self.clock.now_ms()) {
            Ok(Decoded::Event(event)) => SourceItem::Event(event),
            Ok(Decoded::Tombstone) => SourceItem::Tombstone {
                offset: record.offset,
            },
            Err(err) => SourceItem::Undecodable(err),
        }
    }

    fn drop_session(&mut self) {
        self.buffered.clear();
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    /// Connects and seeks after the last delivered offset, or to the initial position.
    fn establish(&mut self) -> Result<(), ConnectError> {
        let position = self
            .last_delivered
            .map_or(self.initial_position, StartPosition::After);
        let broker = &mut self.broker;
        let subscription = &self.subscription;
        let logger = &self.logger;
        let result = self.retry.run(&self.cancel, |attempt| {
            let mut session = broker.connect(subscription).map_err(|err| err.to_string())?;
            if let Err(err) = session.seek(position) {
                session.close();
                return Err(err.to_string());
            }
            if attempt > 1 {
                logger.info("adapter", &format!("connected after {attempt} attempts"));
            }
            Ok(session)
        });
        match result {
            Ok(attempted) => {
                self.session = Some(attempted.value);
                Ok(())
            }
            Err(RetryError::Cancelled { .. }) => Err(ConnectError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                self.logger.error(
                    "adapter",
                    &format!("broker unreachable after {attempts} attempts: {last}"),
                );
                Err(ConnectError::Exhausted { attempts, last })
            }
        }
    }
}

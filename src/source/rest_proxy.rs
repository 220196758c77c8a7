//! Kafka REST Proxy (v2 API) consumer over blocking HTTP.

use super::broker::{
    Broker, BrokerSession, ConnectError, FetchError, RawRecord, SecurityProtocol, StartPosition,
    Subscription,
};
use base64::{engine::general_purpose, Engine as _};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const V2_JSON: &str = "application/vnd.kafka.v2+json";
const V2_BINARY: &str = "application/vnd.kafka.binary.v2+json";
const PARTITION: u32 = 0;
const MAX_FETCH_BYTES: u64 = 1 << 20;

/// Prefixes bare `host:port` entries with the scheme implied by the security mode.
pub fn normalize_endpoint(raw: &str, security: SecurityProtocol) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", security.scheme(), trimmed)
    }
}

/// Creates one consumer instance per session; endpoints are tried in order.
#[derive(Debug, Clone)]
pub struct RestProxyBroker {
    client: Client,
    endpoints: Vec<String>,
}

impl RestProxyBroker {
    pub fn new(
        urls: &[String],
        security: SecurityProtocol,
        request_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let endpoints: Vec<String> = urls
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| normalize_endpoint(entry, security))
            .collect();
        if endpoints.is_empty() {
            return Err(ConnectError::NoEndpoints);
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ConnectError::Unreachable {
                endpoint: endpoints[0].clone(),
                reason: format!("http client build failed: {err}"),
            })?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn open(&self, endpoint: &str, subscription: &Subscription) -> Result<RestProxySession, ConnectError> {
        let unreachable = |reason: String| ConnectError::Unreachable {
            endpoint: endpoint.to_string(),
            reason,
        };
        let request = WireCreateConsumer {
            name: instance_name(),
            format: "binary",
            auto_offset_reset: subscription.offset_reset.as_str(),
            auto_commit_enable: "false",
        };
        let response = self
            .client
            .post(format!("{endpoint}/consumers/{}", subscription.group_id))
            .header("Content-Type", V2_JSON)
            .json(&request)
            .send()
            .map_err(|err| unreachable(format!("create consumer failed: {err}")))?;
        if !response.status().is_success() {
            return Err(ConnectError::Rejected {
                topic: subscription.topic.clone(),
                reason: format!("create consumer returned status {}", response.status()),
            });
        }
        let created: WireConsumerCreated = response
            .json()
            .map_err(|err| unreachable(format!("create consumer decode failed: {err}")))?;
        let session = RestProxySession {
            client: self.client.clone(),
            base_uri: created.base_uri,
            topic: subscription.topic.clone(),
        };
        let assignment = WireAssignments {
            partitions: vec![session.partition()],
        };
        let status = session
            .client
            .post(format!("{}/assignments", session.base_uri))
            .header("Content-Type", V2_JSON)
            .json(&assignment)
            .send()
            .map_err(|err| unreachable(format!("assignment failed: {err}")))?
            .status();
        if !status.is_success() {
            Box::new(session).close();
            return Err(ConnectError::Rejected {
                topic: subscription.topic.clone(),
                reason: format!("assignment returned status {status}"),
            });
        }
        Ok(session)
    }
}

impl Broker for RestProxyBroker {
    fn connect(&mut self, subscription: &Subscription) -> Result<Box<dyn BrokerSession>, ConnectError> {
        let mut last = ConnectError::NoEndpoints;
        for endpoint in &self.endpoints {
            match self.open(endpoint, subscription) {
                Ok(session) => return Ok(Box::new(session)),
                Err(err @ ConnectError::Rejected { .. }) => return Err(err),
                Err(err) => last = err,
            }
        }
        Err(last)
    }
}

struct RestProxySession {
    client: Client,
    base_uri: String,
    topic: String,
}

impl RestProxySession {
    fn partition(&self) -> WirePartition {
        WirePartition {
            topic: self.topic.clone(),
            partition: PARTITION,
        }
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, FetchError> {
        let response = request
            .send()
            .map_err(|err| FetchError::Transport(format!("{what} failed: {err}")))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(FetchError::SessionLost(format!(
                "{what}: consumer instance {} no longer exists",
                self.base_uri
            ))),
            status => Err(FetchError::Transport(format!("{what} returned status {status}"))),
        }
    }
}

impl BrokerSession for RestProxySession {
    fn seek(&mut self, position: StartPosition) -> Result<(), FetchError> {
        let partitions = || {
            WireSeek::Partitions(WireAssignments {
                partitions: vec![self.partition()],
            })
        };
        let (route, body) = match position {
            StartPosition::Earliest => ("positions/beginning", partitions()),
            StartPosition::Latest => ("positions/end", partitions()),
            StartPosition::After(offset) => (
                "positions",
                WireSeek::Offsets(WireOffsets {
                    offsets: vec![self.offset_entry(offset.saturating_add(1))],
                }),
            ),
        };
        let request = self
            .client
            .post(format!("{}/{route}", self.base_uri))
            .header("Content-Type", V2_JSON)
            .json(&body);
        self.send(request, "seek")?;
        Ok(())
    }

    fn fetch(&mut self, max_wait: Duration) -> Result<Vec<RawRecord>, FetchError> {
        let request = self
            .client
            .get(format!("{}/records", self.base_uri))
            .query(&[
                ("timeout", max_wait.as_millis() as u64),
                ("max_bytes", MAX_FETCH_BYTES),
            ])
            .header("Accept", V2_BINARY);
        let records: Vec<WireRecord> = self
            .send(request, "fetch")?
            .json()
            .map_err(|err| FetchError::Transport(format!("fetch decode failed: {err}")))?;
        records.into_iter().map(RawRecord::try_from).collect()
    }

    fn commit(&mut self, next_offset: u64) -> Result<(), FetchError> {
        let request = self
            .client
            .post(format!("{}/offsets", self.base_uri))
            .header("Content-Type", V2_JSON)
            .json(&WireOffsets {
                offsets: vec![self.offset_entry(next_offset)],
            });
        self.send(request, "commit")?;
        Ok(())
    }

    fn close(self: Box<Self>) {
        // Best effort; the proxy reaps idle instances on its own.
        let _ = self
            .client
            .delete(self.base_uri.as_str())
            .header("Content-Type", V2_JSON)
            .send();
    }
}

impl RestProxySession {
    fn offset_entry(&self, offset: u64) -> WireOffset {
        WireOffset {
            topic: self.topic.clone(),
            partition: PARTITION,
            offset,
        }
    }
}

fn instance_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("tallyline-{}-{nanos:08x}", process::id())
}

#[derive(Debug, Serialize)]
struct WireCreateConsumer {
    name: String,
    format: &'static str,
    #[serde(rename = "auto.offset.reset")]
    auto_offset_reset: &'static str,
    #[serde(rename = "auto.commit.enable")]
    auto_commit_enable: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireConsumerCreated {
    #[allow(dead_code)]
    instance_id: String,
    base_uri: String,
}

#[derive(Debug, Serialize)]
struct WirePartition {
    topic: String,
    partition: u32,
}

#[derive(Debug, Serialize)]
struct WireAssignments {
    partitions: Vec<WirePartition>,
}

#[derive(Debug, Serialize)]
struct WireOffset {
    topic: String,
    partition: u32,
    offset: u64,
}

#[derive(Debug, Serialize)]
struct WireOffsets {
    offsets: Vec<WireOffset>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireSeek {
    Partitions(WireAssignments),
    Offsets(WireOffsets),
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    offset: u64,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
}

impl TryFrom<WireRecord> for RawRecord {
    type Error = FetchError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let decode = |field: Option<String>| -> Result<Option<Vec<u8>>, FetchError> {
            field
                .map(|encoded| {
                    general_purpose::STANDARD.decode(encoded).map_err(|err| {
                        FetchError::Transport(format!(
                            "record {} carries invalid base64: {err}",
                            wire.offset
                        ))
                    })
                })
                .transpose()
        };
        Ok(RawRecord {
            offset: wire.offset,
            key: decode(wire.key)?,
            value: decode(wire.value)?,
            timestamp_ms: wire.timestamp,
        })
    }
}

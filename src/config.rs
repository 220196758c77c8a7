//! Pipeline configuration: a JSON document with every field defaulted, plus
//! environment overrides matching the deployment variables.

use crate::commit::{UnchangedTickPolicy, DEFAULT_COMMIT_INTERVAL_MS};
use crate::event_model::aggregate::AggregationPolicy;
use crate::observability::logging::{LogLevel, LogRotationPolicy};
use crate::runtime::retry::RetryPolicy;
use crate::sink::{SinkDestination, SinkKind, SinkTarget, DEFAULT_DOCUMENT_ID};
use crate::source::{OffsetReset, SecurityProtocol, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "TALLYLINE_CONFIG";
pub const REST_PROXY_URL_ENV: &str = "TALLYLINE_REST_PROXY_URL";
pub const DEFAULT_TOPIC: &str = "mongo.test.values";
pub const DEFAULT_GROUP_ID: &str = "0";
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 6_000;
pub const DEFAULT_CHECKPOINT_PATH: &str = "tallyline.checkpoint.json";
pub const DEFAULT_APPEND_LOG_PATH: &str = "output_stream.jsonl";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("environment variable {var} is invalid: {reason}")]
    InvalidEnv { var: &'static str, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub commit: CommitConfig,
    pub aggregation: AggregationConfig,
    pub checkpoint: CheckpointConfig,
    pub sinks: Vec<SinkTarget>,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            commit: CommitConfig::default(),
            aggregation: AggregationConfig::default(),
            checkpoint: CheckpointConfig::default(),
            sinks: vec![
                SinkTarget {
                    id: "mongo".into(),
                    destination: SinkDestination::MutableStore {
                        uri: "file://store".into(),
                        database: "mongo".into(),
                        collection: "test".into(),
                        document_id: DEFAULT_DOCUMENT_ID.into(),
                    },
                },
                SinkTarget {
                    id: "output_stream".into(),
                    destination: SinkDestination::AppendLog {
                        path: PathBuf::from(DEFAULT_APPEND_LOG_PATH),
                    },
                },
            ],
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Kafka REST Proxy base URLs, tried in order. Bare `host:port` entries
    /// take their scheme from `security_protocol`.
    pub rest_proxy_urls: Vec<String>,
    pub security_protocol: SecurityProtocol,
    pub group_id: String,
    /// `<database>.<schema-or-db-name>.<table>`
    pub topic: String,
    pub session_timeout_ms: u64,
    pub offset_reset: OffsetReset,
    /// HTTP timeout for proxy requests; also bounds mongodb server selection.
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rest_proxy_urls: vec!["http://localhost:8082".into()],
            security_protocol: SecurityProtocol::Plaintext,
            group_id: DEFAULT_GROUP_ID.into(),
            topic: DEFAULT_TOPIC.into(),
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            offset_reset: OffsetReset::Earliest,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommitConfig {
    pub interval_ms: u64,
    pub unchanged_ticks: UnchangedTickPolicy,
    pub shutdown_grace_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_COMMIT_INTERVAL_MS,
            unchanged_ticks: UnchangedTickPolicy::Skip,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationConfig {
    pub policy: AggregationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub connect: RetryPolicy,
    pub sink: RetryPolicy,
    pub checkpoint: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogTarget {
    #[default]
    Stderr,
    File {
        path: PathBuf,
        #[serde(default)]
        rotation: LogRotationPolicy,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub target: LogTarget,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            target: LogTarget::Stderr,
        }
    }
}

impl PipelineConfig {
    /// Reads the JSON file at `path`, or starts from defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let payload = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&payload).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies environment overrides through `lookup` (usually `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        if let Some(urls) = get(REST_PROXY_URL_ENV) {
            self.broker.rest_proxy_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(group) = get("KAFKA_GROUP_ID") {
            self.broker.group_id = group;
        }
        if let Some(topic) = get("DEBEZIUM_TOPIC") {
            self.broker.topic = topic;
        }
        if let Some(protocol) = get("KAFKA_SECURITY_PROTOCOL") {
            self.broker.security_protocol = match protocol.to_ascii_lowercase().as_str() {
                "plaintext" => SecurityProtocol::Plaintext,
                "ssl" => SecurityProtocol::Ssl,
                other => {
                    return Err(ConfigError::InvalidEnv {
                        var: "KAFKA_SECURITY_PROTOCOL",
                        reason: format!("expected plaintext or ssl, got `{other}`"),
                    })
                }
            };
        }
        if let Some(uri) = get("MONGO_URI") {
            for target in &mut self.sinks {
                if let SinkDestination::MutableStore { uri: current, .. } = &mut target.destination {
                    *current = uri.clone();
                }
            }
        }
        if let Some(path) = get("TALLYLINE_APPEND_LOG_PATH") {
            for target in &mut self.sinks {
                if let SinkDestination::AppendLog { path: current } = &mut target.destination {
                    *current = PathBuf::from(&path);
                }
            }
        }
        if let Some(path) = get("TALLYLINE_CHECKPOINT_PATH") {
            self.checkpoint.path = PathBuf::from(path);
        }
        if let Some(level) = get("TALLYLINE_LOG_LEVEL") {
            self.logging.level = parse_level(&level).ok_or_else(|| ConfigError::InvalidEnv {
                var: "TALLYLINE_LOG_LEVEL",
                reason: format!("unknown level `{level}`"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.rest_proxy_urls.iter().all(|s| s.trim().is_empty()) {
            return Err(invalid("broker.rest_proxy_urls must list at least one endpoint"));
        }
        if broker.group_id.trim().is_empty() {
            return Err(invalid("broker.group_id must not be empty"));
        }
        if !is_cdc_topic(&broker.topic) {
            return Err(ConfigError::Invalid(format!(
                "broker.topic `{}` must follow <database>.<schema-or-db-name>.<table>",
                broker.topic
            )));
        }
        if broker.session_timeout_ms == 0 || broker.request_timeout_ms == 0 {
            return Err(invalid("broker timeouts must be > 0"));
        }
        if self.commit.interval_ms == 0 {
            return Err(invalid("commit.interval_ms must be > 0"));
        }
        for (name, policy) in [
            ("connect", &self.retry.connect),
            ("sink", &self.retry.sink),
            ("checkpoint", &self.retry.checkpoint),
        ] {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retry.{name}.max_attempts must be > 0"
                )));
            }
        }
        let mut ids = BTreeSet::new();
        for target in &self.sinks {
            if target.id.trim().is_empty() {
                return Err(invalid("sink ids must not be empty"));
            }
            if !ids.insert(target.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sink id `{}`",
                    target.id
                )));
            }
        }
        for kind in [SinkKind::MutableStore, SinkKind::AppendLog] {
            let count = self.sinks.iter().filter(|t| t.kind() == kind).count();
            if count != 1 {
                return Err(ConfigError::Invalid(format!(
                    "exactly one {kind} sink is required, found {count}"
                )));
            }
        }
        Ok(())
    }

    pub fn subscription(&self) -> Subscription {
        Subscription {
            topic: self.broker.topic.clone(),
            group_id: self.broker.group_id.clone(),
            session_timeout: Duration::from_millis(self.broker.session_timeout_ms),
            offset_reset: self.broker.offset_reset,
        }
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.commit.shutdown_grace_ms)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

fn is_cdc_topic(topic: &str) -> bool {
    let segments: Vec<&str> = topic.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.trim().is_empty())
}

fn parse_level(raw: &str) -> Option<LogLevel> {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

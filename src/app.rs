//! Process entrypoint: configuration, wiring, and signal-driven shutdown.

use crate::config::{LogTarget, PipelineConfig, CONFIG_PATH_ENV, REST_PROXY_URL_ENV};
use crate::event_model::checkpoint::FileCheckpointStore;
use crate::event_model::clock::{SystemWallClock, WallClock};
use crate::observability::logging::{JsonLineLogger, Logger};
use crate::runtime::pipeline::{Pipeline, PipelineParts};
use crate::sink::{open_sink, SinkEnvironment, SnapshotSink};
use crate::source::RestProxyBroker;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

/// Loads configuration, starts the pipeline, and runs until interrupted.
pub fn run() -> Result<()> {
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from);
    let mut config = PipelineConfig::load(config_path.as_deref())?;
    config.apply_env(|var| env::var(var).ok())?;
    config.validate()?;

    let clock: Arc<dyn WallClock> = Arc::new(SystemWallClock);
    let logger = Logger::new(build_log_sink(&config)?, clock.clone());
    logger.set_level(config.logging.level);
    let logger = logger.scoped("app");

    let broker = RestProxyBroker::new(
        &config.broker.rest_proxy_urls,
        config.broker.security_protocol,
        config.request_timeout(),
    )?;
    let environment = SinkEnvironment {
        request_timeout: Some(config.request_timeout()),
    };
    let sinks = config
        .sinks
        .iter()
        .map(|target| {
            open_sink(target, &environment).with_context(|| format!("failed to open sink {}", target.id))
        })
        .collect::<Result<Vec<Box<dyn SnapshotSink>>>>()?;

    let mut parts = PipelineParts::new(
        Box::new(broker),
        config.subscription(),
        sinks,
        Box::new(FileCheckpointStore::new(&config.checkpoint.path)),
        clock,
        logger.clone(),
    );
    parts.policy = config.aggregation.policy;
    parts.commit_interval = config.commit_interval();
    parts.unchanged_ticks = config.commit.unchanged_ticks;
    parts.connect_retry = config.retry.connect;
    parts.sink_retry = config.retry.sink;
    parts.checkpoint_retry = config.retry.checkpoint;

    logger.info(
        "lifecycle",
        &format!(
            "consuming {} as group {} via {}",
            config.broker.topic,
            config.broker.group_id,
            config.broker.rest_proxy_urls.join(",")
        ),
    );
    if env::var_os("KAFKA_BOOTSTRAP_SERVERS").is_some() {
        logger.warn(
            "config",
            &format!("KAFKA_BOOTSTRAP_SERVERS is ignored; set {REST_PROXY_URL_ENV} to the REST proxy"),
        );
    }
    let handle = Pipeline::start(parts)?;

    wait_for_interrupt()?;
    let report = handle.shutdown(config.shutdown_grace())?;
    if !report.durable {
        anyhow::bail!(
            "stopped with a non-durable checkpoint; last durable offset {:?}",
            report.final_checkpoint.map(|cp| cp.offset)
        );
    }
    Ok(())
}

fn build_log_sink(config: &PipelineConfig) -> Result<JsonLineLogger> {
    let sink = match &config.logging.target {
        LogTarget::Stderr => JsonLineLogger::stderr(),
        LogTarget::File { path, rotation } => JsonLineLogger::file(path, *rotation)
            .with_context(|| format!("failed to open log file {}", path.display()))?,
    };
    Ok(sink)
}

fn wait_for_interrupt() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for interrupt")
}

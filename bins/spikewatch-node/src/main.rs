//! spikewatch detector daemon.
//!
//! Opens the RocksDB sample store, runs detection cycles on a fixed delay,
//! logs spike events, and serves inspection queries over JSON-RPC.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use spikewatch_core::traits::EventSink;
use spikewatch_detect::config::OverlapPolicy;
use spikewatch_node_lib::sink::write_envelopes;
use spikewatch_node_lib::{
    start_rpc_server, ChannelSink, Detector, LogSink, MultiSink, NodeConfig, RocksStore,
};
use tokio::sync::watch;
use tracing::{info, warn};

/// spikewatch: listener-count spike detection for live audio feeds.
#[derive(Parser, Debug)]
#[command(
    name = "spikewatch-node",
    version,
    about = "Spike detector daemon with RocksDB storage and JSON-RPC server"
)]
struct Args {
    /// TOML config file; SPIKEWATCH_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for sample and state storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Disable the JSON-RPC server
    #[arg(long)]
    no_rpc: bool,

    /// Seconds between the end of one cycle and the start of the next
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// What an active feed does when spike and recovery both hold
    /// ("favor-active" or "favor-recovery")
    #[arg(long)]
    overlap_policy: Option<String>,

    /// Append every spike event as a JSON line to this file
    #[arg(long)]
    events_file: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SPIKEWATCH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, env = "SPIKEWATCH_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    /// Layer CLI flags over the file/env configuration.
    fn into_config(self) -> anyhow::Result<(NodeConfig, Flags)> {
        let mut config =
            NodeConfig::load(self.config.as_deref()).context("failed to load configuration")?;

        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(bind) = self.rpc_bind {
            config.rpc_bind = bind;
        }
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(path) = self.events_file {
            config.events_file = Some(path);
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = self.overlap_policy {
            config.detect.overlap_policy = policy
                .parse::<OverlapPolicy>()
                .context("invalid --overlap-policy")?;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }

        config.validate().context("invalid configuration")?;
        Ok((
            config,
            Flags {
                no_rpc: self.no_rpc,
                once: self.once,
            },
        ))
    }
}

struct Flags {
    no_rpc: bool,
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, flags) = Args::parse().into_config()?;

    init_logging(&config.log_level, &config.log_format);

    info!("spikewatch node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("poll_interval: {}s", config.poll_interval.as_secs());
    info!(
        robust_z = config.detect.robust_z_threshold,
        recovery_z = config.detect.recovery_z_threshold,
        global_z = config.detect.global_robust_z_threshold,
        persist = config.detect.persist_samples,
        min_samples = config.detect.min_samples,
        bucket_size = config.detect.bucket_size,
        "detection thresholds"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data_dir {:?}", config.data_dir))?;

    let store = Arc::new(RocksStore::open(config.db_path()).context("failed to open store")?);
    let mut sink = MultiSink::default();
    sink.push(Arc::new(LogSink));
    let events_task = match &config.events_file {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open events file {path:?}"))?;
            let (queue, rx) = ChannelSink::new(config.event_queue_capacity);
            sink.push(Arc::new(queue));
            info!("writing spike events to {path:?}");
            Some(tokio::spawn(write_envelopes(rx, file)))
        }
        None => None,
    };
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let detector = Arc::new(Detector::new(store.clone(), store.clone(), sink, &config));

    if flags.once {
        let report = detector
            .run_cycle(chrono::Utc::now())
            .await
            .context("cycle failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        drop(detector);
        finish_events(events_task).await;
        return Ok(());
    }

    let rpc_handle = if flags.no_rpc {
        None
    } else {
        let handle = start_rpc_server(&config.rpc_addr(), detector.clone())
            .await
            .with_context(|| format!("failed to start RPC server on {}", config.rpc_addr()))?;
        info!("RPC server listening on {}", config.rpc_addr());
        Some(handle)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn({
        let detector = detector.clone();
        async move { detector.run(shutdown_rx).await }
    });

    info!("spikewatch node running (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down...");

    shutdown_tx.send(true).ok();
    if let Err(e) = loop_handle.await {
        warn!("detector task ended abnormally: {e}");
    }

    if let Some(handle) = rpc_handle {
        handle.stop().ok();
        handle.stopped().await;
        info!("RPC server stopped");
    }
    // Last sender goes with the detector; the writer then drains and exits.
    drop(detector);
    finish_events(events_task).await;
    if let Err(e) = store.flush() {
        warn!("final flush failed: {e}");
    }
    info!("spikewatch node shutdown complete");
    Ok(())
}

/// Wait for the events file writer to drain its queue.
async fn finish_events(task: Option<tokio::task::JoinHandle<std::io::Result<usize>>>) {
    let Some(task) = task else {
        return;
    };
    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(Ok(Ok(written))) => info!("events file writer done ({written} events)"),
        Ok(Ok(Err(e))) => warn!("events file write failed: {e}"),
        Ok(Err(e)) => warn!("events file writer ended abnormally: {e}"),
        Err(_) => warn!("events file writer did not finish in time"),
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`. Pass `format = "json"` for
/// structured JSON output; anything else gives human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

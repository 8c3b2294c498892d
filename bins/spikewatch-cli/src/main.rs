//! spikewatch-cli: sample import and detector queries.
//!
//! `import` loads JSON-lines samples into the RocksDB store (the daemon must
//! be stopped, RocksDB allows one writer). The other commands query a running
//! daemon over JSON-RPC, except `inspect --offline`, which evaluates a feed
//! straight from the store.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use spikewatch_core::constants::DEFAULT_RPC_PORT;
use spikewatch_core::traits::{SampleSource, StateStore};
use spikewatch_core::types::{Feed, FeedId, Sample};
use spikewatch_detect::trace::inspect;
use spikewatch_node_lib::{NodeConfig, RocksStore};

/// Samples per write batch during import.
const IMPORT_BATCH: usize = 1_000;

#[derive(Parser)]
#[command(name = "spikewatch-cli")]
#[command(version, about = "Import samples into and query a spikewatch detector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import JSON-lines samples into the local store.
    Import(ImportArgs),
    /// List all feeds.
    Feeds(RpcArgs),
    /// Show a feed's spike state.
    State(FeedArgs),
    /// Show the full decision trace of a feed.
    Inspect(InspectArgs),
    /// Show the global rank-bucket baseline of the last cycle.
    Baseline(RpcArgs),
    /// Show the detector's cycle status.
    Status(RpcArgs),
}

#[derive(Args)]
struct RpcArgs {
    /// RPC endpoint URL.
    #[arg(short, long, default_value_t = default_endpoint())]
    rpc_endpoint: String,
}

#[derive(Args)]
struct FeedArgs {
    /// Feed id.
    feed_id: String,

    #[command(flatten)]
    rpc: RpcArgs,
}

#[derive(Args)]
struct InspectArgs {
    /// Feed id.
    feed_id: String,

    /// Evaluate as of this RFC 3339 time instead of now.
    #[arg(long)]
    at: Option<String>,

    /// Read the store directly instead of asking the daemon.
    #[arg(long)]
    offline: bool,

    /// Data directory (offline mode).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// TOML config file (offline mode).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    rpc: RpcArgs,
}

#[derive(Args)]
struct ImportArgs {
    /// JSON-lines file, one sample per line; "-" reads stdin.
    file: PathBuf,

    /// Data directory (default: platform data dir / spikewatch).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// One line of an import file.
#[derive(Debug, Deserialize, PartialEq)]
struct ImportRecord {
    feed_id: String,
    timestamp: DateTime<Utc>,
    listener_count: u32,
    #[serde(default)]
    rank: Option<i32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

fn default_endpoint() -> String {
    format!("http://127.0.0.1:{DEFAULT_RPC_PORT}")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import(args) => import(args).await,
        Commands::Feeds(rpc) => print_rpc(&rpc, "listfeeds", ArrayParams::new()).await,
        Commands::State(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.feed_id)?;
            print_rpc(&args.rpc, "getspikestate", params).await
        }
        Commands::Inspect(args) if args.offline => inspect_offline(args).await,
        Commands::Inspect(args) => {
            let mut params = ArrayParams::new();
            params.insert(args.feed_id)?;
            params.insert(args.at)?;
            print_rpc(&args.rpc, "inspectfeed", params).await
        }
        Commands::Baseline(rpc) => print_rpc(&rpc, "getglobalbaseline", ArrayParams::new()).await,
        Commands::Status(rpc) => print_rpc(&rpc, "getcyclestatus", ArrayParams::new()).await,
    }
}

async fn rpc_request<T: DeserializeOwned>(
    rpc: &RpcArgs,
    method: &str,
    params: ArrayParams,
) -> Result<T> {
    let client = jsonrpsee::http_client::HttpClientBuilder::default()
        .build(&rpc.rpc_endpoint)
        .context("Failed to connect to RPC")?;
    client
        .request(method, params)
        .await
        .with_context(|| format!("RPC {method} failed"))
}

async fn print_rpc(rpc: &RpcArgs, method: &str, params: ArrayParams) -> Result<()> {
    let value: serde_json::Value = rpc_request(rpc, method, params).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn open_store(data_dir: Option<PathBuf>, config: &NodeConfig) -> Result<RocksStore> {
    let data_dir = data_dir.unwrap_or_else(|| config.data_dir.clone());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {data_dir:?}"))?;
    let config = NodeConfig {
        data_dir,
        ..config.clone()
    };
    RocksStore::open(config.db_path()).context("Failed to open store (is the daemon running?)")
}

/// Import samples from a JSON-lines file.
async fn import(args: ImportArgs) -> Result<()> {
    let config = NodeConfig::load(None).context("Failed to load configuration")?;
    let store = open_store(args.data_dir, &config)?;

    let reader: Box<dyn BufRead> = if args.file == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(&args.file)
            .with_context(|| format!("Failed to open {:?}", args.file))?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut batch = Vec::with_capacity(IMPORT_BATCH);
    let mut imported = 0usize;
    let mut known = std::collections::HashSet::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        let Some(record) = parse_line(&line).with_context(|| format!("line {}", lineno + 1))?
        else {
            continue;
        };

        let feed_id = FeedId::from(record.feed_id.as_str());
        if record.name.is_some() || !known.contains(&feed_id) {
            if record.name.is_some() || store.get_feed(&feed_id)?.is_none() {
                store.upsert_feed(&Feed {
                    feed_id: feed_id.clone(),
                    name: record.name.clone().unwrap_or_else(|| record.feed_id.clone()),
                    url: record.url.clone().unwrap_or_default(),
                })?;
            }
            known.insert(feed_id.clone());
        }

        batch.push(Sample {
            feed_id,
            timestamp: record.timestamp,
            listener_count: record.listener_count,
            rank: record.rank,
        });
        if batch.len() >= IMPORT_BATCH {
            store.insert_samples(&batch)?;
            imported += batch.len();
            batch.clear();
        }
    }
    store.insert_samples(&batch)?;
    imported += batch.len();
    store.flush()?;

    println!("imported {imported} samples for {} feeds", known.len());
    Ok(())
}

/// Parse one import line; blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Result<Option<ImportRecord>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let record: ImportRecord = serde_json::from_str(trimmed).context("invalid sample JSON")?;
    if record.feed_id.is_empty() {
        bail!("empty feed_id");
    }
    Ok(Some(record))
}

/// Evaluate a feed directly from the store.
async fn inspect_offline(args: InspectArgs) -> Result<()> {
    let config =
        NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let store = open_store(args.data_dir, &config)?;

    let now = match args.at.as_deref() {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .context("--at must be RFC 3339")?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let feed_id = FeedId::from(args.feed_id.as_str());
    let Some(feed) = store.get_feed(&feed_id)? else {
        bail!("unknown feed {feed_id}");
    };
    let detect = &config.detect;
    let samples = store.list_samples(&feed_id, detect.lookback_start(now)).await?;
    let ranked = store
        .list_global_rank_samples(detect.global_lookback_start(now))
        .await?;
    let prior = store.get_spike_state(&feed_id).await?;

    let trace = inspect(&feed, &samples, &ranked, Some(&prior), detect, now);
    println!("{}", serde_json::to_string_pretty(&trace)?);
    Ok(())
}

//! packcache command line
//!
//! Reads packs through the block cache against a filesystem or HTTP
//! backend and reports the session statistics.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  scan | read | index | inflate | warm                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │  PackReader sessions  ──▶  BlockCache  ──▶  Fs / Http backend │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use packcache::backend::{FsBackend, HttpBackend, HttpBackendConfig, PackBackend};
use packcache::cache::{BlockCache, PackIdentity, StatsSnapshot};
use packcache::config::CacheConfig;
use packcache::monitoring::StatsExporter;
use packcache::pack::ObjectId;
use packcache::reader::PackReader;
use packcache::Error;

// =============================================================================
// CLI Arguments
// =============================================================================

/// packcache - block cache for immutable pack files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML cache configuration file
    #[arg(long, env = "PACKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Block size in bytes (power of two)
    #[arg(long, env = "PACKCACHE_BLOCK_SIZE")]
    block_size: Option<u64>,

    /// Block cache capacity in bytes
    #[arg(long, env = "PACKCACHE_CAPACITY")]
    capacity: Option<u64>,

    /// Index cache capacity in bytes
    #[arg(long, env = "PACKCACHE_INDEX_CAPACITY")]
    index_capacity: Option<u64>,

    /// Number of lock shards (power of two)
    #[arg(long, env = "PACKCACHE_SHARDS")]
    shards: Option<usize>,

    /// Root directory of a filesystem backend
    #[arg(long, env = "PACKCACHE_ROOT", conflicts_with = "url")]
    root: Option<PathBuf>,

    /// Base URL of an HTTP backend
    #[arg(long, env = "PACKCACHE_URL")]
    url: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "PACKCACHE_HTTP_TIMEOUT_SECONDS", default_value = "30")]
    http_timeout_seconds: u64,

    /// Store to read from
    #[arg(long, env = "PACKCACHE_STORE", default_value = "default")]
    store: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the packs of the store
    Scan,
    /// Write a byte range of a pack to stdout
    Read {
        /// Pack name, without extension
        pack: String,
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long)]
        length: u64,
    },
    /// Summarize a pack's index and bitmap index
    Index {
        pack: String,
        /// Object id (hex) to look up
        #[arg(long)]
        object: Option<String>,
    },
    /// Inflate the compressed record at an offset and write it to stdout
    Inflate {
        pack: String,
        #[arg(long)]
        offset: u64,
    },
    /// Read every block of every pack with concurrent sessions
    Warm {
        /// Concurrent reader sessions
        #[arg(long, default_value = "4")]
        sessions: usize,
        /// Also print Prometheus text exposition
        #[arg(long)]
        prometheus: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!(
        block_size = config.block_size,
        capacity = config.cache_capacity_bytes,
        index_capacity = config.index_cache_capacity_bytes,
        shards = config.concurrency_shard_count,
        "Starting packcache"
    );

    let backend = build_backend(&args)?;
    let cache = BlockCache::new(config, backend).context("invalid cache configuration")?;

    match args.command {
        Command::Scan => scan(cache, &args.store).await,
        Command::Read { pack, offset, length } => read(cache, &args.store, &pack, offset, length).await,
        Command::Index { pack, object } => index(cache, &args.store, &pack, object.as_deref()).await,
        Command::Inflate { pack, offset } => inflate(cache, &args.store, &pack, offset).await,
        Command::Warm { sessions, prometheus } => warm(cache, &args.store, sessions, prometheus).await,
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(size) = args.block_size {
        config = config.with_block_size(size);
    }
    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
    }
    if let Some(capacity) = args.index_capacity {
        config = config.with_index_capacity(capacity);
    }
    if let Some(shards) = args.shards {
        config = config.with_shards(shards);
    }
    Ok(config)
}

fn build_backend(args: &Args) -> anyhow::Result<Arc<dyn PackBackend>> {
    match (&args.root, &args.url) {
        (Some(root), _) => Ok(Arc::new(FsBackend::new(root))),
        (None, Some(url)) => {
            let backend = HttpBackend::new(HttpBackendConfig {
                base_url: url.clone(),
                request_timeout: Duration::from_secs(args.http_timeout_seconds),
            })?;
            Ok(Arc::new(backend))
        }
        (None, None) => bail!("either --root or --url is required"),
    }
}

fn print_stats(stats: &StatsSnapshot) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(stats)?;
    eprintln!("{}", json);
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn scan(cache: BlockCache, store: &str) -> anyhow::Result<()> {
    let mut reader = PackReader::new(cache.clone(), store);
    let mut listing = Vec::new();
    for pack in reader.scan_packs().await? {
        let size = cache.pack_size(&pack).await?;
        listing.push((pack, size));
    }

    let mut out = std::io::stdout().lock();
    for (pack, size) in &listing {
        writeln!(out, "{}\t{}", pack.pack_name(), size)?;
    }
    drop(out);

    print_stats(&reader.stats())
}

async fn read(cache: BlockCache, store: &str, pack: &str, offset: u64, length: u64) -> anyhow::Result<()> {
    let mut reader = PackReader::new(cache, store);
    let pack = PackIdentity::new(store, pack);
    let data = reader
        .read_range(&pack, offset, length)
        .await
        .with_context(|| format!("failed to read {}", pack))?;

    std::io::stdout().lock().write_all(&data)?;
    print_stats(&reader.stats())
}

async fn index(cache: BlockCache, store: &str, pack: &str, object: Option<&str>) -> anyhow::Result<()> {
    let mut reader = PackReader::new(cache, store);
    let pack = PackIdentity::new(store, pack);

    let idx = reader.get_index(&pack).await?;
    let bitmap = reader.get_bitmap(&pack).await?;

    let mut out = std::io::stdout().lock();
    writeln!(out, "pack:           {}", pack)?;
    writeln!(out, "objects:        {}", idx.object_count())?;
    writeln!(out, "large offsets:  {}", idx.large_offset_count())?;
    writeln!(out, "pack checksum:  {}", idx.pack_checksum())?;
    match &bitmap {
        Some(bitmap) => {
            writeln!(out, "bitmaps:        {}", bitmap.entry_count())?;
            writeln!(out, "commits:        {}", bitmap.commits().cardinality())?;
            writeln!(out, "trees:          {}", bitmap.trees().cardinality())?;
            writeln!(out, "blobs:          {}", bitmap.blobs().cardinality())?;
            writeln!(out, "tags:           {}", bitmap.tags().cardinality())?;
        }
        None => writeln!(out, "bitmaps:        none")?,
    }

    if let Some(hex) = object {
        let id = ObjectId::from_hex(hex).with_context(|| format!("invalid object id {}", hex))?;
        match idx.find_offset(&id) {
            Some(offset) => writeln!(out, "{}  offset {}", id, offset)?,
            None => writeln!(out, "{}  not in pack", id)?,
        }
    }
    drop(out);

    print_stats(&reader.stats())
}

async fn inflate(cache: BlockCache, store: &str, pack: &str, offset: u64) -> anyhow::Result<()> {
    let mut reader = PackReader::new(cache, store);
    let pack = PackIdentity::new(store, pack);
    let data = reader
        .inflate_at(&pack, offset)
        .await
        .with_context(|| format!("failed to inflate {} at {}", pack, offset))?;

    std::io::stdout().lock().write_all(&data)?;
    print_stats(&reader.stats())
}

async fn warm(cache: BlockCache, store: &str, sessions: usize, prometheus: bool) -> anyhow::Result<()> {
    let mut scanner = PackReader::new(cache.clone(), store);
    let packs = Arc::new(scanner.scan_packs().await?);
    info!(packs = packs.len(), sessions, "Warming cache");

    let handles = (0..sessions.max(1)).map(|_| {
        let cache = cache.clone();
        let packs = Arc::clone(&packs);
        let store = store.to_string();
        tokio::spawn(async move { warm_session(cache, &store, &packs).await })
    });

    let mut merged = scanner.stats();
    let exporter = StatsExporter::new()?;
    exporter.record_session(&merged);
    for result in futures::future::join_all(handles).await {
        let stats = result.context("warm session panicked")??;
        exporter.record_session(&stats);
        merged = merged + stats;
    }

    println!("{}", serde_json::to_string_pretty(&merged)?);

    if prometheus {
        exporter.observe_table("block", &cache.table_stats());
        exporter.observe_table("index", &cache.index_stats());
        print!("{}", exporter.encode()?);
    }
    Ok(())
}

/// Touch every block of every pack once
async fn warm_session(cache: BlockCache, store: &str, packs: &[PackIdentity]) -> packcache::Result<StatsSnapshot> {
    let block_size = cache.config().block_size;
    let mut reader = PackReader::new(cache.clone(), store);

    for pack in packs {
        match reader.get_index(pack).await {
            Err(Error::PackNotFound { .. }) => {}
            other => {
                other?;
                reader.get_bitmap(pack).await?;
            }
        }

        let size = cache.pack_size(pack).await?;
        let mut start = 0;
        while start < size {
            let length = block_size.min(size - start);
            let handle = reader.request_block(pack, start, length).await?;
            reader.release_block(handle);
            start += length;
        }
    }
    Ok(reader.stats())
}

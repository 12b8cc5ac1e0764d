//! driftcache CLI
//!
//! Warms a file-backed cache directory from a preload manifest, the same way
//! an application does on startup, and prints what was loaded.
//!
//! ```text
//! manifest.yaml ─► LoadPlan ─► ProgressiveLoader ─► CacheOrchestrator ─► <cache-dir>/{key,bulk}
//!                                   ▲
//!                  HttpFetcher ─────┘ (base URL + path)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use driftcache::{
    CacheConfig, CacheKey, CacheOrchestrator, ConnectivitySignal, DurableBulkStore,
    DurableKeyStore, EphemeralStore, Error, HttpConfig, HttpFetcher, LoadPlan, ProgressiveLoader,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// driftcache - warm an offline cache from a preload manifest
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Preload manifest (YAML with critical/important/optional lists)
    #[arg(long, env = "DRIFTCACHE_MANIFEST")]
    manifest: PathBuf,

    /// Cache configuration file (YAML); defaults apply when omitted
    #[arg(long, env = "DRIFTCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Origin base URL that manifest paths are resolved against
    #[arg(long, env = "DRIFTCACHE_BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,

    /// Directory holding the durable tiers
    #[arg(long, env = "DRIFTCACHE_DIR", default_value = ".driftcache")]
    cache_dir: PathBuf,

    /// Link bandwidth hint in Mbps; omitted means no hint
    #[arg(long, env = "DRIFTCACHE_DOWNLINK_MBPS")]
    downlink_mbps: Option<f64>,

    /// Treat the link as offline (nothing is fetched)
    #[arg(long, env = "DRIFTCACHE_OFFLINE")]
    offline: bool,

    /// Print Prometheus metrics after loading
    #[arg(long, env = "DRIFTCACHE_METRICS")]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Manifest
// =============================================================================

/// One manifest entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ManifestItem {
    key: String,
    /// Path under the base URL; defaults to the key
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

/// Preload manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Manifest {
    critical: Vec<ManifestItem>,
    important: Vec<ManifestItem>,
    optional: Vec<ManifestItem>,
}

impl Manifest {
    fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    fn into_plan(self, fetcher: &Arc<HttpFetcher>) -> LoadPlan {
        let item = |m: ManifestItem| {
            let path = m.path.unwrap_or_else(|| m.key.clone());
            let load = fetcher.load_item(CacheKey::new(m.key), path);
            match m.category {
                Some(category) => load.category(category),
                None => load,
            }
        };

        LoadPlan {
            critical: self.critical.into_iter().map(item).collect(),
            important: self.important.into_iter().map(item).collect(),
            optional: self.optional.into_iter().map(item).collect(),
        }
    }
}

/// Printed on completion
#[derive(Serialize)]
struct Report {
    summary: driftcache::LoadSummary,
    stats: driftcache::CacheStats,
    metrics: driftcache::MetricsSnapshot,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    let manifest = Manifest::from_file(&args.manifest)?;

    info!("Starting driftcache preload");
    info!("  Base URL: {}", args.base_url);
    info!("  Cache dir: {}", args.cache_dir.display());
    info!("  Schema version: {}", config.schema_version);

    let fetcher = HttpFetcher::new(HttpConfig {
        base_url: args.base_url.clone(),
        ..HttpConfig::default()
    })?;

    let stores = &config.stores;
    let bulk = Arc::new(DurableBulkStore::open_dir(args.cache_dir.join("bulk"), stores));
    bulk.open().await;
    let cache = CacheOrchestrator::builder(config.clone())
        .ephemeral(Arc::new(EphemeralStore::from_config(stores)))
        .durable_key(Arc::new(DurableKeyStore::open_dir(
            args.cache_dir.join("key"),
            stores,
        )))
        .bulk(bulk)
        .build();

    let signal = if args.offline {
        ConnectivitySignal::offline()
    } else if let Some(mbps) = args.downlink_mbps {
        ConnectivitySignal::with_downlink(mbps)
    } else {
        ConnectivitySignal::online()
    };
    cache.monitor().report(signal);
    info!("  Network tier: {}", cache.monitor().tier());

    let purged = cache.purge_incompatible().await;
    if purged > 0 {
        info!("Purged {} entries written under another schema", purged);
    }

    let plan = manifest.into_plan(&fetcher);
    info!("Preloading {} items", plan.len());

    let loader = ProgressiveLoader::new(cache.clone());
    let summary = loader.run(plan).await;
    cache.wait_idle().await;

    if summary.failed() > 0 {
        warn!("{} items failed to load", summary.failed());
    }

    let report = Report {
        summary,
        stats: cache.stats(),
        metrics: cache.metrics().snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.metrics {
        print!("{}", cache.encode_prometheus()?);
    }

    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

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
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so the JSON report on stdout stays parseable
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

// =============================================================================
// Tests
// =============================================================================

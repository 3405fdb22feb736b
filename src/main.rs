//! ShardCache demo node
//!
//! Runs one cache process over a set of in-memory shard nodes and serves the
//! admin surface over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        shardcache node                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Admin HTTP   │───▶│ TieredCache  │───▶│ shard nodes  │       │
//! │  │ (hyper)      │    │ L1 + guard   │    │ (in-memory)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │                             ▲                    │               │
//! │                             └── broadcast bus ◀──┘               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shardcache::adapters::{BroadcastBus, InMemoryCluster};
use shardcache::admin::{AdminService, MembershipOp};
use shardcache::cache::{CacheConfig, CacheKey, NodeId, TieredCache};
use shardcache::domain::ports::{loader_fn, Loader, SystemClock};
use shardcache::error::{Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ShardCache - distributed multi-level cache node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file; flags below override it
    #[arg(long, env = "SHARDCACHE_CONFIG")]
    config: Option<String>,

    /// Comma-separated shard node ids
    #[arg(
        long,
        env = "SHARDCACHE_SHARDS",
        value_delimiter = ',',
        default_value = "shard-0,shard-1,shard-2"
    )]
    shards: Vec<String>,

    /// Virtual nodes per shard node
    #[arg(long, env = "SHARDCACHE_VIRTUAL_NODES")]
    virtual_nodes: Option<usize>,

    /// Local tier TTL in milliseconds
    #[arg(long, env = "SHARDCACHE_L1_TTL_MS")]
    l1_ttl_ms: Option<u64>,

    /// Fail reads instead of calling the loader when the cache is unavailable
    #[arg(long, env = "SHARDCACHE_FAIL_ON_DEGRADE")]
    fail_on_degrade: bool,

    /// Simulated loader latency in milliseconds
    #[arg(long, env = "SHARDCACHE_LOADER_LATENCY_MS", default_value = "50")]
    loader_latency_ms: u64,

    /// Interval between maintenance runs (purge + degraded-node probes)
    #[arg(long, env = "SHARDCACHE_MAINTENANCE_INTERVAL_SECONDS", default_value = "5")]
    maintenance_interval_seconds: u64,

    /// Admin server bind address
    #[arg(long, env = "ADMIN_ADDR", default_value = "0.0.0.0:8080")]
    admin_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)?,
            None => CacheConfig::default(),
        };
        if let Some(vnodes) = self.virtual_nodes {
            config.router.virtual_nodes = vnodes;
        }
        if let Some(ttl) = self.l1_ttl_ms {
            config.l1.ttl = Duration::from_millis(ttl);
        }
        if self.fail_on_degrade {
            config.degrade = shardcache::cache::DegradePolicy::Fail;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.cache_config()?;

    info!("Starting ShardCache node");
    info!("  Shard nodes: {}", args.shards.join(", "));
    info!("  Virtual nodes: {}", config.router.virtual_nodes);
    info!("  L1 TTL: {:?}", config.l1.ttl);
    info!("  L2 TTL: {:?}", config.l2.default_ttl);
    info!("  Degrade policy: {:?}", config.degrade);

    let clock = Arc::new(SystemClock);
    let cluster = Arc::new(InMemoryCluster::new(clock.clone()));
    let bus = Arc::new(BroadcastBus::new(config.bus.capacity));

    let mut builder = TieredCache::builder(config)
        .clock(clock)
        .bus(bus)
        .connector(cluster.clone());
    for shard in args.shards.iter().filter(|s| !s.is_empty()) {
        builder = builder.node_id(shard.as_str());
    }
    let cache = Arc::new(builder.build()?);

    let admin = Arc::new(AdminService::new(cache.clone())?);
    let loader = demo_loader(Duration::from_millis(args.loader_latency_ms));

    // Spawn maintenance
    let shutdown = CancellationToken::new();
    let maintenance_cache = cache.clone();
    let maintenance_cluster = cluster.clone();
    let maintenance_shutdown = shutdown.clone();
    let interval = Duration::from_secs(args.maintenance_interval_seconds.max(1));
    tokio::spawn(async move {
        tokio::join!(
            maintenance_cache.run_maintenance(interval, maintenance_shutdown.clone()),
            purge_cluster(maintenance_cluster, interval, maintenance_shutdown),
        );
    });

    let state = Arc::new(AppState { admin, loader });
    tokio::select! {
        result = run_admin_server(&args.admin_addr, state) => {
            if let Err(e) = &result {
                error!("Admin server error: {}", e);
            }
            shutdown.cancel();
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    }

    cache.shutdown();
    info!("ShardCache node stopped");
    Ok(())
}

// =============================================================================
// Logging Setup
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
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Demo loader
// =============================================================================

#[derive(Serialize)]
struct DemoRecord<'a> {
    key: &'a str,
    loaded_at: String,
}

/// Stands in for a database: keys starting with `missing` do not exist,
/// keys starting with `fail` make the load fail.
fn demo_loader(latency: Duration) -> Arc<dyn Loader> {
    loader_fn(move |key: CacheKey| async move {
        tokio::time::sleep(latency).await;
        let name = key.to_string();
        if name.starts_with("missing") {
            return Ok(None);
        }
        if name.starts_with("fail") {
            return Err(shardcache::LoaderError::new(format!("upstream refused {}", name)));
        }
        let record = DemoRecord {
            key: &name,
            loaded_at: chrono::Utc::now().to_rfc3339(),
        };
        serde_json::to_vec(&record)
            .map(|body| Some(Bytes::from(body)))
            .map_err(|e| shardcache::LoaderError::new(e.to_string()))
    })
}

async fn purge_cluster(cluster: Arc<InMemoryCluster>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = cluster.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired shard entries");
                }
            }
        }
    }
}

// =============================================================================
// Admin Server
// =============================================================================

struct AppState {
    admin: Arc<AdminService>,
    loader: Arc<dyn Loader>,
}

async fn run_admin_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid admin server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind admin server: {}", e)))?;

    info!("Admin server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Admin server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(&state, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Admin server connection error: {}", e);
            }
        });
    }
}

async fn handle(state: &AppState, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let admin = &state.admin;
    let path = req.uri().path().to_string();

    match (req.method(), path.as_str()) {
        (&Method::GET, "/healthz") => {
            let health = admin.health().await;
            let status = if health.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json(status, &health)
        }
        (&Method::GET, "/stats") => json(StatusCode::OK, &admin.cache_stats()),
        (&Method::GET, "/metrics") => match admin.metrics_text() {
            Ok(text) => respond(
                StatusCode::OK,
                &admin.metrics_content_type(),
                Bytes::from(text),
            ),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
        },
        (&Method::GET, "/get") => {
            let Some(key) = query_param(&req, "key") else {
                return missing_param("key");
            };
            match admin.cache().get(&CacheKey::from(key), &state.loader).await {
                Ok(Some(value)) => respond(StatusCode::OK, "application/json", value),
                Ok(None) => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::from("not found")),
                Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
            }
        }
        (&Method::POST, "/invalidate") => {
            let Some(key) = query_param(&req, "key") else {
                return missing_param("key");
            };
            match admin.invalidate(&CacheKey::from(key)).await {
                Ok(report) => json(StatusCode::OK, &report),
                Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
            }
        }
        (&Method::POST, "/shards/add") | (&Method::POST, "/shards/remove") => {
            let Some(node) = query_param(&req, "node") else {
                return missing_param("node");
            };
            let op = if path.ends_with("add") {
                MembershipOp::Add
            } else {
                MembershipOp::Remove
            };
            match admin.shard_membership(op, &NodeId::from(node)) {
                Ok(change) => json(StatusCode::OK, &change),
                Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::from("not found")),
    }
}

/// Percent-decoded value of a query parameter
fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != name {
            return None;
        }
        urlencoding::decode(&v.replace('+', " "))
            .ok()
            .map(|v| v.into_owned())
            .filter(|v| !v.is_empty())
    })
}

fn respond(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => respond(status, "application/json", Bytes::from(body)),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            Bytes::from(e.to_string()),
        ),
    }
}

fn error_response(status: StatusCode, error: &Error) -> Response<Full<Bytes>> {
    json(status, &serde_json::json!({ "error": error.to_string() }))
}

fn missing_param(name: &str) -> Response<Full<Bytes>> {
    respond(
        StatusCode::BAD_REQUEST,
        "text/plain",
        Bytes::from(format!("missing query parameter '{}'", name)),
    )
}

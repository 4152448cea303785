mod anomaly;
mod bus;
mod clustering;
mod engine;
mod features;
mod handlers;
mod health;
mod heatmap;
mod ingest_hub;
mod multilateration;
mod persistence;
mod ring;
mod smoothing;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use socketioxide::SocketIo;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use engine::{EngineConfig, SignalEngine};
use handlers::on_connect;
use ingest_hub::{start_ingest_hub, IngestHubConfig};
use persistence::{run_sink, PgSink, SinkMetrics};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

const HOUR_MS: i64 = 3_600_000;

#[derive(Clone)]
struct AppState {
    engine: Arc<SignalEngine>,
    sink_metrics: Arc<SinkMetrics>,
}

// ─── Time Sync Endpoint ───────────────────────────────────────────────────────

async fn time_sync() -> Json<serde_json::Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Json(json!({ "serverTime": now }))
}

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, uptimeSecs, pipeline, sink }

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
        "pipeline": state.engine.stats(),
        "sink": {
            "persisted": state.sink_metrics.persisted.load(Ordering::Relaxed),
            "failures": state.sink_metrics.failures.load(Ordering::Relaxed),
            "timeouts": state.sink_metrics.timeouts.load(Ordering::Relaxed),
        },
    }))
}

// ─── REST Query Surface ───────────────────────────────────────────────────────

async fn api_health_summary(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.engine.health_summary()))
}

async fn api_device_health(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({
        "deviceId": device_id,
        "health": state.engine.device_health(&device_id),
    }))
}

#[derive(Deserialize)]
struct WindowParams {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

async fn api_anomalies(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Json<serde_json::Value> {
    Json(json!(state.engine.recent_anomalies(params.hours * HOUR_MS)))
}

async fn api_regions(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.engine.regions().as_ref()))
}

#[derive(Deserialize)]
struct HeatmapParams {
    #[serde(default)]
    x0: f64,
    #[serde(default)]
    y0: f64,
    #[serde(default = "default_extent")]
    x1: f64,
    #[serde(default = "default_extent")]
    y1: f64,
    #[serde(default = "default_resolution")]
    resolution: usize,
}

fn default_extent() -> f64 {
    100.0
}

fn default_resolution() -> usize {
    100
}

async fn api_heatmap(
    State(state): State<AppState>,
    Query(p): Query<HeatmapParams>,
) -> Json<serde_json::Value> {
    Json(json!(state.engine.heatmap((p.x0, p.y0, p.x1, p.y1), p.resolution)))
}

async fn api_trajectory(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<WindowParams>,
) -> Json<serde_json::Value> {
    Json(json!({
        "deviceId": device_id,
        "points": state.engine.trajectory(&device_id, params.hours * HOUR_MS),
    }))
}

// ─── Periodic Tasks ───────────────────────────────────────────────────────────
// Each task is a single loop: no run ever overlaps the next. Panics are
// caught at the task boundary so the task resumes on its next tick.

fn run_guarded(label: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("{label} task iteration panicked — resuming on next tick");
    }
}

async fn run_clustering_task(engine: Arc<SignalEngine>, mut shutdown: watch::Receiver<bool>) {
    let interval_secs = engine.config().clustering_interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut last_run = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
        }
        // run on the fixed cadence, or early once enough fresh anomalies pile up
        if last_run.elapsed().as_secs() >= interval_secs || engine.clustering_due() {
            last_run = Instant::now();
            run_guarded("clustering", || engine.run_clustering());
        }
    }
    info!("Clustering task stopped");
}

async fn run_health_sweep_task(engine: Arc<SignalEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(engine.config().health_sweep_secs));
    ticker.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
        }
        run_guarded("health sweep", || engine.run_health_sweep());
    }
    info!("Health sweep task stopped");
}

async fn run_eviction_task(engine: Arc<SignalEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(engine.config().eviction_sweep_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
        }
        run_guarded("eviction", || engine.evict_idle());
    }
    info!("Eviction task stopped");
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Record startup time for uptime reporting
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalmesh_backend=info,socketioxide=warn".into()),
        )
        .init();

    info!("📶 SignalMesh Backend (Rust) v{} starting", env!("CARGO_PKG_VERSION"));

    // The one engine handle everything hangs off
    let engine = SignalEngine::new(EngineConfig::default());
    let sink_metrics = Arc::new(SinkMetrics::default());

    // Cooperative shutdown for periodic tasks and the sink
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // UDP ingest hub
    tokio::spawn(start_ingest_hub(IngestHubConfig::default(), engine.clone()));

    // Durable sink — optional, cloud mode only
    match std::env::var("DATABASE_URL") {
        Ok(url) => match PgSink::connect(&url).await {
            Ok(sink) => {
                tokio::spawn(run_sink(
                    sink,
                    engine.clone(),
                    sink_metrics.clone(),
                    shutdown_rx.clone(),
                ));
            }
            Err(e) => {
                warn!("Persistence disabled, could not connect: {e}");
            }
        },
        Err(_) => {
            info!("DATABASE_URL not set — persistence disabled");
        }
    }

    // Build Socket.IO layer
    let (socket_layer, io) = SocketIo::builder().build_layer();

    let engine_sock = engine.clone();
    io.ns("/", move |socket: socketioxide::extract::SocketRef| {
        let engine = engine_sock.clone();
        async move {
            on_connect(socket, engine).await;
        }
    });

    // Periodic pipeline tasks
    tokio::spawn(run_clustering_task(engine.clone(), shutdown_rx.clone()));
    tokio::spawn(run_health_sweep_task(engine.clone(), shutdown_rx.clone()));
    tokio::spawn(run_eviction_task(engine.clone(), shutdown_rx.clone()));

    // CORS — local dev defaults; cloud sets CORS_ORIGINS=*
    let cors_origins_env = std::env::var("CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string());

    let cors = if cors_origins_env.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins_env
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let state = AppState {
        engine,
        sink_metrics,
    };

    // Build Axum router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync))
        .route("/api/health-summary", get(api_health_summary))
        .route("/api/devices/:id/health", get(api_device_health))
        .route("/api/devices/:id/trajectory", get(api_trajectory))
        .route("/api/anomalies", get(api_anomalies))
        .route("/api/regions", get(api_regions))
        .route("/api/heatmap", get(api_heatmap))
        .with_state(state)
        .layer(socket_layer)
        .layer(cors);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{port}");
    info!("🚀 Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            // bounded grace period for periodic tasks to finish their iteration
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await?;

    Ok(())
}

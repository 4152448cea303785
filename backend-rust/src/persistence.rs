//! # persistence
//!
//! Durable sink for derived telemetry. The sink is strictly append-only and
//! strictly off the ingest path: a dedicated task drains bus subscriptions
//! and writes rows with a per-call timeout. Failures and timeouts are
//! counted and logged — they never propagate to producers, and the core
//! never reads anything back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use telemetry_types::{AnomalyEvent, AnomalyRegion, HealthSnapshot, ProcessedMeasurement};

use crate::bus::{BusEvent, Topic};
use crate::engine::SignalEngine;

/// Per-call write deadline.
const SINK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only persistence contract. Implementations may fail or time out
/// independently of the pipeline.
pub trait TelemetrySink: Send + Sync {
    fn persist_measurement(
        &self,
        m: &ProcessedMeasurement,
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
    fn persist_anomaly(
        &self,
        a: &AnomalyEvent,
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
    fn persist_health(
        &self,
        device_id: &str,
        h: &HealthSnapshot,
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
    fn persist_regions(
        &self,
        regions: &[AnomalyRegion],
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
}

/// Sink health counters, surfaced on `/health`.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    pub persisted: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
}

// ── PostgreSQL sink ───────────────────────────────────────────────────────────

pub struct PgSink {
    pool: PgPool,
}

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

impl PgSink {
    /// Build one pool at startup and ensure the schema exists. The pool is
    /// shared for the process lifetime — no per-operation reconnects.
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(SINK_TIMEOUT)
            .connect(database_url)
            .await?;

        for ddl in [
            "CREATE TABLE IF NOT EXISTS telemetry_measurements (
                id BIGSERIAL PRIMARY KEY,
                device_id TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                raw_rssi DOUBLE PRECISION NOT NULL,
                kalman_rssi DOUBLE PRECISION NOT NULL,
                ewma_rssi DOUBLE PRECISION NOT NULL,
                anomaly_score DOUBLE PRECISION NOT NULL,
                position_x DOUBLE PRECISION,
                position_y DOUBLE PRECISION
            )",
            "CREATE TABLE IF NOT EXISTS telemetry_anomalies (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                detail TEXT
            )",
            "CREATE TABLE IF NOT EXISTS device_health (
                id BIGSERIAL PRIMARY KEY,
                device_id TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                risk TEXT NOT NULL,
                predicted_failure_at TIMESTAMPTZ,
                snapshot JSONB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS anomaly_regions (
                id BIGSERIAL PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL,
                region JSONB NOT NULL
            )",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        info!("Persistence sink connected (PostgreSQL)");
        Ok(Self { pool })
    }
}

impl TelemetrySink for PgSink {
    async fn persist_measurement(&self, m: &ProcessedMeasurement) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO telemetry_measurements
                (device_id, recorded_at, raw_rssi, kalman_rssi, ewma_rssi,
                 anomaly_score, position_x, position_y)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&m.device_id)
        .bind(ts(m.timestamp))
        .bind(m.raw_rssi)
        .bind(m.kalman_rssi)
        .bind(m.ewma_rssi)
        .bind(m.anomaly_score)
        .bind(m.position.as_ref().map(|p| p.x))
        .bind(m.position.as_ref().map(|p| p.y))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_anomaly(&self, a: &AnomalyEvent) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO telemetry_anomalies
                (id, device_id, recorded_at, score, kind, severity, detail)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&a.id)
        .bind(&a.device_id)
        .bind(ts(a.timestamp))
        .bind(a.score)
        .bind(enum_str(&a.kind))
        .bind(enum_str(&a.severity))
        .bind(&a.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_health(&self, device_id: &str, h: &HealthSnapshot) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO device_health
                (device_id, updated_at, score, risk, predicted_failure_at, snapshot)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(device_id)
        .bind(ts(h.updated_at))
        .bind(h.score)
        .bind(enum_str(&h.risk))
        .bind(h.predicted_failure_at.map(ts))
        .bind(serde_json::to_value(h).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_regions(&self, regions: &[AnomalyRegion]) -> Result<(), SinkError> {
        for region in regions {
            sqlx::query("INSERT INTO anomaly_regions (created_at, region) VALUES ($1, $2)")
                .bind(ts(region.created_at))
                .bind(serde_json::to_value(region).unwrap_or_default())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

// ── Sink task ─────────────────────────────────────────────────────────────────

async fn write_with_timeout<F>(fut: F, metrics: &SinkMetrics)
where
    F: std::future::Future<Output = Result<(), SinkError>>,
{
    match tokio::time::timeout(SINK_TIMEOUT, fut).await {
        Ok(Ok(())) => {
            metrics.persisted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            metrics.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Sink: write failed: {e}");
        }
        Err(_) => {
            metrics.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!("Sink: write timed out, event dropped");
        }
    }
}

/// Drain bus subscriptions into the sink until shutdown. Runs entirely off
/// the ingest path; a slow or dead database only moves these counters.
pub async fn run_sink<S: TelemetrySink>(
    sink: S,
    engine: Arc<SignalEngine>,
    metrics: Arc<SinkMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let measurements = engine.subscribe(Topic::Measurement);
    let anomalies = engine.subscribe(Topic::Anomaly);
    let health = engine.subscribe(Topic::Health);
    let regions = engine.subscribe(Topic::Region);

    info!("Persistence task started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(event) = measurements.recv() => {
                if let BusEvent::Measurement(m) = event {
                    write_with_timeout(sink.persist_measurement(&m), &metrics).await;
                }
            }
            Some(event) = anomalies.recv() => {
                if let BusEvent::Anomaly(a) = event {
                    write_with_timeout(sink.persist_anomaly(&a), &metrics).await;
                }
            }
            Some(event) = health.recv() => {
                if let BusEvent::Health { device_id, snapshot } = event {
                    write_with_timeout(sink.persist_health(&device_id, &snapshot), &metrics).await;
                }
            }
            Some(event) = regions.recv() => {
                if let BusEvent::Regions(r) = event {
                    write_with_timeout(sink.persist_regions(&r), &metrics).await;
                }
            }
        }
    }

    for sub in [measurements, anomalies, health, regions] {
        engine.unsubscribe(sub.id());
    }
    info!("Persistence task stopped");
}

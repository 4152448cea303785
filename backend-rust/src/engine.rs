//! # engine
//!
//! The signal pipeline orchestrator. One [`SignalEngine`] handle owns every
//! piece of mutable state: the sharded per-device lanes, the anchor set,
//! the cross-device position snapshot, the region list and the event bus.
//! There are no module-level singletons — `main` builds one engine, tests
//! build their own.
//!
//! ## Concurrency
//!
//! Devices hash onto a fixed pool of shard locks: ingest is serial per
//! device, parallel across shards. `ingest` itself is synchronous and does
//! no I/O; publishing to the bus never blocks. Periodic work (clustering,
//! health sweep, eviction) snapshots what it needs and never holds a shard
//! lock across an await.
//!
//! Lock order: shard → positions/regions/anomaly log. The clusterer takes
//! its position snapshot before touching shards and so never inverts this.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use telemetry_types::{
    AlertEvent, Anchor, AnomalyEvent, AnomalyRegion, DeviceAttention, HealthSnapshot,
    HealthSummary, Measurement, Position, PositionMethod, ProcessedMeasurement, RiskLevel,
    TrajectoryPoint,
};

use crate::anomaly::{AnomalyScorer, StatisticalDetector};
use crate::bus::{BusEvent, EventBus, Subscription, Topic};
use crate::clustering::{build_regions, ClusterInput};
use crate::features::{self, signal_quality};
use crate::health;
use crate::heatmap::{self, Heatmap, SignalPoint};
use crate::multilateration::estimate_position;
use crate::ring::{MeasurementRing, StoredMeasurement};
use crate::smoothing::{Ewma, KalmanFilter};

// ── Time ──────────────────────────────────────────────────────────────────────

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Configuration ─────────────────────────────────────────────────────────────

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring buffer entries kept per device
    pub ring_capacity: usize,
    pub kalman_process_variance: f64,
    pub kalman_measurement_variance: f64,
    pub ewma_alpha: f64,
    pub path_loss_exponent: f64,
    /// dBm fall between consecutive samples flagged as a sudden drop
    pub drop_threshold_dbm: f64,
    /// recent-window RSSI std flagged as oscillation
    pub oscillation_threshold_dbm: f64,
    /// DBSCAN neighborhood radius, meters
    pub dbscan_eps_m: f64,
    pub dbscan_min_samples: usize,
    pub clustering_interval_secs: u64,
    /// Fresh anomaly events that trigger an early clustering run
    pub fresh_anomaly_threshold: usize,
    /// Recompute health every N appends (1 = every measurement)
    pub health_stride: usize,
    pub health_sweep_secs: u64,
    pub eviction_sweep_secs: u64,
    /// Devices silent for longer than this are evicted
    pub idle_evict_ms: i64,
    /// Default subscriber inbox capacity
    pub inbox_capacity: usize,
    pub shard_count: usize,
    /// Recent anomaly events retained for queries
    pub anomaly_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: env_parse("SIGNALMESH_RING_CAPACITY", 100),
            kalman_process_variance: 1e-3,
            kalman_measurement_variance: 0.1,
            ewma_alpha: 0.3,
            path_loss_exponent: env_parse("SIGNALMESH_PATH_LOSS_EXP", 2.0),
            drop_threshold_dbm: 20.0,
            oscillation_threshold_dbm: 15.0,
            dbscan_eps_m: env_parse("SIGNALMESH_DBSCAN_EPS_M", 30.0),
            dbscan_min_samples: 2,
            clustering_interval_secs: env_parse("SIGNALMESH_CLUSTER_INTERVAL_SECS", 60),
            fresh_anomaly_threshold: 5,
            health_stride: env_parse("SIGNALMESH_HEALTH_STRIDE", 1),
            health_sweep_secs: env_parse("SIGNALMESH_HEALTH_SWEEP_SECS", 300),
            eviction_sweep_secs: 600,
            idle_evict_ms: env_parse("SIGNALMESH_IDLE_EVICT_SECS", 7 * 86_400_i64) * 1000,
            inbox_capacity: env_parse("SIGNALMESH_INBOX_CAPACITY", 1024),
            shard_count: 16,
            anomaly_log_capacity: 1000,
        }
    }
}

// ── Errors & metrics ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid measurement: {0}")]
    InvalidInput(String),
}

/// Monotonic counters surfaced on the `/health` endpoint.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub measurements_ingested: AtomicU64,
    pub invalid_measurements: AtomicU64,
    pub anomalies_detected: AtomicU64,
    pub solver_failures: AtomicU64,
    pub devices_evicted: AtomicU64,
}

// ── Per-device state ──────────────────────────────────────────────────────────

struct DeviceState {
    ring: MeasurementRing,
    kalman: KalmanFilter,
    ewma: Ewma,
    last_position: Option<Position>,
    health: Option<HealthSnapshot>,
    /// Wall-clock ms of the last ingest, drives idle eviction
    last_seen_ms: i64,
}

impl DeviceState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            ring: MeasurementRing::new(config.ring_capacity),
            kalman: KalmanFilter::new(
                config.kalman_process_variance,
                config.kalman_measurement_variance,
            ),
            ewma: Ewma::new(config.ewma_alpha),
            last_position: None,
            health: None,
            last_seen_ms: 0,
        }
    }

    /// Mean smoothed RSSI over the newest `k` entries.
    fn recent_mean_rssi(&self, k: usize) -> f64 {
        let tail = self.ring.tail(k);
        features::mean(&tail.iter().map(|e| e.kalman_rssi).collect::<Vec<_>>())
    }

    /// Mean anomaly score over the newest `k` entries.
    fn recent_mean_anomaly(&self, k: usize) -> f64 {
        let tail = self.ring.tail(k);
        features::mean(&tail.iter().map(|e| e.anomaly_score).collect::<Vec<_>>())
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Samples a position solve averages over.
const POSITION_RSSI_WINDOW: usize = 5;
/// History required before anomaly scoring runs.
const MIN_ANOMALY_HISTORY: usize = 10;
/// Samples required before a health snapshot exists.
const MIN_HEALTH_SAMPLES: usize = 3;
/// Samples a clustering run averages anomaly scores over.
const CLUSTER_SCORE_WINDOW: usize = 5;
/// Half-width of the historical position window, ms.
const HISTORICAL_WINDOW_MS: i64 = 30_000;
/// Half-width of the trajectory quality window, ms.
const QUALITY_WINDOW_MS: i64 = 300_000;

pub struct SignalEngine {
    config: EngineConfig,
    shards: Vec<Mutex<HashMap<String, DeviceState>>>,
    anchors: RwLock<Vec<Anchor>>,
    /// Last known position per device — the cross-device read snapshot
    positions: RwLock<HashMap<String, Position>>,
    /// Current region list, replaced wholesale by each clustering run
    regions: RwLock<Arc<Vec<AnomalyRegion>>>,
    anomaly_log: RwLock<VecDeque<AnomalyEvent>>,
    /// Anomaly events since the last clustering run
    fresh_anomalies: AtomicUsize,
    detector: StatisticalDetector,
    bus: EventBus,
    pub metrics: EngineMetrics,
}

impl SignalEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let shards = (0..config.shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let bus = EventBus::new(config.inbox_capacity);
        let detector = StatisticalDetector {
            drop_threshold_dbm: config.drop_threshold_dbm,
            oscillation_threshold_dbm: config.oscillation_threshold_dbm,
        };
        info!(
            "Signal engine ready: {} shards, ring capacity {}, inbox capacity {}",
            config.shard_count, config.ring_capacity, config.inbox_capacity
        );
        Arc::new(Self {
            shards,
            anchors: RwLock::new(Vec::new()),
            positions: RwLock::new(HashMap::new()),
            regions: RwLock::new(Arc::new(Vec::new())),
            anomaly_log: RwLock::new(VecDeque::new()),
            fresh_anomalies: AtomicUsize::new(0),
            detector,
            bus,
            metrics: EngineMetrics::default(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn shard(&self, device_id: &str) -> &Mutex<HashMap<String, DeviceState>> {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    // ── Administration ───────────────────────────────────────────────────────

    /// Register or move an anchor. Anchors are read-mostly; updates are rare
    /// administrative events.
    pub fn set_anchor(&self, id: &str, x: f64, y: f64, ref_rssi: f64) {
        let mut anchors = self.anchors.write().expect("anchors poisoned");
        if let Some(existing) = anchors.iter_mut().find(|a| a.id == id) {
            existing.x = x;
            existing.y = y;
            existing.ref_rssi = ref_rssi;
        } else {
            anchors.push(Anchor { id: id.to_string(), x, y, ref_rssi });
        }
        info!("Anchor {id} set at ({x}, {y}), ref {ref_rssi} dBm");
    }

    pub fn anchors(&self) -> Vec<Anchor> {
        self.anchors.read().expect("anchors poisoned").clone()
    }

    // ── Ingest ───────────────────────────────────────────────────────────────

    fn validate(measurement: &Measurement) -> Result<(), IngestError> {
        if measurement.device_id.is_empty() {
            return Err(IngestError::InvalidInput("empty device id".into()));
        }
        if measurement.timestamp <= 0 {
            return Err(IngestError::InvalidInput("non-positive timestamp".into()));
        }
        if !measurement.rssi.is_finite() {
            return Err(IngestError::InvalidInput("non-finite rssi".into()));
        }
        let finite = [
            measurement.snr,
            measurement.frequency,
            measurement.response_time_ms,
            measurement.temperature_c,
            measurement.power_w,
            measurement.cpu_pct,
            measurement.mem_pct,
            measurement.battery_pct,
        ];
        if finite.iter().flatten().any(|v| !v.is_finite()) {
            return Err(IngestError::InvalidInput("non-finite channel value".into()));
        }
        Ok(())
    }

    /// Run one measurement through the full pipeline: append, smooth, score,
    /// solve, rescore health, publish. Succeeds for every well-formed input.
    pub fn ingest(&self, measurement: Measurement) -> Result<ProcessedMeasurement, IngestError> {
        if let Err(e) = Self::validate(&measurement) {
            self.metrics.invalid_measurements.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let device_id = measurement.device_id.clone();
        let anchors = self.anchors();

        let mut shard = self.shard(&device_id).lock().expect("shard poisoned");
        let state = shard
            .entry(device_id.clone())
            .or_insert_with(|| DeviceState::new(&self.config));

        // Smooth and append
        let kalman_rssi = state.kalman.update(measurement.rssi);
        let ewma_rssi = state.ewma.update(measurement.rssi);
        state.ring.append(StoredMeasurement {
            measurement: measurement.clone(),
            kalman_rssi,
            ewma_rssi,
            anomaly_score: 0.0,
        });
        state.last_seen_ms = now_ms();

        // Statistical anomaly scoring
        let history = state.ring.all();
        let assessment = if history.len() >= MIN_ANOMALY_HISTORY {
            self.detector.score(&measurement, &history)
        } else {
            Default::default()
        };
        if let Some(last) = state.ring.last_mut() {
            last.anomaly_score = assessment.score;
        }

        let anomaly_events: Vec<AnomalyEvent> = assessment
            .events
            .iter()
            .map(|a| AnomalyEvent {
                id: Uuid::new_v4().to_string(),
                device_id: device_id.clone(),
                timestamp: measurement.timestamp,
                score: a.score,
                kind: a.kind,
                severity: a.severity,
                detail: Some(a.detail.clone()),
            })
            .collect();

        // Position solve from recent smoothed RSSI
        if anchors.len() >= 3 && state.ring.len() >= 3 {
            let mean_rssi = state.recent_mean_rssi(POSITION_RSSI_WINDOW);
            match estimate_position(
                &device_id,
                &anchors,
                mean_rssi,
                self.config.path_loss_exponent,
                measurement.timestamp,
                PositionMethod::Triangulation,
            ) {
                Some(position) => state.last_position = Some(position),
                None => {
                    self.metrics.solver_failures.fetch_add(1, Ordering::Relaxed);
                    debug!("Position solve declined for {device_id}");
                }
            }
        }

        // Health recompute on the configured stride
        let stride = self.config.health_stride.max(1);
        let mut health_changed = false;
        let mut alert: Option<AlertEvent> = None;
        if state.ring.len() >= MIN_HEALTH_SAMPLES && state.ring.len() % stride == 0 {
            let feats = features::extract(&history);
            let snapshot = health::assess(&feats, state.ring.len(), measurement.timestamp);
            let previous_score = state.health.as_ref().map(|h| h.score);
            health_changed = previous_score != Some(snapshot.score)
                || state.health.as_ref().map(|h| h.risk) != Some(snapshot.risk);
            if snapshot.score < 50.0 && previous_score.map_or(true, |s| s >= 50.0) {
                alert = Some(self.build_alert(&device_id, &snapshot));
            }
            state.health = Some(snapshot);
        }

        let quality = {
            let tail = state.ring.tail(MIN_ANOMALY_HISTORY);
            signal_quality(&tail.iter().map(|e| e.kalman_rssi).collect::<Vec<_>>())
        };
        let processed = ProcessedMeasurement {
            device_id: device_id.clone(),
            timestamp: measurement.timestamp,
            raw_rssi: measurement.rssi,
            kalman_rssi,
            ewma_rssi,
            anomaly_score: assessment.score,
            position: state.last_position.clone(),
            signal_quality: quality,
        };
        let health_snapshot = state.health.clone();
        let position_update = state.last_position.clone();

        // Publish while the shard lock serializes this device: every event
        // for measurement i goes out before any event for measurement i+1.
        self.bus.publish(BusEvent::Measurement(processed.clone()));
        if health_changed {
            if let Some(snapshot) = health_snapshot {
                self.bus.publish(BusEvent::Health {
                    device_id: device_id.clone(),
                    snapshot,
                });
            }
        }
        for event in &anomaly_events {
            self.bus.publish(BusEvent::Anomaly(event.clone()));
        }
        if let Some(alert) = alert {
            warn!("Health alert for {device_id}: {}", alert.description);
            self.bus.publish(BusEvent::Alert(alert));
        }
        drop(shard);

        if let Some(position) = position_update {
            self.positions
                .write()
                .expect("positions poisoned")
                .insert(device_id.clone(), position);
        }
        if !anomaly_events.is_empty() {
            let mut log = self.anomaly_log.write().expect("anomaly log poisoned");
            for event in anomaly_events {
                if log.len() == self.config.anomaly_log_capacity {
                    log.pop_front();
                }
                log.push_back(event);
            }
            drop(log);
            self.fresh_anomalies.fetch_add(1, Ordering::Relaxed);
            self.metrics.anomalies_detected.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.measurements_ingested.fetch_add(1, Ordering::Relaxed);

        Ok(processed)
    }

    fn build_alert(&self, device_id: &str, snapshot: &HealthSnapshot) -> AlertEvent {
        AlertEvent {
            id: Uuid::new_v4().to_string(),
            kind: "device_health_decline".to_string(),
            severity: if snapshot.score < 30.0 {
                telemetry_types::Severity::High
            } else {
                telemetry_types::Severity::Medium
            },
            description: format!(
                "Device {device_id} showing health decline (score: {:.1})",
                snapshot.score
            ),
            affected_devices: vec![device_id.to_string()],
            recommended_actions: snapshot.recommendations.clone(),
            confidence: snapshot.confidence,
            timestamp: snapshot.updated_at,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn device_health(&self, device_id: &str) -> Option<HealthSnapshot> {
        let shard = self.shard(device_id).lock().expect("shard poisoned");
        shard.get(device_id).and_then(|s| s.health.clone())
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        let mut score_sum = 0.0;
        let mut scored = 0usize;

        for shard in &self.shards {
            let shard = shard.lock().expect("shard poisoned");
            for (device_id, state) in shard.iter() {
                let Some(health) = &state.health else { continue };
                scored += 1;
                score_sum += health.score;
                match health.risk {
                    RiskLevel::Low => summary.healthy_devices += 1,
                    RiskLevel::Medium | RiskLevel::High => summary.at_risk_devices += 1,
                    RiskLevel::Critical => summary.critical_devices += 1,
                }
                if matches!(health.risk, RiskLevel::High | RiskLevel::Critical) {
                    summary.devices_needing_attention.push(DeviceAttention {
                        device_id: device_id.clone(),
                        health_score: health.score,
                        risk_level: health.risk,
                        predicted_failure_at: health.predicted_failure_at,
                    });
                }
            }
        }

        summary.total_devices = scored;
        summary.average_health_score = if scored > 0 { score_sum / scored as f64 } else { 0.0 };
        summary
            .devices_needing_attention
            .sort_by(|a, b| a.health_score.total_cmp(&b.health_score));
        summary
    }

    /// Anomaly events newer than `window_ms` before now, newest first.
    pub fn recent_anomalies(&self, window_ms: i64) -> Vec<AnomalyEvent> {
        let cutoff = now_ms() - window_ms;
        let log = self.anomaly_log.read().expect("anomaly log poisoned");
        let mut events: Vec<AnomalyEvent> = log
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .cloned()
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        events
    }

    pub fn regions(&self) -> Arc<Vec<AnomalyRegion>> {
        self.regions.read().expect("regions poisoned").clone()
    }

    pub fn position(&self, device_id: &str) -> Option<Position> {
        self.positions
            .read()
            .expect("positions poisoned")
            .get(device_id)
            .cloned()
    }

    pub fn heatmap(&self, bounds: (f64, f64, f64, f64), resolution: usize) -> Heatmap {
        let positions = self.positions.read().expect("positions poisoned").clone();
        let mut points = Vec::with_capacity(positions.len());
        for (device_id, position) in &positions {
            let shard = self.shard(device_id).lock().expect("shard poisoned");
            if let Some(state) = shard.get(device_id) {
                if !state.ring.is_empty() {
                    points.push(SignalPoint {
                        position: position.point(),
                        rssi: state.recent_mean_rssi(POSITION_RSSI_WINDOW),
                    });
                }
            }
        }
        let regions = self.regions();
        heatmap::generate(bounds, resolution, &points, &regions)
    }

    /// Playback sequence for one device over the trailing window.
    pub fn trajectory(&self, device_id: &str, window_ms: i64) -> Vec<TrajectoryPoint> {
        let anchors = self.anchors();
        let history = {
            let shard = self.shard(device_id).lock().expect("shard poisoned");
            match shard.get(device_id) {
                Some(state) => {
                    let now = now_ms();
                    state.ring.window(now - window_ms, now)
                }
                None => return Vec::new(),
            }
        };

        history
            .iter()
            .map(|entry| {
                let t = entry.timestamp();
                let position = self.historical_position(&history, &anchors, device_id, t);
                let quality_window: Vec<f64> = history
                    .iter()
                    .filter(|e| (e.timestamp() - t).abs() <= QUALITY_WINDOW_MS)
                    .map(|e| e.kalman_rssi)
                    .collect();
                TrajectoryPoint {
                    timestamp: t,
                    smoothed_rssi: entry.kalman_rssi,
                    position,
                    signal_quality: signal_quality(&quality_window),
                    anomaly_score: entry.anomaly_score,
                }
            })
            .collect()
    }

    /// Re-solve a position from measurements around a past instant.
    fn historical_position(
        &self,
        history: &[StoredMeasurement],
        anchors: &[Anchor],
        device_id: &str,
        at_ms: i64,
    ) -> Option<Position> {
        let window: Vec<f64> = history
            .iter()
            .filter(|e| (e.timestamp() - at_ms).abs() <= HISTORICAL_WINDOW_MS)
            .map(|e| e.kalman_rssi)
            .collect();
        if window.is_empty() {
            return None;
        }
        estimate_position(
            device_id,
            anchors,
            features::mean(&window),
            self.config.path_loss_exponent,
            at_ms,
            PositionMethod::Historical,
        )
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    pub fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> Subscription {
        self.bus.subscribe_with_capacity(topic, capacity)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    // ── Periodic work ────────────────────────────────────────────────────────

    /// True when enough fresh anomalies accumulated to justify an early
    /// clustering run.
    pub fn clustering_due(&self) -> bool {
        self.fresh_anomalies.load(Ordering::Relaxed) >= self.config.fresh_anomaly_threshold
    }

    /// Recluster anomalous devices and replace the region list.
    pub fn run_clustering(&self) {
        let positions = self.positions.read().expect("positions poisoned").clone();

        let mut inputs = Vec::with_capacity(positions.len());
        for (device_id, position) in &positions {
            let shard = self.shard(device_id).lock().expect("shard poisoned");
            if let Some(state) = shard.get(device_id) {
                inputs.push(ClusterInput {
                    device_id: device_id.clone(),
                    position: position.point(),
                    anomaly_score: state.recent_mean_anomaly(CLUSTER_SCORE_WINDOW),
                });
            }
        }

        let regions = Arc::new(build_regions(
            &inputs,
            self.config.dbscan_eps_m,
            self.config.dbscan_min_samples,
            now_ms(),
        ));
        if !regions.is_empty() {
            info!("Clustering found {} anomaly region(s)", regions.len());
        }
        *self.regions.write().expect("regions poisoned") = regions.clone();
        self.fresh_anomalies.store(0, Ordering::Relaxed);
        self.bus.publish(BusEvent::Regions(regions));
    }

    /// Recompute health for every tracked device.
    pub fn run_health_sweep(&self) {
        let now = now_ms();
        let mut assessed = 0usize;
        for shard in &self.shards {
            let mut updates = Vec::new();
            {
                let mut shard = shard.lock().expect("shard poisoned");
                for (device_id, state) in shard.iter_mut() {
                    if state.ring.len() < MIN_HEALTH_SAMPLES {
                        continue;
                    }
                    let history = state.ring.all();
                    let feats = features::extract(&history);
                    let snapshot = health::assess(&feats, history.len(), now);
                    let changed = state.health.as_ref().map(|h| h.score) != Some(snapshot.score);
                    state.health = Some(snapshot.clone());
                    assessed += 1;
                    if changed {
                        updates.push((device_id.clone(), snapshot));
                    }
                }
            }
            for (device_id, snapshot) in updates {
                self.bus.publish(BusEvent::Health { device_id, snapshot });
            }
        }
        debug!("Health sweep assessed {assessed} device(s)");
    }

    /// Drop devices idle past the configured horizon.
    pub fn evict_idle(&self) {
        let cutoff = now_ms() - self.config.idle_evict_ms;
        let mut evicted: Vec<String> = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().expect("shard poisoned");
            shard.retain(|device_id, state| {
                let keep = state.last_seen_ms >= cutoff;
                if !keep {
                    evicted.push(device_id.clone());
                }
                keep
            });
        }
        if !evicted.is_empty() {
            let mut positions = self.positions.write().expect("positions poisoned");
            for device_id in &evicted {
                positions.remove(device_id);
            }
            self.metrics
                .devices_evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            info!("Evicted {} idle device(s)", evicted.len());
        }
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn device_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("shard poisoned").len())
            .sum()
    }

    /// Counters and totals for the `/health` payload.
    pub fn stats(&self) -> serde_json::Value {
        json!({
            "devicesTracked": self.device_count(),
            "positionedDevices": self.positions.read().expect("positions poisoned").len(),
            "anomalyRegions": self.regions().len(),
            "anchors": self.anchors().len(),
            "subscribers": self.bus.subscriber_count(),
            "measurementsIngested": self.metrics.measurements_ingested.load(Ordering::Relaxed),
            "invalidMeasurements": self.metrics.invalid_measurements.load(Ordering::Relaxed),
            "anomaliesDetected": self.metrics.anomalies_detected.load(Ordering::Relaxed),
            "solverFailures": self.metrics.solver_failures.load(Ordering::Relaxed),
            "devicesEvicted": self.metrics.devices_evicted.load(Ordering::Relaxed),
            "eventsPublished": self.bus.published_total(),
            "eventsDropped": self.bus.dropped_total(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<SignalEngine> {
        SignalEngine::new(EngineConfig {
            // keep eviction deterministic in tests
            idle_evict_ms: 7 * 86_400_000,
            ..EngineConfig::default()
        })
    }

    fn set_triangle_anchors(engine: &SignalEngine) {
        engine.set_anchor("a1", 0.0, 0.0, -30.0);
        engine.set_anchor("a2", 100.0, 0.0, -30.0);
        engine.set_anchor("a3", 50.0, 100.0, -30.0);
    }

    fn ingest_healthy(engine: &SignalEngine, device_id: &str, n: usize) {
        for i in 0..n {
            let mut m = Measurement::rssi_only(device_id, 1_000_000 + i as i64 * 1000, -55.0);
            m.response_time_ms = Some(100.0);
            m.is_online = Some(true);
            m.error_count = Some(0);
            m.temperature_c = Some(60.0);
            engine.ingest(m).unwrap();
        }
    }

    #[test]
    fn empty_state_queries_are_empty() {
        let engine = engine();
        let summary = engine.health_summary();
        assert_eq!(summary.total_devices, 0);
        assert_eq!(summary.average_health_score, 0.0);
        assert!(summary.devices_needing_attention.is_empty());
        assert!(engine.regions().is_empty());
        assert!(engine.recent_anomalies(24 * 3_600_000).is_empty());
        assert!(engine.trajectory("ghost", 3_600_000).is_empty());
        assert!(engine.device_health("ghost").is_none());
    }

    #[test]
    fn malformed_measurements_are_rejected() {
        let engine = engine();
        assert!(engine.ingest(Measurement::rssi_only("", 1000, -50.0)).is_err());
        assert!(engine.ingest(Measurement::rssi_only("d", 0, -50.0)).is_err());
        assert!(engine.ingest(Measurement::rssi_only("d", 1000, f64::NAN)).is_err());
        assert_eq!(engine.metrics.invalid_measurements.load(Ordering::Relaxed), 3);
        // nothing entered the pipeline
        assert_eq!(engine.device_count(), 0);
    }

    #[test]
    fn healthy_device_scores_100_with_no_events() {
        let engine = engine();
        ingest_healthy(&engine, "dev-1", 50);

        let health = engine.device_health("dev-1").expect("no health snapshot");
        assert_eq!(health.score, 100.0);
        assert_eq!(health.risk, RiskLevel::Low);
        assert!(health.predicted_failure_at.is_none());
        assert!(engine.recent_anomalies(24 * 3_600_000).is_empty());

        let summary = engine.health_summary();
        assert_eq!(summary.total_devices, 1);
        assert_eq!(summary.healthy_devices, 1);
        assert_eq!(summary.average_health_score, 100.0);
    }

    #[test]
    fn two_samples_produce_no_health_snapshot() {
        let engine = engine();
        ingest_healthy(&engine, "dev-1", 2);
        assert!(engine.device_health("dev-1").is_none());
        assert_eq!(engine.health_summary().total_devices, 0);
    }

    #[test]
    fn degrading_device_alerts_and_projects_failure() {
        let engine = engine();
        let alerts = engine.subscribe(Topic::Alert);
        let n = 20;
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let mut m = Measurement::rssi_only("dev-bad", 1_000_000 + i as i64 * 1000, -50.0 - 44.0 * t);
            m.response_time_ms = Some(200.0 + 600.0 * t);
            m.is_online = Some(if i < 15 { true } else { i % 2 == 0 });
            m.error_count = Some(i as u32 / 5);
            m.temperature_c = Some(65.0 + 23.0 * t);
            engine.ingest(m).unwrap();
        }

        let health = engine.device_health("dev-bad").unwrap();
        assert!(matches!(health.risk, RiskLevel::High | RiskLevel::Critical));
        assert!(health.predicted_failure_at.is_some());
        assert!(health.factors.contains(&"Poor signal strength".to_string()));

        let anomalies = engine.recent_anomalies(24 * 3_600_000);
        assert!(
            anomalies.iter().any(|a| matches!(
                a.kind,
                telemetry_types::AnomalyKind::Drop
                    | telemetry_types::AnomalyKind::RssiDeviation
                    | telemetry_types::AnomalyKind::Oscillation
            )),
            "no rssi anomaly in {anomalies:?}"
        );
        assert!(anomalies
            .iter()
            .any(|a| a.kind == telemetry_types::AnomalyKind::Disconnect));

        // the health decline crossed below 50 and raised an alert
        let mut alert_count = 0;
        while alerts.try_recv().is_some() {
            alert_count += 1;
        }
        assert!(alert_count >= 1);
    }

    #[test]
    fn triangulation_needs_three_anchors_and_three_samples() {
        let engine = engine();
        engine.set_anchor("a1", 0.0, 0.0, -30.0);
        engine.set_anchor("a2", 100.0, 0.0, -30.0);
        for i in 0..10 {
            engine
                .ingest(Measurement::rssi_only("dev-1", 1000 + i, -63.979))
                .unwrap();
        }
        assert!(engine.position("dev-1").is_none());

        engine.set_anchor("a3", 50.0, 100.0, -30.0);
        engine
            .ingest(Measurement::rssi_only("dev-1", 2000, -63.979))
            .unwrap();
        let pos = engine.position("dev-1").expect("no position");
        assert_eq!(pos.method, PositionMethod::Triangulation);
        assert!((pos.x - 50.0).abs() < 2.0);
        assert!(pos.confidence > 0.8);
    }

    #[test]
    fn clustering_groups_coincident_anomalous_devices() {
        let engine = engine();
        set_triangle_anchors(&engine);

        // two devices share an identical quiet history (small deterministic
        // jitter keeps the baseline variance non-zero) then crash together
        for device in ["dev-a", "dev-b"] {
            for i in 0..30 {
                let jitter = ((i * 7) % 5) as f64 * 0.4 - 0.8;
                engine
                    .ingest(Measurement::rssi_only(device, 1_000_000 + i * 1000, -50.0 + jitter))
                    .unwrap();
            }
            for i in 0..5 {
                engine
                    .ingest(Measurement::rssi_only(device, 1_030_000 + i * 1000, -90.0))
                    .unwrap();
            }
        }
        // a third, far device stays quiet
        for i in 0..30 {
            engine
                .ingest(Measurement::rssi_only("dev-quiet", 1_000_000 + i * 1000, -70.0))
                .unwrap();
        }

        assert!(engine.clustering_due());
        engine.run_clustering();

        let regions = engine.regions();
        assert_eq!(regions.len(), 1, "regions: {regions:?}");
        let region = &regions[0];
        assert!(region.member_device_ids.contains(&"dev-a".to_string()));
        assert!(region.member_device_ids.contains(&"dev-b".to_string()));
        assert!(!region.member_device_ids.contains(&"dev-quiet".to_string()));
        assert!(region.confidence > 0.5);

        // the next run replaces the list outright
        engine.run_clustering();
        assert!(engine.regions().len() <= 1);
    }

    #[test]
    fn per_device_event_order_matches_ingest_order() {
        let engine = engine();
        let sub = engine.subscribe(Topic::Measurement);
        for i in 0..5 {
            engine
                .ingest(Measurement::rssi_only("dev-1", 1000 + i, -50.0))
                .unwrap();
        }
        let mut timestamps = Vec::new();
        while let Some(BusEvent::Measurement(m)) = sub.try_recv() {
            timestamps.push(m.timestamp);
        }
        assert_eq!(timestamps, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn health_summary_is_idempotent_without_new_ingest() {
        let engine = engine();
        ingest_healthy(&engine, "dev-1", 20);
        ingest_healthy(&engine, "dev-2", 20);
        let first = serde_json::to_value(engine.health_summary()).unwrap();
        let second = serde_json::to_value(engine.health_summary()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn idle_devices_are_evicted() {
        let engine = SignalEngine::new(EngineConfig {
            idle_evict_ms: 1, // idle after a single millisecond of silence
            ..EngineConfig::default()
        });
        ingest_healthy(&engine, "dev-1", 5);
        assert_eq!(engine.device_count(), 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        engine.evict_idle();
        assert_eq!(engine.device_count(), 0);
        assert!(engine.device_health("dev-1").is_none());
        assert_eq!(engine.metrics.devices_evicted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn health_sweep_covers_all_devices() {
        let engine = engine();
        ingest_healthy(&engine, "dev-1", 10);
        ingest_healthy(&engine, "dev-2", 10);
        engine.run_health_sweep();
        assert!(engine.device_health("dev-1").is_some());
        assert!(engine.device_health("dev-2").is_some());
        // summary reflects both
        assert_eq!(engine.health_summary().total_devices, 2);
    }

    #[test]
    fn trajectory_carries_smoothed_values_and_positions() {
        let engine = engine();
        set_triangle_anchors(&engine);
        let now = now_ms();
        for i in 0..20 {
            engine
                .ingest(Measurement::rssi_only("dev-1", now - (20 - i) * 1000, -63.979))
                .unwrap();
        }
        let trajectory = engine.trajectory("dev-1", 3_600_000);
        assert_eq!(trajectory.len(), 20);
        let last = trajectory.last().unwrap();
        assert!(last.smoothed_rssi < -60.0);
        let pos = last.position.as_ref().expect("no historical position");
        assert_eq!(pos.method, PositionMethod::Historical);
        assert!(last.signal_quality.overall > 0.0);
    }
}

//! # telemetry-types
//!
//! Shared telemetry structures for the SignalMesh fleet monitoring system.
//!
//! These types are used by:
//! - `backend-rust`: receiving and parsing TelemetryEnvelopes from field agents,
//!   deriving health/position/anomaly events, broadcasting to subscribers
//! - `fleet-simulator`: producing synthetic agent telemetry for development
//! - Web/mobile clients: consuming the Socket.IO broadcast payloads
//!
//! ## Conventions
//!
//! - **Coordinates**: local planar Cartesian, meters. Anchors and device
//!   positions share one frame; the frame origin is deployment-defined.
//! - **Timestamps**: wall-clock Unix epoch milliseconds (`i64`), the same
//!   clock on every payload. Derived events always carry a timestamp ≥ the
//!   triggering measurement's timestamp.
//! - **RSSI**: dBm, typically −30 (very close) to −100 (edge of reception).
//! - Wire format is JSON with camelCase keys; optional channels are simply
//!   absent when an agent does not report them.

use serde::{Deserialize, Serialize};

// ── Geometry ──────────────────────────────────────────────────────────────────

/// 2D point in the deployment frame (meters).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn dist(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

// ── Measurement ───────────────────────────────────────────────────────────────

/// One telemetry sample for one wireless device, as observed by a field agent.
///
/// `rssi` is the only mandatory channel. Health channels are optional and
/// per-agent: consumers must test presence, never assume it.
/// Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub device_id: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    /// Received signal strength, dBm
    pub rssi: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    /// Carrier frequency, GHz
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
    /// Observer (agent) position — diagnostics only, never used for solving
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_w: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_tx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_rx: Option<u64>,
}

impl Measurement {
    /// Minimal well-formed measurement (rssi only). Used by agents that
    /// report nothing but signal strength, and widely in tests.
    pub fn rssi_only(device_id: &str, timestamp: i64, rssi: f64) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp,
            rssi,
            snr: None,
            frequency: None,
            channel: None,
            location: None,
            response_time_ms: None,
            is_online: None,
            error_count: None,
            temperature_c: None,
            power_w: None,
            cpu_pct: None,
            mem_pct: None,
            battery_pct: None,
            bytes_tx: None,
            bytes_rx: None,
        }
    }
}

/// UDP wire envelope: a [`Measurement`] plus the sending agent's sequence
/// number. The hub rejects stale or duplicate sequence numbers (replay
/// protection) before the measurement enters the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    /// Monotonically increasing per-agent sequence number
    pub seq_num: u32,
    /// Identifier of the reporting field agent
    pub agent_id: String,
    #[serde(flatten)]
    pub measurement: Measurement,
}

// ── Anchors ───────────────────────────────────────────────────────────────────

/// A fixed reference emitter of known position, used for multilateration.
/// `ref_rssi` is the expected RSSI at 1 meter from the anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub ref_rssi: f64,
}

impl Anchor {
    pub fn pos(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

// ── Position estimate ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionMethod {
    /// Solved live from the device's recent mean RSSI against all anchors
    Triangulation,
    /// Re-solved after the fact from measurements around a past timestamp
    Historical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    /// Solver confidence in [0, 1], derived from mean anchor residual
    pub confidence: f64,
    pub timestamp: i64,
    pub method: PositionMethod,
}

impl Position {
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Risk bucket is a pure function of the health score.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Low
        } else if score >= 60.0 {
            Self::Medium
        } else if score >= 30.0 {
            Self::High
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// 0–100, higher is healthier
    pub score: f64,
    pub risk: RiskLevel,
    /// Projected failure instant (epoch ms), present only for degrading devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_failure_at: Option<i64>,
    /// Confidence of the failure projection (0 when no projection)
    pub confidence: f64,
    pub factors: Vec<String>,
    pub recommendations: Vec<String>,
    pub updated_at: i64,
    /// Number of ring-buffer samples the snapshot was computed from
    pub sample_count: usize,
}

// ── Anomalies ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    RssiDeviation,
    LatencySpike,
    Disconnect,
    TempSpike,
    Oscillation,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            Self::High
        } else if score > 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyEvent {
    pub id: String,
    pub device_id: String,
    pub timestamp: i64,
    /// Combined anomaly score in [0, 1]
    pub score: f64,
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// Human-readable description, e.g. "RSSI anomaly: -88 dBm (baseline: -54.2±3.1)"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A spatial cluster of anomalous devices. References device **ids**, never
/// device state — regions are rebuilt wholesale on every recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRegion {
    pub centre: Point,
    pub radius: f64,
    pub severity: Severity,
    pub kind: String,
    pub confidence: f64,
    pub member_device_ids: Vec<String>,
    pub created_at: i64,
}

// ── Derived payloads ──────────────────────────────────────────────────────────

/// Signal quality metrics over a device's recent window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuality {
    /// 0.6·strength + 0.4·stability
    pub overall: f64,
    /// 1 − rssi_std / 30, clamped to [0, 1]
    pub stability: f64,
    /// (rssi_mean + 100) / 70, clamped to [0, 1]
    pub strength: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_std: Option<f64>,
}

/// Broadcast payload for every ingested measurement: raw + smoothed values
/// and whatever the pipeline derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMeasurement {
    pub device_id: String,
    pub timestamp: i64,
    pub raw_rssi: f64,
    pub kalman_rssi: f64,
    pub ewma_rssi: f64,
    pub anomaly_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub signal_quality: SignalQuality,
}

/// One entry of a device trajectory playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryPoint {
    pub timestamp: i64,
    pub smoothed_rssi: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub signal_quality: SignalQuality,
    pub anomaly_score: f64,
}

/// Fleet-wide health rollup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total_devices: usize,
    pub healthy_devices: usize,
    pub at_risk_devices: usize,
    pub critical_devices: usize,
    pub average_health_score: f64,
    pub devices_needing_attention: Vec<DeviceAttention>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAttention {
    pub device_id: String,
    pub health_score: f64,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_failure_at: Option<i64>,
}

/// Alert-topic payload, emitted when a device's health drops below 50.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    pub affected_devices: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub confidence: f64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_buckets_are_pure_in_score() {
        assert_eq!(RiskLevel::from_score(100.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(79.9), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(59.9), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(30.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(29.9), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Critical);
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(Severity::from_score(0.71), Severity::High);
        assert_eq!(Severity::from_score(0.7), Severity::Medium);
        assert_eq!(Severity::from_score(0.41), Severity::Medium);
        assert_eq!(Severity::from_score(0.4), Severity::Low);
    }

    #[test]
    fn envelope_round_trips_camel_case() {
        let mut m = Measurement::rssi_only("dev-1", 1_700_000_000_000, -62.5);
        m.response_time_ms = Some(120.0);
        m.is_online = Some(true);
        let env = TelemetryEnvelope {
            seq_num: 7,
            agent_id: "agent-01".into(),
            measurement: m,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["seqNum"], 7);
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["responseTimeMs"], 120.0);
        // absent channels must not serialize
        assert!(json.get("temperatureC").is_none());

        let back: TelemetryEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.measurement.device_id, "dev-1");
        assert_eq!(back.measurement.is_online, Some(true));
        assert!(back.measurement.error_count.is_none());
    }
}

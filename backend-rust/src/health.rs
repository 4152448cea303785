//! # health
//!
//! Deterministic rule-based device health scoring.
//!
//! A device starts at 100 and loses points for weak or unstable signal, slow
//! or worsening response, disconnects, errors, heat and power drift; uptime
//! scales the score directly. The same feature thresholds drive the
//! contributing-factor and recommendation lists, and degradation trends feed
//! the failure-date projection.

use telemetry_types::{HealthSnapshot, RiskLevel};

use crate::features::Features;

/// Score below which a failure date is projected.
const FAILURE_THRESHOLD: f64 = 30.0;
/// Horizon over which the degradation rate is normalized, days.
const PREDICTION_WINDOW_DAYS: f64 = 30.0;

const MS_PER_DAY: f64 = 86_400_000.0;

// ── Scoring ───────────────────────────────────────────────────────────────────

/// Rule-based health score in [0, 100].
pub fn score(features: &Features) -> f64 {
    let mut score: f64 = 100.0;

    // Signal strength
    if let Some(rssi) = features.get("rssi_mean") {
        if rssi < -70.0 {
            score -= 20.0;
        } else if rssi < -60.0 {
            score -= 10.0;
        }
        if let Some(std) = features.get("rssi_std") {
            if std > 10.0 {
                score -= 15.0;
            }
        }
    }

    // Response time
    if let Some(rt) = features.get("response_time_mean") {
        if rt > 1000.0 {
            score -= 25.0;
        } else if rt > 500.0 {
            score -= 15.0;
        }
        if let Some(rt_trend) = features.get("response_time_trend") {
            if rt_trend > 0.0 {
                score -= 10.0;
            }
        }
    }

    // Availability scales the score directly
    if let Some(uptime) = features.get("uptime_ratio") {
        score *= uptime;
    }
    if let Some(disconnects) = features.get("disconnect_events") {
        score -= (disconnects * 5.0).min(30.0);
    }

    // Errors
    if let Some(error_rate) = features.get("error_rate") {
        score -= (error_rate * 100.0).min(40.0);
    }

    // Temperature
    if let Some(temp_max) = features.get("temp_max") {
        if temp_max > 85.0 {
            score -= 20.0;
        } else if temp_max > 75.0 {
            score -= 10.0;
        }
    }

    // Power drift
    if let Some(power_trend) = features.get("power_trend") {
        if power_trend > 0.0 {
            score -= 10.0;
        }
    }

    score.clamp(0.0, 100.0)
}

// ── Failure projection ────────────────────────────────────────────────────────

/// Project a failure instant from degradation trends.
///
/// Healthy devices (score > 70) and devices with no negative trend get no
/// projection. Returns `(failure_at_ms, confidence)`.
pub fn predict_failure(score: f64, features: &Features, now_ms: i64) -> Option<(i64, f64)> {
    if score > 70.0 {
        return None;
    }

    let negative_trends = features.negative_trend_count();
    if negative_trends == 0 {
        return None;
    }

    let degradation_rate = (100.0 - score) / PREDICTION_WINDOW_DAYS;
    let confidence = (0.5 + negative_trends as f64 * 0.1).min(0.9);
    let days_to_failure = ((score - FAILURE_THRESHOLD) / degradation_rate).max(1.0);
    let failure_at = now_ms + (days_to_failure * MS_PER_DAY) as i64;

    Some((failure_at, confidence))
}

// ── Factors & recommendations ─────────────────────────────────────────────────

/// Conditions contributing to poor health, in fixed order.
pub fn factors(features: &Features) -> Vec<String> {
    let mut out = Vec::new();

    if features.get("rssi_mean").is_some_and(|v| v < -70.0) {
        out.push("Poor signal strength".to_string());
    }
    if features.get("rssi_std").is_some_and(|v| v > 10.0) {
        out.push("Signal instability".to_string());
    }
    if features.get("response_time_mean").is_some_and(|v| v > 500.0) {
        out.push("High response times".to_string());
    }
    if features.get("uptime_ratio").is_some_and(|v| v < 0.95) {
        out.push("Frequent disconnections".to_string());
    }
    if features.get("error_rate").is_some_and(|v| v > 0.05) {
        out.push("High error rate".to_string());
    }
    if features.get("temp_max").is_some_and(|v| v > 80.0) {
        out.push("Temperature concerns".to_string());
    }
    if features.get("power_trend").is_some_and(|v| v > 0.0) {
        out.push("Increasing power consumption".to_string());
    }

    out
}

/// Actionable maintenance recommendations for the given score and features.
pub fn recommendations(score: f64, features: &Features) -> Vec<String> {
    let mut out = Vec::new();

    if score < 30.0 {
        out.push("Schedule immediate maintenance inspection".to_string());
    } else if score < 50.0 {
        out.push("Plan preventive maintenance within 2 weeks".to_string());
    }

    if features.get("rssi_mean").is_some_and(|v| v < -70.0) {
        out.push("Improve device positioning or add a WiFi extender".to_string());
    }
    if features.get("response_time_mean").is_some_and(|v| v > 1000.0) {
        out.push("Check network congestion and device load".to_string());
    }
    if features.get("disconnect_events").is_some_and(|v| v > 5.0) {
        out.push("Investigate network stability issues".to_string());
    }
    if features.get("error_rate").is_some_and(|v| v > 0.1) {
        out.push("Review device logs for error patterns".to_string());
    }
    if features.get("temp_max").is_some_and(|v| v > 85.0) {
        out.push("Improve device ventilation or cooling".to_string());
    }

    out
}

// ── Snapshot assembly ─────────────────────────────────────────────────────────

/// Full health assessment for one device window.
pub fn assess(features: &Features, sample_count: usize, now_ms: i64) -> HealthSnapshot {
    let score = score(features);
    let projection = predict_failure(score, features, now_ms);
    HealthSnapshot {
        score,
        risk: RiskLevel::from_score(score),
        predicted_failure_at: projection.map(|(at, _)| at),
        confidence: projection.map(|(_, conf)| conf).unwrap_or(0.0),
        factors: factors(features),
        recommendations: recommendations(score, features),
        updated_at: now_ms,
        sample_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::extract;
    use crate::ring::StoredMeasurement;
    use telemetry_types::Measurement;

    fn stored(m: Measurement) -> StoredMeasurement {
        StoredMeasurement {
            kalman_rssi: m.rssi,
            ewma_rssi: m.rssi,
            anomaly_score: 0.0,
            measurement: m,
        }
    }

    fn healthy_history(n: usize) -> Vec<StoredMeasurement> {
        (0..n)
            .map(|i| {
                let mut m = Measurement::rssi_only("d", i as i64 * 1000, -55.0);
                m.response_time_ms = Some(100.0);
                m.is_online = Some(true);
                m.error_count = Some(0);
                m.temperature_c = Some(60.0);
                stored(m)
            })
            .collect()
    }

    #[test]
    fn healthy_device_scores_full_marks() {
        let features = extract(&healthy_history(50));
        let snapshot = assess(&features, 50, 1_700_000_000_000);
        assert_eq!(snapshot.score, 100.0);
        assert_eq!(snapshot.risk, RiskLevel::Low);
        assert!(snapshot.predicted_failure_at.is_none());
        assert!(snapshot.factors.is_empty());
        assert!(snapshot.recommendations.is_empty());
    }

    fn degrading_history(n: usize) -> Vec<StoredMeasurement> {
        (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                let mut m = Measurement::rssi_only("d", i as i64 * 1000, -50.0 - 44.0 * t);
                m.response_time_ms = Some(200.0 + 600.0 * t);
                m.is_online = Some(if i < 15 { true } else { i % 2 == 0 });
                m.error_count = Some(i as u32 / 5);
                m.temperature_c = Some(65.0 + 23.0 * t);
                stored(m)
            })
            .collect()
    }

    #[test]
    fn degrading_device_lands_in_high_or_critical() {
        let now = 1_700_000_000_000;
        let features = extract(&degrading_history(20));
        let snapshot = assess(&features, 20, now);
        assert!(
            snapshot.risk == RiskLevel::High || snapshot.risk == RiskLevel::Critical,
            "unexpected risk {:?} at score {}",
            snapshot.risk,
            snapshot.score
        );
        assert!(snapshot.factors.contains(&"Poor signal strength".to_string()));
        assert!(snapshot.factors.contains(&"Frequent disconnections".to_string()));
        assert!(snapshot.factors.contains(&"Temperature concerns".to_string()));

        // failure projected within the 30-day prediction window
        let failure_at = snapshot.predicted_failure_at.expect("no failure projection");
        let days_out = (failure_at - now) as f64 / 86_400_000.0;
        assert!(days_out >= 1.0 && days_out <= 31.0, "failure {days_out} days out");
        assert!(snapshot.confidence >= 0.5 && snapshot.confidence <= 0.9);
    }

    #[test]
    fn score_never_leaves_bounds() {
        // Worst case: every deduction fires at its cap, uptime zero
        let history: Vec<StoredMeasurement> = (0..20)
            .map(|i| {
                let mut m = Measurement::rssi_only("d", i, if i % 2 == 0 { -95.0 } else { -30.0 });
                m.response_time_ms = Some(5000.0 + i as f64 * 100.0);
                m.is_online = Some(false);
                m.error_count = Some(10);
                m.temperature_c = Some(95.0);
                m.power_w = Some(10.0 + i as f64);
                stored(m)
            })
            .collect();
        let features = extract(&history);
        let s = score(&features);
        assert!((0.0..=100.0).contains(&s));
        assert_eq!(s, 0.0);
    }

    #[test]
    fn no_projection_above_seventy_or_without_negative_trend() {
        let features = extract(&healthy_history(10));
        assert!(predict_failure(100.0, &features, 0).is_none());

        // Low score but every observed trend is flat → no projection
        assert!(predict_failure(40.0, &features, 0).is_none());
    }

    #[test]
    fn projection_confidence_grows_with_negative_trends() {
        let features = extract(&degrading_history(20));
        let (_, conf) = predict_failure(45.0, &features, 0).unwrap();
        // rssi_trend is negative here; confidence = 0.5 + 0.1·neg
        assert!(conf > 0.5);
        assert!(conf <= 0.9);
    }
}

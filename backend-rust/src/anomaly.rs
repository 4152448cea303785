//! # anomaly
//!
//! Per-measurement statistical anomaly detection.
//!
//! The detector compares the incoming sample against a baseline carved out
//! of the device's ring history: everything except the 10 newest entries is
//! baseline, the 10 newest are the recent window. The combined z-score /
//! drop / oscillation signal is normalized to [0, 1]; channel-specific
//! checks (latency, disconnect, temperature) emit their own events.
//!
//! Detectors sit behind [`AnomalyScorer`] so a learned scorer can be swapped
//! in without touching the ingest path.

use telemetry_types::{AnomalyKind, Measurement, Severity};

use crate::features::{mean, std_dev};
use crate::ring::StoredMeasurement;

/// Number of newest entries treated as the recent window.
const RECENT_WINDOW: usize = 10;
/// Minimum baseline entries before z-scoring is meaningful.
const MIN_BASELINE: usize = 5;

/// One detected anomaly, ready to be stamped into an event.
#[derive(Debug, Clone)]
pub struct ScoredAnomaly {
    pub score: f64,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub detail: String,
}

/// Result of scoring one measurement.
#[derive(Debug, Clone, Default)]
pub struct Assessment {
    /// Combined statistical score in [0, 1]; stored on the ring entry and
    /// used for spatial clustering even when no event fires.
    pub score: f64,
    /// Events worth publishing (primary score > 0.5, plus channel checks).
    pub events: Vec<ScoredAnomaly>,
}

/// Scoring contract shared by the statistical detector and any learned
/// scorer: inspect one measurement against history, optionally train.
pub trait AnomalyScorer: Send + Sync {
    /// `history` is the device ring tail, newest last; it already contains
    /// `measurement` as its final entry.
    fn score(&self, measurement: &Measurement, history: &[StoredMeasurement]) -> Assessment;

    /// Training hook — a no-op for rule-based scorers.
    fn fit(&mut self, _history: &[StoredMeasurement]) {}
}

// ── Statistical detector ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StatisticalDetector {
    /// dBm drop between consecutive samples counted as a sudden drop
    pub drop_threshold_dbm: f64,
    /// recent-window RSSI std counted as oscillation
    pub oscillation_threshold_dbm: f64,
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self {
            drop_threshold_dbm: 20.0,
            oscillation_threshold_dbm: 15.0,
        }
    }
}

impl AnomalyScorer for StatisticalDetector {
    fn score(&self, measurement: &Measurement, history: &[StoredMeasurement]) -> Assessment {
        if history.len() < RECENT_WINDOW {
            return Assessment::default();
        }

        let split = history.len() - RECENT_WINDOW;
        let baseline = &history[..split];
        let recent = &history[split..];

        let mut events = Vec::new();
        let mut combined = 0.0;
        let mut kind = AnomalyKind::RssiDeviation;
        let mut detail = String::new();

        // 1. z-score against the baseline
        let baseline_rssi: Vec<f64> = baseline.iter().map(|e| e.rssi()).collect();
        if baseline_rssi.len() >= MIN_BASELINE {
            let base_mean = mean(&baseline_rssi);
            let base_std = std_dev(&baseline_rssi);
            if base_std > 0.0 {
                combined += (measurement.rssi - base_mean).abs() / base_std;
                detail = format!(
                    "RSSI anomaly: {:.1} dBm (baseline: {:.1}±{:.1})",
                    measurement.rssi, base_mean, base_std
                );
            }
        }

        // 2. sudden signal drop vs the previous sample
        if history.len() >= 2 {
            let prev = history[history.len() - 2].rssi();
            if prev - measurement.rssi > self.drop_threshold_dbm {
                combined += 2.0;
                kind = AnomalyKind::Drop;
                detail = format!(
                    "Sudden signal drop: {:.1} → {:.1} dBm",
                    prev, measurement.rssi
                );
            }
        }

        // 3. oscillation over the recent window
        let recent_rssi: Vec<f64> = recent.iter().map(|e| e.rssi()).collect();
        if std_dev(&recent_rssi) > self.oscillation_threshold_dbm {
            combined += 1.0;
            if kind == AnomalyKind::RssiDeviation {
                kind = AnomalyKind::Oscillation;
                detail = format!(
                    "Signal oscillation: recent std {:.1} dBm",
                    std_dev(&recent_rssi)
                );
            }
        }

        let score = (combined / 5.0).min(1.0);
        if score > 0.5 {
            events.push(ScoredAnomaly {
                score,
                kind,
                severity: Severity::from_score(score),
                detail,
            });
        }

        // 4. latency spike vs baseline mean response time
        if let Some(rt) = measurement.response_time_ms {
            let baseline_rt: Vec<f64> = baseline
                .iter()
                .filter_map(|e| e.measurement.response_time_ms)
                .collect();
            if !baseline_rt.is_empty() {
                let rt_mean = mean(&baseline_rt);
                if rt_mean > 0.0 && rt > 2.0 * rt_mean {
                    let ratio = rt / rt_mean;
                    let spike_score = (ratio / 4.0).min(1.0);
                    events.push(ScoredAnomaly {
                        score: spike_score,
                        kind: AnomalyKind::LatencySpike,
                        severity: Severity::from_score(spike_score),
                        detail: format!(
                            "Response time spike: {rt:.0} ms (baseline: {rt_mean:.0} ms)"
                        ),
                    });
                }
            }
        }

        // 5. unexpected disconnect: device reports offline while the last
        //    five baseline entries were all online
        if measurement.is_online == Some(false) {
            let recent_online: Vec<bool> = baseline
                .iter()
                .rev()
                .filter_map(|e| e.measurement.is_online)
                .take(5)
                .collect();
            if recent_online.len() == 5 && recent_online.iter().all(|o| *o) {
                events.push(ScoredAnomaly {
                    score: 0.75,
                    kind: AnomalyKind::Disconnect,
                    severity: Severity::High,
                    detail: "Unexpected device disconnect".to_string(),
                });
            }
        }

        // 6. temperature spike over baseline max
        if let Some(temp) = measurement.temperature_c {
            let baseline_temp: Vec<f64> = baseline
                .iter()
                .filter_map(|e| e.measurement.temperature_c)
                .collect();
            if !baseline_temp.is_empty() {
                let base_max = baseline_temp.iter().cloned().fold(f64::MIN, f64::max);
                if temp > base_max + 10.0 {
                    let spike_score = (0.5 + (temp - base_max - 10.0) / 20.0).min(1.0);
                    events.push(ScoredAnomaly {
                        score: spike_score,
                        kind: AnomalyKind::TempSpike,
                        severity: Severity::from_score(spike_score),
                        detail: format!(
                            "Temperature spike: {temp:.1}°C (previous max: {base_max:.1}°C)"
                        ),
                    });
                }
            }
        }

        Assessment { score, events }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::Measurement;

    fn stored(m: Measurement) -> StoredMeasurement {
        StoredMeasurement {
            kalman_rssi: m.rssi,
            ewma_rssi: m.rssi,
            anomaly_score: 0.0,
            measurement: m,
        }
    }

    /// `n` quiet samples around −50 dBm with small deterministic jitter.
    fn quiet_history(n: usize) -> Vec<StoredMeasurement> {
        (0..n)
            .map(|i| {
                let jitter = ((i * 7) % 5) as f64 * 0.4 - 0.8;
                stored(Measurement::rssi_only("d", i as i64 * 1000, -50.0 + jitter))
            })
            .collect()
    }

    fn detect(history: &[StoredMeasurement]) -> Assessment {
        let det = StatisticalDetector::default();
        let current = history.last().unwrap().measurement.clone();
        det.score(&current, history)
    }

    #[test]
    fn short_history_yields_nothing() {
        let history = quiet_history(9);
        let a = detect(&history);
        assert_eq!(a.score, 0.0);
        assert!(a.events.is_empty());
    }

    #[test]
    fn deviation_from_stable_baseline_scores_high() {
        let mut history = quiet_history(25);
        let m = Measurement::rssi_only("d", 25_000, -90.0);
        history.push(stored(m.clone()));
        let a = StatisticalDetector::default().score(&m, &history);
        // huge z-score plus the 40 dBm drop saturate the scale
        assert!(a.score > 0.5, "score {}", a.score);
        assert!(a.score <= 1.0);
        let primary = &a.events[0];
        assert_eq!(primary.kind, AnomalyKind::Drop);
        assert_eq!(primary.severity, Severity::High);
    }

    #[test]
    fn oscillating_signal_is_flagged() {
        let mut history = quiet_history(20);
        for i in 0..10 {
            let rssi = if i % 2 == 0 { -30.0 } else { -75.0 };
            history.push(stored(Measurement::rssi_only("d", 20_000 + i, rssi)));
        }
        let a = detect(&history);
        assert!(a.score > 0.0);
        // at least one rssi-shaped event, flagged as drop or oscillation
        assert!(a
            .events
            .iter()
            .any(|e| matches!(e.kind, AnomalyKind::Oscillation | AnomalyKind::Drop)));
    }

    #[test]
    fn latency_spike_emits_its_own_event() {
        let mut history: Vec<StoredMeasurement> = (0..20)
            .map(|i| {
                let mut m = Measurement::rssi_only("d", i * 1000, -50.0);
                m.response_time_ms = Some(100.0);
                stored(m)
            })
            .collect();
        let mut m = Measurement::rssi_only("d", 20_000, -50.0);
        m.response_time_ms = Some(450.0);
        history.push(stored(m.clone()));

        let a = StatisticalDetector::default().score(&m, &history);
        let spike = a
            .events
            .iter()
            .find(|e| e.kind == AnomalyKind::LatencySpike)
            .expect("no latency event");
        // 4.5× the baseline saturates to high severity
        assert_eq!(spike.severity, Severity::High);
    }

    #[test]
    fn disconnect_after_all_online_baseline() {
        let mut history: Vec<StoredMeasurement> = (0..20)
            .map(|i| {
                let mut m = Measurement::rssi_only("d", i * 1000, -50.0);
                m.is_online = Some(true);
                stored(m)
            })
            .collect();
        let mut m = Measurement::rssi_only("d", 20_000, -50.0);
        m.is_online = Some(false);
        history.push(stored(m.clone()));

        let a = StatisticalDetector::default().score(&m, &history);
        assert!(a.events.iter().any(|e| e.kind == AnomalyKind::Disconnect));
    }

    #[test]
    fn temperature_spike_over_baseline_max() {
        let mut history: Vec<StoredMeasurement> = (0..20)
            .map(|i| {
                let mut m = Measurement::rssi_only("d", i * 1000, -50.0);
                m.temperature_c = Some(60.0);
                stored(m)
            })
            .collect();
        let mut m = Measurement::rssi_only("d", 20_000, -50.0);
        m.temperature_c = Some(82.0);
        history.push(stored(m.clone()));

        let a = StatisticalDetector::default().score(&m, &history);
        let spike = a
            .events
            .iter()
            .find(|e| e.kind == AnomalyKind::TempSpike)
            .expect("no temperature event");
        assert!(spike.score > 0.5);
    }

    #[test]
    fn quiet_device_raises_no_events() {
        let history = quiet_history(40);
        let a = detect(&history);
        assert!(a.score < 0.5, "score {}", a.score);
        assert!(a.events.is_empty());
    }
}

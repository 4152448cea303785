//! # features
//!
//! Reduces a device's measurement tail to a flat feature map for health
//! scoring. A channel contributes features only when it was observed at
//! least three times in the window; downstream consumers test presence,
//! never assume it.

use std::collections::BTreeMap;

use telemetry_types::SignalQuality;

use crate::ring::StoredMeasurement;

// ── Basic statistics ──────────────────────────────────────────────────────────

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Slope of a degree-1 least-squares fit of `values` against indices 0..n−1.
/// Returns 0 for fewer than two points.
pub(crate) fn trend(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

// ── Feature map ───────────────────────────────────────────────────────────────

/// Named scalar features extracted from a device window.
#[derive(Debug, Clone, Default)]
pub struct Features(BTreeMap<&'static str, f64>);

impl Features {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn insert(&mut self, key: &'static str, value: f64) {
        self.0.insert(key, value);
    }

    /// Count of `*_trend` features with a negative slope — the degradation
    /// signal driving failure projection.
    pub fn negative_trend_count(&self) -> usize {
        self.0
            .iter()
            .filter(|(k, v)| k.ends_with("_trend") && **v < 0.0)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &f64)> {
        self.0.iter()
    }
}

const MIN_CHANNEL_SAMPLES: usize = 3;

/// Samples required before signal quality is reported as non-zero.
const MIN_QUALITY_SAMPLES: usize = 5;

/// Signal quality over a window of smoothed RSSI values.
///
/// Strength normalizes the −100..−30 dBm range, stability is the inverse of
/// spread, and the overall score weights them 60/40.
pub fn signal_quality(rssi: &[f64]) -> SignalQuality {
    if rssi.len() < MIN_QUALITY_SAMPLES {
        return SignalQuality::default();
    }
    let m = mean(rssi);
    let std = std_dev(rssi);
    let strength = ((m + 100.0) / 70.0).clamp(0.0, 1.0);
    let stability = (1.0 - std / 30.0).clamp(0.0, 1.0);
    SignalQuality {
        overall: 0.6 * strength + 0.4 * stability,
        stability,
        strength,
        rssi_mean: Some(m),
        rssi_std: Some(std),
    }
}

/// Extract the feature map from a device's tail window.
pub fn extract(history: &[StoredMeasurement]) -> Features {
    let mut f = Features::default();
    let n = history.len();

    // Signal strength (rssi is mandatory, so observed on every entry)
    if n >= MIN_CHANNEL_SAMPLES {
        let rssi: Vec<f64> = history.iter().map(|e| e.rssi()).collect();
        f.insert("rssi_mean", mean(&rssi));
        f.insert("rssi_std", std_dev(&rssi));
        f.insert("rssi_trend", trend(&rssi));
    }

    // Response time
    let rt: Vec<f64> = history
        .iter()
        .filter_map(|e| e.measurement.response_time_ms)
        .collect();
    if rt.len() >= MIN_CHANNEL_SAMPLES {
        f.insert("response_time_mean", mean(&rt));
        f.insert("response_time_std", std_dev(&rt));
        f.insert("response_time_trend", trend(&rt));
    }

    // Availability
    let online: Vec<bool> = history
        .iter()
        .filter_map(|e| e.measurement.is_online)
        .collect();
    if online.len() >= MIN_CHANNEL_SAMPLES {
        let up = online.iter().filter(|o| **o).count() as f64;
        f.insert("uptime_ratio", up / online.len() as f64);
        let disconnects = online
            .windows(2)
            .filter(|w| w[0] && !w[1])
            .count();
        f.insert("disconnect_events", disconnects as f64);
    }

    // Errors
    let errors: Vec<f64> = history
        .iter()
        .filter_map(|e| e.measurement.error_count.map(|c| c as f64))
        .collect();
    if errors.len() >= MIN_CHANNEL_SAMPLES {
        f.insert("error_rate", errors.iter().sum::<f64>() / n as f64);
        f.insert("error_trend", trend(&errors));
    }

    // Traffic
    let traffic: Vec<f64> = history
        .iter()
        .filter_map(|e| {
            match (e.measurement.bytes_tx, e.measurement.bytes_rx) {
                (Some(tx), Some(rx)) => Some((tx + rx) as f64),
                _ => None,
            }
        })
        .collect();
    if traffic.len() >= MIN_CHANNEL_SAMPLES {
        f.insert("traffic_volume", mean(&traffic));
        let m = mean(&traffic);
        let var = traffic.iter().map(|v| (v - m).powi(2)).sum::<f64>() / traffic.len() as f64;
        f.insert("traffic_variance", var);
    }

    // Temperature
    let temps: Vec<f64> = history
        .iter()
        .filter_map(|e| e.measurement.temperature_c)
        .collect();
    if temps.len() >= MIN_CHANNEL_SAMPLES {
        f.insert("temp_mean", mean(&temps));
        f.insert("temp_max", temps.iter().cloned().fold(f64::MIN, f64::max));
    }

    // Power
    let power: Vec<f64> = history
        .iter()
        .filter_map(|e| e.measurement.power_w)
        .collect();
    if power.len() >= MIN_CHANNEL_SAMPLES {
        f.insert("power_mean", mean(&power));
        f.insert("power_trend", trend(&power));
    }

    f
}

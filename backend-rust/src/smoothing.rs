//! # smoothing
//!
//! Online RSSI smoothers, one pair per device: a scalar Kalman filter and an
//! exponentially-weighted moving average. Both are deterministic, carry no
//! look-ahead, and update exactly once per ingested measurement.

// ── Kalman (scalar) ───────────────────────────────────────────────────────────

/// 1-D Kalman filter over a noisy scalar stream.
///
/// State is `(x̂, P)`. The first measurement seeds the estimate directly.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    /// Process variance Q
    process_variance: f64,
    /// Measurement variance R
    measurement_variance: f64,
    estimate: Option<f64>,
    error_estimate: f64,
}

impl KalmanFilter {
    pub fn new(process_variance: f64, measurement_variance: f64) -> Self {
        Self {
            process_variance,
            measurement_variance,
            estimate: None,
            error_estimate: 1.0,
        }
    }

    /// Fold in one measurement and return the updated estimate.
    pub fn update(&mut self, measurement: f64) -> f64 {
        let prev = match self.estimate {
            Some(e) => e,
            None => {
                self.estimate = Some(measurement);
                return measurement;
            }
        };

        // Prediction
        let prediction_error = self.error_estimate + self.process_variance;

        // Update
        let gain = prediction_error / (prediction_error + self.measurement_variance);
        let estimate = prev + gain * (measurement - prev);
        self.error_estimate = (1.0 - gain) * prediction_error;
        self.estimate = Some(estimate);
        estimate
    }

    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(1e-3, 0.1)
    }
}

// ── EWMA ──────────────────────────────────────────────────────────────────────

/// Exponentially-weighted moving average: `y ← α·z + (1−α)·y`.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, measurement: f64) -> f64 {
        let value = match self.value {
            Some(v) => self.alpha * measurement + (1.0 - self.alpha) * v,
            None => measurement,
        };
        self.value = Some(value);
        value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(0.3)
    }
}

//! # heatmap
//!
//! Inverse-distance-weighted interpolation of smoothed RSSI over a
//! rectangular grid, with the current anomaly regions painted on a second
//! layer. Output is pure data — rendering belongs to the clients.

use serde::Serialize;
use telemetry_types::{AnomalyRegion, Point};

/// Minimum number of positioned devices before interpolation is attempted;
/// below this the grids are all zeros.
const MIN_SIGNAL_POINTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heatmap {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    pub resolution: usize,
    /// `signal[row][col]`, row = y index, col = x index
    pub signal: Vec<Vec<f64>>,
    pub anomaly_overlay: Vec<Vec<f64>>,
}

/// One interpolation source: a positioned device and its recent mean RSSI.
#[derive(Debug, Clone, Copy)]
pub struct SignalPoint {
    pub position: Point,
    pub rssi: f64,
}

fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![a];
    }
    let step = (b - a) / (n - 1) as f64;
    (0..n).map(|i| a + step * i as f64).collect()
}

/// Build the interpolated signal grid and anomaly overlay for the given
/// bounds at `resolution × resolution` cells.
pub fn generate(
    bounds: (f64, f64, f64, f64),
    resolution: usize,
    points: &[SignalPoint],
    regions: &[AnomalyRegion],
) -> Heatmap {
    let (x0, y0, x1, y1) = bounds;
    let resolution = resolution.max(1);

    let mut signal = vec![vec![0.0; resolution]; resolution];
    let mut overlay = vec![vec![0.0; resolution]; resolution];

    if points.len() >= MIN_SIGNAL_POINTS {
        let xs = linspace(x0, x1, resolution);
        let ys = linspace(y0, y1, resolution);

        for (row, &gy) in ys.iter().enumerate() {
            for (col, &gx) in xs.iter().enumerate() {
                let cell = Point::new(gx, gy);

                // Inverse-distance-squared weighting; clamp at 1 m to keep
                // a device's own cell finite
                let mut weight_sum = 0.0;
                let mut value_sum = 0.0;
                for p in points {
                    let d = cell.dist(&p.position);
                    let w = if d < 1.0 { 1.0 } else { 1.0 / (d * d) };
                    weight_sum += w;
                    value_sum += w * p.rssi;
                }
                if weight_sum > 0.0 {
                    signal[row][col] = value_sum / weight_sum;
                }

                for region in regions {
                    let d = cell.dist(&region.centre);
                    if d <= region.radius && region.radius > 0.0 {
                        let intensity = (1.0 - d / region.radius) * region.confidence;
                        if intensity > overlay[row][col] {
                            overlay[row][col] = intensity;
                        }
                    }
                }
            }
        }
    }

    Heatmap {
        x0,
        y0,
        x1,
        y1,
        resolution,
        signal,
        anomaly_overlay: overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::Severity;

    fn sources() -> Vec<SignalPoint> {
        vec![
            SignalPoint { position: Point::new(0.0, 0.0), rssi: -40.0 },
            SignalPoint { position: Point::new(100.0, 0.0), rssi: -80.0 },
            SignalPoint { position: Point::new(50.0, 100.0), rssi: -60.0 },
        ]
    }

    #[test]
    fn too_few_points_yields_zero_grids() {
        let map = generate((0.0, 0.0, 100.0, 100.0), 10, &sources()[..2], &[]);
        assert_eq!(map.signal.len(), 10);
        assert!(map.signal.iter().flatten().all(|v| *v == 0.0));
        assert!(map.anomaly_overlay.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn cell_at_a_device_is_dominated_by_it() {
        let map = generate((0.0, 0.0, 100.0, 100.0), 11, &sources(), &[]);
        // grid corner (0,0) sits on the −40 dBm device: within the 1 m
        // clamp it gets full weight, the others ~1/d²
        let corner = map.signal[0][0];
        assert!((corner - -40.0).abs() < 1.0, "corner {corner}");
        // far corner leans toward the −80 dBm device
        let far = map.signal[0][10];
        assert!(far < -70.0, "far corner {far}");
    }

    #[test]
    fn overlay_peaks_at_region_centre_and_ends_at_radius() {
        let region = AnomalyRegion {
            centre: Point::new(50.0, 50.0),
            radius: 20.0,
            severity: Severity::High,
            kind: "signal_degradation".into(),
            confidence: 0.9,
            member_device_ids: vec![],
            created_at: 0,
        };
        let map = generate((0.0, 0.0, 100.0, 100.0), 11, &sources(), &[region]);
        // centre cell (50,50) = row 5, col 5
        assert!((map.anomaly_overlay[5][5] - 0.9).abs() < 1e-9);
        // a cell well outside the radius is untouched
        assert_eq!(map.anomaly_overlay[0][0], 0.0);
        // inside but off-centre is attenuated linearly
        let off = map.anomaly_overlay[5][6]; // (60,50), 10 m out of 20
        assert!((off - 0.45).abs() < 1e-9);
    }
}

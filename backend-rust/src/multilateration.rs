//! # multilateration
//!
//! RSSI-based position solving against a set of fixed anchors.
//!
//! RSSI converts to a distance estimate through the log-distance path-loss
//! model; the position is then the least-squares minimizer of
//! `Σ (‖q − p_i‖ − d_i)²` over all anchors, found by Gauss-Newton iteration
//! on the 2×2 normal equations (Cramer solve — fast and allocation-free for
//! the planar case). Colinear anchor sets are rejected up front: the normal
//! matrix would be singular along the line and the solve meaningless.

use telemetry_types::{Anchor, Point, Position, PositionMethod};

const MAX_ITERATIONS: u32 = 200;
const CONVERGE_TOLERANCE: f64 = 1e-6;
const COLINEARITY_EPS: f64 = 1e-6;

/// Distance clamp bounds, meters.
const MIN_DISTANCE_M: f64 = 1.0;
const MAX_DISTANCE_M: f64 = 1000.0;

// ── RSSI → distance ───────────────────────────────────────────────────────────

/// Log-distance path loss: `d = 10 ^ ((P_ref − P_rx) / (10·n))`, clamped to
/// [1 m, 1000 m]. A received power at or above the 1 m reference maps to 1 m.
pub fn rssi_to_distance(rssi: f64, ref_rssi: f64, path_loss_exponent: f64) -> f64 {
    if rssi >= ref_rssi {
        return MIN_DISTANCE_M;
    }
    let distance = 10f64.powf((ref_rssi - rssi) / (10.0 * path_loss_exponent));
    distance.clamp(MIN_DISTANCE_M, MAX_DISTANCE_M)
}

// ── Least-squares solve ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SolveResult {
    pub point: Point,
    /// `1 − mean_residual / 100`, clamped to [0, 1]
    pub confidence: f64,
    pub mean_residual: f64,
    pub iterations: u32,
}

fn colinear(points: &[Point]) -> bool {
    // Largest twice-triangle-area spanned by the first point and any pair
    let p0 = points[0];
    let mut max_cross = 0.0f64;
    for i in 1..points.len() {
        for j in (i + 1)..points.len() {
            let ax = points[i].x - p0.x;
            let ay = points[i].y - p0.y;
            let bx = points[j].x - p0.x;
            let by = points[j].y - p0.y;
            max_cross = max_cross.max((ax * by - ay * bx).abs());
        }
    }
    max_cross < COLINEARITY_EPS
}

/// Solve for the point minimizing `Σ (‖q − p_i‖ − d_i)²`.
///
/// Returns `None` for fewer than 3 anchors, colinear anchors, a singular
/// normal matrix, or failure to converge within the iteration cap.
pub fn solve(anchors: &[Point], distances: &[f64]) -> Option<SolveResult> {
    if anchors.len() < 3 || anchors.len() != distances.len() {
        return None;
    }
    if colinear(anchors) {
        return None;
    }

    // Initial guess: centroid of the anchors
    let n = anchors.len() as f64;
    let mut q = Point::new(
        anchors.iter().map(|p| p.x).sum::<f64>() / n,
        anchors.iter().map(|p| p.y).sum::<f64>() / n,
    );

    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..MAX_ITERATIONS {
        iterations = iter + 1;

        // Normal equations: JᵀJ·δ = Jᵀr with J_i = (q − p_i)/‖q − p_i‖
        let mut jtj = [[0.0f64; 2]; 2];
        let mut jtr = [0.0f64; 2];

        for (p, &d) in anchors.iter().zip(distances) {
            let dx = q.x - p.x;
            let dy = q.y - p.y;
            let dist = (dx * dx + dy * dy).sqrt().max(1e-9);
            let residual = d - dist;
            let jx = dx / dist;
            let jy = dy / dist;

            jtj[0][0] += jx * jx;
            jtj[0][1] += jx * jy;
            jtj[1][0] += jy * jx;
            jtj[1][1] += jy * jy;
            jtr[0] += jx * residual;
            jtr[1] += jy * residual;
        }

        let det = jtj[0][0] * jtj[1][1] - jtj[0][1] * jtj[1][0];
        if det.abs() < 1e-12 {
            return None;
        }
        let step_x = (jtj[1][1] * jtr[0] - jtj[0][1] * jtr[1]) / det;
        let step_y = (jtj[0][0] * jtr[1] - jtj[1][0] * jtr[0]) / det;

        q.x += step_x;
        q.y += step_y;

        if (step_x * step_x + step_y * step_y).sqrt() < CONVERGE_TOLERANCE {
            converged = true;
            break;
        }
    }

    if !converged {
        return None;
    }

    let residuals: Vec<f64> = anchors
        .iter()
        .zip(distances)
        .map(|(p, &d)| (q.dist(p) - d).abs())
        .collect();
    let mean_residual = residuals.iter().sum::<f64>() / residuals.len() as f64;

    Some(SolveResult {
        point: q,
        confidence: (1.0 - mean_residual / 100.0).clamp(0.0, 1.0),
        mean_residual,
        iterations,
    })
}

// ── Device position estimation ────────────────────────────────────────────────

/// Estimate a device position from its mean RSSI against every anchor's 1 m
/// reference power. `None` when anchors are insufficient or the solver
/// declines.
pub fn estimate_position(
    device_id: &str,
    anchors: &[Anchor],
    mean_rssi: f64,
    path_loss_exponent: f64,
    timestamp: i64,
    method: PositionMethod,
) -> Option<Position> {
    if anchors.len() < 3 {
        return None;
    }

    let points: Vec<Point> = anchors.iter().map(|a| a.pos()).collect();
    let distances: Vec<f64> = anchors
        .iter()
        .map(|a| rssi_to_distance(mean_rssi, a.ref_rssi, path_loss_exponent))
        .collect();

    let result = solve(&points, &distances)?;
    Some(Position {
        device_id: device_id.to_string(),
        x: result.point.x,
        y: result.point.y,
        confidence: result.confidence,
        timestamp,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(50.0, 100.0),
        ]
    }

    #[test]
    fn path_loss_model_basics() {
        // at the reference power the device is at the 1 m floor
        assert_eq!(rssi_to_distance(-30.0, -30.0, 2.0), 1.0);
        assert_eq!(rssi_to_distance(-10.0, -30.0, 2.0), 1.0);
        // 20 dB below reference at n=2 → 10 m
        assert!((rssi_to_distance(-50.0, -30.0, 2.0) - 10.0).abs() < 1e-9);
        // far below reference clamps at 1 km
        assert_eq!(rssi_to_distance(-160.0, -30.0, 2.0), 1000.0);
    }

    #[test]
    fn fewer_than_three_anchors_is_declined() {
        let anchors = vec![Point::new(0.0, 0.0), Point::new(100.0, 0.0)];
        assert!(solve(&anchors, &[10.0, 10.0]).is_none());
    }

    #[test]
    fn colinear_anchors_are_declined() {
        let anchors = vec![
            Point::new(0.0, 0.0),
            Point::new(50.0, 50.0),
            Point::new(100.0, 100.0),
        ];
        assert!(solve(&anchors, &[10.0, 10.0, 10.0]).is_none());
    }

    #[test]
    fn exact_geometry_is_recovered() {
        let anchors = triangle();
        let truth = Point::new(30.0, 40.0);
        let distances: Vec<f64> = anchors.iter().map(|p| truth.dist(p)).collect();

        let result = solve(&anchors, &distances).expect("solver declined");
        assert!(result.point.dist(&truth) < 1e-3, "got {:?}", result.point);
        assert!(result.mean_residual < 1e-3);
        assert!(result.confidence > 0.99);
    }

    #[test]
    fn equidistant_anchors_give_central_fix() {
        // Distances of 50 m to every corner cannot be satisfied exactly; the
        // least-squares point sits centrally below the apex with a modest
        // residual.
        let anchors = triangle();
        let result = solve(&anchors, &[50.0, 50.0, 50.0]).expect("solver declined");
        assert!((result.point.x - 50.0).abs() < 1.0, "x = {}", result.point.x);
        assert!(
            result.point.y > 25.0 && result.point.y < 45.0,
            "y = {}",
            result.point.y
        );
        assert!(result.confidence > 0.8, "confidence {}", result.confidence);
    }

    #[test]
    fn estimate_requires_three_anchors() {
        let anchors = vec![
            Anchor { id: "a".into(), x: 0.0, y: 0.0, ref_rssi: -30.0 },
            Anchor { id: "b".into(), x: 100.0, y: 0.0, ref_rssi: -30.0 },
        ];
        assert!(
            estimate_position("d", &anchors, -50.0, 2.0, 0, PositionMethod::Triangulation)
                .is_none()
        );
    }

    #[test]
    fn estimate_position_from_uniform_rssi() {
        let anchors: Vec<Anchor> = triangle()
            .into_iter()
            .enumerate()
            .map(|(i, p)| Anchor {
                id: format!("anchor-{i}"),
                x: p.x,
                y: p.y,
                ref_rssi: -30.0,
            })
            .collect();
        // −64 dBm against a −30 reference at n=2 → ~50 m from every anchor
        let pos = estimate_position(
            "dev-1",
            &anchors,
            -63.979,
            2.0,
            42,
            PositionMethod::Triangulation,
        )
        .expect("no position");
        assert_eq!(pos.device_id, "dev-1");
        assert_eq!(pos.method, PositionMethod::Triangulation);
        assert_eq!(pos.timestamp, 42);
        assert!((pos.x - 50.0).abs() < 1.5);
        assert!(pos.confidence > 0.8);
    }
}

//! # clustering
//!
//! Spatial clustering of anomalous devices into regions.
//!
//! Devices whose recent mean anomaly score exceeds 0.5 are clustered with
//! DBSCAN over their last known positions. Each dense cluster becomes an
//! [`AnomalyRegion`] carrying centre, radius, severity and the ids of every
//! device inside it — including healthy devices caught within the radius.
//! The clusterer replaces the whole region list on every run; regions are
//! never merged with their predecessors.

use telemetry_types::{AnomalyRegion, Point, Severity};

/// Cluster label for points not belonging to any dense cluster.
pub const NOISE: isize = -1;

/// Region classification applied to every cluster the detector produces.
const REGION_KIND: &str = "signal_degradation";

// ── DBSCAN ────────────────────────────────────────────────────────────────────

/// Density-based clustering. Returns one label per input point; `NOISE` (−1)
/// marks outliers. `min_samples` counts the point itself, matching the
/// conventional formulation.
pub fn dbscan(points: &[Point], eps: f64, min_samples: usize) -> Vec<isize> {
    const UNVISITED: isize = -2;
    let mut labels = vec![UNVISITED; points.len()];
    let mut cluster: isize = 0;

    // eps-neighborhood, including the query point itself
    let neighbors = |idx: usize| -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| points[idx].dist(p) <= eps)
            .map(|(j, _)| j)
            .collect()
    };

    for i in 0..points.len() {
        if labels[i] != UNVISITED {
            continue;
        }
        let seed = neighbors(i);
        if seed.len() < min_samples {
            labels[i] = NOISE;
            continue;
        }

        labels[i] = cluster;
        let mut queue: Vec<usize> = seed;
        while let Some(j) = queue.pop() {
            if labels[j] == NOISE {
                // border point reached from a core point
                labels[j] = cluster;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = cluster;
            let reach = neighbors(j);
            if reach.len() >= min_samples {
                queue.extend(reach);
            }
        }
        cluster += 1;
    }

    labels
}

// ── Region construction ───────────────────────────────────────────────────────

/// Per-device input to a clustering run: last known position plus the mean
/// anomaly score over the device's most recent samples.
#[derive(Debug, Clone)]
pub struct ClusterInput {
    pub device_id: String,
    pub position: Point,
    pub anomaly_score: f64,
}

/// Cluster currently-anomalous devices into regions.
pub fn build_regions(
    devices: &[ClusterInput],
    eps: f64,
    min_samples: usize,
    now_ms: i64,
) -> Vec<AnomalyRegion> {
    let anomalous: Vec<&ClusterInput> = devices
        .iter()
        .filter(|d| d.anomaly_score > 0.5)
        .collect();
    if anomalous.len() < 2 {
        return Vec::new();
    }

    let points: Vec<Point> = anomalous.iter().map(|d| d.position).collect();
    let labels = dbscan(&points, eps, min_samples);
    let cluster_count = labels.iter().cloned().max().map_or(0, |m| m + 1);

    let mut regions = Vec::new();
    for cluster in 0..cluster_count {
        let members: Vec<&ClusterInput> = anomalous
            .iter()
            .zip(&labels)
            .filter(|(_, l)| **l == cluster)
            .map(|(d, _)| *d)
            .collect();
        if members.len() < 2 {
            continue;
        }

        let n = members.len() as f64;
        let centre = Point::new(
            members.iter().map(|d| d.position.x).sum::<f64>() / n,
            members.iter().map(|d| d.position.y).sum::<f64>() / n,
        );
        let radius = members
            .iter()
            .map(|d| d.position.dist(&centre))
            .fold(0.0f64, f64::max);

        // Everything inside the radius is affected, anomalous or not
        let inside: Vec<&ClusterInput> = devices
            .iter()
            .filter(|d| d.position.dist(&centre) <= radius)
            .collect();
        let confidence = if inside.is_empty() {
            0.0
        } else {
            inside.iter().map(|d| d.anomaly_score).sum::<f64>() / inside.len() as f64
        };

        regions.push(AnomalyRegion {
            centre,
            radius,
            severity: if confidence > 0.7 {
                Severity::High
            } else {
                Severity::Medium
            },
            kind: REGION_KIND.to_string(),
            confidence,
            member_device_ids: inside.iter().map(|d| d.device_id.clone()).collect(),
            created_at: now_ms,
        });
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: &str, x: f64, y: f64, score: f64) -> ClusterInput {
        ClusterInput {
            device_id: id.to_string(),
            position: Point::new(x, y),
            anomaly_score: score,
        }
    }

    #[test]
    fn dbscan_separates_dense_pair_from_outlier() {
        let points = vec![
            Point::new(10.0, 10.0),
            Point::new(12.0, 11.0),
            Point::new(40.0, 40.0),
        ];
        let labels = dbscan(&points, 30.0, 2);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[0], NOISE);
        assert_eq!(labels[2], NOISE);
    }

    #[test]
    fn dbscan_chains_through_density() {
        // 5 points in a line, 10 apart, eps 15: one connected cluster
        let points: Vec<Point> = (0..5).map(|i| Point::new(i as f64 * 10.0, 0.0)).collect();
        let labels = dbscan(&points, 15.0, 2);
        assert!(labels.iter().all(|l| *l == 0), "labels {labels:?}");
    }

    #[test]
    fn close_anomalous_pair_forms_one_region() {
        let devices = vec![
            input("a", 10.0, 10.0, 0.8),
            input("b", 12.0, 11.0, 0.7),
            input("c", 40.0, 40.0, 0.9),
        ];
        let regions = build_regions(&devices, 30.0, 2, 1000);
        assert_eq!(regions.len(), 1);

        let r = &regions[0];
        assert!((r.centre.x - 11.0).abs() < 1e-9);
        assert!((r.centre.y - 10.5).abs() < 1e-9);
        assert_eq!(r.member_device_ids.len(), 2);
        assert!(r.member_device_ids.contains(&"a".to_string()));
        assert!(r.member_device_ids.contains(&"b".to_string()));
        assert!(!r.member_device_ids.contains(&"c".to_string()));
        // mean of 0.8 and 0.7 crosses the high-severity bar
        assert!((r.confidence - 0.75).abs() < 1e-9);
        assert_eq!(r.severity, Severity::High);
        assert_eq!(r.created_at, 1000);
    }

    #[test]
    fn quiet_devices_produce_no_regions() {
        let devices = vec![
            input("a", 10.0, 10.0, 0.2),
            input("b", 12.0, 11.0, 0.3),
            input("c", 11.0, 12.0, 0.5), // exactly 0.5 is not anomalous
        ];
        assert!(build_regions(&devices, 30.0, 2, 0).is_empty());
    }

    #[test]
    fn healthy_device_inside_radius_is_listed_and_dilutes_confidence() {
        let devices = vec![
            input("a", 0.0, 0.0, 0.9),
            input("b", 10.0, 0.0, 0.9),
            input("quiet", 5.0, 1.0, 0.0),
        ];
        let regions = build_regions(&devices, 30.0, 2, 0);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert!(r.member_device_ids.contains(&"quiet".to_string()));
        assert!((r.confidence - 0.6).abs() < 1e-9);
        assert_eq!(r.severity, Severity::Medium);
    }
}

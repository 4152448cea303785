//! # ring
//!
//! Fixed-capacity FIFO of measurements, one per tracked device.
//!
//! Appends are O(1); when the buffer is full the oldest entry is evicted.
//! The orchestrator serializes appends per device (shard lock), so the ring
//! itself carries no synchronization. Tail reads hand out owned copies — a
//! point-in-time snapshot that stays valid after the lock is released.

use std::collections::VecDeque;

use telemetry_types::Measurement;

/// A measurement as stored in the ring: the raw sample plus the smoothed
/// values and anomaly score the pipeline attached on ingest.
#[derive(Debug, Clone)]
pub struct StoredMeasurement {
    pub measurement: Measurement,
    pub kalman_rssi: f64,
    pub ewma_rssi: f64,
    /// Combined statistical anomaly score in [0, 1]; 0 until history ≥ 10
    pub anomaly_score: f64,
}

impl StoredMeasurement {
    pub fn timestamp(&self) -> i64 {
        self.measurement.timestamp
    }

    pub fn rssi(&self) -> f64 {
        self.measurement.rssi
    }
}

#[derive(Debug)]
pub struct MeasurementRing {
    buf: VecDeque<StoredMeasurement>,
    capacity: usize,
}

impl MeasurementRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one entry, evicting the oldest when at capacity.
    pub fn append(&mut self, entry: StoredMeasurement) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Newest entry, if any.
    pub fn last(&self) -> Option<&StoredMeasurement> {
        self.buf.back()
    }

    pub fn last_mut(&mut self) -> Option<&mut StoredMeasurement> {
        self.buf.back_mut()
    }

    /// The last `k` entries in append order (oldest first). Owned snapshot.
    pub fn tail(&self, k: usize) -> Vec<StoredMeasurement> {
        let skip = self.buf.len().saturating_sub(k);
        self.buf.iter().skip(skip).cloned().collect()
    }

    /// All entries in append order. Owned snapshot.
    pub fn all(&self) -> Vec<StoredMeasurement> {
        self.buf.iter().cloned().collect()
    }

    /// Entries with timestamp in `[from_ms, to_ms]`, append order.
    pub fn window(&self, from_ms: i64, to_ms: i64) -> Vec<StoredMeasurement> {
        self.buf
            .iter()
            .filter(|e| e.timestamp() >= from_ms && e.timestamp() <= to_ms)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredMeasurement> {
        self.buf.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::Measurement;

    fn entry(ts: i64, rssi: f64) -> StoredMeasurement {
        StoredMeasurement {
            measurement: Measurement::rssi_only("dev", ts, rssi),
            kalman_rssi: rssi,
            ewma_rssi: rssi,
            anomaly_score: 0.0,
        }
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut ring = MeasurementRing::new(5);
        for i in 0..20 {
            ring.append(entry(i, -50.0));
            assert!(ring.len() <= 5);
        }
        assert_eq!(ring.len(), 5);
        // Oldest entries were evicted: survivors are 15..19
        let ts: Vec<i64> = ring.iter().map(|e| e.timestamp()).collect();
        assert_eq!(ts, vec![15, 16, 17, 18, 19]);
    }

    #[test]
    fn tail_returns_newest_in_append_order() {
        let mut ring = MeasurementRing::new(10);
        for i in 0..7 {
            ring.append(entry(i, -50.0 - i as f64));
        }
        let tail = ring.tail(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].timestamp(), 4);
        assert_eq!(tail[2].timestamp(), 6);

        // asking for more than we have returns everything
        assert_eq!(ring.tail(100).len(), 7);
    }

    #[test]
    fn window_filters_by_timestamp() {
        let mut ring = MeasurementRing::new(10);
        for i in 0..10 {
            ring.append(entry(i * 1000, -50.0));
        }
        let w = ring.window(3000, 6000);
        assert_eq!(w.len(), 4);
        assert_eq!(w.first().unwrap().timestamp(), 3000);
        assert_eq!(w.last().unwrap().timestamp(), 6000);
    }
}

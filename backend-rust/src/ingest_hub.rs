//! # ingest_hub
//!
//! Telemetry ingest hub — receives TelemetryEnvelopes from field agents via
//! UDP, validates them, and feeds the measurements into the signal engine.
//!
//! ## Architecture
//! This module runs as a separate Tokio task (tokio::spawn) alongside the
//! Socket.IO handler. It:
//!   1. Binds a UDP socket on port 5577 (configurable via SIGNALMESH_UDP_PORT)
//!   2. Receives TelemetryEnvelopes (JSON, one measurement per datagram)
//!   3. Validates per-agent sequence numbers (replay/stale detection)
//!   4. Hands each measurement to `SignalEngine::ingest`
//!
//! ## Invariants
//! - UDP errors never crash the server: malformed packets are logged at
//!   debug level and skipped, socket errors are logged and the loop
//!   continues.
//! - A rejected packet leaves the engine untouched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use telemetry_types::TelemetryEnvelope;

use crate::engine::SignalEngine;

// ── Configuration ─────────────────────────────────────────────────────────────

pub struct IngestHubConfig {
    /// UDP port to listen on (default 5577)
    pub udp_port: u16,
    /// Datagram buffer size in bytes
    pub buffer_bytes: usize,
}

impl Default for IngestHubConfig {
    fn default() -> Self {
        Self {
            udp_port: std::env::var("SIGNALMESH_UDP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5577),
            buffer_bytes: 8192,
        }
    }
}

// ── Sequence Number Tracker (replay protection) ───────────────────────────────

/// Tracks the last seen sequence number per agent.
/// Rejects exact duplicates and large backward jumps (likely replays);
/// tolerates small reordering.
struct SeqTracker {
    last_seq: HashMap<String, u32>,
}

impl SeqTracker {
    fn new() -> Self {
        Self { last_seq: HashMap::new() }
    }

    fn accept(&mut self, agent_id: &str, seq_num: u32) -> bool {
        let last = self.last_seq.entry(agent_id.to_string()).or_insert(0);
        let diff = seq_num.wrapping_sub(*last);
        if diff == 0 || diff > 1000 {
            warn!("Ingest: rejected packet from {agent_id}: seq {seq_num} (last: {last})");
            return false;
        }
        *last = seq_num;
        true
    }
}

// ── Main UDP listener task ────────────────────────────────────────────────────

/// Start the ingest hub UDP listener as a background Tokio task.
pub async fn start_ingest_hub(config: IngestHubConfig, engine: Arc<SignalEngine>) {
    let addr = format!("0.0.0.0:{}", config.udp_port);
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => {
            info!("📡 Ingest hub listening on UDP {addr}");
            s
        }
        Err(e) => {
            warn!("Ingest hub: could not bind UDP {addr}: {e} (UDP ingest disabled)");
            return;
        }
    };

    let mut seq_tracker = SeqTracker::new();
    let mut buf = vec![0u8; config.buffer_bytes];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                process_packet(&buf[..len], src, &mut seq_tracker, &engine);
            }
            Err(e) => {
                // Never crash — log and continue
                warn!("Ingest hub: UDP recv error: {e}");
            }
        }
    }
}

fn process_packet(
    data: &[u8],
    src: SocketAddr,
    seq_tracker: &mut SeqTracker,
    engine: &SignalEngine,
) {
    let envelope: TelemetryEnvelope = match serde_json::from_slice(data) {
        Ok(e) => e,
        Err(e) => {
            debug!("Ingest: malformed packet from {src}: {e}");
            return;
        }
    };

    if !seq_tracker.accept(&envelope.agent_id, envelope.seq_num) {
        return;
    }

    match engine.ingest(envelope.measurement) {
        Ok(processed) => {
            debug!(
                "Ingest: {} rssi {:.1} → kalman {:.1} (anomaly {:.2})",
                processed.device_id,
                processed.raw_rssi,
                processed.kalman_rssi,
                processed.anomaly_score
            );
        }
        Err(e) => {
            debug!("Ingest: rejected measurement from {src}: {e}");
        }
    }
}

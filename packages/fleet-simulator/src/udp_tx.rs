//! udp_tx.rs — UDP transmitter for TelemetryEnvelopes
//!
//! Sends simulated agent telemetry to the backend ingest hub as one JSON
//! datagram per measurement. Send errors are logged but never crash the
//! sim — the backend may simply not be running yet.

use std::net::UdpSocket;

use tracing::{debug, warn};

use telemetry_types::{Measurement, TelemetryEnvelope};

pub struct UdpTransmitter {
    socket: UdpSocket,
    hub_addr: String,
    agent_id: String,
    seq_num: u32,
}

impl UdpTransmitter {
    pub fn new(hub_addr: &str, agent_id: &str) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            hub_addr: hub_addr.to_string(),
            agent_id: agent_id.to_string(),
            seq_num: 0,
        })
    }

    /// Wrap one measurement in an envelope and send it to the hub.
    pub fn send(&mut self, measurement: Measurement) {
        self.seq_num = self.seq_num.wrapping_add(1);
        let envelope = TelemetryEnvelope {
            seq_num: self.seq_num,
            agent_id: self.agent_id.clone(),
            measurement,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!("UDP tx: serialization failed: {e}");
                return;
            }
        };
        match self.socket.send_to(&payload, &self.hub_addr) {
            Ok(_) => debug!(
                "UDP tx: {} seq {} → {}",
                envelope.measurement.device_id, envelope.seq_num, self.hub_addr
            ),
            Err(e) => warn!("UDP tx: send to {} failed: {e}", self.hub_addr),
        }
    }
}

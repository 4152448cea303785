//! # handlers
//!
//! Socket.IO surface: live topic subscriptions plus the query and admin
//! events. Each subscription gets a bounded inbox on the event bus and a
//! forwarder task that drains it to the socket; a subscriber that falls far
//! enough behind to exhaust its drop allowance is disconnected rather than
//! allowed to slow anything down.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use socketioxide::extract::{Data, SocketRef};
use tracing::{info, warn};

use telemetry_types::Measurement;

use crate::bus::Topic;
use crate::engine::SignalEngine;

pub type SharedEngine = Arc<SignalEngine>;

/// Dropped events tolerated per subscription (as a multiple of its inbox
/// capacity) before the client is considered too slow and disconnected.
const DROP_ALLOWANCE_FACTOR: u64 = 10;

const HOUR_MS: i64 = 3_600_000;

// ─── Main Connection Handler ──────────────────────────────────────────────────

pub async fn on_connect(socket: SocketRef, engine: SharedEngine) {
    let socket_id = socket.id.to_string();
    info!("Client connected: {socket_id}");

    // subscription ids owned by this socket, released on disconnect
    let subscriptions: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    // Cleanup on disconnect
    socket.on_disconnect({
        let engine = engine.clone();
        let subscriptions = subscriptions.clone();
        let sid = socket_id.clone();
        move |_: SocketRef| async move {
            let ids: Vec<u64> = subscriptions.lock().expect("subscriptions poisoned").drain(..).collect();
            for id in ids {
                engine.unsubscribe(id);
            }
            info!("Client disconnected, subscriptions released: {sid}");
        }
    });

    // ── subscribe ─────────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        let subscriptions = subscriptions.clone();
        socket.on("subscribe", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            let subscriptions = subscriptions.clone();
            async move {
                let Some(topic) = data["topic"].as_str().and_then(Topic::parse) else {
                    let _ = s.emit("subscribe-error", &json!({ "error": "unknown topic" }));
                    return;
                };
                let capacity = data["capacity"]
                    .as_u64()
                    .map(|c| c as usize)
                    .unwrap_or(engine.config().inbox_capacity);

                let subscription = engine.subscribe_with_capacity(topic, capacity);
                let sub_id = subscription.id();
                subscriptions.lock().expect("subscriptions poisoned").push(sub_id);
                let _ = s.emit(
                    "subscribed",
                    &json!({ "topic": topic.as_str(), "subscriptionId": sub_id }),
                );

                // Forwarder: inbox → socket, until unsubscribe or disconnect
                let drop_allowance = capacity as u64 * DROP_ALLOWANCE_FACTOR;
                tokio::spawn(async move {
                    while let Some(event) = subscription.recv().await {
                        if s.emit(event.topic().as_str(), &event.payload()).is_err() {
                            // socket gone
                            engine.unsubscribe(sub_id);
                            break;
                        }
                        if subscription.dropped() > drop_allowance {
                            warn!(
                                "Subscriber {} too slow on '{}' ({} drops) — disconnecting",
                                s.id,
                                event.topic().as_str(),
                                subscription.dropped()
                            );
                            engine.unsubscribe(sub_id);
                            let _ = s.disconnect();
                            break;
                        }
                    }
                });
            }
        });
    }

    // ── unsubscribe ───────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        let subscriptions = subscriptions.clone();
        socket.on("unsubscribe", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            let subscriptions = subscriptions.clone();
            async move {
                let Some(id) = data["subscriptionId"].as_u64() else { return };
                engine.unsubscribe(id);
                subscriptions
                    .lock()
                    .expect("subscriptions poisoned")
                    .retain(|sub_id| *sub_id != id);
                let _ = s.emit("unsubscribed", &json!({ "subscriptionId": id }));
            }
        });
    }

    // ── ingest (direct websocket ingest, mirrors the UDP path) ────────────────
    {
        let engine = engine.clone();
        socket.on("ingest", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            async move {
                let measurement: Measurement = match serde_json::from_value(data) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = s.emit("ingest-error", &json!({ "error": e.to_string() }));
                        return;
                    }
                };
                match engine.ingest(measurement) {
                    Ok(processed) => {
                        let _ = s.emit("ingest-result", &json!(processed));
                    }
                    Err(e) => {
                        let _ = s.emit("ingest-error", &json!({ "error": e.to_string() }));
                    }
                }
            }
        });
    }

    // ── set-anchor (administrative) ───────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("set-anchor", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            async move {
                let Some(id) = data["id"].as_str() else {
                    let _ = s.emit("anchor-error", &json!({ "error": "missing id" }));
                    return;
                };
                let x = data["x"].as_f64().unwrap_or(0.0);
                let y = data["y"].as_f64().unwrap_or(0.0);
                let ref_rssi = data["refRssi"].as_f64().unwrap_or(-30.0);
                engine.set_anchor(id, x, y, ref_rssi);
                let _ = s.emit("anchor-set", &json!({ "id": id, "anchors": engine.anchors() }));
            }
        });
    }

    // ── health-summary ────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("health-summary", move |s: SocketRef| {
            let engine = engine.clone();
            async move {
                let _ = s.emit("health-summary", &json!(engine.health_summary()));
            }
        });
    }

    // ── device-health ─────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("device-health", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            async move {
                let Some(device_id) = data["deviceId"].as_str() else { return };
                let _ = s.emit(
                    "device-health",
                    &json!({
                        "deviceId": device_id,
                        "health": engine.device_health(device_id),
                    }),
                );
            }
        });
    }

    // ── recent-anomalies ──────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("recent-anomalies", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            async move {
                let hours = data["hours"].as_i64().unwrap_or(24);
                let _ = s.emit(
                    "recent-anomalies",
                    &json!(engine.recent_anomalies(hours * HOUR_MS)),
                );
            }
        });
    }

    // ── regions ───────────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("regions", move |s: SocketRef| {
            let engine = engine.clone();
            async move {
                let _ = s.emit("regions", &json!(engine.regions().as_ref()));
            }
        });
    }

    // ── heatmap ───────────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("heatmap", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            async move {
                let bounds = (
                    data["x0"].as_f64().unwrap_or(0.0),
                    data["y0"].as_f64().unwrap_or(0.0),
                    data["x1"].as_f64().unwrap_or(100.0),
                    data["y1"].as_f64().unwrap_or(100.0),
                );
                let resolution = data["resolution"].as_u64().unwrap_or(100) as usize;
                let _ = s.emit("heatmap", &json!(engine.heatmap(bounds, resolution)));
            }
        });
    }

    // ── trajectory ────────────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        socket.on("trajectory", move |s: SocketRef, Data::<Value>(data)| {
            let engine = engine.clone();
            async move {
                let Some(device_id) = data["deviceId"].as_str() else { return };
                let hours = data["hours"].as_i64().unwrap_or(24);
                let _ = s.emit(
                    "trajectory",
                    &json!({
                        "deviceId": device_id,
                        "points": engine.trajectory(device_id, hours * HOUR_MS),
                    }),
                );
            }
        });
    }
}

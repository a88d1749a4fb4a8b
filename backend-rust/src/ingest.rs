//! # ingest
//!
//! MQTT ingest: owns the broker connection and dispatches every publish
//! through the classifier into the broadcaster's update queue. Broker errors
//! never crash the task; the loop backs off and reconnects, re-subscribing
//! on every CONNACK.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, Transport};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{RoutePlan, UpdateEvent};
use crate::classifier::{classify, device_from_topic};
use crate::config::{Config, MqttTransport};
use crate::decoder::{DecodeMeta, FrameDecoder};
use crate::state::{coords_are_zero, now_ts, within_map_radius, RouteMode, SharedStore, TopologyStore};

/// Payload types excluded from path-header routes (advert / trace frames).
const NON_ROUTE_PAYLOAD_TYPES: [u8; 2] = [8, 9];

// ─── Connection setup ─────────────────────────────────────────────────────────

fn mqtt_options(cfg: &Config) -> MqttOptions {
    let mut opts = match cfg.mqtt_transport {
        MqttTransport::Tcp => {
            MqttOptions::new(cfg.mqtt_client_id.clone(), cfg.mqtt_host.clone(), cfg.mqtt_port)
        }
        MqttTransport::Websocket => {
            let scheme = if cfg.mqtt_tls { "wss" } else { "ws" };
            let url = format!(
                "{scheme}://{}:{}{}",
                cfg.mqtt_host, cfg.mqtt_port, cfg.mqtt_ws_path
            );
            MqttOptions::new(cfg.mqtt_client_id.clone(), url, cfg.mqtt_port)
        }
    };
    opts.set_keep_alive(Duration::from_secs(60));
    opts.set_max_packet_size(1024 * 1024, 1024 * 1024);
    if let Some(user) = &cfg.mqtt_username {
        opts.set_credentials(user.clone(), cfg.mqtt_password.clone().unwrap_or_default());
    }
    opts.set_transport(build_transport(cfg));
    opts
}

fn build_transport(cfg: &Config) -> Transport {
    let ca = cfg.mqtt_ca_cert.as_ref().and_then(|path| {
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Could not read MQTT_CA_CERT {}: {e}", path.display());
                None
            }
        }
    });
    if cfg.mqtt_tls && cfg.mqtt_tls_insecure {
        // The rustls backend always verifies the chain; a pinned CA is the
        // supported way to talk to a self-signed broker.
        warn!("MQTT_TLS_INSECURE is set but certificate verification cannot be disabled; pin MQTT_CA_CERT instead");
    }

    match (cfg.mqtt_transport, cfg.mqtt_tls) {
        (MqttTransport::Tcp, false) => Transport::tcp(),
        (MqttTransport::Tcp, true) => match ca {
            Some(ca) => Transport::tls(ca, None, None),
            None => Transport::tls_with_default_config(),
        },
        (MqttTransport::Websocket, false) => Transport::ws(),
        (MqttTransport::Websocket, true) => match ca {
            Some(ca) => Transport::wss(ca, None, None),
            None => Transport::wss_with_default_config(),
        },
    }
}

/// Long-lived ingest task: connect, subscribe, dispatch.
pub async fn run_mqtt_ingest(
    cfg: Arc<Config>,
    store: SharedStore,
    decoder: Arc<FrameDecoder>,
    tx: mpsc::Sender<UpdateEvent>,
) {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&cfg), 64);
    info!(
        "MQTT ingest connecting to {}:{} ({} topics)",
        cfg.mqtt_host,
        cfg.mqtt_port,
        cfg.mqtt_topics.len()
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("MQTT connected; subscribing");
                for topic in &cfg.mqtt_topics {
                    if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                        warn!("MQTT subscribe {topic} failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                handle_message(&publish.topic, &publish.payload, &cfg, &store, &decoder, &tx).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {e}. Reconnecting in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// One MQTT message end to end: counters, presence, classification, gating,
/// route synthesis, queue hand-off.
pub async fn handle_message(
    topic: &str,
    payload: &[u8],
    cfg: &Config,
    store: &SharedStore,
    decoder: &FrameDecoder,
    tx: &mpsc::Sender<UpdateEvent>,
) {
    let now = now_ts();
    let mut events: Vec<UpdateEvent> = Vec::new();

    // Counters + presence before any parsing
    {
        let mut guard = store.write().await;
        guard.stats.received += 1;
        *guard.stats.topic_counts.entry(topic.to_string()).or_insert(0) += 1;

        if cfg.topic_marks_online(topic) {
            if let Some(device_id) = device_from_topic(topic) {
                guard.mark_seen(&device_id, now);
                if guard.devices.contains_key(&device_id) {
                    let due = guard
                        .last_seen_broadcast
                        .get(&device_id)
                        .map_or(true, |t| now - t >= cfg.mqtt_seen_broadcast_min_seconds as f64);
                    if due {
                        guard.last_seen_broadcast.insert(device_id.clone(), now);
                        events.push(UpdateEvent::DeviceSeen {
                            device_id,
                            last_seen_ts: now,
                            mqtt_seen_ts: now,
                        });
                    }
                }
            }
        }
    }

    // Classification runs without the lock; the decoder may block on its
    // subprocess timeout.
    let c = classify(topic, payload, now, cfg, decoder).await;

    {
        let mut guard = store.write().await;
        *guard
            .stats
            .result_counts
            .entry(c.tag().to_string())
            .or_insert(0) += 1;
        if let Some(meta) = c.meta() {
            guard.stats.decode_attempts += 1;
            if !meta.ok {
                guard.stats.decode_failures += 1;
            }
        }
        if c.update().is_some() {
            guard.stats.parsed += 1;
        }
        let preview = safe_preview(payload, cfg.payload_preview_max);
        let decode = c.meta().map(|m| {
            json!({
                "ok": m.ok,
                "payload_type": m.payload_type,
                "route_type": m.route_type,
                "message_hash": m.message_hash,
                "path_length": m.path_length,
            })
        });
        guard.push_debug(
            json!({
                "ts": now,
                "topic": topic,
                "result": c.tag(),
                "device_id": c.origin_id(),
                "name": c.name_hint(),
                "role": c.role_hint(),
                "pubkey": c.pubkey(),
                "packet_hash": c.packet_hash(),
                "decode": decode,
                "parse_error": c.parse_error(),
                "preview": preview,
            }),
            cfg,
        );

        // Coordinate gating: zero coords never materialize, out-of-radius
        // positions evict a previously known device.
        let mut update = c.update().cloned();
        if let Some(u) = &update {
            if coords_are_zero(u.lat, u.lon) {
                update = None;
            } else if !within_map_radius(cfg, u.lat, u.lon) {
                debug!("Device {} outside map radius; discarding", u.device_id);
                if guard.devices.contains_key(&u.device_id) {
                    events.push(UpdateEvent::DeviceRemove {
                        device_id: u.device_id.clone(),
                    });
                }
                update = None;
            }
        }

        // Name/role deltas not already carried by a device update
        let subject = c
            .origin_id()
            .map(str::to_string)
            .or_else(|| device_from_topic(topic));
        if let Some(id) = &subject {
            if let Some(name) = c.name_hint() {
                let carried = update.as_ref().map_or(false, |u| u.name.is_some());
                if !carried && guard.device_names.get(id).map(String::as_str) != Some(name) {
                    events.push(UpdateEvent::DeviceName {
                        device_id: id.clone(),
                        name: name.to_string(),
                    });
                }
            }
            if let Some(role) = c.role_hint() {
                let carried = update.as_ref().map_or(false, |u| u.role.is_some());
                if !carried && guard.device_roles.get(id) != Some(&role) {
                    events.push(UpdateEvent::DeviceRole {
                        device_id: id.clone(),
                        role,
                    });
                }
            }
        }

        // Route determination from decoder metadata
        let receiver_id = device_from_topic(topic);
        if let Some(meta) = c.meta().filter(|m| m.ok) {
            if let (Some(mh), Some(dir), Some(recv)) =
                (&meta.message_hash, c.direction(), receiver_id.as_deref())
            {
                guard.note_message_origin(mh, dir == "tx", recv, now);
            }
            if let Some(event) = plan_route(
                &guard,
                cfg,
                meta,
                c.direction(),
                c.pubkey(),
                topic,
                receiver_id,
                now,
            ) {
                events.push(event);
            }
        }

        if let Some(update) = update {
            events.push(UpdateEvent::Device {
                update,
                raw_topic: Some(topic.to_string()),
            });
        }
    }

    let mut dropped = 0u64;
    for event in events {
        if tx.try_send(event).is_err() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        let mut guard = store.write().await;
        guard.stats.queue_dropped += dropped;
    }
}

/// Routing ladder: explicit path hashes, then a
/// path-like header, then rx fanout synthesis via the origin cache.
#[allow(clippy::too_many_arguments)]
fn plan_route(
    store: &TopologyStore,
    cfg: &Config,
    meta: &DecodeMeta,
    direction: Option<&str>,
    origin_pubkey: Option<&str>,
    topic: &str,
    receiver_id: Option<String>,
    now: f64,
) -> Option<UpdateEvent> {
    let message_hash = meta.message_hash.clone();
    let origin_hint = origin_pubkey.map(str::to_string);

    if let Some(hashes) = meta.path_hashes.as_ref().filter(|h| !h.is_empty()) {
        if meta
            .payload_type
            .map_or(false, |pt| cfg.route_payload_types.contains(&pt))
        {
            return Some(UpdateEvent::Route(RoutePlan {
                id: message_hash.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
                route_mode: RouteMode::Path,
                ts: now,
                path_hashes: hashes.clone(),
                origin_id: origin_hint,
                receiver_id,
                payload_type: meta.payload_type,
                message_hash,
                snr_values: meta.snr_values.clone(),
            }));
        }
    }

    if let Some(header) = meta.path.as_ref() {
        let hashes = split_path_header(header, cfg.route_path_max_len);
        if !hashes.is_empty()
            && matches!(meta.route_type, Some(0) | Some(1))
            && !meta
                .payload_type
                .map_or(false, |pt| NON_ROUTE_PAYLOAD_TYPES.contains(&pt))
        {
            return Some(UpdateEvent::Route(RoutePlan {
                id: message_hash.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
                route_mode: RouteMode::Path,
                ts: now,
                path_hashes: hashes,
                origin_id: origin_hint,
                receiver_id,
                payload_type: meta.payload_type,
                message_hash,
                snr_values: meta.snr_values.clone(),
            }));
        }
    }

    if topic.ends_with("/packets") && direction == Some("rx") {
        let message_hash = message_hash?;
        let receiver_id = receiver_id?;
        let origin_id = origin_hint
            .or_else(|| store.resolve_origin(&message_hash))
            .filter(|o| o != &receiver_id)?;
        return Some(UpdateEvent::Route(RoutePlan {
            id: format!("{message_hash}-{receiver_id}"),
            route_mode: RouteMode::Fanout,
            ts: now,
            path_hashes: vec![],
            origin_id: Some(origin_id),
            receiver_id: Some(receiver_id),
            payload_type: meta.payload_type,
            message_hash: Some(message_hash),
            snr_values: meta.snr_values.clone(),
        }));
    }

    None
}

/// A path header is a run of two-hex-digit node hashes.
fn split_path_header(header: &str, max_len: usize) -> Vec<String> {
    let header = header.trim();
    if header.len() % 2 != 0 || !header.chars().all(|c| c.is_ascii_hexdigit()) {
        return Vec::new();
    }
    header
        .as_bytes()
        .chunks(2)
        .take(max_len)
        .map(|pair| String::from_utf8_lossy(pair).to_ascii_lowercase())
        .collect()
}

fn safe_preview(payload: &[u8], max: usize) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.chars().take(max).collect(),
        Err(_) => hex::encode(&payload[..payload.len().min(max / 2)]),
    }
}

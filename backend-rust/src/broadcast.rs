//! # broadcast
//!
//! Single-consumer loop that applies queued ingest events to the topology
//! store and fans JSON deltas out to every live WebSocket subscriber. This
//! task is the only serving-path writer; the dispatcher crosses over to it
//! through a bounded mpsc queue.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::history::{append_segments, record_route_history};
use crate::state::{
    within_map_radius, DeviceRole, DeviceState, DeviceUpdate, HistoryEdge, LatLon, Route,
    RouteMode, SharedStore, Snapshot, TopologyStore, TrailPoint,
};

/// Bounded hand-off from the MQTT dispatcher; sized for bursts, dropped
/// (with a counter) when the consumer falls behind.
pub const UPDATE_QUEUE_CAP: usize = 1024;

/// Per-subscriber channel depth; a client that lags this far behind is cut.
const SUBSCRIBER_QUEUE_CAP: usize = 256;

// ─── Inbound events ───────────────────────────────────────────────────────────

/// A route reconstruction request; points are resolved against the store at
/// apply time so late-arriving device positions are honored.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub id: String,
    pub route_mode: RouteMode,
    pub ts: f64,
    pub path_hashes: Vec<String>,
    pub origin_id: Option<String>,
    pub receiver_id: Option<String>,
    pub payload_type: Option<u8>,
    pub message_hash: Option<String>,
    pub snr_values: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub enum UpdateEvent {
    Device {
        update: DeviceUpdate,
        raw_topic: Option<String>,
    },
    DeviceSeen {
        device_id: String,
        last_seen_ts: f64,
        mqtt_seen_ts: f64,
    },
    DeviceName {
        device_id: String,
        name: String,
    },
    DeviceRole {
        device_id: String,
        role: DeviceRole,
    },
    DeviceRemove {
        device_id: String,
    },
    Route(RoutePlan),
}

// ─── Outbound messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(Snapshot),
    Update {
        device: DeviceState,
        #[serde(skip_serializing_if = "Option::is_none")]
        trail: Option<Vec<TrailPoint>>,
    },
    DeviceSeen {
        device_id: String,
        last_seen_ts: f64,
        mqtt_seen_ts: f64,
    },
    Stale {
        device_ids: Vec<String>,
    },
    Route {
        route: Route,
    },
    RouteRemove {
        route_ids: Vec<String>,
    },
    HistoryEdges {
        edges: Vec<HistoryEdge>,
    },
    HistoryEdgesRemove {
        edge_ids: Vec<String>,
    },
}

// ─── Subscriber registry ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct Subscribers {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<String>>,
}

pub type SharedSubscribers = Arc<RwLock<Subscribers>>;

impl Subscribers {
    pub fn add(&mut self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let id = self.next_id;
        self.next_id += 1;
        self.senders.insert(id, tx);
        (id, rx)
    }

    pub fn remove(&mut self, id: u64) {
        self.senders.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }
}

/// Serialize once, push to every subscriber. A failed send marks the
/// subscriber for removal after the iteration completes.
pub async fn broadcast(subs: &SharedSubscribers, msg: &ServerMessage) {
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(e) => {
            warn!("Broadcast: serialization failed: {e}");
            return;
        }
    };

    let mut guard = subs.write().await;
    let mut dead = Vec::new();
    for (&id, tx) in &guard.senders {
        if tx.try_send(text.clone()).is_err() {
            dead.push(id);
        }
    }
    for id in dead {
        info!("Dropping slow or closed subscriber {id}");
        guard.remove(id);
    }
}

// ─── Route point resolution ───────────────────────────────────────────────────

struct ResolvedRoute {
    points: Vec<LatLon>,
    point_ids: Vec<Option<String>>,
    route_mode: RouteMode,
}

fn device_point(store: &TopologyStore, id: &str) -> Option<LatLon> {
    store.devices.get(id).map(|d| LatLon { lat: d.lat, lon: d.lon })
}

/// Resolution ladder: hashed path, then fanout pair, then direct fallback.
/// Routes with any point outside the map radius are dropped whole.
fn resolve_route_points(
    store: &TopologyStore,
    cfg: &Config,
    plan: &RoutePlan,
) -> Option<ResolvedRoute> {
    // 1. Resolve each two-hex-digit hash against the node index
    if !plan.path_hashes.is_empty() {
        let mut points: Vec<LatLon> = Vec::new();
        let mut point_ids: Vec<Option<String>> = Vec::new();
        for hash in plan.path_hashes.iter().take(cfg.route_path_max_len) {
            let Some(device_id) = store
                .resolve_node_hash(hash, plan.receiver_id.as_deref())
                .cloned()
            else {
                continue;
            };
            if point_ids.last().and_then(|p| p.as_deref()) == Some(device_id.as_str()) {
                continue;
            }
            let Some(point) = device_point(store, &device_id) else {
                continue;
            };
            points.push(point);
            point_ids.push(Some(device_id));
        }
        if points.len() == 1 {
            if let Some(receiver_id) = &plan.receiver_id {
                if point_ids[0].as_deref() != Some(receiver_id.as_str()) {
                    if let Some(point) = device_point(store, receiver_id) {
                        points.push(point);
                        point_ids.push(Some(receiver_id.clone()));
                    }
                }
            }
        }
        if points.len() >= 2 {
            return radius_checked(cfg, points, point_ids, plan.route_mode);
        }
    }

    // 2./3. Two-point origin → receiver synthesis
    let origin_id = plan.origin_id.as_deref()?;
    let receiver_id = plan.receiver_id.as_deref()?;
    if origin_id == receiver_id {
        return None;
    }
    let origin = device_point(store, origin_id)?;
    let receiver = device_point(store, receiver_id)?;
    let mode = if plan.route_mode == RouteMode::Fanout {
        RouteMode::Fanout
    } else {
        RouteMode::Direct
    };
    radius_checked(
        cfg,
        vec![origin, receiver],
        vec![Some(origin_id.to_string()), Some(receiver_id.to_string())],
        mode,
    )
}

fn radius_checked(
    cfg: &Config,
    points: Vec<LatLon>,
    point_ids: Vec<Option<String>>,
    route_mode: RouteMode,
) -> Option<ResolvedRoute> {
    if points.iter().any(|p| !within_map_radius(cfg, p.lat, p.lon)) {
        return None;
    }
    Some(ResolvedRoute {
        points,
        point_ids,
        route_mode,
    })
}

// ─── Event application ────────────────────────────────────────────────────────

/// Apply one queued event and emit the corresponding deltas. Failures here
/// never propagate — a bad event is logged and the loop moves on.
pub async fn handle_event(
    event: UpdateEvent,
    store: &SharedStore,
    cfg: &Config,
    subs: &SharedSubscribers,
) {
    match event {
        UpdateEvent::Device { update, raw_topic } => {
            let (device, trail) = {
                let mut guard = store.write().await;
                let Some(device) = guard.upsert_device(update, raw_topic, cfg) else {
                    return;
                };
                guard.stats.devices_updated += 1;
                let trail = if cfg.trail_len > 0 {
                    guard.trails.get(&device.device_id).cloned()
                } else {
                    None
                };
                (device, trail)
            };
            broadcast(subs, &ServerMessage::Update { device, trail }).await;
        }

        UpdateEvent::DeviceSeen {
            device_id,
            last_seen_ts,
            mqtt_seen_ts,
        } => {
            let alive = {
                let mut guard = store.write().await;
                match guard.devices.get_mut(&device_id) {
                    Some(device) => {
                        device.last_seen_ts = Some(last_seen_ts);
                        device.mqtt_seen_ts = Some(mqtt_seen_ts);
                        guard.stats.seen_broadcasts += 1;
                        true
                    }
                    // Raced with an eviction — drop silently
                    None => false,
                }
            };
            if alive {
                broadcast(
                    subs,
                    &ServerMessage::DeviceSeen {
                        device_id,
                        last_seen_ts,
                        mqtt_seen_ts,
                    },
                )
                .await;
            }
        }

        UpdateEvent::DeviceName { device_id, name } => {
            let device = {
                let mut guard = store.write().await;
                guard.device_names.insert(device_id.clone(), name.clone());
                guard.dirty = true;
                guard.devices.get_mut(&device_id).map(|d| {
                    d.name = Some(name);
                    d.clone()
                })
            };
            if let Some(device) = device {
                broadcast(subs, &ServerMessage::Update { device, trail: None }).await;
            }
        }

        UpdateEvent::DeviceRole { device_id, role } => {
            let device = {
                let mut guard = store.write().await;
                if guard.device_role_sources.get(&device_id)
                    == Some(&crate::state::RoleSource::Override)
                {
                    return;
                }
                guard.device_roles.insert(device_id.clone(), role);
                guard
                    .device_role_sources
                    .insert(device_id.clone(), crate::state::RoleSource::Explicit);
                guard.dirty = true;
                guard.devices.get_mut(&device_id).map(|d| {
                    d.role = Some(role);
                    d.clone()
                })
            };
            if let Some(device) = device {
                broadcast(subs, &ServerMessage::Update { device, trail: None }).await;
            }
        }

        UpdateEvent::DeviceRemove { device_id } => {
            let existed = store.write().await.evict_device(&device_id);
            if existed {
                broadcast(
                    subs,
                    &ServerMessage::Stale {
                        device_ids: vec![device_id],
                    },
                )
                .await;
            }
        }

        UpdateEvent::Route(plan) => {
            let (route, delta) = {
                let mut guard = store.write().await;
                let Some(resolved) = resolve_route_points(&guard, cfg, &plan) else {
                    debug!("Route {} dropped: no resolvable points", plan.id);
                    return;
                };
                let route = Route {
                    id: plan.id,
                    points: resolved.points,
                    route_mode: resolved.route_mode,
                    ts: plan.ts,
                    expires_at: plan.ts + cfg.route_ttl_seconds as f64,
                    origin_id: plan.origin_id,
                    receiver_id: plan.receiver_id,
                    payload_type: plan.payload_type,
                    message_hash: plan.message_hash,
                    snr_values: plan.snr_values,
                    node_hashes: plan.path_hashes,
                    point_ids: Some(resolved.point_ids),
                };
                guard.record_route(route.clone());
                let delta = record_route_history(&mut guard, &route, cfg);
                (route, delta)
            };

            broadcast(subs, &ServerMessage::Route { route }).await;
            if !delta.updated.is_empty() {
                broadcast(subs, &ServerMessage::HistoryEdges { edges: delta.updated.clone() }).await;
            }
            if !delta.removed.is_empty() {
                broadcast(
                    subs,
                    &ServerMessage::HistoryEdgesRemove {
                        edge_ids: delta.removed.clone(),
                    },
                )
                .await;
            }
            append_segments(&cfg.route_history_file, &delta.new_segments).await;
        }
    }
}

/// The broadcaster task: drain the queue until every producer is gone.
pub async fn run_broadcaster(
    store: SharedStore,
    cfg: Arc<Config>,
    subs: SharedSubscribers,
    mut rx: mpsc::Receiver<UpdateEvent>,
) {
    info!("Broadcaster started");
    while let Some(event) = rx.recv().await {
        handle_event(event, &store, &cfg, &subs).await;
    }
    info!("Broadcaster stopped: update queue closed");
}

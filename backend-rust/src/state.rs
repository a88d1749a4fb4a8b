//! # state
//!
//! Authoritative in-memory topology state: devices, trails, routes, history
//! edges, heat events, presence maps, name/role tables, the node-hash index
//! and the message-origin cache. The store is a plain data container — all
//! serving-path mutation goes through the broadcaster task, the reaper and
//! the history compactor; HTTP handlers only take read locks for snapshot
//! assembly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::history::{HistorySegment, EDGE_KEY_SEP};

pub type SharedStore = Arc<RwLock<TopologyStore>>;

// ─── Time & geometry helpers ──────────────────────────────────────────────────

/// Seconds since epoch as float (matches the wire timestamps).
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Great-circle distance on a 6371 km sphere.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (rlat1, rlat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + rlat1.cos() * rlat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * 6371.0 * a.sqrt().asin()
}

pub fn coords_are_zero(lat: f64, lon: f64) -> bool {
    lat.abs() < 1e-9 && lon.abs() < 1e-9
}

pub fn coords_valid(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Radius filter against the configured map origin. `MAP_RADIUS_KM=0`
/// disables filtering.
pub fn within_map_radius(cfg: &Config, lat: f64, lon: f64) -> bool {
    if cfg.map_radius_km <= 0.0 {
        return true;
    }
    haversine_km(cfg.map_start_lat, cfg.map_start_lon, lat, lon) <= cfg.map_radius_km
}

// ─── Geographic types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub lat: f64,
    pub lon: f64,
    pub ts: f64,
}

// ─── Devices ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Companion,
    Repeater,
    Room,
}

impl DeviceRole {
    /// Decoder metadata role codes.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Companion),
            2 => Some(Self::Repeater),
            3 => Some(Self::Room),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSource {
    Explicit,
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DeviceRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_seen_ts: Option<f64>,
}

/// Normalized output of the packet classifier for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    pub name: Option<String>,
    pub role: Option<DeviceRole>,
}

// ─── Routes & heat ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    Path,
    Direct,
    Fanout,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

/// Advert payload type — announces a node; never contributes heat.
pub const ADVERT_PAYLOAD_TYPE: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub points: Vec<LatLon>,
    pub route_mode: RouteMode,
    pub ts: f64,
    pub expires_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr_values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_hashes: Vec<String>,
    /// One device id per point, where resolution produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_ids: Option<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeatEvent {
    pub lat: f64,
    pub lon: f64,
    pub ts: f64,
    pub weight: f64,
}

// ─── History edges ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSample {
    pub ts: f64,
    pub mode: RouteMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEdge {
    pub a: LatLon,
    pub b: LatLon,
    pub a_id: String,
    pub b_id: String,
    pub count: u64,
    pub last_ts: f64,
    pub recent: Vec<EdgeSample>,
}

/// Undirected edge key: lexicographically ordered endpoint pair.
pub fn edge_key(a_id: &str, b_id: &str) -> String {
    if a_id <= b_id {
        format!("{a_id}{EDGE_KEY_SEP}{b_id}")
    } else {
        format!("{b_id}{EDGE_KEY_SEP}{a_id}")
    }
}

// ─── Message-origin cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MessageOrigin {
    /// First-seen origin, from a direction=tx observation.
    pub origin_id: Option<String>,
    /// First receiver to publish an rx observation.
    pub first_rx: Option<String>,
    pub receivers: HashSet<String>,
    pub ts: f64,
}

// ─── Ingest counters ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub parsed: u64,
    pub devices_updated: u64,
    pub routes: u64,
    pub decode_attempts: u64,
    pub decode_failures: u64,
    pub queue_dropped: u64,
    pub seen_broadcasts: u64,
    pub result_counts: HashMap<String, u64>,
    pub topic_counts: HashMap<String, u64>,
}

// ─── Snapshot ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub devices: HashMap<String, DeviceState>,
    pub trails: HashMap<String, Vec<TrailPoint>>,
    pub routes: Vec<Route>,
    pub history_edges: Vec<HistoryEdge>,
    pub history_window_seconds: f64,
    pub heat: Vec<HeatEvent>,
}

// ─── Topology store ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TopologyStore {
    pub devices: HashMap<String, DeviceState>,
    pub trails: HashMap<String, Vec<TrailPoint>>,
    pub routes: HashMap<String, Route>,
    pub heat_events: Vec<HeatEvent>,

    // Presence
    pub seen_devices: HashMap<String, f64>,
    pub mqtt_seen: HashMap<String, f64>,
    pub last_seen_broadcast: HashMap<String, f64>,

    // Name/role tables
    pub device_names: HashMap<String, String>,
    pub device_roles: HashMap<String, DeviceRole>,
    pub device_role_sources: HashMap<String, RoleSource>,

    // Secondary index: two-hex-digit prefix → most recently seen device id,
    // plus every live candidate per prefix for receiver-aware disambiguation.
    pub node_hash_to_device: HashMap<String, String>,
    pub node_hash_candidates: HashMap<String, Vec<String>>,

    pub message_origins: HashMap<String, MessageOrigin>,

    // Route history (logic lives in the history module)
    pub history_segments: VecDeque<HistorySegment>,
    pub history_edges: HashMap<String, HistoryEdge>,

    pub stats: IngestStats,
    pub debug_last: VecDeque<serde_json::Value>,
    pub status_last: HashMap<String, serde_json::Value>,

    /// Set whenever persisted state changed; cleared by the state saver.
    pub dirty: bool,
}

impl TopologyStore {
    /// Insert or replace a device. Returns the stored state, or `None` when
    /// the update violates the store invariants (zero or invalid coords).
    /// Radius filtering happens in the dispatcher so it can also evict.
    pub fn upsert_device(
        &mut self,
        update: DeviceUpdate,
        raw_topic: Option<String>,
        cfg: &Config,
    ) -> Option<DeviceState> {
        if !coords_valid(update.lat, update.lon) || coords_are_zero(update.lat, update.lon) {
            return None;
        }

        let id = update.device_id.clone();
        if let Some(name) = &update.name {
            self.device_names.insert(id.clone(), name.clone());
        }
        if let Some(role) = update.role {
            // Override entries from the roles file are never downgraded.
            if self.device_role_sources.get(&id) != Some(&RoleSource::Override) {
                self.device_roles.insert(id.clone(), role);
                self.device_role_sources.insert(id.clone(), RoleSource::Explicit);
            }
        }

        let is_new = !self.devices.contains_key(&id);
        let device = DeviceState {
            device_id: id.clone(),
            lat: update.lat,
            lon: update.lon,
            ts: update.ts,
            heading: update.heading,
            speed: update.speed,
            rssi: update.rssi,
            snr: update.snr,
            name: self.device_names.get(&id).cloned(),
            role: self.device_roles.get(&id).copied(),
            raw_topic,
            last_seen_ts: self.seen_devices.get(&id).copied(),
            mqtt_seen_ts: self.mqtt_seen.get(&id).copied(),
        };
        self.devices.insert(id.clone(), device.clone());

        if cfg.trail_len > 0 {
            let trail = self.trails.entry(id).or_default();
            trail.push(TrailPoint {
                lat: update.lat,
                lon: update.lon,
                ts: update.ts,
            });
            if trail.len() > cfg.trail_len {
                let excess = trail.len() - cfg.trail_len;
                trail.drain(..excess);
            }
        }

        if is_new {
            self.rebuild_node_hash_index();
        }
        self.dirty = true;
        Some(device)
    }

    /// Remove a device with its trail and presence entries.
    pub fn evict_device(&mut self, device_id: &str) -> bool {
        let existed = self.devices.remove(device_id).is_some();
        self.trails.remove(device_id);
        self.seen_devices.remove(device_id);
        self.mqtt_seen.remove(device_id);
        self.last_seen_broadcast.remove(device_id);
        if existed {
            self.rebuild_node_hash_index();
            self.dirty = true;
        }
        existed
    }

    /// Insert a transient route and append heat points for its coordinates.
    /// Advert payloads update routes but never heat.
    pub fn record_route(&mut self, route: Route) {
        if route.payload_type != Some(ADVERT_PAYLOAD_TYPE) {
            for p in &route.points {
                self.heat_events.push(HeatEvent {
                    lat: p.lat,
                    lon: p.lon,
                    ts: route.ts,
                    weight: 1.0,
                });
            }
        }
        self.stats.routes += 1;
        self.routes.insert(route.id.clone(), route);
    }

    /// Rebuild the prefix index from the live device set. Iteration is
    /// ordered by `ts` so the most recently seen device wins the slot.
    pub fn rebuild_node_hash_index(&mut self) {
        self.node_hash_to_device.clear();
        self.node_hash_candidates.clear();

        let mut by_ts: Vec<(String, f64)> = self
            .devices
            .values()
            .map(|d| (d.device_id.clone(), d.ts))
            .collect();
        by_ts.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        for (device_id, _) in by_ts {
            let Some(prefix) = node_hash_prefix(&device_id) else {
                continue;
            };
            self.node_hash_to_device.insert(prefix.clone(), device_id.clone());
            let candidates = self.node_hash_candidates.entry(prefix).or_default();
            if !candidates.contains(&device_id) {
                candidates.push(device_id);
            }
        }
    }

    /// Resolve a path node hash to a live device id, preferring a candidate
    /// consistent with the receiver when the prefix is ambiguous.
    pub fn resolve_node_hash(&self, hash: &str, prefer: Option<&str>) -> Option<&String> {
        let prefix = hash.get(..2)?.to_ascii_lowercase();
        let candidates = self.node_hash_candidates.get(&prefix)?;
        if let Some(preferred) = prefer {
            if let Some(hit) = candidates.iter().find(|c| c.as_str() == preferred) {
                return Some(hit);
            }
        }
        self.node_hash_to_device.get(&prefix)
    }

    /// Presence update from an online-marking topic.
    pub fn mark_seen(&mut self, device_id: &str, now: f64) {
        self.seen_devices.insert(device_id.to_string(), now);
        self.mqtt_seen.insert(device_id.to_string(), now);
        self.dirty = true;
    }

    /// Track tx/rx observations of a message hash so a later rx frame with
    /// no encoded origin can be attributed to a plausible one.
    pub fn note_message_origin(
        &mut self,
        message_hash: &str,
        direction_tx: bool,
        device_id: &str,
        now: f64,
    ) {
        let entry = self.message_origins.entry(message_hash.to_string()).or_default();
        entry.ts = now;
        if direction_tx {
            if entry.origin_id.is_none() {
                entry.origin_id = Some(device_id.to_string());
            }
        } else {
            if entry.first_rx.is_none() {
                entry.first_rx = Some(device_id.to_string());
            }
            entry.receivers.insert(device_id.to_string());
        }
    }

    /// Best origin guess for a message hash: the tx publisher, else the
    /// first receiver that reported it.
    pub fn resolve_origin(&self, message_hash: &str) -> Option<String> {
        let entry = self.message_origins.get(message_hash)?;
        entry.origin_id.clone().or_else(|| entry.first_rx.clone())
    }

    pub fn push_debug(&mut self, record: serde_json::Value, cfg: &Config) {
        if !cfg.debug_payload {
            return;
        }
        if let Some(result) = record.get("result").and_then(|r| r.as_str()) {
            self.status_last.insert(result.to_string(), record.clone());
        }
        self.debug_last.push_back(record);
        while self.debug_last.len() > cfg.debug_payload_max {
            self.debug_last.pop_front();
        }
    }

    /// Deep copy suitable for serializing to a new subscriber. Expired
    /// routes may still be present between reaper passes; they are filtered
    /// here so a fresh client never sees dead state.
    pub fn snapshot(&self, cfg: &Config) -> Snapshot {
        let now = now_ts();
        Snapshot {
            devices: self.devices.clone(),
            trails: self.trails.clone(),
            routes: self
                .routes
                .values()
                .filter(|r| r.expires_at > now)
                .cloned()
                .collect(),
            history_edges: self.history_edges.values().cloned().collect(),
            history_window_seconds: cfg.route_history_hours * 3600.0,
            heat: self.heat_events.clone(),
        }
    }
}

/// Two-hex-digit lowercase prefix used in mesh path headers.
pub fn node_hash_prefix(device_id: &str) -> Option<String> {
    let prefix = device_id.get(..2)?;
    if prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(prefix.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.trail_len = 3;
        cfg.map_radius_km = 0.0;
        cfg.map_start_lat = 42.3601;
        cfg.map_start_lon = -71.0589;
        cfg.route_history_hours = 24.0;
        cfg
    }

    fn update(id: &str, lat: f64, lon: f64, ts: f64) -> DeviceUpdate {
        DeviceUpdate {
            device_id: id.to_string(),
            lat,
            lon,
            ts,
            heading: None,
            speed: None,
            rssi: None,
            snr: None,
            name: None,
            role: None,
        }
    }

    fn route(id: &str, payload_type: Option<u8>, ts: f64, expires_at: f64) -> Route {
        Route {
            id: id.to_string(),
            points: vec![LatLon { lat: 42.0, lon: -71.0 }, LatLon { lat: 42.1, lon: -71.1 }],
            route_mode: RouteMode::Path,
            ts,
            expires_at,
            origin_id: None,
            receiver_id: None,
            payload_type,
            message_hash: None,
            snr_values: None,
            node_hashes: vec![],
            point_ids: None,
        }
    }

    #[test]
    fn haversine_known_distance() {
        // Boston → New York is about 306 km
        let d = haversine_km(42.3601, -71.0589, 40.7128, -74.0060);
        assert!((d - 306.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn radius_filter_disabled_at_zero() {
        let mut cfg = test_config();
        cfg.map_radius_km = 0.0;
        assert!(within_map_radius(&cfg, 0.0, 90.0));
        cfg.map_radius_km = 50.0;
        assert!(within_map_radius(&cfg, 42.36, -71.06));
        assert!(!within_map_radius(&cfg, 40.7128, -74.0060));
    }

    #[test]
    fn upsert_rejects_zero_and_invalid_coords() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        assert!(store.upsert_device(update("aa11", 0.0, 0.0, 1.0), None, &cfg).is_none());
        assert!(store.upsert_device(update("aa11", 91.0, 0.1, 1.0), None, &cfg).is_none());
        assert!(store.devices.is_empty());
        assert!(store.trails.is_empty());
    }

    #[test]
    fn trail_capped_and_ordered() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        for i in 0..5 {
            let ts = 100.0 + i as f64;
            store.upsert_device(update("aa11", 42.0 + i as f64 * 0.001, -71.0, ts), None, &cfg);
        }
        let trail = &store.trails["aa11"];
        assert_eq!(trail.len(), 3);
        assert!(trail.windows(2).all(|w| w[0].ts <= w[1].ts));
        let device_ts = store.devices["aa11"].ts;
        assert!(trail.iter().all(|p| p.ts <= device_ts));
    }

    #[test]
    fn trail_len_zero_disables_trails() {
        let mut cfg = test_config();
        cfg.trail_len = 0;
        let mut store = TopologyStore::default();
        store.upsert_device(update("aa11", 42.0, -71.0, 1.0), None, &cfg);
        assert!(store.trails.is_empty());
    }

    #[test]
    fn node_hash_index_prefers_most_recent() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        store.upsert_device(update("a1old", 42.0, -71.0, 100.0), None, &cfg);
        store.upsert_device(update("a1new", 42.1, -71.1, 200.0), None, &cfg);

        assert_eq!(store.node_hash_to_device["a1"], "a1new");
        let candidates = &store.node_hash_candidates["a1"];
        assert!(candidates.contains(&"a1old".to_string()));
        assert!(candidates.contains(&"a1new".to_string()));

        // Receiver-consistent candidate wins over the most recent one
        assert_eq!(
            store.resolve_node_hash("A1", Some("a1old")).map(String::as_str),
            Some("a1old")
        );
        assert_eq!(
            store.resolve_node_hash("a1", None).map(String::as_str),
            Some("a1new")
        );
    }

    #[test]
    fn evict_removes_presence_and_reindexes() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        store.upsert_device(update("b2dev", 42.0, -71.0, 100.0), None, &cfg);
        store.mark_seen("b2dev", 100.0);
        assert!(store.evict_device("b2dev"));
        assert!(store.devices.is_empty());
        assert!(store.seen_devices.is_empty());
        assert!(store.node_hash_to_device.is_empty());
        assert!(!store.evict_device("b2dev"));
    }

    #[test]
    fn advert_routes_do_not_heat() {
        let mut store = TopologyStore::default();
        store.record_route(route("r1", Some(ADVERT_PAYLOAD_TYPE), 100.0, 130.0));
        assert!(store.heat_events.is_empty());

        store.record_route(route("r2", Some(5), 100.0, 130.0));
        assert_eq!(store.heat_events.len(), 2);
    }

    #[test]
    fn role_override_never_downgraded() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        store.device_roles.insert("cc33".into(), DeviceRole::Repeater);
        store.device_role_sources.insert("cc33".into(), RoleSource::Override);

        let mut upd = update("cc33", 42.0, -71.0, 1.0);
        upd.role = Some(DeviceRole::Companion);
        let stored = store.upsert_device(upd, None, &cfg).unwrap();
        assert_eq!(stored.role, Some(DeviceRole::Repeater));
        assert_eq!(store.device_roles["cc33"], DeviceRole::Repeater);
    }

    #[test]
    fn message_origin_tracking_and_resolution() {
        let mut store = TopologyStore::default();
        store.note_message_origin("h1", false, "rxA", 10.0);
        assert_eq!(store.resolve_origin("h1"), Some("rxA".to_string()));
        store.note_message_origin("h1", true, "txB", 11.0);
        assert_eq!(store.resolve_origin("h1"), Some("txB".to_string()));
        store.note_message_origin("h1", false, "rxC", 12.0);
        let entry = &store.message_origins["h1"];
        assert_eq!(entry.first_rx.as_deref(), Some("rxA"));
        assert_eq!(entry.receivers.len(), 2);
    }

    #[test]
    fn snapshot_filters_expired_routes() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        let now = now_ts();
        store.record_route(route("live", Some(5), now, now + 30.0));
        store.record_route(route("dead", Some(5), now - 100.0, now - 70.0));
        let snap = store.snapshot(&cfg);
        assert_eq!(snap.routes.len(), 1);
        assert_eq!(snap.routes[0].id, "live");
        assert!((snap.history_window_seconds - cfg.route_history_hours * 3600.0).abs() < 1e-9);
    }

    #[test]
    fn edge_key_orders_endpoints() {
        assert_eq!(edge_key("bb", "aa"), edge_key("aa", "bb"));
        assert!(edge_key("aa", "bb").starts_with("aa"));
    }
}

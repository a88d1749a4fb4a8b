//! # history
//!
//! Long-lived route history: accepted path routes are decomposed into
//! consecutive endpoint pairs, aggregated into undirected weighted edges and
//! mirrored to an append-only JSONL file. Edges age out of a rolling time
//! window; a periodic compactor rewrites the file with only the segments
//! still inside it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::config::Config;
use crate::state::{
    edge_key, within_map_radius, EdgeSample, HistoryEdge, LatLon, Route, SharedStore,
    TopologyStore,
};

pub const EDGE_KEY_SEP: char = '|';

/// One directed traversal between two adjacent path nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySegment {
    pub a_id: String,
    pub b_id: String,
    pub ts: f64,
    pub mode: crate::state::RouteMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
}

/// Edge changes produced by a record or prune pass, for broadcasting.
#[derive(Debug, Default)]
pub struct HistoryDelta {
    pub updated: Vec<HistoryEdge>,
    pub removed: Vec<String>,
    /// Segments newly appended this pass — mirrored to the JSONL file.
    pub new_segments: Vec<HistorySegment>,
}

impl HistoryDelta {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

// ─── Recording ────────────────────────────────────────────────────────────────

/// Decompose an accepted route into segments and fold them into the edge
/// table. Routes outside the configured gates record nothing.
pub fn record_route_history(store: &mut TopologyStore, route: &Route, cfg: &Config) -> HistoryDelta {
    let mut delta = HistoryDelta::default();
    if !cfg.route_history_enabled {
        return delta;
    }
    if !cfg.route_history_allowed_modes.contains(route.route_mode.as_str()) {
        return delta;
    }
    match route.payload_type {
        Some(pt) if cfg.route_history_payload_types.contains(&pt) => {}
        _ => return delta,
    }
    let Some(point_ids) = &route.point_ids else {
        return delta;
    };

    for i in 0..point_ids.len().saturating_sub(1) {
        let (Some(a_id), Some(b_id)) = (&point_ids[i], &point_ids[i + 1]) else {
            continue;
        };
        if a_id == b_id {
            continue;
        }
        let in_radius = |p: Option<&LatLon>| {
            p.map(|p| within_map_radius(cfg, p.lat, p.lon)).unwrap_or(false)
        };
        if !in_radius(route.points.get(i)) || !in_radius(route.points.get(i + 1)) {
            continue;
        }

        let segment = HistorySegment {
            a_id: a_id.clone(),
            b_id: b_id.clone(),
            ts: route.ts,
            mode: route.route_mode,
            message_hash: route.message_hash.clone(),
        };
        if let Some(edge) = apply_segment(store, &segment, cfg) {
            // Dedup within one route: the same edge may appear once per pass
            if let Some(existing) = delta.updated.iter_mut().find(|e| {
                edge_key(&e.a_id, &e.b_id) == edge_key(&edge.a_id, &edge.b_id)
            }) {
                *existing = edge;
            } else {
                delta.updated.push(edge);
            }
        }
        store.history_segments.push_back(segment.clone());
        delta.new_segments.push(segment);
    }

    while store.history_segments.len() > cfg.route_history_max_segments {
        store.history_segments.pop_front();
    }
    delta
}

/// Fold one segment into the edge table. Returns the updated edge for
/// broadcast, or `None` when a brand-new edge cannot be positioned because
/// an endpoint device is gone.
pub fn apply_segment(
    store: &mut TopologyStore,
    segment: &HistorySegment,
    cfg: &Config,
) -> Option<HistoryEdge> {
    let key = edge_key(&segment.a_id, &segment.b_id);
    let sample = EdgeSample {
        ts: segment.ts,
        mode: segment.mode,
        message_hash: segment.message_hash.clone(),
    };

    if let Some(edge) = store.history_edges.get_mut(&key) {
        edge.count += 1;
        edge.last_ts = edge.last_ts.max(segment.ts);
        edge.recent.push(sample);
        if edge.recent.len() > cfg.history_edge_sample_limit {
            let excess = edge.recent.len() - cfg.history_edge_sample_limit;
            edge.recent.drain(..excess);
        }
        return Some(edge.clone());
    }

    // New edge: endpoint coordinates are captured at creation time and kept
    // even if a device later moves (see DESIGN.md).
    let a_dev = store.devices.get(&segment.a_id)?;
    let b_dev = store.devices.get(&segment.b_id)?;
    let (a_id, b_id, a, b) = if segment.a_id <= segment.b_id {
        (
            segment.a_id.clone(),
            segment.b_id.clone(),
            LatLon { lat: a_dev.lat, lon: a_dev.lon },
            LatLon { lat: b_dev.lat, lon: b_dev.lon },
        )
    } else {
        (
            segment.b_id.clone(),
            segment.a_id.clone(),
            LatLon { lat: b_dev.lat, lon: b_dev.lon },
            LatLon { lat: a_dev.lat, lon: a_dev.lon },
        )
    };
    let edge = HistoryEdge {
        a,
        b,
        a_id,
        b_id,
        count: 1,
        last_ts: segment.ts,
        recent: vec![sample],
    };
    store.history_edges.insert(key, edge.clone());
    Some(edge)
}

// ─── Pruning ──────────────────────────────────────────────────────────────────

/// Drop segments and edges that fell out of the rolling window. Edges whose
/// `recent` ring shrank are reported as updates.
pub fn prune_route_history(store: &mut TopologyStore, now: f64, cfg: &Config) -> HistoryDelta {
    let mut delta = HistoryDelta::default();
    let cutoff = now - cfg.route_history_hours * 3600.0;

    while store
        .history_segments
        .front()
        .map(|s| s.ts < cutoff)
        .unwrap_or(false)
    {
        store.history_segments.pop_front();
    }

    let expired: Vec<String> = store
        .history_edges
        .iter()
        .filter(|(_, e)| e.last_ts < cutoff)
        .map(|(k, _)| k.clone())
        .collect();
    for key in expired {
        store.history_edges.remove(&key);
        delta.removed.push(key);
    }

    for edge in store.history_edges.values_mut() {
        let before = edge.recent.len();
        edge.recent.retain(|s| s.ts >= cutoff);
        if edge.recent.len() != before {
            delta.updated.push(edge.clone());
        }
    }
    delta
}

// ─── JSONL mirror ─────────────────────────────────────────────────────────────

/// Append freshly recorded segments. IO failures are logged and retried
/// implicitly next pass (persistence-fault policy).
pub async fn append_segments(path: &Path, segments: &[HistorySegment]) {
    if segments.is_empty() {
        return;
    }
    let mut lines = String::new();
    for segment in segments {
        match serde_json::to_string(segment) {
            Ok(line) => {
                lines.push_str(&line);
                lines.push('\n');
            }
            Err(e) => warn!("History: failed to serialize segment: {e}"),
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut f) => {
            if let Err(e) = f.write_all(lines.as_bytes()).await {
                warn!("History: append to {} failed: {e}", path.display());
            }
        }
        Err(e) => warn!("History: could not open {}: {e}", path.display()),
    }
}

/// Load persisted segments at startup, keeping only the in-window tail, and
/// rebuild the edge table from them.
pub async fn load_route_history(store: &mut TopologyStore, cfg: &Config) {
    let data = match tokio::fs::read_to_string(&cfg.route_history_file).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("History: could not read {}: {e}", cfg.route_history_file.display());
            return;
        }
    };

    let cutoff = crate::state::now_ts() - cfg.route_history_hours * 3600.0;
    let mut loaded = 0usize;
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let segment: HistorySegment = match serde_json::from_str(line) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if segment.ts < cutoff {
            continue;
        }
        apply_segment(store, &segment, cfg);
        store.history_segments.push_back(segment);
        loaded += 1;
    }
    while store.history_segments.len() > cfg.route_history_max_segments {
        store.history_segments.pop_front();
    }
    if loaded > 0 {
        info!(
            "Loaded {loaded} history segments ({} edges) from {}",
            store.history_edges.len(),
            cfg.route_history_file.display()
        );
    }
}

/// Periodic compactor: rewrite the JSONL file keeping only in-window
/// segments. Runs alongside the reaper on its own schedule.
pub async fn run_history_compactor(store: SharedStore, cfg: std::sync::Arc<Config>) {
    if !cfg.route_history_enabled {
        return;
    }
    let mut ticker = interval(Duration::from_secs(cfg.route_history_compact_interval.max(1)));
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;

        let lines = {
            let guard = store.read().await;
            let cutoff = crate::state::now_ts() - cfg.route_history_hours * 3600.0;
            let mut buf = String::new();
            for segment in guard.history_segments.iter().filter(|s| s.ts >= cutoff) {
                if let Ok(line) = serde_json::to_string(segment) {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
            buf
        };

        let tmp = cfg.route_history_file.with_extension("jsonl.tmp");
        if let Err(e) = tokio::fs::write(&tmp, lines.as_bytes()).await {
            warn!("History: compactor write failed: {e}");
            continue;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &cfg.route_history_file).await {
            warn!("History: compactor rename failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::{DeviceUpdate, RouteMode};

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.map_radius_km = 0.0;
        cfg.trail_len = 0;
        cfg.route_history_enabled = true;
        cfg.route_history_hours = 1.0;
        cfg.route_history_max_segments = 4;
        cfg.history_edge_sample_limit = 2;
        cfg.route_history_allowed_modes = ["path".to_string()].into_iter().collect();
        cfg.route_history_payload_types = [5u8].into_iter().collect();
        cfg
    }

    fn seed_device(store: &mut TopologyStore, cfg: &Config, id: &str, lat: f64, lon: f64) {
        store.upsert_device(
            DeviceUpdate {
                device_id: id.to_string(),
                lat,
                lon,
                ts: 1000.0,
                heading: None,
                speed: None,
                rssi: None,
                snr: None,
                name: None,
                role: None,
            },
            None,
            cfg,
        );
    }

    fn path_route(ids: &[&str], points: &[(f64, f64)], ts: f64) -> Route {
        Route {
            id: "r".into(),
            points: points.iter().map(|&(lat, lon)| LatLon { lat, lon }).collect(),
            route_mode: RouteMode::Path,
            ts,
            expires_at: ts + 30.0,
            origin_id: None,
            receiver_id: None,
            payload_type: Some(5),
            message_hash: Some("mh".into()),
            snr_values: None,
            node_hashes: vec![],
            point_ids: Some(ids.iter().map(|s| Some(s.to_string())).collect()),
        }
    }

    #[test]
    fn records_one_edge_per_pair() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        seed_device(&mut store, &cfg, "a1aaa", 42.0, -71.0);
        seed_device(&mut store, &cfg, "b2bbb", 42.1, -71.1);

        let route = path_route(&["a1aaa", "b2bbb"], &[(42.0, -71.0), (42.1, -71.1)], 1000.0);
        let delta = record_route_history(&mut store, &route, &cfg);

        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.new_segments.len(), 1);
        let edge = &store.history_edges[&edge_key("a1aaa", "b2bbb")];
        assert_eq!(edge.count, 1);
        assert_eq!(edge.recent.len(), 1);

        // Second traversal bumps the count and keeps recent bounded
        record_route_history(&mut store, &route, &cfg);
        record_route_history(&mut store, &route, &cfg);
        let edge = &store.history_edges[&edge_key("a1aaa", "b2bbb")];
        assert_eq!(edge.count, 3);
        assert_eq!(edge.recent.len(), cfg.history_edge_sample_limit);
        assert!(edge.count as usize >= edge.recent.len());
        assert!(edge.recent.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[test]
    fn skips_missing_equal_and_out_of_radius_pairs() {
        let mut cfg = test_config();
        cfg.map_radius_km = 50.0;
        let mut store = TopologyStore::default();
        seed_device(&mut store, &cfg, "a1aaa", 42.36, -71.06);
        seed_device(&mut store, &cfg, "b2bbb", 42.37, -71.07);

        // Middle id missing → both pairs around it are dropped
        let mut route = path_route(
            &["a1aaa", "a1aaa", "b2bbb"],
            &[(42.36, -71.06), (42.36, -71.06), (42.37, -71.07)],
            1000.0,
        );
        route.point_ids = Some(vec![Some("a1aaa".into()), None, Some("b2bbb".into())]);
        let delta = record_route_history(&mut store, &route, &cfg);
        assert!(delta.updated.is_empty());

        // Equal endpoint ids dropped
        let route = path_route(&["a1aaa", "a1aaa"], &[(42.36, -71.06), (42.36, -71.06)], 1000.0);
        assert!(record_route_history(&mut store, &route, &cfg).updated.is_empty());

        // Out-of-radius point dropped (New York is well outside 50 km)
        let route = path_route(&["a1aaa", "b2bbb"], &[(42.36, -71.06), (40.71, -74.0)], 1000.0);
        assert!(record_route_history(&mut store, &route, &cfg).updated.is_empty());
    }

    #[test]
    fn gates_mode_payload_and_enable_flag() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        seed_device(&mut store, &cfg, "a1aaa", 42.0, -71.0);
        seed_device(&mut store, &cfg, "b2bbb", 42.1, -71.1);

        let mut route = path_route(&["a1aaa", "b2bbb"], &[(42.0, -71.0), (42.1, -71.1)], 1000.0);
        route.route_mode = RouteMode::Direct;
        assert!(record_route_history(&mut store, &route, &cfg).new_segments.is_empty());

        let mut route = path_route(&["a1aaa", "b2bbb"], &[(42.0, -71.0), (42.1, -71.1)], 1000.0);
        route.payload_type = Some(8);
        assert!(record_route_history(&mut store, &route, &cfg).new_segments.is_empty());

        let mut off = test_config();
        off.route_history_enabled = false;
        let route = path_route(&["a1aaa", "b2bbb"], &[(42.0, -71.0), (42.1, -71.1)], 1000.0);
        assert!(record_route_history(&mut store, &route, &off).new_segments.is_empty());
    }

    #[test]
    fn segment_list_capped_globally() {
        let cfg = test_config();
        let mut store = TopologyStore::default();
        seed_device(&mut store, &cfg, "a1aaa", 42.0, -71.0);
        seed_device(&mut store, &cfg, "b2bbb", 42.1, -71.1);
        seed_device(&mut store, &cfg, "c3ccc", 42.2, -71.2);

        let route = path_route(
            &["a1aaa", "b2bbb", "c3ccc"],
            &[(42.0, -71.0), (42.1, -71.1), (42.2, -71.2)],
            1000.0,
        );
        for _ in 0..4 {
            record_route_history(&mut store, &route, &cfg);
        }
        assert_eq!(store.history_segments.len(), cfg.route_history_max_segments);
    }

    #[test]
    fn prune_removes_expired_edges_and_trims_recent() {
        let cfg = test_config(); // 1 hour window
        let mut store = TopologyStore::default();
        seed_device(&mut store, &cfg, "a1aaa", 42.0, -71.0);
        seed_device(&mut store, &cfg, "b2bbb", 42.1, -71.1);
        seed_device(&mut store, &cfg, "c3ccc", 42.2, -71.2);

        let old = path_route(&["a1aaa", "b2bbb"], &[(42.0, -71.0), (42.1, -71.1)], 1000.0);
        record_route_history(&mut store, &old, &cfg);
        let mut fresh = path_route(&["b2bbb", "c3ccc"], &[(42.1, -71.1), (42.2, -71.2)], 1000.0);
        record_route_history(&mut store, &fresh, &cfg);
        fresh.ts = 5000.0;
        record_route_history(&mut store, &fresh, &cfg);

        // One hour after the fresh sample: the old edge is gone and the
        // surviving edge loses its stale sample.
        let delta = prune_route_history(&mut store, 5000.0 + 3000.0, &cfg);
        assert_eq!(delta.removed, vec![edge_key("a1aaa", "b2bbb")]);
        assert_eq!(delta.updated.len(), 1);
        let survivor = &store.history_edges[&edge_key("b2bbb", "c3ccc")];
        assert_eq!(survivor.recent.len(), 1);
        assert_eq!(survivor.count, 2);
        assert!(store.history_segments.iter().all(|s| s.ts >= 5000.0 + 3000.0 - 3600.0));
    }

    #[tokio::test]
    async fn jsonl_round_trip_rebuilds_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.route_history_file = dir.path().join("route_history.jsonl");

        let mut store = TopologyStore::default();
        seed_device(&mut store, &cfg, "a1aaa", 42.0, -71.0);
        seed_device(&mut store, &cfg, "b2bbb", 42.1, -71.1);
        let now = crate::state::now_ts();
        let route = path_route(&["a1aaa", "b2bbb"], &[(42.0, -71.0), (42.1, -71.1)], now);
        let delta = record_route_history(&mut store, &route, &cfg);
        append_segments(&cfg.route_history_file, &delta.new_segments).await;

        let mut reloaded = TopologyStore::default();
        seed_device(&mut reloaded, &cfg, "a1aaa", 42.0, -71.0);
        seed_device(&mut reloaded, &cfg, "b2bbb", 42.1, -71.1);
        load_route_history(&mut reloaded, &cfg).await;

        assert_eq!(reloaded.history_segments.len(), 1);
        let edge = &reloaded.history_edges[&edge_key("a1aaa", "b2bbb")];
        assert_eq!(edge.count, 1);
    }
}

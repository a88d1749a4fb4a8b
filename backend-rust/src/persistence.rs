//! # persistence
//!
//! Durable JSON state file for devices, trails, presence and the name/role
//! tables. Saves are dirty-flag gated and atomic (write to a temp file,
//! then rename). Load failures log and start empty; save failures log and
//! retry on the next tick.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::classifier::normalize_role;
use crate::config::Config;
use crate::state::{
    coords_are_zero, coords_valid, now_ts, within_map_radius, DeviceRole, DeviceState,
    RoleSource, SharedStore, TopologyStore, TrailPoint,
};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: f64,
    #[serde(default)]
    pub devices: HashMap<String, DeviceState>,
    #[serde(default)]
    pub trails: HashMap<String, Vec<TrailPoint>>,
    #[serde(default)]
    pub seen_devices: HashMap<String, f64>,
    #[serde(default)]
    pub device_names: HashMap<String, String>,
    #[serde(default)]
    pub device_roles: HashMap<String, DeviceRole>,
    #[serde(default)]
    pub device_role_sources: HashMap<String, RoleSource>,
}

impl PersistedState {
    pub fn capture(store: &TopologyStore) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: now_ts(),
            devices: store.devices.clone(),
            trails: store.trails.clone(),
            seen_devices: store.seen_devices.clone(),
            device_names: store.device_names.clone(),
            device_roles: store.device_roles.clone(),
            device_role_sources: store.device_role_sources.clone(),
        }
    }
}

// ─── Load ─────────────────────────────────────────────────────────────────────

/// Load persisted state into a fresh store. Devices and trail points with
/// invalid, zero or out-of-radius coordinates are dropped on the way in.
pub async fn load_state(cfg: &Config) -> TopologyStore {
    let mut store = TopologyStore::default();

    match fs::read_to_string(&cfg.state_file).await {
        Ok(data) => match serde_json::from_str::<PersistedState>(&data) {
            Ok(persisted) => {
                apply_persisted(&mut store, persisted, cfg);
                info!(
                    "Loaded state from {} ({} devices, {} trails)",
                    cfg.state_file.display(),
                    store.devices.len(),
                    store.trails.len()
                );
            }
            Err(e) => warn!("Failed to parse {}: {e}, starting empty", cfg.state_file.display()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No state file at {}, starting empty", cfg.state_file.display());
        }
        Err(e) => warn!("Failed to read {}: {e}, starting empty", cfg.state_file.display()),
    }

    merge_role_overrides(&mut store, cfg).await;
    store.rebuild_node_hash_index();
    store.dirty = false;
    store
}

fn apply_persisted(store: &mut TopologyStore, persisted: PersistedState, cfg: &Config) {
    for (id, device) in persisted.devices {
        if !coords_valid(device.lat, device.lon)
            || coords_are_zero(device.lat, device.lon)
            || !within_map_radius(cfg, device.lat, device.lon)
        {
            continue;
        }
        store.devices.insert(id, device);
    }
    for (id, trail) in persisted.trails {
        if !store.devices.contains_key(&id) {
            continue;
        }
        let mut filtered: Vec<TrailPoint> = trail
            .into_iter()
            .filter(|p| {
                coords_valid(p.lat, p.lon)
                    && !coords_are_zero(p.lat, p.lon)
                    && within_map_radius(cfg, p.lat, p.lon)
            })
            .collect();
        if cfg.trail_len == 0 {
            continue;
        }
        if filtered.len() > cfg.trail_len {
            let excess = filtered.len() - cfg.trail_len;
            filtered.drain(..excess);
        }
        if !filtered.is_empty() {
            store.trails.insert(id, filtered);
        }
    }
    store.seen_devices = persisted.seen_devices;
    store.device_names = persisted.device_names;
    store.device_roles = persisted.device_roles;
    store.device_role_sources = persisted.device_role_sources;
}

/// Role overrides file: `{ "<device_id>": "<role>" }`. Entries become
/// source=override and are never downgraded by observed data.
async fn merge_role_overrides(store: &mut TopologyStore, cfg: &Config) {
    let data = match fs::read_to_string(&cfg.device_roles_file).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Failed to read {}: {e}", cfg.device_roles_file.display());
            return;
        }
    };
    let overrides: HashMap<String, String> = match serde_json::from_str(&data) {
        Ok(o) => o,
        Err(e) => {
            warn!("Failed to parse {}: {e}", cfg.device_roles_file.display());
            return;
        }
    };
    let mut applied = 0usize;
    for (id, role_str) in overrides {
        let Some(role) = normalize_role(&role_str) else {
            warn!("Unknown role {role_str:?} for {id} in overrides file");
            continue;
        };
        store.device_roles.insert(id.clone(), role);
        store.device_role_sources.insert(id.clone(), RoleSource::Override);
        if let Some(device) = store.devices.get_mut(&id) {
            device.role = Some(role);
        }
        applied += 1;
    }
    if applied > 0 {
        info!("Applied {applied} role overrides from {}", cfg.device_roles_file.display());
    }
}

// ─── Save ─────────────────────────────────────────────────────────────────────

/// Atomic rewrite: temp file in the same directory, then rename over.
pub async fn save_state(cfg: &Config, persisted: &PersistedState) -> Result<()> {
    if let Some(parent) = cfg.state_file.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string(persisted)?;
    let tmp = cfg.state_file.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes())
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &cfg.state_file)
        .await
        .with_context(|| format!("renaming over {}", cfg.state_file.display()))?;
    Ok(())
}

/// Periodic saver: only writes when the store was marked dirty since the
/// last pass.
pub async fn run_state_saver(store: SharedStore, cfg: Arc<Config>) {
    let mut ticker = interval(Duration::from_secs(cfg.state_save_interval.max(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;

        let snapshot = {
            let mut guard = store.write().await;
            if !guard.dirty {
                continue;
            }
            guard.dirty = false;
            PersistedState::capture(&guard)
        };

        if let Err(e) = save_state(&cfg, &snapshot).await {
            warn!("State save failed (will retry): {e:#}");
            store.write().await.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceUpdate;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::from_env();
        cfg.trail_len = 10;
        cfg.map_radius_km = 0.0;
        cfg.map_start_lat = 42.3601;
        cfg.map_start_lon = -71.0589;
        cfg.state_file = dir.join("state.json");
        cfg.device_roles_file = dir.join("device_roles.json");
        cfg
    }

    fn seed(store: &mut TopologyStore, cfg: &Config, id: &str, lat: f64, lon: f64) {
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
                name: Some(format!("{id}-name")),
                role: None,
            },
            None,
            cfg,
        );
    }

    #[tokio::test]
    async fn state_round_trip_reproduces_tables() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let mut store = TopologyStore::default();
        seed(&mut store, &cfg, "aa11", 42.36, -71.05);
        seed(&mut store, &cfg, "bb22", 42.40, -71.10);
        store.mark_seen("aa11", 1000.0);

        save_state(&cfg, &PersistedState::capture(&store)).await.unwrap();
        let reloaded = load_state(&cfg).await;

        assert_eq!(reloaded.devices.len(), 2);
        assert_eq!(reloaded.trails.len(), 2);
        assert_eq!(reloaded.device_names["aa11"], "aa11-name");
        assert_eq!(reloaded.seen_devices["aa11"], 1000.0);
        assert!(!reloaded.dirty);
        assert!(reloaded.node_hash_to_device.contains_key("aa"));
    }

    #[tokio::test]
    async fn load_drops_invalid_and_out_of_radius_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());

        // Save with no radius filter, reload with a 50 km one
        let mut store = TopologyStore::default();
        seed(&mut store, &cfg, "aa11", 42.36, -71.05);
        seed(&mut store, &cfg, "ffaa", 40.71, -74.00); // New York
        let mut persisted = PersistedState::capture(&store);
        // Hand-corrupt one device with zero coords
        persisted.devices.insert(
            "00zz".into(),
            DeviceState {
                device_id: "00zz".into(),
                lat: 0.0,
                lon: 0.0,
                ts: 1.0,
                heading: None,
                speed: None,
                rssi: None,
                snr: None,
                name: None,
                role: None,
                raw_topic: None,
                last_seen_ts: None,
                mqtt_seen_ts: None,
            },
        );
        save_state(&cfg, &persisted).await.unwrap();

        cfg.map_radius_km = 50.0;
        let reloaded = load_state(&cfg).await;
        assert_eq!(reloaded.devices.len(), 1);
        assert!(reloaded.devices.contains_key("aa11"));
        assert!(!reloaded.trails.contains_key("ffaa"));
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fs::write(&cfg.state_file, b"{ not json").await.unwrap();
        let store = load_state(&cfg).await;
        assert!(store.devices.is_empty());
    }

    #[tokio::test]
    async fn role_overrides_merge_as_override_source() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let mut store = TopologyStore::default();
        seed(&mut store, &cfg, "aa11", 42.36, -71.05);
        save_state(&cfg, &PersistedState::capture(&store)).await.unwrap();
        fs::write(&cfg.device_roles_file, br#"{"aa11": "repeater", "cc33": "room"}"#)
            .await
            .unwrap();

        let reloaded = load_state(&cfg).await;
        assert_eq!(reloaded.device_roles["aa11"], DeviceRole::Repeater);
        assert_eq!(reloaded.device_role_sources["aa11"], RoleSource::Override);
        assert_eq!(reloaded.devices["aa11"].role, Some(DeviceRole::Repeater));
        assert_eq!(reloaded.device_roles["cc33"], DeviceRole::Room);
    }
}

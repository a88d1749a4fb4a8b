//! # reaper
//!
//! Periodic sweeper enforcing every TTL across the topology store. Runs on
//! a fixed 5 second cadence and broadcasts the resulting removals so map
//! clients converge without reconnecting.

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::broadcast::{broadcast, ServerMessage, SharedSubscribers};
use crate::config::Config;
use crate::history::prune_route_history;
use crate::state::{coords_are_zero, now_ts, SharedStore};

const REAP_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run_reaper(store: SharedStore, cfg: Arc<Config>, subs: SharedSubscribers) {
    let mut ticker = interval(REAP_INTERVAL);
    info!("Reaper started ({}s cadence)", REAP_INTERVAL.as_secs());
    loop {
        ticker.tick().await;
        reap_once(&store, &cfg, &subs, now_ts()).await;
    }
}

/// One sweep: device TTL, defective routes, route expiry,
/// history pruning, heat window, origin-cache expiry, presence forget.
pub async fn reap_once(store: &SharedStore, cfg: &Config, subs: &SharedSubscribers, now: f64) {
    let mut messages: Vec<ServerMessage> = Vec::new();

    {
        let mut guard = store.write().await;

        // 1. Device TTL (0 disables expiry entirely)
        if cfg.device_ttl_seconds > 0 {
            let cutoff = now - cfg.device_ttl_seconds as f64;
            let stale: Vec<String> = guard
                .devices
                .values()
                .filter(|d| d.ts < cutoff)
                .map(|d| d.device_id.clone())
                .collect();
            if !stale.is_empty() {
                debug!("Reaper: evicting {} stale devices", stale.len());
                for id in &stale {
                    guard.evict_device(id);
                }
                messages.push(ServerMessage::Stale { device_ids: stale });
            }
        }

        // 2. Routes that somehow carry a zero coordinate
        let zeroed: Vec<String> = guard
            .routes
            .values()
            .filter(|r| r.points.iter().any(|p| coords_are_zero(p.lat, p.lon)))
            .map(|r| r.id.clone())
            .collect();
        if !zeroed.is_empty() {
            for id in &zeroed {
                guard.routes.remove(id);
            }
            messages.push(ServerMessage::RouteRemove { route_ids: zeroed });
        }

        // 3. Route expiry
        let expired: Vec<String> = guard
            .routes
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.id.clone())
            .collect();
        if !expired.is_empty() {
            for id in &expired {
                guard.routes.remove(id);
            }
            messages.push(ServerMessage::RouteRemove { route_ids: expired });
        }

        // 4. History window
        let delta = prune_route_history(&mut guard, now, cfg);
        if !delta.updated.is_empty() {
            messages.push(ServerMessage::HistoryEdges {
                edges: delta.updated,
            });
        }
        if !delta.removed.is_empty() {
            messages.push(ServerMessage::HistoryEdgesRemove {
                edge_ids: delta.removed,
            });
        }

        // 5. Heat window
        let heat_cutoff = now - cfg.heat_ttl_seconds as f64;
        guard.heat_events.retain(|h| h.ts >= heat_cutoff);

        // 6. Message-origin cache
        let origin_cutoff = now - cfg.message_origin_ttl_seconds as f64;
        guard.message_origins.retain(|_, o| o.ts >= origin_cutoff);

        // 7. Presence forget
        let presence_cutoff = now - cfg.presence_forget_seconds() as f64;
        guard.seen_devices.retain(|_, &mut ts| ts >= presence_cutoff);
        guard.mqtt_seen.retain(|_, &mut ts| ts >= presence_cutoff);
        guard
            .last_seen_broadcast
            .retain(|_, &mut ts| ts >= presence_cutoff);
    }

    for message in &messages {
        broadcast(subs, message).await;
    }
}

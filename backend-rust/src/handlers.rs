//! # handlers
//!
//! HTTP surface and the WebSocket fan-out endpoint. Handlers only read the
//! topology store; every mutation stays on the broadcaster/reaper path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::auth::{check_access, extract_token};
use crate::broadcast::{ServerMessage, SharedSubscribers};
use crate::config::Config;
use crate::decoder::FrameDecoder;
use crate::los::{fetch_coverage, LosService};
use crate::state::{now_ts, DeviceState, SharedStore, TopologyStore};

/// WS close code for a rejected token (policy violation).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: SharedStore,
    pub subs: SharedSubscribers,
    pub decoder: Arc<FrameDecoder>,
    pub los: Arc<LosService>,
    pub http_client: reqwest::Client,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/snapshot", get(snapshot))
        .route("/stats", get(stats))
        .route("/api/nodes", get(api_nodes))
        .route("/peers/:device_id", get(peers))
        .route("/los", get(los_endpoint))
        .route("/coverage", get(coverage))
        .route("/debug/last", get(debug_last))
        .route("/debug/status", get(debug_status))
        .route("/manifest.webmanifest", get(manifest))
        .route("/sw.js", get(service_worker))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ─── Plain endpoints ──────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    check_access(&state.cfg, &headers, &query)?;
    let snap = state.store.read().await.snapshot(&state.cfg);
    let mut body = serde_json::to_value(&snap).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    body["server_time"] = json!(now_ts());
    body["map"] = json!({
        "start_lat": state.cfg.map_start_lat,
        "start_lon": state.cfg.map_start_lon,
        "start_zoom": state.cfg.map_start_zoom,
        "radius_km": state.cfg.map_radius_km,
    });
    Ok(Json(body))
}

async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    check_access(&state.cfg, &headers, &query)?;
    let decoder_ready = state.decoder.is_ready().await;
    let subscribers = state.subs.read().await.len();
    let guard = state.store.read().await;

    if state.cfg.prod_mode {
        // Reduced surface in production: counters only
        return Ok(Json(json!({
            "received": guard.stats.received,
            "parsed": guard.stats.parsed,
            "routes": guard.stats.routes,
            "devices": guard.devices.len(),
        })));
    }

    let mut top_topics: Vec<(&String, &u64)> = guard.stats.topic_counts.iter().collect();
    top_topics.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    top_topics.truncate(20);

    Ok(Json(json!({
        "received": guard.stats.received,
        "parsed": guard.stats.parsed,
        "devices_updated": guard.stats.devices_updated,
        "routes": guard.stats.routes,
        "decode_attempts": guard.stats.decode_attempts,
        "decode_failures": guard.stats.decode_failures,
        "queue_dropped": guard.stats.queue_dropped,
        "seen_broadcasts": guard.stats.seen_broadcasts,
        "result_counts": guard.stats.result_counts,
        "top_topics": top_topics,
        "decoder_ready": decoder_ready,
        "subscribers": subscribers,
        "devices": guard.devices.len(),
        "routes_live": guard.routes.len(),
        "history_edges": guard.history_edges.len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })))
}

async fn api_nodes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    check_access(&state.cfg, &headers, &query)?;
    let updated_since = query.get("updated_since").and_then(|v| parse_updated_since(v));
    let delta = query.get("mode").map(|m| m == "delta").unwrap_or(false);
    let flat = query.get("format").map(|f| f == "flat").unwrap_or(false);

    let guard = state.store.read().await;
    let body = build_nodes(&guard, &state.cfg, now_ts(), delta.then_some(updated_since).flatten(), flat);
    Ok(Json(body))
}

async fn peers(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    check_access(&state.cfg, &headers, &query)?;
    let limit = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(10usize);
    let guard = state.store.read().await;
    Ok(Json(build_peers(&guard, &state.cfg, &device_id, limit)))
}

async fn los_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    check_access(&state.cfg, &headers, &query)?;

    let coord = |key: &str| query.get(key).and_then(|v| v.parse::<f64>().ok());
    let (Some(lat1), Some(lon1), Some(lat2), Some(lon2)) =
        (coord("lat1"), coord("lon1"), coord("lat2"), coord("lon2"))
    else {
        return Ok(Json(json!({ "error": "lat1, lon1, lat2, lon2 are required" })));
    };
    let profile = coord("profile").unwrap_or(2.0);

    match state.los.line_of_sight(lat1, lon1, lat2, lon2, profile).await {
        Ok(result) => Ok(Json(result)),
        Err(reason) => Ok(Json(json!({ "error": format!("elevation_fetch_failed: {reason}") }))),
    }
}

async fn coverage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, StatusCode> {
    check_access(&state.cfg, &headers, &query)?;
    let Some(url) = state.cfg.coverage_api_url.as_deref() else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "coverage_api_unconfigured" })),
        )
            .into_response());
    };
    match fetch_coverage(&state.http_client, url).await {
        Ok(body) => Ok(Json(body).into_response()),
        Err(tag) => Ok(Json(json!({ "error": tag })).into_response()),
    }
}

async fn debug_last(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.cfg.prod_mode {
        return Err(StatusCode::NOT_FOUND);
    }
    let guard = state.store.read().await;
    Ok(Json(json!({ "entries": guard.debug_last })))
}

async fn debug_status(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.cfg.prod_mode {
        return Err(StatusCode::NOT_FOUND);
    }
    let guard = state.store.read().await;
    Ok(Json(json!({ "by_result": guard.status_last })))
}

// Thin PWA stubs; the real client assets live in the static file server.
async fn manifest() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/manifest+json")],
        Json(json!({
            "name": "Mesh Live Map",
            "short_name": "MeshMap",
            "start_url": "/",
            "display": "standalone",
        })),
    )
}

async fn service_worker() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        "self.addEventListener('fetch', () => {});\n",
    )
}

// ─── WebSocket ────────────────────────────────────────────────────────────────

async fn ws_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, StatusCode> {
    let token_ok = if state.cfg.prod_mode {
        let Some(expected) = state.cfg.prod_token.as_deref() else {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        };
        extract_token(&headers, &query).as_deref() == Some(expected)
    } else {
        true
    };

    Ok(ws.on_upgrade(move |socket| async move {
        if !token_ok {
            reject_socket(socket).await;
            return;
        }
        client_loop(socket, state).await;
    }))
}

async fn reject_socket(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "invalid token".into(),
        })))
        .await;
}

/// Per-client loop: one snapshot, then relay broadcaster deltas until the
/// socket goes away. Client-to-server text is ignored.
async fn client_loop(socket: WebSocket, state: AppState) {
    let snapshot = state.store.read().await.snapshot(&state.cfg);
    let first = match serde_json::to_string(&ServerMessage::Snapshot(snapshot)) {
        Ok(t) => t,
        Err(_) => return,
    };

    let (mut sender, mut receiver) = socket.split();
    if sender.send(Message::Text(first)).await.is_err() {
        return;
    }

    let (id, mut rx) = state.subs.write().await.add();
    info!("WS subscriber {id} connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => debug!("WS subscriber {id}: client message ignored"),
            },
        }
    }

    state.subs.write().await.remove(id);
    info!("WS subscriber {id} disconnected");
}

// ─── Response assembly (pure, unit-tested) ────────────────────────────────────

fn effective_last_seen(device: &DeviceState) -> f64 {
    device.last_seen_ts.unwrap_or(device.ts).max(device.ts)
}

fn parse_updated_since(raw: &str) -> Option<f64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis() as f64 / 1000.0);
    }
    raw.parse::<f64>().ok()
}

pub(crate) fn build_nodes(
    store: &TopologyStore,
    cfg: &Config,
    now: f64,
    updated_since: Option<f64>,
    flat: bool,
) -> Value {
    let forced = &cfg.mqtt_online_force_names;
    let mut nodes: Vec<&DeviceState> = store.devices.values().collect();
    if let Some(since) = updated_since {
        nodes.retain(|d| effective_last_seen(d) >= since);
    }
    nodes.sort_by(|a, b| {
        effective_last_seen(b)
            .partial_cmp(&effective_last_seen(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });

    let entries: Vec<Value> = nodes
        .iter()
        .map(|d| {
            let forced_online = d
                .name
                .as_deref()
                .map(|n| forced.contains(&n.to_ascii_lowercase()))
                .unwrap_or(false);
            let online = forced_online
                || now - effective_last_seen(d) <= cfg.mqtt_online_seconds as f64;
            json!({
                "device_id": d.device_id,
                "name": d.name,
                "role": d.role,
                "lat": d.lat,
                "lon": d.lon,
                "ts": d.ts,
                "last_seen_ts": effective_last_seen(d),
                "online": online,
            })
        })
        .collect();

    if flat {
        json!({ "data": entries })
    } else {
        json!({ "data": { "nodes": entries } })
    }
}

pub(crate) fn build_peers(
    store: &TopologyStore,
    cfg: &Config,
    device_id: &str,
    limit: usize,
) -> Value {
    let mut incoming: HashMap<&str, u64> = HashMap::new();
    let mut outgoing: HashMap<&str, u64> = HashMap::new();
    for segment in &store.history_segments {
        if segment.a_id == device_id {
            *outgoing.entry(segment.b_id.as_str()).or_insert(0) += 1;
        }
        if segment.b_id == device_id {
            *incoming.entry(segment.a_id.as_str()).or_insert(0) += 1;
        }
    }

    let excluded = |peer: &str| {
        store
            .device_names
            .get(peer)
            .map(|n| cfg.mqtt_online_force_names.contains(&n.to_ascii_lowercase()))
            .unwrap_or(false)
    };
    let histogram = |counts: HashMap<&str, u64>| -> Vec<Value> {
        let mut rows: Vec<(&str, u64)> = counts.into_iter().filter(|(p, _)| !excluded(p)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        rows.truncate(limit);
        rows.into_iter()
            .map(|(peer, count)| {
                json!({
                    "device_id": peer,
                    "name": store.device_names.get(peer),
                    "count": count,
                })
            })
            .collect()
    };

    json!({
        "device_id": device_id,
        "incoming": histogram(incoming),
        "outgoing": histogram(outgoing),
    })
}

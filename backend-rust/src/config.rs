//! # config
//!
//! Environment-variable configuration for the backend. Every option is read
//! once at startup; invalid numeric values fall back to the documented
//! defaults, and an invalid `DIRECT_COORDS_TOPIC_REGEX` disables regex
//! gating with a warning rather than aborting.

use std::collections::HashSet;
use std::path::PathBuf;

use regex::Regex;
use tracing::warn;

// ─── Enumerated options ───────────────────────────────────────────────────────

/// How direct (non-decoded) coordinates found in MQTT payloads are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectCoordsMode {
    /// Never accept direct coordinates.
    Off,
    /// Accept from any topic.
    Any,
    /// Accept only when the topic matches `DIRECT_COORDS_TOPIC_REGEX`.
    Topic,
    /// Topic match OR a location-hint key in the JSON body.
    Strict,
}

impl DirectCoordsMode {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "false" | "0" => Self::Off,
            "topic" => Self::Topic,
            "strict" => Self::Strict,
            _ => Self::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttTransport {
    Tcp,
    Websocket,
}

// ─── Env helpers ──────────────────────────────────────────────────────────────

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Comma-separated list, trimmed, empties dropped.
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Comma-separated list of small integers (payload type codes).
pub fn parse_type_set(value: &str, default: &[u8]) -> HashSet<u8> {
    let parsed: HashSet<u8> = value
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        default.iter().copied().collect()
    } else {
        parsed
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    // MQTT connection
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topics: Vec<String>,
    pub mqtt_tls: bool,
    pub mqtt_tls_insecure: bool,
    pub mqtt_ca_cert: Option<PathBuf>,
    pub mqtt_transport: MqttTransport,
    pub mqtt_ws_path: String,

    // Presence
    pub mqtt_online_seconds: u64,
    pub mqtt_seen_broadcast_min_seconds: u64,
    pub mqtt_online_topic_suffixes: Vec<String>,
    pub mqtt_online_force_names: HashSet<String>,

    // Retention
    pub device_ttl_seconds: u64,
    pub route_ttl_seconds: u64,
    pub heat_ttl_seconds: u64,
    pub message_origin_ttl_seconds: u64,
    pub trail_len: usize,

    // Routes
    pub route_payload_types: HashSet<u8>,
    pub route_path_max_len: usize,

    // Route history
    pub route_history_enabled: bool,
    pub route_history_hours: f64,
    pub route_history_max_segments: usize,
    pub route_history_file: PathBuf,
    pub route_history_payload_types: HashSet<u8>,
    pub route_history_allowed_modes: HashSet<String>,
    pub route_history_compact_interval: u64,
    pub history_edge_sample_limit: usize,

    // Classifier
    pub direct_coords_mode: DirectCoordsMode,
    pub direct_coords_topic_regex: Option<Regex>,
    pub direct_coords_allow_zero: bool,

    // External frame decoder
    pub decode_with_node: bool,
    pub node_script_path: PathBuf,
    pub node_decode_timeout_seconds: f64,

    // Debug traces
    pub debug_payload: bool,
    pub debug_payload_max: usize,
    pub payload_preview_max: usize,

    // Map framing
    pub map_start_lat: f64,
    pub map_start_lon: f64,
    pub map_start_zoom: f64,
    pub map_radius_km: f64,

    // Persistence
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub device_roles_file: PathBuf,
    pub state_save_interval: u64,

    // Auth
    pub prod_mode: bool,
    pub prod_token: Option<String>,

    // External providers
    pub los_elevation_url: String,
    pub los_sample_min: usize,
    pub los_sample_max: usize,
    pub los_sample_step_meters: f64,
    pub elevation_cache_ttl: u64,
    pub coverage_api_url: Option<String>,

    // HTTP
    pub port: u16,
    pub cors_origins: String,
}

impl Config {
    pub fn from_env() -> Self {
        let mqtt_tls = env_bool("MQTT_TLS", false);
        let default_port = if mqtt_tls { 8883 } else { 1883 };

        // MQTT_TOPICS wins over the single-topic MQTT_TOPIC form
        let topics_raw = env_opt("MQTT_TOPICS")
            .or_else(|| env_opt("MQTT_TOPIC"))
            .unwrap_or_else(|| "meshcore/#".to_string());
        let mut mqtt_topics = parse_csv(&topics_raw);
        if mqtt_topics.is_empty() {
            mqtt_topics.push("meshcore/#".to_string());
        }

        let direct_coords_topic_regex = env_opt("DIRECT_COORDS_TOPIC_REGEX").and_then(|pat| {
            match Regex::new(&pat) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Invalid DIRECT_COORDS_TOPIC_REGEX {pat:?}: {e} — regex gating disabled");
                    None
                }
            }
        });

        let state_dir = PathBuf::from(env_str("STATE_DIR", "data"));
        let state_file = env_opt("STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("state.json"));
        let device_roles_file = env_opt("DEVICE_ROLES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("device_roles.json"));
        let route_history_file = env_opt("ROUTE_HISTORY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("route_history.jsonl"));

        let route_history_allowed_modes: HashSet<String> = {
            let modes = parse_csv(&env_str("ROUTE_HISTORY_ALLOWED_MODES", "path"));
            modes.into_iter().map(|m| m.to_ascii_lowercase()).collect()
        };

        Self {
            mqtt_host: env_str("MQTT_HOST", "127.0.0.1"),
            mqtt_port: env_u64("MQTT_PORT", default_port) as u16,
            mqtt_username: env_opt("MQTT_USERNAME"),
            mqtt_password: env_opt("MQTT_PASSWORD"),
            mqtt_client_id: env_str("MQTT_CLIENT_ID", "meshmap-backend"),
            mqtt_topics,
            mqtt_tls,
            mqtt_tls_insecure: env_bool("MQTT_TLS_INSECURE", false),
            mqtt_ca_cert: env_opt("MQTT_CA_CERT").map(PathBuf::from),
            mqtt_transport: match env_str("MQTT_TRANSPORT", "tcp").to_ascii_lowercase().as_str() {
                "websocket" | "websockets" | "ws" | "wss" => MqttTransport::Websocket,
                _ => MqttTransport::Tcp,
            },
            mqtt_ws_path: env_str("MQTT_WS_PATH", "/mqtt"),

            mqtt_online_seconds: env_u64("MQTT_ONLINE_SECONDS", 900),
            mqtt_seen_broadcast_min_seconds: env_u64("MQTT_SEEN_BROADCAST_MIN_SECONDS", 30),
            mqtt_online_topic_suffixes: parse_csv(&env_str(
                "MQTT_ONLINE_TOPIC_SUFFIXES",
                "/status,/internal",
            )),
            mqtt_online_force_names: parse_csv(&env_str("MQTT_ONLINE_FORCE_NAMES", ""))
                .into_iter()
                .map(|n| n.to_ascii_lowercase())
                .collect(),

            device_ttl_seconds: env_u64("DEVICE_TTL_SECONDS", 21_600),
            route_ttl_seconds: env_u64("ROUTE_TTL_SECONDS", 30),
            heat_ttl_seconds: env_u64("HEAT_TTL_SECONDS", 3_600),
            message_origin_ttl_seconds: env_u64("MESSAGE_ORIGIN_TTL_SECONDS", 300),
            trail_len: env_usize("TRAIL_LEN", 50),

            route_payload_types: parse_type_set(&env_str("ROUTE_PAYLOAD_TYPES", "5"), &[5]),
            route_path_max_len: env_usize("ROUTE_PATH_MAX_LEN", 16),

            route_history_enabled: env_bool("ROUTE_HISTORY_ENABLED", true),
            route_history_hours: env_f64("ROUTE_HISTORY_HOURS", 24.0),
            route_history_max_segments: env_usize("ROUTE_HISTORY_MAX_SEGMENTS", 20_000),
            route_history_file,
            route_history_payload_types: parse_type_set(
                &env_str("ROUTE_HISTORY_PAYLOAD_TYPES", "5"),
                &[5],
            ),
            route_history_allowed_modes,
            route_history_compact_interval: env_u64("ROUTE_HISTORY_COMPACT_INTERVAL", 900),
            history_edge_sample_limit: env_usize("HISTORY_EDGE_SAMPLE_LIMIT", 20),

            direct_coords_mode: DirectCoordsMode::parse(&env_str("DIRECT_COORDS_MODE", "any")),
            direct_coords_topic_regex,
            direct_coords_allow_zero: env_bool("DIRECT_COORDS_ALLOW_ZERO", false),

            decode_with_node: env_bool("DECODE_WITH_NODE", true),
            node_script_path: PathBuf::from(env_str("NODE_SCRIPT_PATH", "decoder/decode.js")),
            node_decode_timeout_seconds: env_f64("NODE_DECODE_TIMEOUT_SECONDS", 4.0),

            debug_payload: env_bool("DEBUG_PAYLOAD", false),
            debug_payload_max: env_usize("DEBUG_PAYLOAD_MAX", 200),
            payload_preview_max: env_usize("PAYLOAD_PREVIEW_MAX", 160),

            map_start_lat: env_f64("MAP_START_LAT", 42.3601),
            map_start_lon: env_f64("MAP_START_LON", -71.0589),
            map_start_zoom: env_f64("MAP_START_ZOOM", 10.0),
            map_radius_km: env_f64("MAP_RADIUS_KM", 0.0),

            state_dir,
            state_file,
            device_roles_file,
            state_save_interval: env_u64("STATE_SAVE_INTERVAL", 30),

            prod_mode: env_bool("PROD_MODE", false),
            prod_token: env_opt("PROD_TOKEN"),

            los_elevation_url: env_str(
                "LOS_ELEVATION_URL",
                "https://api.opentopodata.org/v1/srtm90m",
            ),
            los_sample_min: env_usize("LOS_SAMPLE_MIN", 32),
            los_sample_max: env_usize("LOS_SAMPLE_MAX", 256),
            los_sample_step_meters: env_f64("LOS_SAMPLE_STEP_METERS", 60.0),
            elevation_cache_ttl: env_u64("ELEVATION_CACHE_TTL", 3_600),
            coverage_api_url: env_opt("COVERAGE_API_URL"),

            port: env_u64("PORT", 8000) as u16,
            cors_origins: env_str("CORS_ORIGINS", "*"),
        }
    }

    /// True when the topic suffix marks the publishing device as online.
    pub fn topic_marks_online(&self, topic: &str) -> bool {
        self.mqtt_online_topic_suffixes
            .iter()
            .any(|s| topic.ends_with(s.as_str()))
    }

    /// Presence entries are forgotten after this many seconds.
    pub fn presence_forget_seconds(&self) -> u64 {
        (self.device_ttl_seconds * 3).max(900)
    }
}

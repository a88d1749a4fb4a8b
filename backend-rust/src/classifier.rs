//! # classifier
//!
//! Best-effort extraction of coordinates, device id, role, name and decoder
//! metadata from one MQTT frame. Pure with respect to the topology store:
//! the dispatcher feeds it a topic + payload and gets back a tagged
//! classification. Classification never panics; anything unhandled comes
//! back as `Unparsed` with a `parse_error`.

use std::sync::OnceLock;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{Config, DirectCoordsMode};
use crate::decoder::{DecodeMeta, FrameDecoder};
use crate::state::{coords_are_zero, coords_valid, DeviceRole, DeviceUpdate};

// ─── Result tags (wire/debug names of the variants below) ─────────────────────

pub const DIRECT_JSON: &str = "direct_json";
pub const DIRECT_TEXT_JSON: &str = "direct_text_json";
pub const DIRECT_TEXT_JSON_BASE64: &str = "direct_text_json_base64";
pub const DIRECT_TEXT: &str = "direct_text";
pub const DIRECT_BLOCKED: &str = "direct_blocked";
pub const DIRECT_ZERO_COORDS: &str = "direct_zero_coords";
pub const DECODED: &str = "decoded";
pub const DECODED_NO_LOCATION: &str = "decoded_no_location";
pub const DECODE_FAILED: &str = "decode_failed";
pub const JSON_NO_PACKET_BLOB: &str = "json_no_packet_blob";
pub const UNKNOWN: &str = "unknown";

const PACKET_BLOB_KEYS: [&str; 7] = ["hex", "raw", "packet", "data", "payload", "frame", "mesh_packet"];
const LOCATION_HINT_KEYS: [&str; 5] = ["location", "gps", "position", "coords", "geo"];
const ROLE_KEYS: [&str; 7] = [
    "role", "device_role", "node_role", "device_type", "node_type", "class", "profile",
];

// ─── Classification result ────────────────────────────────────────────────────

/// Envelope-level hints recovered from a readable body and the topic:
/// origin device id, name/role and the publisher's tx/rx direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeHints {
    pub origin_id: Option<String>,
    pub name: Option<String>,
    pub role: Option<DeviceRole>,
    pub direction: Option<String>,
}

/// A direct (non-decoded) coordinate fix.
#[derive(Debug, Clone)]
pub struct DirectFix {
    pub update: DeviceUpdate,
    pub hints: EnvelopeHints,
}

/// Output of a successful external decode; `update` is present only when
/// the frame carried a usable location.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub meta: DecodeMeta,
    pub update: Option<DeviceUpdate>,
    pub hints: EnvelopeHints,
    pub packet_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailedDecode {
    pub meta: DecodeMeta,
    pub hints: EnvelopeHints,
    pub packet_hash: Option<String>,
}

/// One variant per classification outcome, carrying only that outcome's
/// data. The dispatcher branches on the shape; the string tags exist solely
/// for counters and debug records.
#[derive(Debug, Clone)]
pub enum Classification {
    /// lat/lon keys in a JSON object.
    DirectJson(DirectFix),
    /// Coordinate text inside a JSON string leaf.
    DirectTextJson(DirectFix),
    /// Coordinate text inside a base64-encoded JSON leaf.
    DirectTextJsonBase64(DirectFix),
    /// Coordinate text in a plain-text payload.
    DirectText(DirectFix),
    /// Direct coordinates rejected by the gating mode.
    DirectBlocked(EnvelopeHints),
    /// `(0, 0)` rejected.
    DirectZeroCoords(EnvelopeHints),
    /// External decoder produced metadata, with or without a location.
    Decoded(DecodedFrame),
    /// External decoder refused the frame.
    DecodeFailed(FailedDecode),
    /// JSON body with neither coordinates nor a packet blob.
    JsonNoPacketBlob(EnvelopeHints),
    /// Nothing recognizable.
    Unparsed { parse_error: Option<String> },
}

impl Classification {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::DirectJson(_) => DIRECT_JSON,
            Self::DirectTextJson(_) => DIRECT_TEXT_JSON,
            Self::DirectTextJsonBase64(_) => DIRECT_TEXT_JSON_BASE64,
            Self::DirectText(_) => DIRECT_TEXT,
            Self::DirectBlocked(_) => DIRECT_BLOCKED,
            Self::DirectZeroCoords(_) => DIRECT_ZERO_COORDS,
            Self::Decoded(frame) if frame.update.is_some() => DECODED,
            Self::Decoded(_) => DECODED_NO_LOCATION,
            Self::DecodeFailed(_) => DECODE_FAILED,
            Self::JsonNoPacketBlob(_) => JSON_NO_PACKET_BLOB,
            Self::Unparsed { .. } => UNKNOWN,
        }
    }

    pub fn update(&self) -> Option<&DeviceUpdate> {
        match self {
            Self::DirectJson(f)
            | Self::DirectTextJson(f)
            | Self::DirectTextJsonBase64(f)
            | Self::DirectText(f) => Some(&f.update),
            Self::Decoded(f) => f.update.as_ref(),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&DecodeMeta> {
        match self {
            Self::Decoded(f) => Some(&f.meta),
            Self::DecodeFailed(f) => Some(&f.meta),
            _ => None,
        }
    }

    pub fn hints(&self) -> Option<&EnvelopeHints> {
        match self {
            Self::DirectJson(f)
            | Self::DirectTextJson(f)
            | Self::DirectTextJsonBase64(f)
            | Self::DirectText(f) => Some(&f.hints),
            Self::Decoded(f) => Some(&f.hints),
            Self::DecodeFailed(f) => Some(&f.hints),
            Self::DirectBlocked(h) | Self::DirectZeroCoords(h) | Self::JsonNoPacketBlob(h) => {
                Some(h)
            }
            Self::Unparsed { .. } => None,
        }
    }

    pub fn origin_id(&self) -> Option<&str> {
        self.hints().and_then(|h| h.origin_id.as_deref())
    }

    pub fn name_hint(&self) -> Option<&str> {
        self.hints().and_then(|h| h.name.as_deref())
    }

    pub fn role_hint(&self) -> Option<DeviceRole> {
        self.hints().and_then(|h| h.role)
    }

    pub fn direction(&self) -> Option<&str> {
        self.hints().and_then(|h| h.direction.as_deref())
    }

    /// Public key reported by the external decoder, when a decode ran.
    pub fn pubkey(&self) -> Option<&str> {
        self.meta().and_then(|m| m.pubkey.as_deref())
    }

    pub fn packet_hash(&self) -> Option<&str> {
        match self {
            Self::Decoded(f) => f.packet_hash.as_deref(),
            Self::DecodeFailed(f) => f.packet_hash.as_deref(),
            _ => None,
        }
    }

    pub fn parse_error(&self) -> Option<&str> {
        match self {
            Self::DecodeFailed(f) => f.meta.error.as_deref(),
            Self::Unparsed { parse_error } => parse_error.as_deref(),
            _ => None,
        }
    }
}

// ─── Entry point ──────────────────────────────────────────────────────────────

pub async fn classify(
    topic: &str,
    payload: &[u8],
    now: f64,
    cfg: &Config,
    decoder: &FrameDecoder,
) -> Classification {
    let text = std::str::from_utf8(payload).ok();

    // 1. Structured JSON text
    if let Some(text) = text {
        if let Ok(json @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
            return classify_json(topic, payload, &json, now, cfg, decoder).await;
        }
    }

    // 2. Plain text fallback
    if let Some(text) = text {
        if let Some((lat, lon)) = coords_from_text(text) {
            return direct_classification(topic, None, lat, lon, now, cfg, Classification::DirectText);
        }
        let trimmed = text.trim();
        if let Some(hex) = hex_packet(trimmed) {
            return decode_classification(topic, payload, None, &hex, now, decoder).await;
        }
        if let Some(bytes) = base64_packet(trimmed) {
            let hex = hex::encode(bytes);
            return decode_classification(topic, payload, None, &hex, now, decoder).await;
        }
        return Classification::Unparsed { parse_error: None };
    }

    // 3. Binary fallback
    if payload.len() >= 10 && !mostly_printable(payload) {
        let hex = hex::encode(payload);
        return decode_classification(topic, payload, None, &hex, now, decoder).await;
    }

    Classification::Unparsed {
        parse_error: Some("payload is neither text, JSON, nor a binary frame".to_string()),
    }
}

// ─── JSON branch ──────────────────────────────────────────────────────────────

async fn classify_json(
    topic: &str,
    payload: &[u8],
    json: &Value,
    now: f64,
    cfg: &Config,
    decoder: &FrameDecoder,
) -> Classification {
    // 1a. direct lat/lon keys anywhere in the object
    if let Some((lat, lon)) = find_coord_keys(json) {
        return direct_classification(
            topic,
            Some(json),
            lat,
            lon,
            now,
            cfg,
            Classification::DirectJson,
        );
    }

    // 1b. textual coordinates inside string leaves, raw then base64-decoded
    let leaves = string_leaves(json);
    for leaf in &leaves {
        if let Some((lat, lon)) = coords_from_text(leaf) {
            return direct_classification(
                topic,
                Some(json),
                lat,
                lon,
                now,
                cfg,
                Classification::DirectTextJson,
            );
        }
    }
    for leaf in &leaves {
        if let Some(decoded) = try_base64(leaf) {
            if let Ok(inner) = String::from_utf8(decoded) {
                if let Some((lat, lon)) = coords_from_text(&inner) {
                    return direct_classification(
                        topic,
                        Some(json),
                        lat,
                        lon,
                        now,
                        cfg,
                        Classification::DirectTextJsonBase64,
                    );
                }
            }
        }
    }

    // 1c. opaque packet blob handed to the external decoder
    if let Some(hex) = find_packet_blob(json) {
        return decode_classification(topic, payload, Some(json), &hex, now, decoder).await;
    }

    Classification::JsonNoPacketBlob(extract_hints(Some(json), topic, None))
}

// ─── Direct-coordinate acceptance ─────────────────────────────────────────────

fn direct_classification(
    topic: &str,
    json: Option<&Value>,
    lat: f64,
    lon: f64,
    now: f64,
    cfg: &Config,
    make: fn(DirectFix) -> Classification,
) -> Classification {
    if !direct_allowed(cfg, topic, json) {
        return Classification::DirectBlocked(extract_hints(json, topic, None));
    }
    if coords_are_zero(lat, lon) && !cfg.direct_coords_allow_zero {
        return Classification::DirectZeroCoords(extract_hints(json, topic, None));
    }

    let hints = extract_hints(json, topic, None);
    let Some(device_id) = hints.origin_id.clone() else {
        return Classification::Unparsed {
            parse_error: Some("no device id resolvable from payload or topic".to_string()),
        };
    };
    let update = DeviceUpdate {
        device_id,
        lat,
        lon,
        ts: json.and_then(extract_ts).unwrap_or(now),
        heading: json.and_then(|j| number_key(j, &["heading", "course"])),
        speed: json.and_then(|j| number_key(j, &["speed"])),
        rssi: json.and_then(|j| number_key(j, &["rssi"])),
        snr: json.and_then(|j| number_key(j, &["snr"])),
        name: hints.name.clone(),
        role: hints.role,
    };
    make(DirectFix { update, hints })
}

fn direct_allowed(cfg: &Config, topic: &str, json: Option<&Value>) -> bool {
    let topic_matches = cfg
        .direct_coords_topic_regex
        .as_ref()
        .map(|re| re.is_match(topic))
        .unwrap_or(false);
    match cfg.direct_coords_mode {
        DirectCoordsMode::Off => false,
        DirectCoordsMode::Any => true,
        DirectCoordsMode::Topic => topic_matches,
        DirectCoordsMode::Strict => {
            topic_matches || json.map(has_location_hint).unwrap_or(false)
        }
    }
}

fn has_location_hint(json: &Value) -> bool {
    match json {
        Value::Object(map) => map.iter().any(|(k, v)| {
            LOCATION_HINT_KEYS.contains(&k.to_ascii_lowercase().as_str()) || has_location_hint(v)
        }),
        Value::Array(items) => items.iter().any(has_location_hint),
        _ => false,
    }
}

// ─── Decoder branch ───────────────────────────────────────────────────────────

async fn decode_classification(
    topic: &str,
    payload: &[u8],
    json: Option<&Value>,
    frame_hex: &str,
    now: f64,
    decoder: &FrameDecoder,
) -> Classification {
    let meta = decoder.decode_hex(frame_hex).await;
    let mut c = apply_decode_meta(topic, json, meta, now);
    match &mut c {
        Classification::Decoded(frame) if frame.packet_hash.is_none() => {
            frame.packet_hash = Some(short_hash(payload));
        }
        Classification::DecodeFailed(frame) => frame.packet_hash = Some(short_hash(payload)),
        _ => {}
    }
    c
}

/// Turn decoder output into a classification. Split out so the decode path
/// is testable without the external tool.
pub(crate) fn apply_decode_meta(
    topic: &str,
    json: Option<&Value>,
    meta: DecodeMeta,
    now: f64,
) -> Classification {
    if !meta.ok {
        return Classification::DecodeFailed(FailedDecode {
            hints: extract_hints(json, topic, None),
            meta,
            packet_hash: None,
        });
    }

    let mut hints = extract_hints(json, topic, meta.pubkey.as_deref());
    if hints.name.is_none() {
        hints.name = meta.name.clone();
    }
    if hints.role.is_none() {
        hints.role = meta.role.and_then(DeviceRole::from_code);
    }

    let coords = match (meta.lat, meta.lon) {
        (Some(lat), Some(lon)) => normalize_lat_lon(lat, lon)
            .filter(|&(lat, lon)| !coords_are_zero(lat, lon)),
        _ => None,
    };
    let update = coords.and_then(|(lat, lon)| {
        let device_id = hints.origin_id.clone()?;
        Some(DeviceUpdate {
            device_id,
            lat,
            lon,
            ts: json.and_then(extract_ts).unwrap_or(now),
            heading: None,
            speed: None,
            rssi: json.and_then(|j| number_key(j, &["rssi"])),
            snr: json.and_then(|j| number_key(j, &["snr"])),
            name: hints.name.clone(),
            role: hints.role,
        })
    });

    Classification::Decoded(DecodedFrame {
        packet_hash: meta.message_hash.clone(),
        meta,
        update,
        hints,
    })
}

// ─── Hint extraction ──────────────────────────────────────────────────────────

/// Origin id, name/role hints and direction from the JSON body and topic.
/// `decoder_pubkey` takes precedence in device-id resolution.
fn extract_hints(json: Option<&Value>, topic: &str, decoder_pubkey: Option<&str>) -> EnvelopeHints {
    let mut hints = EnvelopeHints::default();
    if let Some(json) = json {
        hints.name = string_key(json, &["name", "device_name", "node_name"]);
        hints.role = ROLE_KEYS
            .iter()
            .filter_map(|&k| string_key(json, &[k]))
            .find_map(|v| normalize_role(&v));
        hints.direction = string_key(json, &["direction"]).map(|d| d.to_ascii_lowercase());
    }
    hints.origin_id = resolve_device_id(decoder_pubkey, json, topic);
    hints
}

/// Device-id precedence: decoder pubkey > JSON id keys > JWT `publickey`
/// claim > topic position 3 under `meshcore/…` > last topic segment.
pub fn resolve_device_id(
    decoder_pubkey: Option<&str>,
    json: Option<&Value>,
    topic: &str,
) -> Option<String> {
    if let Some(pk) = decoder_pubkey {
        if !pk.is_empty() {
            return Some(pk.to_string());
        }
    }
    if let Some(json) = json {
        if let Some(id) = string_key(json, &["device_id", "id", "from", "origin_id"]) {
            return Some(id);
        }
        if let Some(pk) = jwt_publickey(json) {
            return Some(pk);
        }
    }
    device_from_topic(topic)
}

/// `meshcore/<group>/<device_id>/<suffix>` → the third segment; any other
/// shape falls back to the last segment.
pub fn device_from_topic(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').filter(|p| !p.is_empty()).collect();
    if parts.first() == Some(&"meshcore") && parts.len() >= 3 {
        return Some(parts[2].to_string());
    }
    parts.last().map(|s| s.to_string())
}

/// Unverified JWT payload-segment decode: any string leaf shaped like a JWT
/// whose claims carry a `publickey`.
fn jwt_publickey(json: &Value) -> Option<String> {
    for leaf in string_leaves(json) {
        let parts: Vec<&str> = leaf.split('.').collect();
        if parts.len() != 3 {
            continue;
        }
        let Ok(payload) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(parts[1]) else {
            continue;
        };
        let Ok(claims) = serde_json::from_slice::<Value>(&payload) else {
            continue;
        };
        if let Some(pk) = claims.get("publickey").and_then(|v| v.as_str()) {
            return Some(pk.to_string());
        }
    }
    None
}

/// Substring-based role normalization shared by JSON hints.
pub fn normalize_role(value: &str) -> Option<DeviceRole> {
    let v = value.to_ascii_lowercase();
    if v.contains("repeat") || v.contains("relay") {
        Some(DeviceRole::Repeater)
    } else if v.contains("companion") || v.contains("chat") {
        Some(DeviceRole::Companion)
    } else if v.contains("room") {
        Some(DeviceRole::Room)
    } else {
        None
    }
}

// ─── Coordinate helpers ───────────────────────────────────────────────────────

/// Accept raw doubles in valid range, else try integer scalings until a
/// valid pair emerges. Already-valid pairs pass through unchanged.
pub fn normalize_lat_lon(lat: f64, lon: f64) -> Option<(f64, f64)> {
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    if coords_valid(lat, lon) {
        return Some((lat, lon));
    }
    for scale in [1e7, 1e6, 1e5, 1e4] {
        let (slat, slon) = (lat / scale, lon / scale);
        if coords_valid(slat, slon) {
            return Some((slat, slon));
        }
    }
    None
}

fn find_coord_keys(value: &Value) -> Option<(f64, f64)> {
    if let Value::Object(map) = value {
        let lat = map.iter().find_map(|(k, v)| {
            matches!(k.to_ascii_lowercase().as_str(), "lat" | "latitude").then(|| coerce_f64(v)).flatten()
        });
        let lon = map.iter().find_map(|(k, v)| {
            matches!(k.to_ascii_lowercase().as_str(), "lon" | "lng" | "longitude")
                .then(|| coerce_f64(v))
                .flatten()
        });
        if let (Some(lat), Some(lon)) = (lat, lon) {
            if let Some(pair) = normalize_lat_lon(lat, lon) {
                return Some(pair);
            }
        }
    }
    match value {
        Value::Object(map) => map.values().find_map(find_coord_keys),
        Value::Array(items) => items.iter().find_map(find_coord_keys),
        _ => None,
    }
}

fn coord_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)lat(?:itude)?[^-+0-9]{0,12}([-+]?\d{1,3}(?:\.\d+)?)[^-+0-9]{1,16}lon(?:gitude|g)?[^-+0-9]{0,12}([-+]?\d{1,3}(?:\.\d+)?)",
        )
        .unwrap()
    })
}

fn two_float_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([-+]?\d{1,3}\.\d{3,})\s*[,;]\s*([-+]?\d{1,3}\.\d{3,})").unwrap()
    })
}

/// Labelled-coordinate regex, then a bare two-float pair.
pub fn coords_from_text(text: &str) -> Option<(f64, f64)> {
    if let Some(caps) = coord_regex().captures(text) {
        let lat: f64 = caps.get(1)?.as_str().parse().ok()?;
        let lon: f64 = caps.get(2)?.as_str().parse().ok()?;
        if let Some(pair) = normalize_lat_lon(lat, lon) {
            return Some(pair);
        }
    }
    if let Some(caps) = two_float_regex().captures(text) {
        let lat: f64 = caps.get(1)?.as_str().parse().ok()?;
        let lon: f64 = caps.get(2)?.as_str().parse().ok()?;
        if coords_valid(lat, lon) && !coords_are_zero(lat, lon) {
            return Some((lat, lon));
        }
    }
    None
}

// ─── Packet blob extraction ───────────────────────────────────────────────────

/// Recursive search for an opaque frame: preferred key names first, then any
/// plausible hex string, base64 string or byte array.
pub fn find_packet_blob(value: &Value) -> Option<String> {
    if let Some(hex) = find_blob_by_key(value) {
        return Some(hex);
    }
    find_blob_any(value)
}

fn find_blob_by_key(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in PACKET_BLOB_KEYS {
                if let Some(v) = map.get(key) {
                    if let Some(hex) = blob_from_value(v) {
                        return Some(hex);
                    }
                }
            }
            map.values().find_map(find_blob_by_key)
        }
        Value::Array(items) => items.iter().find_map(find_blob_by_key),
        _ => None,
    }
}

fn find_blob_any(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.values().find_map(find_blob_any),
        Value::Array(_) => blob_from_value(value),
        Value::String(_) => blob_from_value(value),
        _ => None,
    }
}

fn blob_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = hex_packet(s) {
                return Some(hex);
            }
            base64_packet(s).map(hex::encode)
        }
        Value::Array(items) if items.len() >= 10 => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().filter(|&b| b <= 255).map(|b| b as u8))
                .collect();
            bytes.map(hex::encode)
        }
        _ => None,
    }
}

fn hex_packet(s: &str) -> Option<String> {
    if s.len() >= 20 && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(s.to_ascii_lowercase())
    } else {
        None
    }
}

fn base64_packet(s: &str) -> Option<Vec<u8>> {
    if s.len() < 16 {
        return None;
    }
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !compact
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
    {
        return None;
    }
    try_base64(&compact).filter(|b| b.len() >= 10)
}

fn try_base64(s: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s.trim_end_matches('=')))
        .ok()
}

// ─── Small helpers ────────────────────────────────────────────────────────────

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_key(json: &Value, keys: &[&str]) -> Option<String> {
    if let Value::Object(map) = json {
        for (k, v) in map {
            if keys.contains(&k.to_ascii_lowercase().as_str()) {
                if let Some(s) = v.as_str() {
                    let s = s.trim();
                    if !s.is_empty() {
                        return Some(s.to_string());
                    }
                }
            }
        }
        for v in map.values() {
            if let found @ Some(_) = string_key(v, keys) {
                return found;
            }
        }
    }
    None
}

fn number_key(json: &Value, keys: &[&str]) -> Option<f64> {
    if let Value::Object(map) = json {
        for (k, v) in map {
            if keys.contains(&k.to_ascii_lowercase().as_str()) {
                if let Some(n) = coerce_f64(v) {
                    return Some(n);
                }
            }
        }
        for v in map.values() {
            if let found @ Some(_) = number_key(v, keys) {
                return found;
            }
        }
    }
    None
}

fn extract_ts(json: &Value) -> Option<f64> {
    let ts = number_key(json, &["ts", "timestamp", "time"])?;
    // Millisecond timestamps normalized to seconds
    if ts > 1e12 {
        Some(ts / 1000.0)
    } else if ts > 0.0 {
        Some(ts)
    } else {
        None
    }
}

fn string_leaves(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_string_leaves(value, &mut out);
    out
}

fn collect_string_leaves(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Object(map) => map.values().for_each(|v| collect_string_leaves(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_string_leaves(v, out)),
        _ => {}
    }
}

fn mostly_printable(payload: &[u8]) -> bool {
    let head = &payload[..payload.len().min(200)];
    if head.is_empty() {
        return true;
    }
    let printable = head
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    printable as f64 / head.len() as f64 >= 0.6
}

fn short_hash(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::decoder::FrameDecoder;
    use serde_json::json;

    fn test_config() -> Config {
        let mut cfg = Config::from_env();
        cfg.direct_coords_mode = DirectCoordsMode::Any;
        cfg.direct_coords_allow_zero = false;
        cfg.direct_coords_topic_regex = None;
        cfg.decode_with_node = false;
        cfg
    }

    fn disabled_decoder(cfg: &Config) -> FrameDecoder {
        FrameDecoder::new(cfg)
    }

    #[tokio::test]
    async fn direct_json_coordinates() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let payload = br#"{"lat":42.3601,"lon":-71.0589,"ts":1700000000}"#;
        let c = classify("meshcore/bos/AABBCC/position", payload, 1.0, &cfg, &decoder).await;

        let Classification::DirectJson(fix) = c else {
            panic!("expected DirectJson, got {c:?}");
        };
        assert_eq!(fix.update.device_id, "AABBCC");
        assert!((fix.update.lat - 42.3601).abs() < 1e-9);
        assert!((fix.update.lon - -71.0589).abs() < 1e-9);
        assert!((fix.update.ts - 1_700_000_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn scaled_integer_coordinates_normalize() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let payload = br#"{"latitude":423601000,"longitude":-710589000}"#;
        let c = classify("meshcore/bos/AABBCC/position", payload, 1.0, &cfg, &decoder).await;

        let upd = c.update().expect("update expected");
        assert!((upd.lat - 42.3601).abs() < 1e-6);
        assert!((upd.lon - -71.0589).abs() < 1e-6);
    }

    #[test]
    fn normalize_round_trip_is_idempotent() {
        let (lat, lon) = normalize_lat_lon(423601000.0, -710589000.0).unwrap();
        assert_eq!(normalize_lat_lon(lat, lon), Some((lat, lon)));
        assert_eq!(normalize_lat_lon(42.0, -71.0), Some((42.0, -71.0)));
        assert_eq!(normalize_lat_lon(f64::NAN, 1.0), None);
    }

    #[tokio::test]
    async fn zero_coords_rejected_by_default() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let c = classify(
            "meshcore/bos/AABBCC/position",
            br#"{"lat":0,"lon":0}"#,
            1.0,
            &cfg,
            &decoder,
        )
        .await;
        assert!(matches!(c, Classification::DirectZeroCoords(_)));
        assert_eq!(c.tag(), DIRECT_ZERO_COORDS);
        assert!(c.update().is_none());
    }

    #[tokio::test]
    async fn direct_gating_modes() {
        let mut cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let payload = br#"{"lat":42.0,"lon":-71.0}"#;

        cfg.direct_coords_mode = DirectCoordsMode::Off;
        let c = classify("meshcore/bos/AABBCC/position", payload, 1.0, &cfg, &decoder).await;
        assert!(matches!(c, Classification::DirectBlocked(_)));

        cfg.direct_coords_mode = DirectCoordsMode::Topic;
        cfg.direct_coords_topic_regex = Some(Regex::new(r"/position$").unwrap());
        let c = classify("meshcore/bos/AABBCC/position", payload, 1.0, &cfg, &decoder).await;
        assert_eq!(c.tag(), DIRECT_JSON);
        let c = classify("meshcore/bos/AABBCC/status", payload, 1.0, &cfg, &decoder).await;
        assert_eq!(c.tag(), DIRECT_BLOCKED);

        // strict: non-matching topic is rescued by a location-hint key
        cfg.direct_coords_mode = DirectCoordsMode::Strict;
        let hinted = br#"{"gps":{"lat":42.0,"lon":-71.0}}"#;
        let c = classify("meshcore/bos/AABBCC/status", hinted, 1.0, &cfg, &decoder).await;
        assert_eq!(c.tag(), DIRECT_JSON);
        let c = classify("meshcore/bos/AABBCC/status", payload, 1.0, &cfg, &decoder).await;
        assert_eq!(c.tag(), DIRECT_BLOCKED);
    }

    #[tokio::test]
    async fn text_coordinates_in_json_leaf() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let payload = br#"{"msg":"pos lat 42.36 lon -71.05 ok"}"#;
        let c = classify("meshcore/bos/AABBCC/chat", payload, 1.0, &cfg, &decoder).await;
        assert_eq!(c.tag(), DIRECT_TEXT_JSON);
        assert!(c.update().is_some());
    }

    #[tokio::test]
    async fn base64_leaf_coordinates() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let inner = STANDARD.encode("latitude 42.360100 longitude -71.058900");
        let payload = serde_json::to_vec(&json!({ "blob": inner })).unwrap();
        let c = classify("meshcore/bos/AABBCC/chat", &payload, 1.0, &cfg, &decoder).await;
        assert_eq!(c.tag(), DIRECT_TEXT_JSON_BASE64);
    }

    #[tokio::test]
    async fn plain_text_two_floats() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let c = classify("sensors/tracker9", b"42.3601, -71.0589", 1.0, &cfg, &decoder).await;
        let Classification::DirectText(fix) = c else {
            panic!("expected DirectText, got {c:?}");
        };
        assert_eq!(fix.update.device_id, "tracker9");
    }

    #[tokio::test]
    async fn hex_blob_with_disabled_decoder_fails_closed() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let payload = serde_json::to_vec(&json!({ "packet": "a1b2c3d4e5f60718293a4b5c" })).unwrap();
        let c = classify("meshcore/bos/AABBCC/packets", &payload, 1.0, &cfg, &decoder).await;
        assert!(matches!(c, Classification::DecodeFailed(_)));
        assert!(c.update().is_none());
        assert!(c.parse_error().unwrap().contains("disabled"));
        assert!(c.packet_hash().is_some());
    }

    #[tokio::test]
    async fn json_without_blob_is_tagged() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let c = classify(
            "meshcore/bos/AABBCC/status",
            br#"{"battery":97,"uptime":12}"#,
            1.0,
            &cfg,
            &decoder,
        )
        .await;
        assert!(matches!(c, Classification::JsonNoPacketBlob(_)));
        assert_eq!(c.origin_id(), Some("AABBCC"));
    }

    #[test]
    fn decode_meta_produces_device_and_route_hints() {
        let meta = DecodeMeta {
            ok: true,
            payload_type: Some(5),
            route_type: Some(0),
            message_hash: Some("H".into()),
            path_hashes: Some(vec!["A1".into(), "B2".into()]),
            snr_values: Some(vec![4.5, -2.0]),
            path: None,
            path_length: Some(2),
            lat: Some(42.36),
            lon: Some(-71.05),
            pubkey: Some("P00DLE".into()),
            name: Some("relay-7".into()),
            role: Some(2),
            error: None,
        };
        let c = apply_decode_meta("meshcore/bos/AABBCC/packets", None, meta, 50.0);
        assert_eq!(c.tag(), DECODED);
        let upd = c.update().expect("decoded frame carries a location");
        assert_eq!(upd.device_id, "P00DLE");
        assert_eq!(upd.role, Some(DeviceRole::Repeater));
        assert_eq!(c.packet_hash(), Some("H"));
        assert_eq!(c.pubkey(), Some("P00DLE"));
    }

    #[test]
    fn decode_meta_without_location() {
        let meta = DecodeMeta {
            ok: true,
            payload_type: Some(5),
            ..DecodeMeta::default()
        };
        let c = apply_decode_meta("meshcore/bos/AABBCC/packets", None, meta, 50.0);
        assert_eq!(c.tag(), DECODED_NO_LOCATION);
        assert!(c.update().is_none());
        assert!(c.meta().is_some());
    }

    #[test]
    fn device_id_precedence() {
        let body = json!({ "device_id": "json-id" });
        assert_eq!(
            resolve_device_id(Some("pubkey-id"), Some(&body), "meshcore/g/topic-id/status"),
            Some("pubkey-id".to_string())
        );
        assert_eq!(
            resolve_device_id(None, Some(&body), "meshcore/g/topic-id/status"),
            Some("json-id".to_string())
        );
        assert_eq!(
            resolve_device_id(None, None, "meshcore/g/topic-id/status"),
            Some("topic-id".to_string())
        );
        assert_eq!(
            resolve_device_id(None, None, "other/broker/leaf"),
            Some("leaf".to_string())
        );
    }

    #[test]
    fn jwt_publickey_claim_resolves() {
        let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"publickey":"deadbeef"}"#);
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{claims}.sig");
        let body = json!({ "auth": token });
        assert_eq!(
            resolve_device_id(None, Some(&body), "x/y"),
            Some("deadbeef".to_string())
        );
    }

    #[test]
    fn role_normalization() {
        assert_eq!(normalize_role("Repeater"), Some(DeviceRole::Repeater));
        assert_eq!(normalize_role("mesh-relay"), Some(DeviceRole::Repeater));
        assert_eq!(normalize_role("ChatNode"), Some(DeviceRole::Companion));
        assert_eq!(normalize_role("room_server"), Some(DeviceRole::Room));
        assert_eq!(normalize_role("gateway"), None);
    }

    #[test]
    fn packet_blob_forms() {
        // preferred key, hex
        assert_eq!(
            find_packet_blob(&json!({ "hex": "A1B2C3D4E5F60718293A4B5C" })),
            Some("a1b2c3d4e5f60718293a4b5c".to_string())
        );
        // odd length rejected
        assert_eq!(find_packet_blob(&json!({ "hex": "a1b2c3d4e5f60718293a4b5" })), None);
        // byte array
        let bytes: Vec<u8> = (0u8..12).collect();
        assert_eq!(
            find_packet_blob(&json!({ "frame": bytes })),
            Some(hex::encode((0u8..12).collect::<Vec<u8>>()))
        );
        // base64 string under a non-preferred key still found
        let b64 = STANDARD.encode([0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert!(find_packet_blob(&json!({ "other": b64 })).is_some());
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let cfg = test_config();
        let decoder = disabled_decoder(&cfg);
        let payload = br#"{"lat":42.3601,"lon":-71.0589,"ts":1700000000}"#;
        let a = classify("meshcore/bos/AABBCC/position", payload, 1.0, &cfg, &decoder).await;
        let b = classify("meshcore/bos/AABBCC/position", payload, 1.0, &cfg, &decoder).await;
        assert_eq!(a.tag(), b.tag());
        assert_eq!(a.update(), b.update());
    }

    #[test]
    fn printability_heuristic() {
        assert!(mostly_printable(b"hello world"));
        let binary: Vec<u8> = (0u8..200).map(|i| i.wrapping_mul(7)).collect();
        assert!(!mostly_printable(&binary));
    }
}

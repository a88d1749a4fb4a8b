//! # decoder
//!
//! Synchronous request/response bridge to the external mesh-frame decoder,
//! invoked as a subprocess per frame. The adapter initializes lazily on
//! first use; if the tool is missing the unavailable state is sticky so we
//! never pay a process spawn per message for a tool that is not there.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;

// ─── Decoder output ───────────────────────────────────────────────────────────

/// Flattened decoder metadata for one frame.
#[derive(Debug, Clone, Default)]
pub struct DecodeMeta {
    pub ok: bool,
    pub payload_type: Option<u8>,
    pub route_type: Option<u8>,
    pub message_hash: Option<String>,
    pub path_hashes: Option<Vec<String>>,
    pub snr_values: Option<Vec<f64>>,
    /// Raw path header (concatenated node hashes) when present.
    pub path: Option<String>,
    pub path_length: Option<u32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub pubkey: Option<String>,
    pub name: Option<String>,
    pub role: Option<u8>,
    pub error: Option<String>,
}

impl DecodeMeta {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecodeOutput {
    ok: Option<bool>,
    payload_type: Option<u8>,
    route_type: Option<u8>,
    message_hash: Option<String>,
    path_hashes: Option<Vec<String>>,
    snr_values: Option<Vec<f64>>,
    path: Option<String>,
    path_length: Option<u32>,
    location: Option<RawLocation>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
    pubkey: Option<String>,
    name: Option<String>,
    role: Option<u8>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder disabled by configuration")]
    Disabled,
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
    #[error("decoder timed out after {0:.1}s")]
    Timeout(f64),
    #[error("decoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("decoder produced invalid JSON: {0}")]
    BadOutput(#[from] serde_json::Error),
    #[error("decoder spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

// ─── Adapter ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Unchecked,
    Ready,
    Unavailable,
}

pub struct FrameDecoder {
    enabled: bool,
    script: PathBuf,
    timeout: Duration,
    state: Mutex<AdapterState>,
}

impl FrameDecoder {
    pub fn new(cfg: &Config) -> Self {
        Self {
            enabled: cfg.decode_with_node,
            script: cfg.node_script_path.clone(),
            timeout: Duration::from_secs_f64(cfg.node_decode_timeout_seconds.max(0.1)),
            state: Mutex::new(AdapterState::Unchecked),
        }
    }

    /// Decode one hex-encoded frame. Never errors outward: every failure
    /// mode is an `ok=false` meta with a descriptive error string.
    pub async fn decode_hex(&self, frame_hex: &str) -> DecodeMeta {
        match self.try_decode(frame_hex).await {
            Ok(meta) => meta,
            Err(e) => DecodeMeta::failure(e.to_string()),
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.enabled && *self.state.lock().await != AdapterState::Unavailable
    }

    async fn try_decode(&self, frame_hex: &str) -> Result<DecodeMeta, DecodeError> {
        if !self.enabled {
            return Err(DecodeError::Disabled);
        }
        self.ensure_initialized().await?;

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("node")
                .arg(&self.script)
                .arg(frame_hex)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| DecodeError::Timeout(self.timeout.as_secs_f64()))??;

        if !output.status.success() {
            return Err(DecodeError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// First-use check for the script file. A failed check is sticky.
    async fn ensure_initialized(&self) -> Result<(), DecodeError> {
        let mut state = self.state.lock().await;
        match *state {
            AdapterState::Ready => Ok(()),
            AdapterState::Unavailable => Err(DecodeError::Unavailable(format!(
                "{} missing",
                self.script.display()
            ))),
            AdapterState::Unchecked => {
                if tokio::fs::metadata(&self.script).await.is_ok() {
                    info!("Frame decoder ready: {}", self.script.display());
                    *state = AdapterState::Ready;
                    Ok(())
                } else {
                    warn!(
                        "Frame decoder script {} not found — decoding disabled for this run",
                        self.script.display()
                    );
                    *state = AdapterState::Unavailable;
                    Err(DecodeError::Unavailable(format!(
                        "{} missing",
                        self.script.display()
                    )))
                }
            }
        }
    }
}

pub(crate) fn parse_output(stdout: &str) -> Result<DecodeMeta, DecodeError> {
    let raw: RawDecodeOutput = serde_json::from_str(stdout.trim())?;
    let location = raw.location;
    Ok(DecodeMeta {
        ok: raw.ok.unwrap_or(raw.error.is_none()),
        payload_type: raw.payload_type,
        route_type: raw.route_type,
        message_hash: raw.message_hash,
        path_hashes: raw.path_hashes,
        snr_values: raw.snr_values,
        path: raw.path,
        path_length: raw.path_length,
        lat: location.as_ref().and_then(|l| l.latitude),
        lon: location.as_ref().and_then(|l| l.longitude),
        pubkey: location.as_ref().and_then(|l| l.pubkey.clone()),
        name: location.as_ref().and_then(|l| l.name.clone()),
        role: location.as_ref().and_then(|l| l.role),
        error: raw.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder_with(enabled: bool, script: &str) -> FrameDecoder {
        let mut cfg = Config::from_env();
        cfg.decode_with_node = enabled;
        cfg.node_script_path = PathBuf::from(script);
        cfg.node_decode_timeout_seconds = 1.0;
        FrameDecoder::new(&cfg)
    }

    #[tokio::test]
    async fn disabled_decoder_fails_closed() {
        let d = decoder_with(false, "decoder/decode.js");
        let meta = d.decode_hex("a1b2c3").await;
        assert!(!meta.ok);
        assert!(meta.error.unwrap().contains("disabled"));
        assert!(!d.is_ready().await);
    }

    #[tokio::test]
    async fn missing_script_is_sticky_unavailable() {
        let d = decoder_with(true, "/nonexistent/decode.js");
        let first = d.decode_hex("a1b2c3").await;
        assert!(!first.ok);
        assert!(first.error.unwrap().contains("missing"));

        // Second call short-circuits on the sticky state
        let second = d.decode_hex("a1b2c3").await;
        assert!(!second.ok);
        assert!(!d.is_ready().await);
    }

    #[test]
    fn parses_full_decoder_output() {
        let out = r#"{
            "ok": true,
            "payloadType": 5,
            "routeType": 0,
            "messageHash": "H",
            "pathHashes": ["A1", "B2"],
            "snrValues": [4.25, -1.5],
            "path": "a1b2",
            "pathLength": 2,
            "location": {"latitude": 42.36, "longitude": -71.05, "pubkey": "P", "name": "n1", "role": 2}
        }"#;
        let meta = parse_output(out).unwrap();
        assert!(meta.ok);
        assert_eq!(meta.payload_type, Some(5));
        assert_eq!(meta.path_hashes.as_deref(), Some(&["A1".to_string(), "B2".to_string()][..]));
        assert_eq!(meta.lat, Some(42.36));
        assert_eq!(meta.pubkey.as_deref(), Some("P"));
        assert_eq!(meta.role, Some(2));
    }

    #[test]
    fn ok_flag_inferred_from_error_field() {
        let meta = parse_output(r#"{"error": "unsupported frame"}"#).unwrap();
        assert!(!meta.ok);
        let meta = parse_output(r#"{"payloadType": 5}"#).unwrap();
        assert!(meta.ok);
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(parse_output("not json at all").is_err());
    }
}

//! # los
//!
//! Flat adapters around external HTTP providers: the line-of-sight check
//! against an elevation API and the coverage-samples proxy. Neither touches
//! the topology store; failures come back as tagged JSON errors.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::state::haversine_km;

/// Fixed elevation/coverage fetch timeout.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, Deserialize)]
struct ElevationResponse {
    results: Vec<ElevationResult>,
}

#[derive(Debug, Deserialize)]
struct ElevationResult {
    elevation: Option<f64>,
}

pub struct LosService {
    client: reqwest::Client,
    elevation_url: String,
    sample_min: usize,
    sample_max: usize,
    sample_step_m: f64,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (f64, Instant)>>,
}

impl LosService {
    pub fn new(cfg: &Config) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROVIDER_TIMEOUT)
                .build()
                .unwrap_or_default(),
            elevation_url: cfg.los_elevation_url.clone(),
            sample_min: cfg.los_sample_min.max(2),
            sample_max: cfg.los_sample_max.max(cfg.los_sample_min.max(2)),
            sample_step_m: cfg.los_sample_step_meters.max(1.0),
            cache_ttl: Duration::from_secs(cfg.elevation_cache_ttl),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Line-of-sight between two points with an antenna height (`profile`)
    /// added at both ends. Error string is the `elevation_fetch_failed`
    /// reason for the caller to tag.
    pub async fn line_of_sight(
        &self,
        lat1: f64,
        lon1: f64,
        lat2: f64,
        lon2: f64,
        profile_m: f64,
    ) -> Result<Value, String> {
        let distance_m = haversine_km(lat1, lon1, lat2, lon2) * 1000.0;
        let points = sample_points(
            lat1,
            lon1,
            lat2,
            lon2,
            distance_m,
            self.sample_step_m,
            self.sample_min,
            self.sample_max,
        );
        let elevations = self.fetch_elevations(&points).await?;
        let obstruction = max_obstruction(&elevations, profile_m);

        Ok(json!({
            "distance_m": distance_m,
            "clear": obstruction <= 0.0,
            "max_obstruction_m": obstruction.max(0.0),
            "samples": points
                .iter()
                .zip(&elevations)
                .map(|(&(lat, lon), &elev)| json!({ "lat": lat, "lon": lon, "elevation": elev }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn fetch_elevations(&self, points: &[(f64, f64)]) -> Result<Vec<f64>, String> {
        let mut out = vec![f64::NAN; points.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            cache.retain(|_, (_, at)| at.elapsed() < self.cache_ttl);
            for (i, &(lat, lon)) in points.iter().enumerate() {
                match cache.get(&cache_key(lat, lon)) {
                    Some(&(elev, _)) => out[i] = elev,
                    None => missing.push(i),
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let locations = missing
            .iter()
            .map(|&i| format!("{:.6},{:.6}", points[i].0, points[i].1))
            .collect::<Vec<_>>()
            .join("|");
        let url = format!("{}?locations={}", self.elevation_url, locations);
        debug!("LOS: fetching {} elevations", missing.len());

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("provider returned {}", response.status()));
        }
        let parsed: ElevationResponse = response.json().await.map_err(|e| e.to_string())?;
        if parsed.results.len() != missing.len() {
            return Err(format!(
                "provider returned {} results for {} locations",
                parsed.results.len(),
                missing.len()
            ));
        }

        let mut cache = self.cache.lock().await;
        for (&i, result) in missing.iter().zip(&parsed.results) {
            let elev = result.elevation.unwrap_or(0.0);
            out[i] = elev;
            cache.insert(cache_key(points[i].0, points[i].1), (elev, Instant::now()));
        }
        Ok(out)
    }
}

/// Proxy one coverage-samples request. The error string is a ready-made
/// tag (`coverage_api_timeout` or `coverage_api_error: …`).
pub async fn fetch_coverage(client: &reqwest::Client, url: &str) -> Result<Value, String> {
    let response = match client.get(url).timeout(PROVIDER_TIMEOUT).send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return Err("coverage_api_timeout".to_string()),
        Err(e) => return Err(format!("coverage_api_error: {e}")),
    };
    if !response.status().is_success() {
        return Err(format!("coverage_api_error: status {}", response.status()));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| format!("coverage_api_error: {e}"))
}

// ─── Geometry ─────────────────────────────────────────────────────────────────

/// Evenly spaced points along the segment, one per `step_m`, clamped to
/// `[min, max]` samples inclusive of both endpoints.
pub fn sample_points(
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
    distance_m: f64,
    step_m: f64,
    min: usize,
    max: usize,
) -> Vec<(f64, f64)> {
    let wanted = (distance_m / step_m).ceil() as usize + 1;
    let n = wanted.clamp(min, max);
    (0..n)
        .map(|i| {
            let t = i as f64 / (n - 1) as f64;
            (lat1 + (lat2 - lat1) * t, lon1 + (lon2 - lon1) * t)
        })
        .collect()
}

/// Largest terrain intrusion above the straight sight line between the two
/// endpoint elevations (each raised by the antenna profile). Negative means
/// fully clear.
pub fn max_obstruction(elevations: &[f64], profile_m: f64) -> f64 {
    if elevations.len() < 3 {
        return 0.0;
    }
    let start = elevations[0] + profile_m;
    let end = elevations[elevations.len() - 1] + profile_m;
    let n = (elevations.len() - 1) as f64;
    elevations[1..elevations.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, &terrain)| {
            let t = (i + 1) as f64 / n;
            terrain - (start + (end - start) * t)
        })
        .fold(f64::NEG_INFINITY, f64::max)
}

fn cache_key(lat: f64, lon: f64) -> String {
    format!("{lat:.5},{lon:.5}")
}

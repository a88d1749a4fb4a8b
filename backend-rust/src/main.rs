mod auth;
mod broadcast;
mod classifier;
mod config;
mod decoder;
mod handlers;
mod history;
mod ingest;
mod los;
mod persistence;
mod reaper;
mod state;

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderValue;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use broadcast::{Subscribers, UPDATE_QUEUE_CAP};
use config::Config;
use decoder::FrameDecoder;
use handlers::AppState;
use los::LosService;

#[tokio::main]
async fn main() {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshmap_backend=info,tower_http=warn".into()),
        )
        .init();

    let started_at = Instant::now();
    let cfg = Arc::new(Config::from_env());
    info!(
        "🗺️  Meshmap backend v{} starting — broker {}:{}, {} topic filters",
        env!("CARGO_PKG_VERSION"),
        cfg.mqtt_host,
        cfg.mqtt_port,
        cfg.mqtt_topics.len()
    );

    if let Err(e) = tokio::fs::create_dir_all(&cfg.state_dir).await {
        tracing::warn!("Could not create state dir {}: {e}", cfg.state_dir.display());
    }

    // Load persisted state, then the route-history mirror on top of it
    let mut initial = persistence::load_state(&cfg).await;
    if cfg.route_history_enabled {
        history::load_route_history(&mut initial, &cfg).await;
    }
    let store: state::SharedStore = Arc::new(RwLock::new(initial));
    let subs: broadcast::SharedSubscribers = Arc::new(RwLock::new(Subscribers::default()));
    let decoder = Arc::new(FrameDecoder::new(&cfg));
    let los = Arc::new(LosService::new(&cfg));

    // MQTT callback → bounded queue → single-writer broadcaster
    let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE_CAP);
    tokio::spawn(ingest::run_mqtt_ingest(
        cfg.clone(),
        store.clone(),
        decoder.clone(),
        update_tx,
    ));
    tokio::spawn(broadcast::run_broadcaster(
        store.clone(),
        cfg.clone(),
        subs.clone(),
        update_rx,
    ));
    tokio::spawn(reaper::run_reaper(store.clone(), cfg.clone(), subs.clone()));
    tokio::spawn(persistence::run_state_saver(store.clone(), cfg.clone()));
    tokio::spawn(history::run_history_compactor(store.clone(), cfg.clone()));

    // CORS — open by default, or a comma-separated origin list
    let cors = if cfg.cors_origins.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .cors_origins
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = handlers::router(AppState {
        cfg: cfg.clone(),
        store,
        subs,
        decoder,
        los,
        http_client: reqwest::Client::new(),
        started_at,
    })
    .layer(cors);

    let addr = format!("0.0.0.0:{}", cfg.port);
    info!("🚀 Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown");
        })
        .await
        .unwrap();
}

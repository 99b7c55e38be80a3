pub mod api;
pub mod cache;
pub mod chart;
pub mod config;
pub mod data_structures;
pub mod series;
pub mod yahoo;

use crate::config::AppConfig;
use crate::data_structures::{SharedCache, SharedClient};
use axum::{Router, extract::FromRef, routing::get};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct AppState {
    cache: SharedCache,
    client: SharedClient,
    config: AppConfig,
}

impl FromRef<AppState> for SharedCache {
    fn from_ref(app_state: &AppState) -> SharedCache {
        app_state.cache.clone()
    }
}

impl FromRef<AppState> for SharedClient {
    fn from_ref(app_state: &AppState) -> SharedClient {
        app_state.client.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

#[tokio::main]
async fn main() {
    let app_config = AppConfig::load();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    tracing::info!("Starting perchart");
    tracing::info!(
        environment = %app_config.environment,
        port = app_config.port,
        window = app_config.moving_average_window,
        "Loaded configuration"
    );

    let yahoo_client = yahoo::YahooClient::new(true, app_config.fetch_rate_limit_per_minute)
        .unwrap_or_else(|e| panic!("Failed to build market data client: {e}"))
        .with_base_urls(&app_config.chart_base_url, &app_config.quote_base_url);

    let shared_cache: SharedCache = Arc::new(Mutex::new(cache::SeriesCache::new()));
    let shared_client: SharedClient = Arc::new(Mutex::new(yahoo_client));

    let app_state = AppState {
        cache: shared_cache,
        client: shared_client,
        config: app_config.clone(),
    };

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default().per_second(10).burst_size(20).finish().unwrap(),
    );

    let app = Router::new()
        .route("/", get(api::index_handler))
        .route("/api/periods", get(api::periods_handler))
        .route(
            "/api/per",
            get(api::per_handler).layer(GovernorLayer::new(governor_conf)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], app_config.port));
    tracing::info!(%addr, "Server listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .unwrap();
}

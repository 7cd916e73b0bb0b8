use std::sync::Arc;
use std::time::Duration;

use stepup_gate::{web_api, GateConfig, HttpJwksSource, SystemClock};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match GateConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    config.log_summary();

    let jwks = Arc::new(HttpJwksSource::new(config.issuer.jwks_uri.clone()));
    let state = web_api::AppState::new(&config, jwks, Arc::new(SystemClock));
    let _sweeper = state.spawn_sweeper(Duration::from_millis(config.nonce_sweep_interval_ms));

    if let Err(e) = web_api::run_http_server(config.api_addr, state).await {
        tracing::error!(error = %e, "server stopped");
        std::process::exit(1);
    }
}

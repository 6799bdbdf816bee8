mod router;
mod tap;
mod telemetry;
mod webhook;

use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::router::{app_router, AppState};
use crate::tap::TapHub;
use reply_gate_util::{load_env_file, AppConfig};
use reply_gate_wp::BridgeClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();

    let config = AppConfig::from_env()?;
    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let tap = TapHub::new();
    if config.environment.is_development() {
        tap.spawn_mock_publisher();
    }

    let bridge_base = Url::parse(&config.bridge_base_url)?;
    let http = reqwest::Client::builder().build()?;
    let bridge = BridgeClient::new(bridge_base, &config.bridge_token, http);

    let install_secret: Arc<[u8]> =
        Arc::from(config.install_secret.as_bytes().to_vec().into_boxed_slice());
    let state = AppState::new(metrics, tap, bridge, install_secret);
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(
        stage = "startup",
        addr = %config.bind_addr,
        env = %config.environment.as_str(),
        bridge = %config.bridge_base_url,
        "inbound reply gateway listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

/*!
VITARING HUB - service entry point

Loads the config, wires the MQTT live channel into the hub, starts the
configured source and serves the operator API.
*/

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vitaring_hub::config::{load_config, Autostart};
use vitaring_hub::http::{self, AppState};
use vitaring_hub::mqtt::MqttChannel;
use vitaring_hub::{ConnectionStatus, TelemetryHub};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    let channel = MqttChannel::new(cfg.feed.clone());
    let hub = TelemetryHub::from_config(&cfg, Box::new(channel)).context("invalid hub configuration")?;

    // Follow every publication in the log.
    let mut updates = hub.subscribe();
    tokio::spawn(async move {
        while let Some(state) = updates.recv().await {
            match (&state.current, state.connection) {
                (Some(record), ConnectionStatus::Online) => info!(
                    "{} [{}] pulse {} surface {:.2}°C battery {:.0}%",
                    state.active_device_id, state.source_mode, record.pulse_proxy_value,
                    record.surface_temperature, record.battery_level
                ),
                (_, connection) => info!("{} [{}] {:?}", state.active_device_id, state.source_mode, connection),
            }
        }
    });

    match cfg.hub.autostart {
        Autostart::Live => hub.start_live_resolved()?,
        Autostart::Synthetic => hub.start_synthetic(cfg.synthetic_interval())?,
        Autostart::Idle => info!("autostart disabled, waiting for an operator call"),
    }

    if std::env::var(http::API_KEY_ENV).unwrap_or_default().is_empty() {
        warn!("{} not set, every operator route will answer 401", http::API_KEY_ENV);
    }

    let app = http::build_router(AppState {
        hub: hub.clone(),
        default_interval: cfg.synthetic_interval(),
    });
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    info!("operator API listening on http://{}", cfg.http.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("HTTP server failed")?;

    hub.stop();
    info!("vitaring hub shut down");
    Ok(())
}

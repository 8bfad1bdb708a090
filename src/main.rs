mod alerts;
mod config;
mod db;
mod dispatch;
mod error;
mod gateway;
mod geo;
mod kafka;
mod models;
mod notify;
mod presence;
mod processor;
mod rewards;
mod state;

use std::sync::Arc;

use config::AppConfig;
use db::postgres::PgPersistence;
use notify::{ExternalNotifier, HttpGateway, NotificationGateway};
use state::AppState;
use tokio::net::TcpListener;
use tokio::signal::{self, unix::SignalKind};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting Ride SOS alert service...");

    // Init DB
    let pool = db::init_pool(&config.database_url).await?;
    info!("Connected to database");
    let store = Arc::new(PgPersistence::new(pool));

    let gateway: Option<Arc<dyn NotificationGateway>> = match &config.sms_gateway_url {
        Some(url) => Some(Arc::new(HttpGateway::new(
            url.clone(),
            config.sms_gateway_token.clone(),
        ))),
        None => {
            warn!("SMS_GATEWAY_URL not set, external notifications will be simulated");
            None
        }
    };
    let notifier = ExternalNotifier::new(
        gateway,
        config.emergency_service_number.clone(),
        config.notify_timeout(),
    );

    let state = AppState::new(store.clone(), store, notifier, config.alert_policy());

    // Telemetry ingest
    if config.kafka_enabled {
        let kafka_config = config.clone();
        let presence = Arc::clone(&state.presence);
        let store = Arc::clone(&state.store);
        tokio::spawn(async move {
            if let Err(e) = kafka::start_kafka_consumer(&kafka_config, presence, store).await {
                error!("Kafka consumer stopped: {}", e);
            }
        });
    } else {
        info!("Kafka ingest disabled");
    }

    let listener = TcpListener::bind(&config.ws_bind_addr).await?;
    tokio::select! {
        result = gateway::serve(listener, state) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Ride SOS alert service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let terminate = async {
        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

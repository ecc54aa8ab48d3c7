mod commands;
mod config;
mod connection;
mod dashboard;
mod models;
mod mqtt_service;
mod registry;
mod rest_server;
mod service_utils;
mod topics;
mod transport;

use crate::commands::CommandPublisher;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConsumerOptions};
use crate::dashboard::SharedDashboard;
use crate::mqtt_service::MqttConnector;
use crate::rest_server::{run_rest_server, AppState};
use crate::service_utils::{
    attach_dashboard, handle_shutdown, periodic_status_update, wait_for_terminal_close,
    watch_connectivity,
};
use crate::topics::UnsTopics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };
    info!("Broker: {}", config.broker_url());
    info!(
        "Plant: {} -> Device: {}",
        config.hierarchy.enterprise, config.hierarchy.device
    );

    let topics = UnsTopics::new(&config.hierarchy);
    let manager = ConnectionManager::new(
        Arc::new(MqttConnector::new(config.clone())),
        Duration::from_millis(config.mqtt_subscribe_settle_ms),
    );
    watch_connectivity(manager.connectivity());

    // Live dashboard consumer
    let dashboard = SharedDashboard::default();
    let dashboard_handle = match attach_dashboard(&manager, &topics, dashboard.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to attach dashboard: {}", e);
            return;
        }
    };

    // Job entry consumer, publish only
    let command_handle = match manager.attach(ConsumerOptions::new()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to attach job entry: {}", e);
            return;
        }
    };

    periodic_status_update(manager.clone(), dashboard.clone());

    let app = AppState {
        publisher: CommandPublisher::new(command_handle, topics.clone()),
        dashboard,
        hierarchy: config.hierarchy.clone(),
    };
    let rest_api_task = tokio::spawn(async move {
        run_rest_server(app).await;
    });

    tokio::select! {
        _ = handle_shutdown() => {}
        _ = wait_for_terminal_close(manager.clone()) => {}
        _ = rest_api_task => info!("REST server exited."),
    }

    dashboard_handle.detach().await;
    manager.shutdown().await;
    info!("All services shut down successfully.");
}

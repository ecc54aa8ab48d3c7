use crate::connection::{ConnectionHandle, ConnectionManager, ConsumerOptions};
use crate::dashboard::{dashboard_handler, SharedDashboard};
use crate::topics::UnsTopics;
use crate::transport::LinkError;
use std::sync::PoisonError;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Attach the live dashboard consumer: telemetry topics plus the reducer.
pub async fn attach_dashboard(
    manager: &ConnectionManager,
    topics: &UnsTopics,
    dashboard: SharedDashboard,
) -> Result<ConnectionHandle, LinkError> {
    info!("Dashboard subscribing to topics: {:?}", topics.telemetry());
    manager
        .attach(
            ConsumerOptions::new()
                .with_topics(topics.telemetry())
                .with_handler(dashboard_handler(topics.clone(), dashboard)),
        )
        .await
}

/// Log every connectivity flip.
pub fn watch_connectivity(mut connectivity: watch::Receiver<bool>) {
    tokio::spawn(async move {
        while connectivity.changed().await.is_ok() {
            if *connectivity.borrow_and_update() {
                info!("MQTT connected");
            } else {
                warn!("MQTT disconnected");
            }
        }
    });
}

/// Resolves once the transport has given up reconnecting while consumers
/// are still attached. Nothing reopens the connection after that.
pub async fn wait_for_terminal_close(manager: ConnectionManager) {
    let mut connectivity = manager.connectivity();
    while connectivity.changed().await.is_ok() {
        if *connectivity.borrow_and_update() {
            continue;
        }
        if manager.closed_by_transport().await {
            error!("MQTT connection closed after maximum retries. Stopping the service.");
            return;
        }
    }
}

/// Start periodic status updates
pub fn periodic_status_update(manager: ConnectionManager, dashboard: SharedDashboard) {
    tokio::spawn(async move {
        let mut ticker = interval(STATUS_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = dashboard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            info!(
                "Status: connected={} consumers={} job={:?} alarm={} cycle_time_ms={} boards(good={}, bad={}, total={})",
                manager.is_connected(),
                manager.ref_count().await,
                snapshot.current_job.as_ref().map(|job| job.job_id),
                snapshot.has_alarm(),
                snapshot.cycle_time_ms,
                snapshot.boards_count.good,
                snapshot.boards_count.bad,
                snapshot.boards_count.total,
            );
        }
    });
}

/// Wait for Ctrl-C.
pub async fn handle_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("Dashboard is shutting down...");
    }
}

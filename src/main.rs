//! Standalone broker process
//!
//! Binds the broker on a kernel-chosen loopback port, advertises it through
//! the discovery sidecar, and runs until interrupted. The hub normally
//! embeds the broker in-process; this binary exists for running one
//! standalone.

use pi_hive::broker::Broker;
use pi_hive::discovery::{self, BrokerInfo};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pi_hive=info,tower_http=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("PI_HIVE_LOG_JSON").is_ok_and(|v| v == "1") {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let broker = Broker::bind().await?;
    let hub_id = uuid::Uuid::new_v4().to_string();
    let info = BrokerInfo::new(broker.port(), hub_id.as_str());
    let sidecar = discovery::publish(&info)?;
    tracing::info!(
        port = broker.port(),
        hub_id = %hub_id,
        sidecar = %sidecar.display(),
        "Broker ready"
    );

    shutdown_signal().await;

    tracing::info!("Shutting down");
    discovery::remove()?;
    broker.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

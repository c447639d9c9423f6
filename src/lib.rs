pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod filename;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod prompts;
pub mod render;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod state;
pub mod tokens;
pub mod utils;
pub mod workbook;
pub mod workflow;

pub use config::{CliArgs, ModelProvider, ServerConfig};
pub use error::{ApiError, ErrorCode};
pub use logging::{LoggingConfig, init_logging, shutdown_telemetry};
pub use service::SheetPromptService;
pub use shutdown::{ShutdownConfig, ShutdownCoordinator};

use anyhow::Result;
use state::AppState;
use std::{future::IntoFuture, sync::Arc};
use tokio::{
    net::TcpListener,
    time::{Duration, timeout},
};

/// Time allowed for connections to close once in-flight requests have drained.
const CONNECTION_CLOSE_GRACE: Duration = Duration::from_secs(2);

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let config = Arc::new(config);
    let state = Arc::new(AppState::from_config(config.clone()).await?);

    let shutdown_config =
        ShutdownConfig::default().with_in_flight_timeout(config.graceful_shutdown_timeout);
    let coordinator = Arc::new(ShutdownCoordinator::new(shutdown_config));

    let router = server::router(state, Some(coordinator.clone()));
    let listener = TcpListener::bind(config.http_bind_address).await?;
    let actual_addr = listener.local_addr()?;
    tracing::info!(
        bind = %actual_addr,
        provider = %config.model.provider,
        max_upload_bytes = config.max_upload_bytes,
        "listening"
    );

    let signal_coordinator = coordinator.clone();
    let server_future = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal_coordinator.wait_for_signal().await;
        })
        .into_future();
    tokio::pin!(server_future);

    tokio::select! {
        result = &mut server_future => return result.map_err(anyhow::Error::from),
        _ = coordinator.initiated() => {}
    }

    if !coordinator.wait_for_drain().await {
        tracing::warn!(
            remaining_requests = coordinator.active_request_count(),
            "abandoning in-flight requests"
        );
        return Ok(());
    }

    match timeout(CONNECTION_CLOSE_GRACE, &mut server_future).await {
        Ok(result) => result.map_err(anyhow::Error::from)?,
        Err(_) => tracing::warn!("idle connections did not close in time"),
    }
    tracing::info!("server stopped");
    Ok(())
}

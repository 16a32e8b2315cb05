use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use session_transport::config::Settings;
use session_transport::events::Event;
use session_transport::server::{create_app, AppState};
use session_transport::session::SessionTransport;
use session_transport::tasks::MaintenanceTask;
use session_transport::telemetry::{init_tracing, LogFormat};
use session_transport::transport::WebSocketTransportFactory;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing(LogFormat::from_env());

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(endpoint = %settings.transport.endpoint, "Configuration loaded");

    // Create the session transport
    let factory = Arc::new(WebSocketTransportFactory::new(settings.transport.endpoint.clone()));
    let session = SessionTransport::new(&settings, factory);
    tracing::info!("Session transport initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start maintenance task in background
    let maintenance = MaintenanceTask::new(&settings, session.clone(), shutdown_tx.subscribe());
    let maintenance_handle = tokio::spawn(maintenance.run());

    // Log inbound session events
    let mut events = session.subscribe();
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::StateChanged { key, previous, current } => {
                    tracing::debug!(key = ?key, from = %previous, to = %current, "State event");
                }
                Event::Inbound { key, envelope } => {
                    tracing::debug!(key = %key, message_type = %envelope.message_type, "Inbound message");
                }
                Event::Session(event) => {
                    tracing::info!(session_key = %event.session_key(), event = ?event, "Session event");
                }
            }
        }
    });

    if let Some(key) = settings.session.auto_start_key.clone() {
        if session.initialize_connection(&key).await {
            tracing::info!(key = %key, "Auto-start session connected");
        } else {
            tracing::warn!(key = %key, "Auto-start session failed, continuing without it");
        }
    }

    // Create Axum app
    let addr = settings.server_addr();
    let app = create_app(AppState::new(settings, session.clone()));

    // Start server
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_tx))
        .await?;

    // Close connections and end subscriber streams
    session.shutdown().await;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(maintenance_handle, events_handle);

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    // Stop background tasks
    let _ = shutdown_tx.send(());
}

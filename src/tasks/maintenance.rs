use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::Settings;
use crate::metrics::QueueMetrics;
use crate::session::SessionTransport;

/// Background task for session keepalive and queue housekeeping
pub struct MaintenanceTask {
    session: SessionTransport,
    heartbeat_interval: Duration,
    cleanup_interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl MaintenanceTask {
    pub fn new(
        settings: &Settings,
        session: SessionTransport,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            session,
            heartbeat_interval: settings.session.heartbeat_interval(),
            cleanup_interval: settings.queue.cleanup_interval(),
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup timers until shutdown
    pub async fn run(mut self) {
        let mut heartbeat_timer = tokio::time::interval(self.heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(self.cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.heartbeat_interval.as_secs(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.heartbeat().await;
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup();
                }
            }
        }

        tracing::info!("Maintenance task stopped");
    }

    async fn heartbeat(&self) {
        if self.session.active_key().is_none() {
            return;
        }

        if self.session.send_heartbeat().await {
            let flushed = self.session.flush_pending().await;
            if flushed > 0 {
                tracing::debug!(flushed, "Delivered messages left over from an interrupted flush");
            }
        } else {
            tracing::debug!(state = %self.session.state(), "Heartbeat skipped or failed");
        }
    }

    fn cleanup(&self) {
        let expired = self.session.cleanup_expired_messages();
        if expired > 0 {
            tracing::info!(expired, "Cleaned up expired queued messages");
        }
        QueueMetrics::set_depth(self.session.stats().queue_depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransportFactory;
    use std::sync::Arc;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.session.heartbeat_interval_secs = 1;
        settings.queue.cleanup_interval_secs = 60;
        settings
    }

    #[tokio::test]
    async fn test_maintenance_task_shutdown() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let session = SessionTransport::new(&settings(), factory);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = MaintenanceTask::new(&settings(), session.clone(), shutdown_rx);
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_on_active_session() {
        let factory = Arc::new(MemoryTransportFactory::new());
        let session = SessionTransport::new(&settings(), factory.clone());
        assert!(session.initialize_connection("s1").await);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = MaintenanceTask::new(&settings(), session.clone(), shutdown_rx);
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let transport = factory.latest("s1").unwrap();
        assert!(transport.sent_types().iter().any(|t| t == "heartbeat"));

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
        session.shutdown().await;
    }
}

//! Centralized shutdown management

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::constants::SHUTDOWN_TIMEOUT_SECS;
use crate::data::{AnalyticsService, SqliteService};

/// Centralized shutdown service for coordinating graceful shutdown
#[derive(Clone)]
pub struct ShutdownService {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    metadata: Arc<SqliteService>,
    analytics: Arc<AnalyticsService>,
}

impl ShutdownService {
    pub fn new(metadata: Arc<SqliteService>, analytics: Arc<AnalyticsService>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            handles: Arc::new(Mutex::new(Vec::new())),
            metadata,
            analytics,
        }
    }

    /// Register a background task handle to be awaited during shutdown
    pub async fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Subscribe to shutdown signal
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Check if shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown and wait for all registered tasks to complete
    ///
    /// Shutdown order:
    /// 1. Signal all tasks to stop
    /// 2. Wait for in-flight backfill steps and refreshes to finish
    /// 3. Checkpoint and close databases
    pub async fn shutdown(&self) {
        tracing::debug!("Initiating graceful shutdown...");
        self.trigger();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        tracing::debug!(
            count = handles.len(),
            "Waiting for background tasks to finish..."
        );

        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                tracing::debug!("All background tasks completed");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Timeout waiting for background tasks"
                );
            }
        }

        tracing::debug!("Closing database connections...");
        let metadata = self.metadata.clone();
        let analytics = self.analytics.clone();
        tokio::join!(
            async {
                if let Err(e) = metadata.checkpoint().await {
                    tracing::warn!("SQLite checkpoint failed: {}", e);
                }
                metadata.close().await;
            },
            async {
                if let Err(e) = analytics.checkpoint().await {
                    tracing::warn!(backend = %analytics.backend(), "Analytics checkpoint failed: {}", e);
                }
                if let Err(e) = analytics.close().await {
                    tracing::warn!(backend = %analytics.backend(), "Analytics close failed: {}", e);
                }
            }
        );

        tracing::debug!("Shutdown complete");
    }

    /// Wait for the shutdown signal
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&v| v).await;
        }
    }

    /// Install OS signal handlers and auto-trigger on Ctrl+C/SIGTERM
    pub fn install_signal_handlers(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(e) => {
                        tracing::error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::debug!("Received Ctrl+C, shutting down"),
                _ = terminate => tracing::debug!("Received SIGTERM, shutting down"),
            }

            service.trigger();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AnalyticsBackend;

    async fn make_shutdown(dir: &std::path::Path) -> ShutdownService {
        let metadata = Arc::new(SqliteService::open_in_memory().await.unwrap());
        let analytics = Arc::new(
            AnalyticsService::init(AnalyticsBackend::Duckdb, &dir.join("test.duckdb"), None)
                .await
                .unwrap(),
        );
        ShutdownService::new(metadata, analytics)
    }

    #[tokio::test]
    async fn test_shutdown_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = make_shutdown(dir.path()).await;
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_shutdown_wait_returns_after_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = make_shutdown(dir.path()).await;
        let handle = tokio::spawn(shutdown.wait());

        tokio::task::yield_now().await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_registered_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = make_shutdown(dir.path()).await;

        let mut rx = shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let _ = rx.wait_for(|&v| v).await;
        });
        shutdown.register(handle).await;

        tokio::time::timeout(Duration::from_secs(5), shutdown.shutdown())
            .await
            .unwrap();
        assert!(shutdown.is_triggered());
    }
}

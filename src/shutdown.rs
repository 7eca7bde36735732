use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::control::ControlPlane;
use crate::telemetry::shutdown_telemetry;

/// Graceful shutdown coordinator for the run control plane
pub struct ShutdownCoordinator {
    control: Arc<ControlPlane>,
    /// Upper bound on worker teardown before giving up on it
    teardown_limit: Duration,
}

impl ShutdownCoordinator {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        let worker = &control.config().worker;
        // Grace period, forker wait, and slack for per-worker shutdown requests.
        let teardown_limit = Duration::from_millis(worker.shutdown_grace_ms)
            + Duration::from_secs(worker.forker_exit_wait_secs)
            + Duration::from_secs(10);
        Self {
            control,
            teardown_limit,
        }
    }

    /// Wait for SIGINT (or SIGTERM on unix)
    pub async fn wait_for_signal() -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received");
        Ok(())
    }

    /// Wait for a shutdown signal, then shut everything down
    pub async fn wait_for_shutdown(self) -> Result<Option<i32>> {
        info!("Shutdown coordinator ready - will shutdown gracefully on SIGINT/SIGTERM");
        Self::wait_for_signal().await?;
        self.shutdown_all_services().await
    }

    /// Perform graceful shutdown operations
    pub async fn shutdown_all_services(self) -> Result<Option<i32>> {
        info!("Initiating graceful shutdown of all services...");

        let exit_code = match timeout(self.teardown_limit, self.control.shutdown()).await {
            Ok(code) => code,
            Err(_) => {
                warn!(
                    limit_secs = self.teardown_limit.as_secs_f64(),
                    "Worker teardown did not finish in time"
                );
                None
            }
        };

        shutdown_telemetry();
        info!(forker_exit_code = ?exit_code, "Graceful shutdown completed successfully");
        Ok(exit_code)
    }
}

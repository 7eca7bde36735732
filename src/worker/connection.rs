//! Resolving a published registration name into a live factory handle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{RemoteRunFactory, WorkerRegistry};
use crate::errors::{RemoteError, RunError};
use crate::observability::metrics;

#[derive(Clone)]
pub struct RemoteWorkerConnection {
    registry: Arc<dyn WorkerRegistry>,
    poll_interval: Duration,
    deadline: Duration,
}

impl RemoteWorkerConnection {
    pub fn new(registry: Arc<dyn WorkerRegistry>, poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            registry,
            poll_interval,
            deadline,
        }
    }

    pub fn registry(&self) -> &Arc<dyn WorkerRegistry> {
        &self.registry
    }

    /// A single lookup. Registry unreachability is reported, absence is `None`.
    pub async fn lookup_once(&self, name: &str) -> Result<Option<Arc<dyn RemoteRunFactory>>, RunError> {
        metrics().record_registry_lookup();
        self.registry.lookup(name).await.map_err(|e| {
            metrics().record_connectivity_failure();
            RunError::from(e)
        })
    }

    /// Poll the registry at a fixed interval until `name` appears or the
    /// deadline passes. The wait is a timer, so callers are suspended rather
    /// than holding a thread, and dropping the future abandons the poll.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn RemoteRunFactory>, RunError> {
        let started = Instant::now();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let polled = timeout(self.deadline, async {
            let mut attempts: u32 = 0;
            loop {
                ticker.tick().await;
                attempts += 1;
                match self.lookup_once(name).await {
                    Ok(Some(factory)) => return (factory, attempts),
                    Ok(None) => {
                        debug!(registration_name = %name, attempts, "Worker not registered yet");
                    }
                    Err(e) => {
                        debug!(
                            registration_name = %name,
                            attempts,
                            error = %e,
                            "Registry lookup failed; polling again"
                        );
                    }
                }
            }
        })
        .await;

        match polled {
            Ok((factory, attempts)) => {
                debug!(
                    registration_name = %name,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker factory resolved"
                );
                Ok(factory)
            }
            Err(_) => {
                metrics().record_connectivity_failure();
                warn!(
                    registration_name = %name,
                    deadline_secs = self.deadline.as_secs_f64(),
                    "Worker did not register before the deadline"
                );
                Err(RunError::connectivity(format!(
                    "worker '{name}' did not register within {:?}",
                    self.deadline
                )))
            }
        }
    }
}

/// Run a remote call, repeating it when the worker is unreachable, up to
/// `attempts` tries in total. Worker faults are returned immediately.
pub async fn retry_remote<T, F, Fut>(attempts: u32, mut operation: F) -> Result<T, RunError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_connectivity() => {
                metrics().record_connectivity_failure();
                warn!(attempt, attempts, error = %e, "Remote call unreachable");
                last = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last
        .map(RunError::from)
        .unwrap_or_else(|| RunError::connectivity("remote call never attempted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_remote_retries_only_connectivity() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_remote(3, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::Unreachable("blip".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), RunError> = retry_remote(3, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Fault("broken".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(RunError::ImplementationFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_remote_surfaces_connectivity_after_budget() {
        let result: Result<(), RunError> =
            retry_remote(2, || async { Err(RemoteError::Unreachable("down".to_string())) }).await;
        assert!(matches!(result, Err(RunError::ConnectivityFailure { .. })));
    }
}

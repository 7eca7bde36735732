//! The authoritative table of live runs and the background expiry sweep.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::RunError;
use crate::identity::Identity;
use crate::observability::metrics;
use crate::policy::Policy;
use crate::run::{Run, RunId};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<RunId>,
    pub destroy_failures: usize,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, Arc<Run>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, Arc<Run>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, run: Arc<Run>) -> Result<RunId, RunError> {
        let id = run.id();
        let mut runs = self.runs();
        if runs.contains_key(&id) {
            return Err(RunError::implementation(format!(
                "run identifier {id} is already registered"
            )));
        }
        runs.insert(id, run);
        debug!(run_id = %id, registered = runs.len(), "Run registered");
        Ok(id)
    }

    pub fn get_run(&self, id: RunId) -> Result<Arc<Run>, RunError> {
        self.runs()
            .get(&id)
            .cloned()
            .ok_or_else(|| RunError::unknown_run(id))
    }

    /// Like [`get_run`](Self::get_run), but a run the policy hides from
    /// `identity` is reported exactly as a missing one.
    pub fn get_run_for(
        &self,
        identity: &Identity,
        policy: &dyn Policy,
        id: RunId,
    ) -> Result<Arc<Run>, RunError> {
        let run = self.get_run(id)?;
        if policy.permit_access(identity, &run) {
            Ok(run)
        } else {
            Err(RunError::unknown_run(id))
        }
    }

    fn snapshot(&self) -> Vec<Arc<Run>> {
        self.runs().values().cloned().collect()
    }

    /// Every run visible to `identity`, oldest first.
    pub fn list_runs(&self, identity: &Identity, policy: &dyn Policy) -> Vec<Arc<Run>> {
        let mut visible: Vec<Arc<Run>> = self
            .snapshot()
            .into_iter()
            .filter(|run| policy.permit_access(identity, run))
            .collect();
        visible.sort_by_key(|run| run.created_at());
        visible
    }

    pub fn unregister_run(&self, id: RunId) -> Option<Arc<Run>> {
        let removed = self.runs().remove(&id);
        if removed.is_some() {
            debug!(run_id = %id, "Run unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every run whose expiry has passed and destroy it. The table
    /// lock is released before any worker is contacted, and a failed destroy
    /// does not stop the rest.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let expired: Vec<Arc<Run>> = {
            let mut runs = self.runs();
            let ids: Vec<RunId> = runs
                .values()
                .filter(|run| run.is_expired(now))
                .map(|run| run.id())
                .collect();
            ids.iter().filter_map(|id| runs.remove(id)).collect()
        };

        let mut report = SweepReport::default();
        for run in expired {
            report.expired.push(run.id());
            metrics().record_run_expired();
            if let Err(e) = run.destroy().await {
                report.destroy_failures += 1;
                warn!(run_id = %run.id(), error = %e, "Failed to destroy expired run");
            }
        }

        if !report.expired.is_empty() {
            info!(
                expired = report.expired.len(),
                destroy_failures = report.destroy_failures,
                "Expired runs swept"
            );
        }
        report
    }

    /// Sweep on a fixed interval until [`stop_sweeper`](Self::stop_sweeper).
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_expired(Utc::now()).await;
            }
        });

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = sweeper.replace(task) {
            previous.abort();
        }
        info!(interval_secs = every.as_secs_f64(), "Expiry sweeper started");
    }

    pub fn stop_sweeper(&self) {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!("Expiry sweeper stopped");
        }
    }
}

//! Worker Process Supervision
//!
//! Maps each local account to at most one live worker subprocess, creates run
//! handles inside it, and tears every worker down on shutdown.
//!
//! Connections are cached per account in a `moka` cache whose initialisation
//! is single-flight: concurrent first use for the same account waits on one
//! spawn instead of racing several. A connection that turns out to be
//! unreachable is evicted and the next request re-attaches or respawns.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CreateRequest, InteractionEndpoint, RemoteRun, RemoteRunFactory, RemoteWorkerConnection,
    WorkerLauncher,
};
use crate::config::{InteractionConfig, WorkerConfig};
use crate::errors::RunError;
use crate::observability::{metrics, OperationTimer};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub registration_prefix: String,
    pub creation_attempts: u32,
    pub shutdown_grace: Duration,
    pub forker_exit_wait: Duration,
    pub interaction: Option<InteractionEndpoint>,
}

impl SupervisorSettings {
    pub fn from_config(worker: &WorkerConfig, interaction: Option<&InteractionConfig>) -> Self {
        Self {
            registration_prefix: worker.registration_prefix.clone(),
            creation_attempts: worker.creation_attempts.max(1),
            shutdown_grace: Duration::from_millis(worker.shutdown_grace_ms),
            forker_exit_wait: Duration::from_secs(worker.forker_exit_wait_secs),
            interaction: interaction.map(|i| InteractionEndpoint {
                host: i.host.clone(),
                port: i.port,
                webdav_path: i.webdav_path.clone(),
                feed_path: i.feed_path.clone(),
            }),
        }
    }
}

/// Bookkeeping for one account's worker subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcessHandle {
    pub local_user: String,
    pub registration_name: String,
    /// Whether a live factory connection is currently cached.
    pub connected: bool,
    pub last_exit_code: Option<i32>,
    pub spawn_attempts: u32,
    pub spawned_at: DateTime<Utc>,
}

pub struct WorkerProcessSupervisor {
    settings: SupervisorSettings,
    launcher: Arc<dyn WorkerLauncher>,
    connection: RemoteWorkerConnection,
    connections: Cache<String, Arc<dyn RemoteRunFactory>>,
    handles: Mutex<HashMap<String, WorkerProcessHandle>>,
    forker_exit_code: Mutex<Option<i32>>,
}

impl WorkerProcessSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        launcher: Arc<dyn WorkerLauncher>,
        connection: RemoteWorkerConnection,
    ) -> Self {
        Self {
            settings,
            launcher,
            connection,
            connections: Cache::builder().build(),
            handles: Mutex::new(HashMap::new()),
            forker_exit_code: Mutex::new(None),
        }
    }

    fn registration_name(&self) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!(
            "{}-{}-{}",
            self.settings.registration_prefix,
            host,
            Uuid::new_v4().simple()
        )
    }

    fn handle(&self, local_user: &str) -> Option<WorkerProcessHandle> {
        self.handles
            .lock()
            .ok()
            .and_then(|handles| handles.get(local_user).cloned())
    }

    /// Snapshot of every account's worker bookkeeping.
    pub fn handles(&self) -> Vec<WorkerProcessHandle> {
        let mut handles: Vec<WorkerProcessHandle> = self
            .handles
            .lock()
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default();
        for handle in handles.iter_mut() {
            handle.connected = self.connections.contains_key(&handle.local_user);
        }
        handles.sort_by(|a, b| a.local_user.cmp(&b.local_user));
        handles
    }

    pub fn forker_exit_code(&self) -> Option<i32> {
        self.forker_exit_code.lock().ok().and_then(|c| *c)
    }

    /// The live factory for `local_user`, spawning its worker if needed.
    pub async fn connection_for(&self, local_user: &str) -> Result<Arc<dyn RemoteRunFactory>, RunError> {
        self.connections
            .try_get_with(local_user.to_string(), self.attach_or_spawn(local_user))
            .await
            .map_err(|e| e.as_ref().clone())
    }

    /// Drop the cached factory so the next request re-attaches or respawns.
    pub async fn evict(&self, local_user: &str) {
        self.connections.invalidate(local_user).await;
        debug!(local_user = %local_user, "Worker connection evicted");
    }

    async fn attach_or_spawn(&self, local_user: &str) -> Result<Arc<dyn RemoteRunFactory>, RunError> {
        if let Some(existing) = self.handle(local_user) {
            match self.launcher.exit_code(&existing.registration_name) {
                None => {
                    if let Ok(Some(factory)) =
                        self.connection.lookup_once(&existing.registration_name).await
                    {
                        metrics().record_worker_reattach();
                        info!(
                            local_user = %local_user,
                            registration_name = %existing.registration_name,
                            "Re-attached to running worker"
                        );
                        return Ok(factory);
                    }
                }
                Some(code) => {
                    self.update_handle(local_user, |h| h.last_exit_code = Some(code));
                    info!(
                        local_user = %local_user,
                        registration_name = %existing.registration_name,
                        exit_code = code,
                        "Previous worker has exited"
                    );
                }
            }

            if let Err(e) = self
                .connection
                .registry()
                .unbind(&existing.registration_name)
                .await
            {
                debug!(
                    registration_name = %existing.registration_name,
                    error = %e,
                    "Could not unbind stale worker registration"
                );
            }
            self.launcher.forget(&existing.registration_name);
        }

        self.spawn(local_user).await
    }

    async fn spawn(&self, local_user: &str) -> Result<Arc<dyn RemoteRunFactory>, RunError> {
        let registration_name = self.registration_name();
        let timer = OperationTimer::new("worker_spawn");

        {
            let mut handles = self
                .handles
                .lock()
                .map_err(|_| RunError::implementation("worker table poisoned"))?;
            let previous_attempts = handles.get(local_user).map(|h| h.spawn_attempts).unwrap_or(0);
            let last_exit_code = handles.get(local_user).and_then(|h| h.last_exit_code);
            handles.insert(
                local_user.to_string(),
                WorkerProcessHandle {
                    local_user: local_user.to_string(),
                    registration_name: registration_name.clone(),
                    connected: false,
                    last_exit_code,
                    spawn_attempts: previous_attempts + 1,
                    spawned_at: Utc::now(),
                },
            );
        }

        self.launcher.launch(local_user, &registration_name).await?;
        metrics().record_worker_spawn();

        let factory = self.connection.resolve(&registration_name).await?;

        if let Some(endpoint) = &self.settings.interaction {
            factory.configure_interaction(endpoint).await?;
        }

        timer.finish();
        info!(
            local_user = %local_user,
            registration_name = %registration_name,
            "Worker subprocess registered"
        );
        Ok(factory)
    }

    fn update_handle(&self, local_user: &str, update: impl FnOnce(&mut WorkerProcessHandle)) {
        if let Ok(mut handles) = self.handles.lock() {
            if let Some(handle) = handles.get_mut(local_user) {
                update(handle);
            }
        }
    }

    /// Create a run handle inside `local_user`'s worker. An unreachable cached
    /// worker is evicted and the creation retried a bounded number of times.
    pub async fn create_remote_run(
        &self,
        local_user: &str,
        request: CreateRequest,
    ) -> Result<Arc<dyn RemoteRun>, RunError> {
        let attempts = self.settings.creation_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let factory = self.connection_for(local_user).await?;
            match factory.create(request.clone()).await {
                Ok(run) => {
                    debug!(
                        local_user = %local_user,
                        run_id = ?request.run_id,
                        attempt,
                        "Remote run created"
                    );
                    return Ok(run);
                }
                Err(e) if e.is_connectivity() => {
                    metrics().record_connectivity_failure();
                    warn!(
                        local_user = %local_user,
                        attempt,
                        attempts,
                        error = %e,
                        "Cached worker unreachable; evicting"
                    );
                    self.evict(local_user).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RunError::connectivity(format!(
            "worker for '{local_user}' unreachable after {attempts} attempts: {}",
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string())
        )))
    }

    /// Sum of the operating-run counters every connected worker keeps.
    pub async fn count_operating_runs(&self) -> usize {
        self.connections.run_pending_tasks().await;
        let connected: Vec<(Arc<String>, Arc<dyn RemoteRunFactory>)> =
            self.connections.iter().collect();

        let mut total = 0;
        for (local_user, factory) in connected {
            match factory.count_operating_runs().await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(
                        local_user = %local_user,
                        error = %e,
                        "Could not count operating runs; evicting worker"
                    );
                    if e.is_connectivity() {
                        self.evict(&local_user).await;
                    }
                }
            }
        }
        total
    }

    pub async fn is_allowing_runs_to_start(&self, operating_limit: usize) -> bool {
        self.count_operating_runs().await < operating_limit
    }

    /// Best-effort teardown of every worker and then of the spawning process.
    pub async fn shutdown(&self) -> Option<i32> {
        let handles = self.handles();
        info!(workers = handles.len(), "Shutting down worker subprocesses");

        for handle in &handles {
            if let Some(factory) = self.connections.get(&handle.local_user).await {
                if let Err(e) = factory.shutdown().await {
                    warn!(
                        local_user = %handle.local_user,
                        registration_name = %handle.registration_name,
                        error = %e,
                        "Worker refused shutdown request"
                    );
                }
            }
            if let Err(e) = self
                .connection
                .registry()
                .unbind(&handle.registration_name)
                .await
            {
                warn!(
                    registration_name = %handle.registration_name,
                    error = %e,
                    "Failed to remove worker registration"
                );
            }
        }
        self.connections.invalidate_all();

        tokio::time::sleep(self.settings.shutdown_grace).await;

        let exit_code = self.launcher.shutdown(self.settings.forker_exit_wait).await;
        if let Ok(mut recorded) = self.forker_exit_code.lock() {
            *recorded = exit_code;
        }
        if let Ok(mut table) = self.handles.lock() {
            for handle in table.values_mut() {
                if let Some(code) = self.launcher.exit_code(&handle.registration_name) {
                    handle.last_exit_code = Some(code);
                }
            }
        }

        info!(exit_code = ?exit_code, "Worker supervision stopped");
        exit_code
    }
}

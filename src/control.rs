//! The control plane as callers see it: policy, run table, workers and
//! security contexts behind one set of operations.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn, Instrument};

use crate::config::RunControlConfig;
use crate::errors::RunError;
use crate::identity::{Identity, LocalUserMapper};
use crate::observability::metrics;
use crate::policy::{Policy, SimplePolicy};
use crate::run::{Run, RunId, RunServices, RunSettings, Workflow};
use crate::run_registry::RunRegistry;
use crate::security::SecurityContextFactory;
use crate::telemetry::create_run_span;
use crate::usage::{UsageRecordSink, UsageRecorder};
use crate::worker::{
    ForkingLauncher, InMemoryRegistry, RemoteWorkerConnection, SupervisorSettings, WorkerLauncher,
    WorkerProcessSupervisor, WorkerRegistry,
};

pub struct ControlPlane {
    config: RunControlConfig,
    policy: Arc<dyn Policy>,
    registry: Arc<RunRegistry>,
    supervisor: Arc<WorkerProcessSupervisor>,
    security: Arc<SecurityContextFactory>,
    usage: Arc<dyn UsageRecordSink>,
    users: LocalUserMapper,
    /// Serializes the count check with the insert it guards.
    admission: Mutex<()>,
}

impl ControlPlane {
    /// Wire a control plane around the given worker launcher and the registry
    /// workers publish themselves in.
    pub fn new(
        config: RunControlConfig,
        launcher: Arc<dyn WorkerLauncher>,
        worker_registry: Arc<dyn WorkerRegistry>,
    ) -> Result<Self, RunError> {
        let usage: Arc<dyn UsageRecordSink> = Arc::new(UsageRecorder::new(&config.usage));
        Self::with_usage_sink(config, launcher, worker_registry, usage)
    }

    pub fn with_usage_sink(
        config: RunControlConfig,
        launcher: Arc<dyn WorkerLauncher>,
        worker_registry: Arc<dyn WorkerRegistry>,
        usage: Arc<dyn UsageRecordSink>,
    ) -> Result<Self, RunError> {
        let connection = RemoteWorkerConnection::new(
            worker_registry,
            Duration::from_millis(config.worker.registry_poll_interval_ms.max(1)),
            Duration::from_secs(config.worker.registry_deadline_secs),
        );
        let supervisor = Arc::new(WorkerProcessSupervisor::new(
            SupervisorSettings::from_config(&config.worker, config.interaction.as_ref()),
            launcher,
            connection,
        ));
        let registry = Arc::new(RunRegistry::new());
        let policy: Arc<dyn Policy> =
            Arc::new(SimplePolicy::new(&config.policy, Arc::clone(&registry)));

        Ok(Self {
            users: LocalUserMapper::new(&config.users)?,
            security: Arc::new(SecurityContextFactory::new(&config.security)?),
            policy,
            registry,
            supervisor,
            usage,
            config,
            admission: Mutex::new(()),
        })
    }

    /// Forking launcher and an in-process worker registry.
    pub fn from_config(config: RunControlConfig) -> Result<Self, RunError> {
        let launcher: Arc<dyn WorkerLauncher> = Arc::new(ForkingLauncher::new(&config.worker));
        let registry: Arc<dyn WorkerRegistry> = Arc::new(InMemoryRegistry::new());
        Self::new(config, launcher, registry)
    }

    pub fn config(&self) -> &RunControlConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<WorkerProcessSupervisor> {
        &self.supervisor
    }

    pub fn security(&self) -> &Arc<SecurityContextFactory> {
        &self.security
    }

    pub async fn create_run(&self, identity: &Identity, workflow: Workflow) -> Result<Arc<Run>, RunError> {
        let span = create_run_span("create_run", None, identity.name());
        async {
            let (id, run) = self.admit(identity, workflow)?;

            metrics().record_run_created();
            info!(
                run_id = %id,
                owner = %identity,
                local_user = %run.local_user(),
                workflow = %run.workflow().reference,
                "Run created"
            );
            Ok(run)
        }
        .instrument(span)
        .await
    }

    /// Admission and registration as one step, so concurrent creates by the
    /// same caller cannot all pass the run-count check.
    fn admit(&self, identity: &Identity, workflow: Workflow) -> Result<(RunId, Arc<Run>), RunError> {
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        self.policy.permit_create(identity, &workflow)?;
        let local_user = self.users.local_user_for(identity)?;

        let settings = RunSettings::for_user(&self.config, local_user);
        let services = RunServices {
            supervisor: Arc::clone(&self.supervisor),
            security: Arc::clone(&self.security),
            usage: Arc::clone(&self.usage),
        };
        let run = Arc::new(Run::new(identity, workflow, settings, services)?);
        match self.registry.register(Arc::clone(&run)) {
            Ok(id) => Ok((id, run)),
            Err(e) => {
                self.security.release(run.security_handle());
                Err(e)
            }
        }
    }

    /// A run visible to `identity`; hidden and missing runs look the same.
    pub fn run(&self, identity: &Identity, id: RunId) -> Result<Arc<Run>, RunError> {
        self.registry.get_run_for(identity, self.policy.as_ref(), id)
    }

    pub fn run_for_update(&self, identity: &Identity, id: RunId) -> Result<Arc<Run>, RunError> {
        let run = self.run(identity, id)?;
        self.policy.permit_update(identity, &run)?;
        Ok(run)
    }

    pub fn list_runs(&self, identity: &Identity) -> Vec<Arc<Run>> {
        self.registry.list_runs(identity, self.policy.as_ref())
    }

    /// Remove a run. Worker-side teardown is best effort: once the run is out
    /// of the table a failing worker is logged, not reported.
    pub async fn destroy_run(&self, identity: &Identity, id: RunId) -> Result<(), RunError> {
        let id_text = id.to_string();
        let span = create_run_span("destroy_run", Some(&id_text), identity.name());
        async {
            let run = self.run(identity, id)?;
            self.policy.permit_destroy(identity, &run)?;

            if self.registry.unregister_run(id).is_none() {
                // Lost a race with another destroy or the sweeper.
                return Err(RunError::unknown_run(id));
            }
            metrics().record_run_destroyed();
            if let Err(e) = run.destroy().await {
                warn!(run_id = %id, error = %e, "Worker did not release destroyed run");
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn operating_run_count(&self) -> usize {
        self.supervisor.count_operating_runs().await
    }

    pub fn start_sweeper(&self) {
        self.registry
            .start_sweeper(Duration::from_secs(self.config.runs.sweep_interval_secs.max(1)));
    }

    /// Stop sweeping, then tear down every worker. Returns the spawning
    /// process's exit code when one was observed.
    pub async fn shutdown(&self) -> Option<i32> {
        self.registry.stop_sweeper();
        let exit_code = self.supervisor.shutdown().await;
        metrics().log_stats();
        exit_code
    }
}

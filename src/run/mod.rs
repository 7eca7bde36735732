//! A single workflow run: its lifecycle, its bindings and the proxy to the
//! worker that executes it.
//!
//! No worker resources are committed while a run is Initialized. The first
//! start (or the first working-directory access) provisions a remote run in
//! the owner's worker; that provisioning is allowed a bounded budget per
//! request, after which the caller is told to retry while provisioning
//! carries on in the background.

pub mod bindings;
pub mod listener;
pub mod status;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RunControlConfig, RunsConfig, WorkerConfig};
use crate::errors::RunError;
use crate::filesystem::{Directory, DirectoryEntry};
use crate::identity::Identity;
use crate::security::{DelegateHandle, Permission, SecurityContextFactory, SecurityDelegate};
use crate::usage::{UsageRecord, UsageRecordSink};
use crate::worker::{
    retry_remote, CreateRequest, LaunchRequest, RemoteRun, WorkerProcessSupervisor,
};

pub use bindings::{validate_filename, InputBinding, InputBindings, InputSource};
pub use listener::{IoListener, Listener, ListenerFactory, TransitionLogListener};
pub use status::{merge, plan_transition, Lifecycle, Status, TransitionPlan};

/// The remote run a local run is bound to, once there is one.
pub type RemoteSlot = Arc<RwLock<Option<Arc<dyn RemoteRun>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Malformed identifiers name no run at all.
        Uuid::parse_str(s.trim())
            .map(RunId)
            .map_err(|_| RunError::unknown_run(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Where the workflow came from; also the default run name.
    pub reference: String,
    pub document: Vec<u8>,
}

impl Workflow {
    pub fn new(reference: impl Into<String>, document: impl Into<Vec<u8>>) -> Self {
        Self {
            reference: reference.into(),
            document: document.into(),
        }
    }
}

/// Per-run knobs drawn from configuration at creation time.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub local_user: String,
    pub working_directory_root: PathBuf,
    pub engine_command: String,
    pub environment: BTreeMap<String, String>,
    pub extra_args: Vec<String>,
    pub start_budget: Duration,
    pub remote_call_attempts: u32,
    pub operating_limit: usize,
    pub lifetime: Option<Duration>,
    pub default_name: String,
    pub max_name_length: usize,
}

impl RunSettings {
    pub fn from_config(
        runs: &RunsConfig,
        worker: &WorkerConfig,
        operating_limit: usize,
        local_user: impl Into<String>,
    ) -> Self {
        Self {
            local_user: local_user.into(),
            working_directory_root: runs.working_directory_root.clone(),
            engine_command: worker.engine_command.clone(),
            environment: worker.environment.clone(),
            extra_args: worker.extra_args.clone(),
            start_budget: Duration::from_secs(runs.start_budget_secs),
            remote_call_attempts: worker.remote_call_attempts.max(1),
            operating_limit,
            lifetime: match runs.default_lifetime_minutes {
                0 => None,
                minutes => Some(Duration::from_secs(minutes * 60)),
            },
            default_name: runs.default_name.clone(),
            max_name_length: runs.max_name_length,
        }
    }

    pub fn for_user(config: &RunControlConfig, local_user: impl Into<String>) -> Self {
        Self::from_config(
            &config.runs,
            &config.worker,
            config.policy.operating_limit,
            local_user,
        )
    }

    fn display_name(&self, requested: &str) -> String {
        let trimmed = requested.trim();
        if trimmed.is_empty() {
            return self.default_name.clone();
        }
        trimmed.chars().take(self.max_name_length).collect()
    }
}

/// Shared collaborators every run talks to.
#[derive(Clone)]
pub struct RunServices {
    pub supervisor: Arc<WorkerProcessSupervisor>,
    pub security: Arc<SecurityContextFactory>,
    pub usage: Arc<dyn UsageRecordSink>,
}

struct RunState {
    lifecycle: Lifecycle,
    name: String,
    inputs: InputBindings,
    input_aggregate: Option<String>,
    output_capture: Option<String>,
    generate_provenance: bool,
    listeners: Vec<Arc<dyn Listener>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    expiry: Option<DateTime<Utc>>,
    /// The worker has accepted the launch request.
    launched: bool,
    destroyed: bool,
}

impl RunState {
    fn require_live(&self, id: RunId) -> Result<(), RunError> {
        if self.destroyed {
            Err(RunError::unknown_run(id))
        } else {
            Ok(())
        }
    }

    fn require_initialized(&self, id: RunId, what: &str) -> Result<(), RunError> {
        self.require_live(id)?;
        if self.lifecycle.intended == Status::Initialized {
            Ok(())
        } else {
            Err(RunError::bad_state(format!(
                "{what} can only change while the run is Initialized (run is {})",
                self.lifecycle.effective()
            )))
        }
    }
}

pub struct Run {
    id: RunId,
    owner: String,
    workflow: Workflow,
    settings: RunSettings,
    services: RunServices,
    security: DelegateHandle,
    state: Mutex<RunState>,
    remote: RemoteSlot,
    provisioning: AsyncMutex<Option<JoinHandle<Result<Arc<dyn RemoteRun>, RunError>>>>,
    transitions: AsyncMutex<()>,
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("workflow", &self.workflow.reference)
            .finish_non_exhaustive()
    }
}

impl Run {
    pub fn new(
        owner: &Identity,
        workflow: Workflow,
        settings: RunSettings,
        services: RunServices,
    ) -> Result<Self, RunError> {
        let owner = owner
            .name()
            .ok_or_else(|| RunError::admission_denied("anonymous callers cannot own runs"))?
            .to_string();
        let security = services.security.create(&owner)?;
        let remote: RemoteSlot = Arc::new(RwLock::new(None));
        let io = ListenerFactory::create("io", "", &remote, settings.remote_call_attempts)?;

        let now = Utc::now();
        let expiry = match settings.lifetime {
            Some(lifetime) => Some(
                now + chrono::Duration::from_std(lifetime)
                    .map_err(|e| RunError::invalid_argument(format!("run lifetime: {e}")))?,
            ),
            None => None,
        };

        let state = RunState {
            lifecycle: Lifecycle::default(),
            name: settings.display_name(&workflow.reference),
            inputs: InputBindings::default(),
            input_aggregate: None,
            output_capture: None,
            generate_provenance: false,
            listeners: vec![io],
            created_at: now,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            expiry,
            launched: false,
            destroyed: false,
        };

        Ok(Self {
            id: RunId::new(),
            owner,
            workflow,
            settings,
            services,
            security,
            state: Mutex::new(state),
            remote,
            provisioning: AsyncMutex::new(None),
            transitions: AsyncMutex::new(()),
        })
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn local_user(&self) -> &str {
        &self.settings.local_user
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        let name = self.settings.display_name(name);
        self.state().name = name;
    }

    pub fn security_handle(&self) -> DelegateHandle {
        self.security
    }

    pub fn security_delegate(&self) -> Result<Arc<SecurityDelegate>, RunError> {
        self.services.security.resolve(self.security)
    }

    /// Whether `identity` holds at least `needed` on this run.
    pub fn permits(&self, identity: &Identity, needed: Permission) -> bool {
        if identity.name() == Some(self.owner.as_str()) {
            return true;
        }
        self.security_delegate()
            .map(|delegate| delegate.permits(identity, needed))
            .unwrap_or(false)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state().created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state().finished_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.state().cancelled_at
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.state().expiry
    }

    /// `None` means the run never expires.
    pub fn set_expiry(&self, expiry: Option<DateTime<Utc>>) -> Result<(), RunError> {
        if let Some(at) = expiry {
            if at <= Utc::now() {
                return Err(RunError::invalid_argument(format!(
                    "expiry {at} is not in the future"
                )));
            }
        }
        self.state().expiry = expiry;
        debug!(run_id = %self.id, expiry = ?expiry, "Run expiry updated");
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry(), Some(at) if at <= now)
    }

    /// Whether a remote run has been provisioned for this run.
    pub async fn is_bound(&self) -> bool {
        self.remote.read().await.is_some()
    }

    // Bindings

    pub fn input_bindings(&self) -> Vec<InputBinding> {
        self.state().inputs.to_vec()
    }

    pub fn input_binding(&self, name: &str) -> Option<InputBinding> {
        self.state().inputs.get(name).cloned()
    }

    fn upsert_input(&self, binding: InputBinding) -> Result<(), RunError> {
        let mut state = self.state();
        state.require_initialized(self.id, "input bindings")?;
        if state.input_aggregate.is_some() {
            return Err(RunError::bad_state(
                "per-port inputs cannot be set while an aggregate input file is in use",
            ));
        }
        debug!(run_id = %self.id, input = %binding.name, "Input binding set");
        state.inputs.upsert(binding);
        Ok(())
    }

    pub fn set_input_file(&self, name: &str, path: &str) -> Result<(), RunError> {
        self.upsert_input(InputBinding::file(name, path)?)
    }

    pub fn set_input_value(&self, name: &str, value: &str) -> Result<(), RunError> {
        self.upsert_input(InputBinding::value(name, value))
    }

    pub fn set_input_delimiter(&self, name: &str, delimiter: Option<char>) -> Result<(), RunError> {
        let mut state = self.state();
        state.require_initialized(self.id, "input bindings")?;
        state.inputs.set_delimiter(name, delimiter)
    }

    pub fn input_aggregate(&self) -> Option<String> {
        self.state().input_aggregate.clone()
    }

    /// Setting an aggregate input file replaces every per-port binding.
    pub fn set_input_aggregate(&self, path: Option<&str>) -> Result<(), RunError> {
        if let Some(path) = path {
            validate_filename(path)?;
        }
        let mut state = self.state();
        state.require_initialized(self.id, "the aggregate input")?;
        if path.is_some() {
            state.inputs.clear();
        }
        state.input_aggregate = path.map(str::to_string);
        Ok(())
    }

    pub fn output_capture(&self) -> Option<String> {
        self.state().output_capture.clone()
    }

    pub fn set_output_capture(&self, path: Option<&str>) -> Result<(), RunError> {
        if let Some(path) = path {
            validate_filename(path)?;
        }
        let mut state = self.state();
        state.require_initialized(self.id, "the output capture file")?;
        state.output_capture = path.map(str::to_string);
        Ok(())
    }

    pub fn generate_provenance(&self) -> bool {
        self.state().generate_provenance
    }

    pub fn set_generate_provenance(&self, enabled: bool) -> Result<(), RunError> {
        let mut state = self.state();
        state.require_initialized(self.id, "provenance generation")?;
        state.generate_provenance = enabled;
        Ok(())
    }

    // Listeners

    pub fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.state().listeners.clone()
    }

    pub fn listener(&self, name: &str) -> Option<Arc<dyn Listener>> {
        self.state()
            .listeners
            .iter()
            .find(|l| l.name() == name)
            .cloned()
    }

    pub fn add_listener(&self, kind: &str, configuration: &str) -> Result<Arc<dyn Listener>, RunError> {
        self.state().require_initialized(self.id, "listeners")?;
        let listener = ListenerFactory::create(
            kind,
            configuration,
            &self.remote,
            self.settings.remote_call_attempts,
        )?;

        let mut state = self.state();
        state.require_initialized(self.id, "listeners")?;
        if state.listeners.iter().any(|l| l.name() == listener.name()) {
            return Err(RunError::bad_state(format!(
                "a '{}' listener is already attached",
                listener.name()
            )));
        }
        state.listeners.push(Arc::clone(&listener));
        Ok(listener)
    }

    fn notify(&self, from: Status, to: Status) {
        if from == to {
            return;
        }
        for listener in self.listeners() {
            listener.status_changed(from, to);
        }
    }

    // Lifecycle

    async fn bound_remote(&self) -> Option<Arc<dyn RemoteRun>> {
        self.remote.read().await.clone()
    }

    /// Ask the worker where the run is and fold the answer in.
    async fn reconcile(&self) -> Result<Status, RunError> {
        let (intended, before) = {
            let state = self.state();
            (state.lifecycle.intended, state.lifecycle.effective())
        };
        let Some(remote) = self.bound_remote().await else {
            return Ok(before);
        };
        if intended == Status::Initialized {
            return Ok(before);
        }

        let reported =
            retry_remote(self.settings.remote_call_attempts, || remote.status()).await?;

        let after = {
            let mut state = self.state();
            let after = state.lifecycle.observe(reported);
            if after == Status::Finished && state.finished_at.is_none() {
                state.finished_at = Some(Utc::now());
            }
            after
        };
        if before != after {
            info!(run_id = %self.id, from = %before, to = %after, "Worker moved run on its own");
            self.notify(before, after);
        }
        Ok(after)
    }

    pub async fn status(&self) -> Result<Status, RunError> {
        self.reconcile().await
    }

    /// Request a status change. Returns the status the run is in afterwards,
    /// which is `Finished` when the worker completed the run first.
    pub async fn set_status(&self, requested: Status) -> Result<Status, RunError> {
        let _guard = self.transitions.lock().await;
        self.state().require_live(self.id)?;

        self.reconcile().await?;
        let (plan, from) = {
            let state = self.state();
            (state.lifecycle.plan(requested)?, state.lifecycle.effective())
        };

        let to = match plan {
            TransitionPlan::NoOp(status) => return Ok(status),
            TransitionPlan::Start => self.start().await?,
            TransitionPlan::Resume => {
                self.ensure_operating_capacity().await?;
                let remote = self.require_remote().await?;
                remote.start().await?;
                Status::Operating
            }
            TransitionPlan::Pause => {
                let remote = self.require_remote().await?;
                remote.stop().await?;
                Status::Stopped
            }
            TransitionPlan::Cancel => {
                let remote = self.require_remote().await?;
                remote.kill().await?;
                let now = Utc::now();
                let mut state = self.state();
                state.cancelled_at = Some(now);
                state.finished_at = Some(now);
                Status::Finished
            }
            TransitionPlan::Abandon => {
                self.state().finished_at = Some(Utc::now());
                Status::Finished
            }
        };

        self.state().lifecycle.settle(to);
        info!(run_id = %self.id, from = %from, to = %to, "Run status changed");
        self.notify(from, to);
        Ok(to)
    }

    async fn ensure_operating_capacity(&self) -> Result<(), RunError> {
        let limit = self.settings.operating_limit;
        if self.services.supervisor.is_allowing_runs_to_start(limit).await {
            Ok(())
        } else {
            Err(RunError::admission_denied(format!(
                "the limit of {limit} operating runs has been reached"
            )))
        }
    }

    async fn require_remote(&self) -> Result<Arc<dyn RemoteRun>, RunError> {
        self.bound_remote()
            .await
            .ok_or_else(|| RunError::bad_state("run is not bound to a worker"))
    }

    async fn start(&self) -> Result<Status, RunError> {
        self.ensure_operating_capacity().await?;
        let remote = self.ensure_remote("starting the run").await?;

        let (launch, launched) = {
            let state = self.state();
            (self.launch_request(&state), state.launched)
        };
        if !launched {
            remote
                .attach_usage_sink(Arc::clone(&self.services.usage))
                .await?;
            remote.initialize(launch).await?;
            self.state().launched = true;
        }

        let delegate = self.security_delegate()?;
        if !delegate.is_sealed() {
            let context = remote.security_context().await?;
            delegate.convey(context.as_ref()).await?;
        }

        remote.start().await?;
        let mut state = self.state();
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        Ok(Status::Operating)
    }

    fn launch_request(&self, state: &RunState) -> LaunchRequest {
        LaunchRequest {
            command: self.settings.engine_command.clone(),
            workflow: self.workflow.document.clone(),
            working_directory: self.settings.working_directory_root.join(self.id.to_string()),
            inputs: state.inputs.to_vec(),
            input_aggregate: state.input_aggregate.clone(),
            output_capture: state.output_capture.clone(),
            environment: self.settings.environment.clone(),
            run_id: self.id,
            extra_args: self.settings.extra_args.clone(),
            generate_provenance: state.generate_provenance,
        }
    }

    /// Bind this run to a remote run in its owner's worker, provisioning one
    /// if needed. Gives up with `StillWorking` after the start budget; the
    /// provisioning itself keeps going and the next call picks it up.
    async fn ensure_remote(&self, operation: &str) -> Result<Arc<dyn RemoteRun>, RunError> {
        if let Some(remote) = self.bound_remote().await {
            return Ok(remote);
        }

        let mut provisioning = self.provisioning.lock().await;
        if let Some(remote) = self.bound_remote().await {
            return Ok(remote);
        }
        // Nothing may be provisioned for a run that is already torn down.
        self.state().require_live(self.id)?;

        let task = provisioning.get_or_insert_with(|| self.spawn_provisioning());
        let joined = match timeout(self.settings.start_budget, task).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!(
                    run_id = %self.id,
                    local_user = %self.settings.local_user,
                    budget_secs = self.settings.start_budget.as_secs_f64(),
                    "Worker still provisioning"
                );
                return Err(RunError::still_working(operation));
            }
        };
        *provisioning = None;

        let remote = joined
            .map_err(|e| RunError::implementation(format!("worker provisioning task failed: {e}")))??;
        *self.remote.write().await = Some(Arc::clone(&remote));
        info!(
            run_id = %self.id,
            local_user = %self.settings.local_user,
            "Run bound to worker"
        );
        Ok(remote)
    }

    fn spawn_provisioning(&self) -> JoinHandle<Result<Arc<dyn RemoteRun>, RunError>> {
        let supervisor = Arc::clone(&self.services.supervisor);
        let local_user = self.settings.local_user.clone();
        let request = CreateRequest {
            workflow: self.workflow.document.clone(),
            creator: self.owner.clone(),
            usage_sink: Some(Arc::clone(&self.services.usage)),
            run_id: Some(self.id),
        };
        debug!(run_id = %self.id, local_user = %local_user, "Provisioning remote run");
        tokio::spawn(async move { supervisor.create_remote_run(&local_user, request).await })
    }

    /// The run's working directory on the worker. Binds the run to a worker
    /// without starting it.
    pub async fn working_directory(&self) -> Result<WorkingDirectory, RunError> {
        self.state().require_live(self.id)?;
        let remote = self.ensure_remote("opening the working directory").await?;
        let directory = remote.working_directory().await?;
        Ok(WorkingDirectory {
            inner: directory,
            attempts: self.settings.remote_call_attempts,
        })
    }

    fn usage_record(&self) -> UsageRecord {
        let state = self.state();
        UsageRecord {
            run_id: self.id,
            owner: self.owner.clone(),
            local_user: self.settings.local_user.clone(),
            workflow: self.workflow.reference.clone(),
            status: state.lifecycle.effective(),
            created: state.created_at,
            started: state.started_at,
            finished: state.finished_at,
            recorded: Utc::now(),
        }
    }

    /// Release everything this run holds, locally and on the worker. The
    /// security context is always released; a worker failure is reported
    /// after that. Once destroyed, the run refuses every further operation
    /// with `UnknownRun`; destroying it again does nothing.
    pub async fn destroy(&self) -> Result<(), RunError> {
        let _guard = self.transitions.lock().await;
        {
            let mut state = self.state();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
        }

        let pending = self.provisioning.lock().await.take();

        let started = self.state().started_at.is_some();
        if started {
            if let Err(e) = self.services.usage.record(self.usage_record()).await {
                warn!(run_id = %self.id, error = %e, "Failed to record run usage");
            }
        }

        let mut remote = self.remote.write().await.take();
        if remote.is_none() {
            if let Some(pending) = pending {
                remote = self.orphaned_remote(pending).await;
            }
        }
        self.services.security.release(self.security);

        if let Some(remote) = remote {
            remote.destroy().await?;
        }
        info!(run_id = %self.id, owner = %self.owner, "Run destroyed");
        Ok(())
    }

    /// Outcome of a provisioning task nobody collected. The worker may
    /// already hold a remote run for it, so the task is awaited rather than
    /// aborted.
    async fn orphaned_remote(
        &self,
        pending: JoinHandle<Result<Arc<dyn RemoteRun>, RunError>>,
    ) -> Option<Arc<dyn RemoteRun>> {
        if !pending.is_finished() {
            debug!(run_id = %self.id, "Waiting for in-flight provisioning before teardown");
        }
        match pending.await {
            Ok(Ok(remote)) => Some(remote),
            Ok(Err(e)) => {
                debug!(run_id = %self.id, error = %e, "Provisioning failed; nothing to tear down");
                None
            }
            Err(e) => {
                warn!(run_id = %self.id, error = %e, "Provisioning task ended abnormally");
                None
            }
        }
    }
}

/// A run's working directory with every path checked before it reaches the
/// worker.
#[derive(Clone)]
pub struct WorkingDirectory {
    inner: Arc<dyn Directory>,
    attempts: u32,
}

impl WorkingDirectory {
    fn check(path: &str) -> Result<(), RunError> {
        if path.is_empty() {
            // The directory itself.
            return Ok(());
        }
        validate_filename(path)
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>, RunError> {
        Self::check(path)?;
        retry_remote(self.attempts, || self.inner.list(path)).await
    }

    pub async fn make_subdirectory(&self, parent: &str, name: &str) -> Result<String, RunError> {
        Self::check(parent)?;
        validate_filename(name)?;
        Ok(self.inner.make_subdirectory(parent, name).await?)
    }

    pub async fn make_empty_file(&self, parent: &str, name: &str) -> Result<String, RunError> {
        Self::check(parent)?;
        validate_filename(name)?;
        Ok(self.inner.make_empty_file(parent, name).await?)
    }

    pub async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, RunError> {
        validate_filename(path)?;
        retry_remote(self.attempts, || self.inner.read(path, offset, length)).await
    }

    pub async fn overwrite(&self, path: &str, contents: &[u8]) -> Result<(), RunError> {
        validate_filename(path)?;
        Ok(self.inner.overwrite(path, contents).await?)
    }

    pub async fn append(&self, path: &str, contents: &[u8]) -> Result<(), RunError> {
        validate_filename(path)?;
        Ok(self.inner.append(path, contents).await?)
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<(), RunError> {
        validate_filename(from)?;
        validate_filename(to)?;
        Ok(self.inner.copy(from, to).await?)
    }

    pub async fn destroy(&self, path: &str) -> Result<(), RunError> {
        validate_filename(path)?;
        Ok(self.inner.destroy(path).await?)
    }

    pub async fn zip_snapshot(&self, path: &str) -> Result<Vec<u8>, RunError> {
        Self::check(path)?;
        retry_remote(self.attempts, || self.inner.zip_snapshot(path)).await
    }
}

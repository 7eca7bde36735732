//! Hand-written worker-side fakes shared by the scenario tests.
//!
//! `FakeLauncher` plays the forker: every launch builds a `FakeFactory` and
//! binds it into the shared `InMemoryRegistry` after a delay, the way a real
//! worker subprocess registers itself once it has started.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use run_control::config::RunControlConfig;
use run_control::filesystem::{Directory, DirectoryEntry};
use run_control::security::{RemoteSecurityContext, SecurityMaterial};
use run_control::usage::{UsageRecordSink, UsageRecorder};
use run_control::worker::{
    CreateRequest, InMemoryRegistry, InteractionEndpoint, LaunchRequest, RemoteRun,
    RemoteRunFactory, WorkerLauncher, WorkerRegistry,
};
use run_control::{ControlPlane, RemoteError, RunError, Status};

/// Configuration tuned for fast tests.
pub fn test_config() -> RunControlConfig {
    let mut config = RunControlConfig::default();
    config.worker.registry_poll_interval_ms = 10;
    config.worker.registry_deadline_secs = 2;
    config.worker.shutdown_grace_ms = 0;
    config.worker.forker_exit_wait_secs = 1;
    config.runs.start_budget_secs = 5;
    config.runs.default_lifetime_minutes = 60;
    config.observability.json_logs = false;
    config
}

pub struct TestPlane {
    pub control: Arc<ControlPlane>,
    pub launcher: Arc<FakeLauncher>,
    pub registry: Arc<InMemoryRegistry>,
    pub usage: Arc<UsageRecorder>,
}

pub fn control_plane(config: RunControlConfig) -> TestPlane {
    control_plane_with_delay(config, Duration::from_millis(5))
}

pub fn control_plane_with_delay(config: RunControlConfig, register_after: Duration) -> TestPlane {
    let registry = Arc::new(InMemoryRegistry::new());
    let launcher = Arc::new(FakeLauncher::new(Arc::clone(&registry), register_after));
    let usage = Arc::new(UsageRecorder::new(&config.usage));
    let control = Arc::new(
        ControlPlane::with_usage_sink(
            config,
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            Arc::clone(&registry) as Arc<dyn WorkerRegistry>,
            Arc::clone(&usage) as Arc<dyn UsageRecordSink>,
        )
        .expect("control plane builds from test config"),
    );
    TestPlane {
        control,
        launcher,
        registry,
        usage,
    }
}

/// Stands in for the forker process.
pub struct FakeLauncher {
    registry: Arc<InMemoryRegistry>,
    register_after: Duration,
    registers: AtomicBool,
    launched: Mutex<Vec<(String, String)>>,
    factories: Mutex<HashMap<String, Arc<FakeFactory>>>,
    exited: Mutex<HashMap<String, i32>>,
    forgotten: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(registry: Arc<InMemoryRegistry>, register_after: Duration) -> Self {
        Self {
            registry,
            register_after,
            registers: AtomicBool::new(true),
            launched: Mutex::new(Vec::new()),
            factories: Mutex::new(HashMap::new()),
            exited: Mutex::new(HashMap::new()),
            forgotten: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Workers launched from now on never show up in the registry.
    pub fn never_register(&self) {
        self.registers.store(false, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<(String, String)> {
        self.launched.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn factory(&self, registration_name: &str) -> Option<Arc<FakeFactory>> {
        self.factories.lock().unwrap().get(registration_name).cloned()
    }

    /// Factory of the most recent worker launched for `local_user`.
    pub fn factory_for(&self, local_user: &str) -> Option<Arc<FakeFactory>> {
        let name = self
            .launched()
            .into_iter()
            .rev()
            .find(|(user, _)| user == local_user)
            .map(|(_, name)| name)?;
        self.factory(&name)
    }

    pub fn mark_exited(&self, registration_name: &str, code: i32) {
        self.exited
            .lock()
            .unwrap()
            .insert(registration_name.to_string(), code);
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, local_user: &str, registration_name: &str) -> Result<(), RunError> {
        self.launched
            .lock()
            .unwrap()
            .push((local_user.to_string(), registration_name.to_string()));

        let factory = Arc::new(FakeFactory::new(local_user));
        self.factories
            .lock()
            .unwrap()
            .insert(registration_name.to_string(), Arc::clone(&factory));

        if self.registers.load(Ordering::SeqCst) {
            let registry = Arc::clone(&self.registry);
            let name = registration_name.to_string();
            let delay = self.register_after;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry
                    .bind(&name, factory as Arc<dyn RemoteRunFactory>)
                    .await
                    .expect("fresh registration name");
            });
        }
        Ok(())
    }

    fn exit_code(&self, registration_name: &str) -> Option<i32> {
        self.exited.lock().unwrap().get(registration_name).copied()
    }

    fn forget(&self, registration_name: &str) {
        self.exited.lock().unwrap().remove(registration_name);
        self.forgotten
            .lock()
            .unwrap()
            .push(registration_name.to_string());
    }

    async fn shutdown(&self, _wait: Duration) -> Option<i32> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Some(0)
    }
}

/// What a worker subprocess publishes.
pub struct FakeFactory {
    pub local_user: String,
    operating: Arc<AtomicUsize>,
    runs: Mutex<Vec<Arc<FakeRemoteRun>>>,
    unreachable: AtomicBool,
    failing_creates: AtomicU32,
    creates: AtomicUsize,
    shutdowns: AtomicUsize,
    interaction: Mutex<Option<InteractionEndpoint>>,
}

impl FakeFactory {
    pub fn new(local_user: &str) -> Self {
        Self {
            local_user: local_user.to_string(),
            operating: Arc::new(AtomicUsize::new(0)),
            runs: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            failing_creates: AtomicU32::new(0),
            creates: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            interaction: Mutex::new(None),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `count` creations fail as if the worker were unreachable.
    pub fn fail_next_creates(&self, count: u32) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<Arc<FakeRemoteRun>> {
        self.runs.lock().unwrap().clone()
    }

    pub fn last_run(&self) -> Option<Arc<FakeRemoteRun>> {
        self.runs.lock().unwrap().last().cloned()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn operating(&self) -> usize {
        self.operating.load(Ordering::SeqCst)
    }

    pub fn interaction(&self) -> Option<InteractionEndpoint> {
        self.interaction.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RemoteError::Unreachable(format!(
                "worker for {} is gone",
                self.local_user
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteRunFactory for FakeFactory {
    async fn create(&self, request: CreateRequest) -> Result<Arc<dyn RemoteRun>, RemoteError> {
        self.check_reachable()?;
        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(RemoteError::Unreachable("connection reset".to_string()));
        }

        self.creates.fetch_add(1, Ordering::SeqCst);
        let run = Arc::new(FakeRemoteRun::new(request, Arc::clone(&self.operating)));
        self.runs.lock().unwrap().push(Arc::clone(&run));
        Ok(run)
    }

    async fn shutdown(&self) -> Result<(), RemoteError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn count_operating_runs(&self) -> Result<usize, RemoteError> {
        self.check_reachable()?;
        Ok(self.operating())
    }

    async fn configure_interaction(&self, endpoint: &InteractionEndpoint) -> Result<(), RemoteError> {
        *self.interaction.lock().unwrap() = Some(endpoint.clone());
        Ok(())
    }
}

/// One run inside a fake worker.
pub struct FakeRemoteRun {
    pub creator: String,
    pub request_run_id: Option<run_control::RunId>,
    status: Mutex<Status>,
    operating: Arc<AtomicUsize>,
    calls: Mutex<Vec<String>>,
    launch: Mutex<Option<LaunchRequest>>,
    usage_attached: AtomicBool,
    fail_destroy: AtomicBool,
    pub security: Arc<FakeSecurityContext>,
    pub directory: Arc<FakeDirectory>,
}

impl FakeRemoteRun {
    fn new(request: CreateRequest, operating: Arc<AtomicUsize>) -> Self {
        Self {
            creator: request.creator,
            request_run_id: request.run_id,
            status: Mutex::new(Status::Initialized),
            operating,
            calls: Mutex::new(Vec::new()),
            launch: Mutex::new(None),
            usage_attached: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            security: Arc::new(FakeSecurityContext::default()),
            directory: Arc::new(FakeDirectory::default()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn launch_request(&self) -> Option<LaunchRequest> {
        self.launch.lock().unwrap().clone()
    }

    pub fn usage_attached(&self) -> bool {
        self.usage_attached.load(Ordering::SeqCst)
    }

    pub fn fail_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    /// The engine completes on its own.
    pub fn complete(&self) {
        self.transition(Status::Finished);
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn transition(&self, to: Status) {
        let mut status = self.status.lock().unwrap();
        let was_operating = *status == Status::Operating;
        let now_operating = to == Status::Operating;
        if was_operating && !now_operating {
            self.operating.fetch_sub(1, Ordering::SeqCst);
        } else if !was_operating && now_operating {
            self.operating.fetch_add(1, Ordering::SeqCst);
        }
        *status = to;
    }
}

#[async_trait]
impl RemoteRun for FakeRemoteRun {
    async fn initialize(&self, request: LaunchRequest) -> Result<(), RemoteError> {
        self.record("initialize");
        *self.launch.lock().unwrap() = Some(request);
        Ok(())
    }

    async fn start(&self) -> Result<(), RemoteError> {
        self.record("start");
        self.transition(Status::Operating);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RemoteError> {
        self.record("stop");
        self.transition(Status::Stopped);
        Ok(())
    }

    async fn kill(&self) -> Result<(), RemoteError> {
        self.record("kill");
        self.transition(Status::Finished);
        Ok(())
    }

    async fn status(&self) -> Result<Status, RemoteError> {
        Ok(*self.status.lock().unwrap())
    }

    async fn attach_usage_sink(&self, _sink: Arc<dyn UsageRecordSink>) -> Result<(), RemoteError> {
        self.record("attach_usage_sink");
        self.usage_attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn io_property(&self, name: &str) -> Result<String, RemoteError> {
        match name {
            "stdout" => Ok("hello from the engine\n".to_string()),
            "stderr" => Ok(String::new()),
            "exitcode" => Ok("0".to_string()),
            other => Err(RemoteError::Fault(format!("no io property {other}"))),
        }
    }

    async fn working_directory(&self) -> Result<Arc<dyn Directory>, RemoteError> {
        Ok(Arc::clone(&self.directory) as Arc<dyn Directory>)
    }

    async fn security_context(&self) -> Result<Arc<dyn RemoteSecurityContext>, RemoteError> {
        Ok(Arc::clone(&self.security) as Arc<dyn RemoteSecurityContext>)
    }

    async fn destroy(&self) -> Result<(), RemoteError> {
        self.record("destroy");
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("worker went away".to_string()));
        }
        if *self.status.lock().unwrap() == Status::Operating {
            self.transition(Status::Finished);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSecurityContext {
    installed: Mutex<Vec<SecurityMaterial>>,
}

impl FakeSecurityContext {
    pub fn installed(&self) -> Vec<SecurityMaterial> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSecurityContext for FakeSecurityContext {
    async fn install(&self, material: SecurityMaterial) -> Result<(), RemoteError> {
        self.installed.lock().unwrap().push(material);
        Ok(())
    }
}

/// Flat in-memory file store.
#[derive(Default)]
pub struct FakeDirectory {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>, RemoteError> {
        let files = self.files.lock().unwrap();
        let mut entries: Vec<DirectoryEntry> = files
            .iter()
            .filter(|(name, _)| path.is_empty() || name.starts_with(&format!("{path}/")))
            .map(|(name, contents)| DirectoryEntry::File {
                name: name.rsplit('/').next().unwrap_or(name).to_string(),
                path: name.clone(),
                size: contents.len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(entries)
    }

    async fn make_subdirectory(&self, parent: &str, name: &str) -> Result<String, RemoteError> {
        Ok(join(parent, name))
    }

    async fn make_empty_file(&self, parent: &str, name: &str) -> Result<String, RemoteError> {
        let path = join(parent, name);
        self.files.lock().unwrap().insert(path.clone(), Vec::new());
        Ok(path)
    }

    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, RemoteError> {
        let files = self.files.lock().unwrap();
        let contents = files
            .get(path)
            .ok_or_else(|| RemoteError::Fault(format!("{path} not found")))?;
        let start = (offset as usize).min(contents.len());
        let end = start.saturating_add(length as usize).min(contents.len());
        Ok(contents[start..end].to_vec())
    }

    async fn overwrite(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn append(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(contents);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let mut files = self.files.lock().unwrap();
        let contents = files
            .get(from)
            .cloned()
            .ok_or_else(|| RemoteError::Fault(format!("{from} not found")))?;
        files.insert(to.to_string(), contents);
        Ok(())
    }

    async fn destroy(&self, path: &str) -> Result<(), RemoteError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn zip_snapshot(&self, _path: &str) -> Result<Vec<u8>, RemoteError> {
        Ok(b"PK\x05\x06".to_vec())
    }
}

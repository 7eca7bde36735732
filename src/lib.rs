// Run Control Library - control plane for workflow runs executed by per-user workers
// This exposes the core components for testing and integration

pub mod config;
pub mod control;
pub mod errors;
pub mod filesystem;
pub mod identity;
pub mod observability;
pub mod policy;
pub mod run;
pub mod run_registry;
pub mod security;
pub mod shutdown;
pub mod telemetry;
pub mod usage;
pub mod worker;

// Re-export key types for easy access
pub use config::{config, init_config, RunControlConfig};
pub use control::ControlPlane;
pub use errors::{RemoteError, RunError};
pub use filesystem::{Directory, DirectoryEntry};
pub use identity::{Identity, LocalUserMapper};
pub use observability::{metrics, ControlPlaneMetrics, ControlPlaneStats, OperationTimer};
pub use policy::{Policy, PolicyLimits, SimplePolicy};
pub use run::{
    validate_filename, InputBinding, InputSource, Lifecycle, Listener, Run, RunId, RunServices,
    RunSettings, Status, TransitionPlan, Workflow, WorkingDirectory,
};
pub use run_registry::{RunRegistry, SweepReport};
pub use security::{
    Credential, DelegateHandle, Permission, RemoteSecurityContext, SecurityContextFactory,
    SecurityDelegate, SecurityMaterial, TrustedIdentity,
};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_run_span, init_telemetry, shutdown_telemetry};
pub use usage::{UsageRecord, UsageRecordSink, UsageRecorder};
pub use worker::{
    CreateRequest, ForkingLauncher, InMemoryRegistry, InteractionEndpoint, LaunchRequest,
    RemoteRun, RemoteRunFactory, RemoteWorkerConnection, SupervisorSettings, WorkerLauncher,
    WorkerProcessHandle, WorkerProcessSupervisor, WorkerRegistry,
};

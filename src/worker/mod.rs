//! Worker side of the control plane.
//!
//! Each local account gets at most one worker subprocess. The subprocess
//! publishes a [`RemoteRunFactory`] under a registration name in a
//! [`WorkerRegistry`]; the supervisor discovers it there and asks it for
//! [`RemoteRun`] handles, one per run.

pub mod connection;
pub mod launcher;
pub mod registry;
pub mod supervisor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::RemoteError;
use crate::filesystem::Directory;
use crate::run::{InputBinding, RunId, Status};
use crate::security::RemoteSecurityContext;
use crate::usage::UsageRecordSink;

pub use connection::{retry_remote, RemoteWorkerConnection};
pub use launcher::{ForkingLauncher, WorkerLauncher};
pub use registry::{InMemoryRegistry, WorkerRegistry};
pub use supervisor::{SupervisorSettings, WorkerProcessHandle, WorkerProcessSupervisor};

/// Everything a worker needs to execute one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub command: String,
    pub workflow: Vec<u8>,
    pub working_directory: PathBuf,
    pub inputs: Vec<InputBinding>,
    pub input_aggregate: Option<String>,
    pub output_capture: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub run_id: RunId,
    pub extra_args: Vec<String>,
    pub generate_provenance: bool,
}

/// Interaction service endpoint a worker advertises to running workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionEndpoint {
    pub host: String,
    pub port: u16,
    pub webdav_path: String,
    pub feed_path: String,
}

/// Handle to one run living inside a worker subprocess.
#[async_trait]
pub trait RemoteRun: Send + Sync {
    async fn initialize(&self, request: LaunchRequest) -> Result<(), RemoteError>;

    async fn start(&self) -> Result<(), RemoteError>;

    async fn stop(&self) -> Result<(), RemoteError>;

    async fn kill(&self) -> Result<(), RemoteError>;

    async fn status(&self) -> Result<Status, RemoteError>;

    async fn attach_usage_sink(&self, sink: Arc<dyn UsageRecordSink>) -> Result<(), RemoteError>;

    /// `stdout`, `stderr` or `exitcode` of the engine process.
    async fn io_property(&self, name: &str) -> Result<String, RemoteError>;

    async fn working_directory(&self) -> Result<Arc<dyn Directory>, RemoteError>;

    async fn security_context(&self) -> Result<Arc<dyn RemoteSecurityContext>, RemoteError>;

    /// Release everything the worker holds for this run.
    async fn destroy(&self) -> Result<(), RemoteError>;
}

#[derive(Clone)]
pub struct CreateRequest {
    pub workflow: Vec<u8>,
    pub creator: String,
    pub usage_sink: Option<Arc<dyn UsageRecordSink>>,
    pub run_id: Option<RunId>,
}

impl std::fmt::Debug for CreateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateRequest")
            .field("workflow_bytes", &self.workflow.len())
            .field("creator", &self.creator)
            .field("usage_sink", &self.usage_sink.is_some())
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Published by a worker subprocess once it has initialised.
#[async_trait]
pub trait RemoteRunFactory: Send + Sync {
    async fn create(&self, request: CreateRequest) -> Result<Arc<dyn RemoteRun>, RemoteError>;

    async fn shutdown(&self) -> Result<(), RemoteError>;

    async fn count_operating_runs(&self) -> Result<usize, RemoteError>;

    async fn configure_interaction(&self, endpoint: &InteractionEndpoint) -> Result<(), RemoteError>;
}

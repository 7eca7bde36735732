//! Admission and authorisation decisions.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::errors::RunError;
use crate::identity::Identity;
use crate::run::{Run, Workflow};
use crate::run_registry::RunRegistry;
use crate::security::Permission;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLimits {
    pub max_runs: usize,
    /// `None` leaves only the global cap.
    pub max_runs_per_user: Option<usize>,
    pub operating_limit: usize,
}

impl From<&PolicyConfig> for PolicyLimits {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            max_runs: config.max_runs,
            max_runs_per_user: config.max_runs_per_user,
            operating_limit: config.operating_limit,
        }
    }
}

pub trait Policy: Send + Sync {
    fn permit_create(&self, identity: &Identity, workflow: &Workflow) -> Result<(), RunError>;

    fn permit_destroy(&self, identity: &Identity, run: &Run) -> Result<(), RunError>;

    fn permit_update(&self, identity: &Identity, run: &Run) -> Result<(), RunError>;

    /// Never fails; decides visibility.
    fn permit_access(&self, identity: &Identity, run: &Run) -> bool;

    fn max_runs(&self) -> usize;

    fn max_runs_for(&self, identity: &Identity) -> usize;

    fn operating_limit(&self) -> usize;
}

/// Limits from configuration, per-run permissions from each run's security
/// delegate, and a fixed set of administrators who may do anything.
pub struct SimplePolicy {
    limits: PolicyLimits,
    admins: HashSet<String>,
    permitted_workflows: HashSet<String>,
    registry: Arc<RunRegistry>,
}

impl SimplePolicy {
    pub fn new(config: &PolicyConfig, registry: Arc<RunRegistry>) -> Self {
        Self {
            limits: PolicyLimits::from(config),
            admins: config.admins.iter().cloned().collect(),
            permitted_workflows: config.permitted_workflows.iter().cloned().collect(),
            registry,
        }
    }

    pub fn limits(&self) -> &PolicyLimits {
        &self.limits
    }

    fn is_admin(&self, identity: &Identity) -> bool {
        identity.name().is_some_and(|name| self.admins.contains(name))
    }

    fn require(
        &self,
        identity: &Identity,
        run: &Run,
        needed: Permission,
        action: &str,
    ) -> Result<(), RunError> {
        if self.is_admin(identity) || run.permits(identity, needed) {
            Ok(())
        } else {
            Err(RunError::admission_denied(format!(
                "{identity} may not {action} run {}",
                run.id()
            )))
        }
    }
}

impl Policy for SimplePolicy {
    fn permit_create(&self, identity: &Identity, workflow: &Workflow) -> Result<(), RunError> {
        if identity.is_anonymous() {
            return Err(RunError::admission_denied("anonymous callers cannot create runs"));
        }

        if !self.permitted_workflows.is_empty()
            && !self.permitted_workflows.contains(&workflow.reference)
        {
            return Err(RunError::admission_denied(format!(
                "workflow '{}' is not permitted on this server",
                workflow.reference
            )));
        }

        let limit = self.max_runs_for(identity);
        let current = self.registry.list_runs(identity, self).len();
        debug!(identity = %identity, current, limit, "Checking run admission");
        if current >= limit {
            return Err(RunError::admission_denied(format!(
                "run limit of {limit} reached"
            )));
        }
        Ok(())
    }

    fn permit_destroy(&self, identity: &Identity, run: &Run) -> Result<(), RunError> {
        self.require(identity, run, Permission::Destroy, "destroy")
    }

    fn permit_update(&self, identity: &Identity, run: &Run) -> Result<(), RunError> {
        self.require(identity, run, Permission::Update, "update")
    }

    fn permit_access(&self, identity: &Identity, run: &Run) -> bool {
        self.is_admin(identity) || run.permits(identity, Permission::Read)
    }

    fn max_runs(&self) -> usize {
        self.limits.max_runs
    }

    fn max_runs_for(&self, identity: &Identity) -> usize {
        match (identity, self.limits.max_runs_per_user) {
            (Identity::User(_), Some(per_user)) => per_user,
            _ => self.limits.max_runs,
        }
    }

    fn operating_limit(&self) -> usize {
        self.limits.operating_limit
    }
}

//! Run lifecycle states and the pure transition rules.
//!
//! The locally held status of a run is only advisory: the worker may finish a
//! run on its own at any moment. `Lifecycle` therefore keeps what we asked for
//! (`intended`) apart from what the worker last told us (`observed`), and
//! `merge` folds the two into the status callers see. `plan_transition`
//! decides what a status request means without touching any worker, so every
//! rule here is testable in isolation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// No worker resources committed; bindings still mutable.
    Initialized,
    Operating,
    /// Paused with resources retained.
    Stopped,
    /// Execution ceased; artifacts retained.
    Finished,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Initialized,
        Status::Operating,
        Status::Stopped,
        Status::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initialized => "Initialized",
            Status::Operating => "Operating",
            Status::Stopped => "Stopped",
            Status::Finished => "Finished",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RunError::invalid_argument(format!("'{s}' is not a run status")))
    }
}

/// What has to happen for a status request to be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    /// Nothing to do; the run already is (or has moved past to) this status.
    NoOp(Status),
    /// Initialized → Operating: provision the worker and start execution.
    Start,
    /// Operating → Stopped.
    Pause,
    /// Stopped → Operating.
    Resume,
    /// Operating → Finished on request.
    Cancel,
    /// Initialized → Finished for a run that never started.
    Abandon,
}

impl TransitionPlan {
    pub fn target(&self) -> Status {
        match self {
            TransitionPlan::NoOp(status) => *status,
            TransitionPlan::Start | TransitionPlan::Resume => Status::Operating,
            TransitionPlan::Pause => Status::Stopped,
            TransitionPlan::Cancel | TransitionPlan::Abandon => Status::Finished,
        }
    }

    pub fn needs_worker(&self) -> bool {
        !matches!(self, TransitionPlan::NoOp(_) | TransitionPlan::Abandon)
    }
}

/// Intended status plus the last status the worker reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub intended: Status,
    pub observed: Option<Status>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            intended: Status::Initialized,
            observed: None,
        }
    }
}

impl Lifecycle {
    pub fn effective(&self) -> Status {
        merge(self.intended, self.observed)
    }

    /// Record a worker report and return the merged status.
    pub fn observe(&mut self, reported: Status) -> Status {
        self.observed = Some(reported);
        if reported == Status::Finished {
            self.intended = Status::Finished;
        }
        self.effective()
    }

    pub fn settle(&mut self, status: Status) {
        self.intended = status;
        if self.observed.is_some() {
            self.observed = Some(status);
        }
    }

    pub fn plan(&self, requested: Status) -> Result<TransitionPlan, RunError> {
        plan_transition(self.intended, self.observed, requested)
    }
}

/// Fold the worker's report into the locally intended status.
///
/// A worker-reported `Finished` always wins. Otherwise the worker's view wins
/// once execution has been handed to it; before that the worker has nothing
/// meaningful to say and the local intent stands.
pub fn merge(intended: Status, observed: Option<Status>) -> Status {
    match (intended, observed) {
        (_, Some(Status::Finished)) => Status::Finished,
        (Status::Finished, _) => Status::Finished,
        (Status::Initialized, _) => Status::Initialized,
        (_, Some(Status::Initialized)) | (_, None) => intended,
        (_, Some(reported)) => reported,
    }
}

/// Decide what `requested` means for a run whose status is `intended` locally
/// and `observed` remotely.
pub fn plan_transition(
    intended: Status,
    observed: Option<Status>,
    requested: Status,
) -> Result<TransitionPlan, RunError> {
    let current = merge(intended, observed);

    if current == requested {
        return Ok(TransitionPlan::NoOp(current));
    }

    // Completion can land between the caller's last look and this request.
    if observed == Some(Status::Finished)
        && matches!(requested, Status::Operating | Status::Stopped)
    {
        return Ok(TransitionPlan::NoOp(Status::Finished));
    }

    match (current, requested) {
        (Status::Initialized, Status::Operating) => Ok(TransitionPlan::Start),
        (Status::Initialized, Status::Finished) => Ok(TransitionPlan::Abandon),
        (Status::Operating, Status::Stopped) => Ok(TransitionPlan::Pause),
        (Status::Operating, Status::Finished) => Ok(TransitionPlan::Cancel),
        (Status::Stopped, Status::Operating) => Ok(TransitionPlan::Resume),
        (from, to) => Err(RunError::IllegalTransition { from, to }),
    }
}

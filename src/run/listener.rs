//! Observers attached to a run.
//!
//! Every run carries an `io` listener from creation; further listeners are
//! built by kind through [`ListenerFactory`] while the run is still
//! Initialized.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use super::{RemoteSlot, Status};
use crate::errors::RunError;
use crate::worker::retry_remote;

#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &str;

    fn configuration(&self) -> String;

    fn property_names(&self) -> Vec<String>;

    async fn property(&self, name: &str) -> Result<String, RunError>;

    async fn set_property(&self, name: &str, value: &str) -> Result<(), RunError>;

    /// Called after the run's status changed.
    fn status_changed(&self, _from: Status, _to: Status) {}
}

fn unknown_property(listener: &str, property: &str) -> RunError {
    RunError::invalid_argument(format!("listener '{listener}' has no property '{property}'"))
}

/// Engine standard streams and exit code, read from the worker once the run
/// is bound to one.
pub struct IoListener {
    remote: RemoteSlot,
    attempts: u32,
}

impl IoListener {
    pub const PROPERTIES: [&'static str; 3] = ["stdout", "stderr", "exitcode"];

    pub fn new(remote: RemoteSlot, attempts: u32) -> Self {
        Self { remote, attempts }
    }
}

#[async_trait]
impl Listener for IoListener {
    fn name(&self) -> &str {
        "io"
    }

    fn kind(&self) -> &str {
        "io"
    }

    fn configuration(&self) -> String {
        String::new()
    }

    fn property_names(&self) -> Vec<String> {
        Self::PROPERTIES.iter().map(|p| p.to_string()).collect()
    }

    async fn property(&self, name: &str) -> Result<String, RunError> {
        if !Self::PROPERTIES.contains(&name) {
            return Err(unknown_property(self.name(), name));
        }
        let Some(remote) = self.remote.read().await.clone() else {
            // Nothing has run yet.
            return Ok(String::new());
        };
        retry_remote(self.attempts, || remote.io_property(name)).await
    }

    async fn set_property(&self, name: &str, _value: &str) -> Result<(), RunError> {
        if Self::PROPERTIES.contains(&name) {
            Err(RunError::bad_state(format!("io property '{name}' is read-only")))
        } else {
            Err(unknown_property(self.name(), name))
        }
    }
}

/// Keeps the most recent status changes of the run.
pub struct TransitionLogListener {
    name: String,
    inner: Mutex<TransitionLog>,
}

struct TransitionLog {
    capacity: usize,
    entries: VecDeque<String>,
}

impl TransitionLogListener {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(TransitionLog {
                capacity: capacity.max(1),
                entries: VecDeque::new(),
            }),
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn parse_capacity(value: &str) -> Result<usize, RunError> {
        match value.trim().parse::<usize>() {
            Ok(capacity) if capacity > 0 => Ok(capacity),
            _ => Err(RunError::invalid_argument(format!(
                "log capacity must be a positive integer, got '{value}'"
            ))),
        }
    }
}

#[async_trait]
impl Listener for TransitionLogListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "log"
    }

    fn configuration(&self) -> String {
        self.inner
            .lock()
            .map(|log| log.capacity.to_string())
            .unwrap_or_default()
    }

    fn property_names(&self) -> Vec<String> {
        vec!["history".to_string(), "capacity".to_string()]
    }

    async fn property(&self, name: &str) -> Result<String, RunError> {
        match name {
            "history" => Ok(self.history().join("\n")),
            "capacity" => Ok(self.configuration()),
            other => Err(unknown_property(&self.name, other)),
        }
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<(), RunError> {
        match name {
            "capacity" => {
                let capacity = Self::parse_capacity(value)?;
                let mut log = self
                    .inner
                    .lock()
                    .map_err(|_| RunError::implementation("transition log poisoned"))?;
                log.capacity = capacity;
                while log.entries.len() > capacity {
                    log.entries.pop_front();
                }
                Ok(())
            }
            "history" => Err(RunError::bad_state("log history is read-only")),
            other => Err(unknown_property(&self.name, other)),
        }
    }

    fn status_changed(&self, from: Status, to: Status) {
        if let Ok(mut log) = self.inner.lock() {
            if log.entries.len() >= log.capacity {
                log.entries.pop_front();
            }
            log.entries
                .push_back(format!("{} {from} -> {to}", Utc::now().to_rfc3339()));
        }
    }
}

/// Builds listeners by kind name.
pub struct ListenerFactory;

impl ListenerFactory {
    pub const KINDS: [&'static str; 2] = ["io", "log"];

    pub fn create(
        kind: &str,
        configuration: &str,
        remote: &RemoteSlot,
        attempts: u32,
    ) -> Result<Arc<dyn Listener>, RunError> {
        debug!(kind = %kind, "Creating listener");
        match kind {
            "io" => Ok(Arc::new(IoListener::new(Arc::clone(remote), attempts))),
            "log" => {
                let capacity = if configuration.trim().is_empty() {
                    TransitionLogListener::DEFAULT_CAPACITY
                } else {
                    TransitionLogListener::parse_capacity(configuration)?
                };
                Ok(Arc::new(TransitionLogListener::new("log", capacity)))
            }
            other => Err(RunError::invalid_argument(format!(
                "unknown listener kind '{other}'; known kinds: {}",
                Self::KINDS.join(", ")
            ))),
        }
    }
}

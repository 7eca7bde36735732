//! Usage records: one summary per run, produced by the worker and by the run
//! itself when it is torn down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::UsageConfig;
use crate::errors::RemoteError;
use crate::run::{RunId, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: RunId,
    pub owner: String,
    pub local_user: String,
    pub workflow: String,
    pub status: Status,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub recorded: DateTime<Utc>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait UsageRecordSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), RemoteError>;
}

/// Counts records and, when configured, appends them as JSON lines.
#[derive(Debug)]
pub struct UsageRecorder {
    log_path: Option<PathBuf>,
    written: Mutex<()>,
    recorded: AtomicU64,
}

impl UsageRecorder {
    pub fn new(config: &UsageConfig) -> Self {
        Self {
            log_path: config.log_path.clone(),
            written: Mutex::new(()),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn recorded_count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    async fn append(&self, path: &PathBuf, record: &UsageRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let _guard = self.written.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl UsageRecordSink for UsageRecorder {
    async fn record(&self, record: UsageRecord) -> Result<(), RemoteError> {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        debug!(
            run_id = %record.run_id,
            owner = %record.owner,
            status = %record.status,
            "Usage record received"
        );

        if let Some(path) = &self.log_path {
            if let Err(e) = self.append(path, &record).await {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to append usage record"
                );
                return Err(RemoteError::Fault(format!("usage log unavailable: {e}")));
            }
        }
        Ok(())
    }
}

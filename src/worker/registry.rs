use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::RemoteRunFactory;
use crate::errors::RemoteError;

/// Shared directory in which worker subprocesses publish their factories.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<Arc<dyn RemoteRunFactory>>, RemoteError>;

    async fn bind(&self, name: &str, factory: Arc<dyn RemoteRunFactory>) -> Result<(), RemoteError>;

    async fn unbind(&self, name: &str) -> Result<(), RemoteError>;

    async fn names(&self) -> Result<Vec<String>, RemoteError>;
}

/// Registry for workers hosted in the same address space.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<String, Arc<dyn RemoteRunFactory>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryRegistry {
    async fn lookup(&self, name: &str) -> Result<Option<Arc<dyn RemoteRunFactory>>, RemoteError> {
        Ok(self.entries.read().await.get(name).cloned())
    }

    async fn bind(&self, name: &str, factory: Arc<dyn RemoteRunFactory>) -> Result<(), RemoteError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(RemoteError::Fault(format!("'{name}' is already bound")));
        }
        entries.insert(name.to_string(), factory);
        debug!(registration_name = %name, "Worker factory bound");
        Ok(())
    }

    async fn unbind(&self, name: &str) -> Result<(), RemoteError> {
        self.entries.write().await.remove(name);
        debug!(registration_name = %name, "Worker factory unbound");
        Ok(())
    }

    async fn names(&self) -> Result<Vec<String>, RemoteError> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// # Memory Config Store
//
// In-memory implementation of ConfigStore.
//
// Nothing survives a restart: the next start is a first boot with safe
// defaults. Useful for tests and for running the agent without a writable
// config location.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::config::ConnectConfig;
use crate::traits::ConfigStore;
use crate::Error;

/// In-memory config store
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<RwLock<Option<ConnectConfig>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryConfigStore {
    /// Create an empty store (first boot)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a saved configuration
    pub fn with_config(config: ConnectConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(config))),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of saves performed
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Option<ConnectConfig>, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, config: &ConnectConfig) -> Result<(), Error> {
        *self.inner.write().await = Some(config.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

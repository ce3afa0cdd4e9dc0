// # Config Store Trait
//
// Defines the interface for persisting [`ConnectConfig`] between restarts.
//
// ## Implementations
//
// - [`crate::state::MemoryConfigStore`]: in-memory, for tests and ephemeral runs
// - [`crate::state::FileConfigStore`]: JSON file with atomic writes and backup
//
// Stores are dumb persistence: they never decide what to write. Every write
// originates from `Store::update_config`.

use async_trait::async_trait;

use crate::config::ConnectConfig;

/// Trait for config persistence implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the persisted configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Some(config))`: Previously saved configuration
    /// - `Ok(None)`: Nothing saved yet (first boot)
    /// - `Err(Error)`: Storage error
    async fn load(&self) -> Result<Option<ConnectConfig>, crate::Error>;

    /// Save the configuration
    async fn save(&self, config: &ConnectConfig) -> Result<(), crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

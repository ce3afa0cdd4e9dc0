// # File Config Store
//
// File-based implementation of ConfigStore with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: new content goes to `<path>.tmp`, then is renamed over `<path>`
// - Backup: the previous file is copied to `<path>.backup` before each rename
// - Recovery: if `<path>` does not parse, `<path>.backup` is loaded and restored
// - If both are unreadable the agent starts from defaults (remote access off)
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "config": {
//     "remote_access": {
//       "wan_access_enabled": false,
//       "wan_port": 8443,
//       "upnp_enabled": false,
//       "remote_access_type": "STATIC"
//     },
//     "api_key": "..."
//   }
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::config::ConnectConfig;
use crate::traits::ConfigStore;
use crate::Error;

/// Config file format version
const CONFIG_FILE_VERSION: &str = "1.0";

/// Serializable config file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ConfigFileFormat {
    version: String,
    config: ConnectConfig,
}

/// Why reading a config file failed
enum ReadFailure {
    /// File exists but its content is not a valid config
    Corrupt(String),
    /// File could not be read at all
    Io(Error),
}

/// File-based config store with crash recovery
///
/// The parsed config is cached; `load()` never touches the disk after
/// construction, `save()` always writes through.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    cached: RwLock<Option<ConnectConfig>>,
}

impl FileConfigStore {
    /// Open (or create) a config store at `path`
    ///
    /// Creates the parent directory if needed and recovers from a corrupted
    /// file using its backup.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::persistence(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let cached = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<Option<ConnectConfig>, Error> {
        match Self::read_file(path).await {
            Ok(config) => Ok(config),
            Err(ReadFailure::Io(e)) => Err(e),
            Err(ReadFailure::Corrupt(reason)) => {
                tracing::warn!(
                    "Config file {} is corrupted ({}). Attempting recovery from backup.",
                    path.display(),
                    reason
                );

                let backup = Self::backup_path(path);
                match Self::read_file(&backup).await {
                    Ok(Some(config)) => {
                        tracing::info!("Recovered config from backup");
                        if let Err(e) = fs::copy(&backup, path).await {
                            tracing::error!("Failed to restore config file from backup: {}", e);
                        }
                        Ok(Some(config))
                    }
                    Ok(None) => {
                        tracing::warn!("No backup file found. Starting with defaults.");
                        Ok(None)
                    }
                    Err(_) => {
                        tracing::error!("Backup also unreadable. Starting with defaults.");
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn read_file(path: &Path) -> Result<Option<ConnectConfig>, ReadFailure> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            ReadFailure::Io(Error::persistence(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: ConfigFileFormat =
            serde_json::from_str(&content).map_err(|e| ReadFailure::Corrupt(e.to_string()))?;

        if file.version != CONFIG_FILE_VERSION {
            tracing::warn!(
                "Config file version mismatch: expected {}, got {}. Loading anyway.",
                CONFIG_FILE_VERSION,
                file.version
            );
        }

        Ok(Some(file.config))
    }

    async fn write_file(&self, config: &ConnectConfig) -> Result<(), Error> {
        let file = ConfigFileFormat {
            version: CONFIG_FILE_VERSION.to_string(),
            config: config.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp_path = self.temp_path();
        {
            let mut temp = fs::File::create(&temp_path).await.map_err(|e| {
                Error::persistence(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            temp.write_all(json.as_bytes()).await?;
            temp.flush().await?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to create config backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::persistence(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Config written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    /// Path of the config file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> Result<Option<ConnectConfig>, Error> {
        Ok(self.cached.read().await.clone())
    }

    async fn save(&self, config: &ConnectConfig) -> Result<(), Error> {
        // Hold the write lock across the disk write so saves never interleave
        let mut cached = self.cached.write().await;
        self.write_file(config).await?;
        *cached = Some(config.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        // Every save writes through
        Ok(())
    }
}

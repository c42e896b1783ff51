use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::{config::Config, config::DeviceConfig, error::Error};

/// The persistence boundary the reload path reads from.
///
/// Implementations own the configurations; the core only reads them. The
/// returned order carries no guarantee beyond being deterministic per call.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The currently enabled device configurations.
    async fn enabled_configurations(&self) -> Result<Vec<DeviceConfig>, Error>;
}

/// A store backed by the RON configuration file.
///
/// The file is re-read on every call, so editing it and hitting the reload
/// endpoint is all a runtime reconfiguration takes.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// A store reading from the given file.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn enabled_configurations(&self) -> Result<Vec<DeviceConfig>, Error> {
        let path = self.path.clone();

        // Config loading does blocking file I/O.
        let config = tokio::task::spawn_blocking(move || Config::new_from_path(path))
            .await
            .map_err(|e| Error::Store(format!("config read task failed: {e}")))??;

        let enabled = config
            .devices
            .into_iter()
            .filter(|device| device.enabled)
            .collect::<Vec<_>>();

        debug!(count = enabled.len(), "read enabled configurations");

        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_a_store_error() {
        let store = FileStore::new("/definitely/not/a/real/path.ron");

        let err = store.enabled_configurations().await.unwrap_err();

        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn disabled_entries_are_filtered_out() {
        let dir = std::env::temp_dir().join("radar-helm-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.ron");
        std::fs::write(&path, Config::example().serialize_pretty()).unwrap();

        let store = FileStore::new(&path);
        let enabled = store.enabled_configurations().await.unwrap();

        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].path, "/dev/ttyUSB0");
    }
}

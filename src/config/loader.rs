use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::file::{load_config, AlertConfig, ConfigError};
use crate::metrics::Metrics;
use crate::notify::SecretStore;

/// Loads the rule file and publishes each accepted configuration
///
/// The evaluation loop picks up a new configuration at its next tick; a
/// rejected reload leaves the current one in place.
pub struct ConfigLoader {
    path: PathBuf,
    secrets: Arc<dyn SecretStore>,
    timeout: Duration,
    metrics: Arc<Metrics>,
    tx: watch::Sender<Arc<AlertConfig>>,
    reloading: Mutex<()>,
}

impl ConfigLoader {
    /// Load the initial configuration. Errors here are fatal to startup.
    pub fn init(
        path: impl AsRef<Path>,
        secrets: Arc<dyn SecretStore>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = load_config(&path, secrets.as_ref(), timeout)?;
        tracing::info!(
            path = %path.display(),
            rules = config.rules.len(),
            receivers = config.receivers.len(),
            "Loaded rule file"
        );

        let (tx, _) = watch::channel(Arc::new(config));
        Ok(Self {
            path,
            secrets,
            timeout,
            metrics,
            tx,
            reloading: Mutex::new(()),
        })
    }

    /// Re-read the rule file and publish it if valid
    pub fn reload(&self) -> Result<Arc<AlertConfig>, ConfigError> {
        let _guard = self.reloading.lock();

        match load_config(&self.path, self.secrets.as_ref(), self.timeout) {
            Ok(config) => {
                let config = Arc::new(config);
                self.tx.send_replace(Arc::clone(&config));
                self.metrics.record_reload(true);
                tracing::info!(
                    path = %self.path.display(),
                    rules = config.rules.len(),
                    receivers = config.receivers.len(),
                    "Rule file reloaded"
                );
                Ok(config)
            }
            Err(e) => {
                self.metrics.record_reload(false);
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "Rule file rejected, keeping previous configuration"
                );
                Err(e)
            }
        }
    }

    /// [`reload`](Self::reload) on the blocking pool, for async callers
    pub async fn reload_async(self: &Arc<Self>) -> Result<Arc<AlertConfig>, ConfigError> {
        let loader = Arc::clone(self);
        tokio::task::spawn_blocking(move || loader.reload())
            .await
            .map_err(|e| ConfigError::ReloadTask(e.to_string()))?
    }

    pub fn current(&self) -> Arc<AlertConfig> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AlertConfig>> {
        self.tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::StaticSecretStore;

    const VALID: &str = r#"
rules:
  - name: InstanceDown
    expr: up == 0
    for: 1m
route:
  receivers: [default]
receivers:
  - name: default
    type: log
"#;

    fn loader(dir: &tempfile::TempDir) -> (ConfigLoader, PathBuf) {
        let path = dir.path().join("rules.yml");
        std::fs::write(&path, VALID).unwrap();
        let loader = ConfigLoader::init(
            &path,
            Arc::new(StaticSecretStore::new()),
            Duration::from_secs(5),
            Arc::new(Metrics::new()),
        )
        .unwrap();
        (loader, path)
    }

    #[test]
    fn test_invalid_startup_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yml");
        std::fs::write(&path, "rules: [").unwrap();

        let result = ConfigLoader::init(
            &path,
            Arc::new(StaticSecretStore::new()),
            Duration::from_secs(5),
            Arc::new(Metrics::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reload_publishes_new_config() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, path) = loader(&dir);
        let mut rx = loader.subscribe();

        std::fs::write(&path, VALID.replace("InstanceDown", "NodeDown")).unwrap();
        loader.reload().unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().rules[0].name, "NodeDown");
        assert_eq!(loader.current().rules[0].name, "NodeDown");
    }

    #[tokio::test]
    async fn test_async_reload_publishes_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, path) = loader(&dir);
        let loader = Arc::new(loader);

        std::fs::write(&path, VALID.replace("InstanceDown", "NodeDown")).unwrap();
        let config = loader.reload_async().await.unwrap();
        assert_eq!(config.rules[0].name, "NodeDown");
        assert_eq!(loader.current().rules[0].name, "NodeDown");

        std::fs::write(&path, "rules: [").unwrap();
        let result = loader.reload_async().await;
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
        assert_eq!(loader.current().rules[0].name, "NodeDown");
    }

    #[test]
    fn test_rejected_reload_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, path) = loader(&dir);
        let before = loader.current().loaded_at;
        let rx = loader.subscribe();

        std::fs::write(&path, VALID.replace("up == 0", "up >")).unwrap();
        assert!(loader.reload().is_err());

        assert!(!rx.has_changed().unwrap());
        assert_eq!(loader.current().rules[0].name, "InstanceDown");
        assert_eq!(loader.current().loaded_at, before);
    }
}

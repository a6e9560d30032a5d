//! File-backed [`DynamicConfig`](crate::config_listener::DynamicConfig):
//! a directory of `<key>.yaml` rule files, hot-reloaded on change.
//!
//! Each file holds one configurator URL per non-blank, non-`#`-comment
//! line (see [`crate::config_listener::parse_rule_file`]). A missing file
//! is treated as an empty rule set — subscribing before the file exists is
//! not an error, matching the registry facade's empty-marker convention
//! for a subscription with no current matches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config_listener::{parse_rule_file, rule_file_path, DynamicConfig, DynamicConfigListener, KeyedListeners};
use crate::configurator::Configurator;
use crate::{Error, Result};

/// Watches `directory` for `.yaml` rule-file changes and fans out the
/// parsed configurator set to every listener subscribed to the
/// corresponding key.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the
/// struct; dropping it stops the watch.
pub struct FileDynamicConfig {
    directory: PathBuf,
    listeners: KeyedListeners,
    file_keys: DashMap<String, String>,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileDynamicConfig {
    /// Create `directory` if missing and start watching it.
    ///
    /// # Errors
    /// [`Error::Internal`] if the directory cannot be created or the
    /// underlying `notify` watcher cannot be started.
    pub fn start(directory: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|e| Error::Internal(format!("failed to create dynamic config directory: {e}")))?;

        let (tx, rx) = tokio::sync::mpsc::channel::<PathBuf>(32);
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)) {
                    for path in event.paths {
                        let _ = tx.try_send(path);
                    }
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("failed to create dynamic config watcher: {e}")))?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("failed to watch dynamic config directory: {e}")))?;

        let this = Arc::new(Self {
            directory,
            listeners: DashMap::new(),
            file_keys: DashMap::new(),
            _watcher: Mutex::new(Some(watcher)),
        });
        this.clone().spawn_reload_task(rx);
        Ok(this)
    }

    fn spawn_reload_task(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<PathBuf>) {
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                let Some(key) = self.key_for_path(&path) else { continue };
                info!(key = %key, "dynamic config: rule file changed, reloading");
                self.reload_and_notify(&key).await;
            }
        });
    }

    fn key_for_path(&self, path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?.to_string();
        self.file_keys.get(&stem).map(|k| k.clone())
    }

    fn load_from_disk(&self, key: &str) -> Vec<Configurator> {
        let path = rule_file_path(self.directory.to_str().unwrap_or("."), key);
        match std::fs::read_to_string(&path) {
            Ok(contents) => parse_rule_file(&contents).unwrap_or_else(|e| {
                warn!(key = %key, path = %path.display(), error = %e, "dynamic config: malformed rule file, treating as empty");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %key, "dynamic config: no rule file yet, empty set");
                Vec::new()
            }
            Err(e) => {
                warn!(key = %key, path = %path.display(), error = %e, "dynamic config: failed to read rule file");
                Vec::new()
            }
        }
    }

    async fn reload_and_notify(&self, key: &str) {
        let configurators = self.load_from_disk(key);
        if let Some(entries) = self.listeners.get(key) {
            for listener in entries.value() {
                listener.notify(configurators.clone()).await;
            }
        }
    }
}

#[async_trait]
impl DynamicConfig for FileDynamicConfig {
    async fn add_listener(&self, key: &str, listener: Arc<dyn DynamicConfigListener>) -> Result<()> {
        let stem = rule_file_path(".", key)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(key)
            .to_string();
        self.file_keys.insert(stem, key.to_string());

        listener.notify(self.load_from_disk(key)).await;
        self.listeners.entry(key.to_string()).or_default().push(listener);
        Ok(())
    }

    async fn remove_listener(&self, key: &str, listener: Arc<dyn DynamicConfigListener>) -> Result<()> {
        if let Some(mut entries) = self.listeners.get_mut(key) {
            entries.retain(|l| !Arc::ptr_eq(l, &listener));
        }
        Ok(())
    }
}

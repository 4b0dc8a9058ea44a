//! File watcher used to reload TLS material as soon as it changes on disk.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A watcher that monitors a set of files for modification.
pub struct FileWatcher {
    paths: Vec<PathBuf>,
    changed_tx: mpsc::UnboundedSender<()>,
}

impl FileWatcher {
    /// Create a watcher that signals `changed_tx` on every change.
    pub fn new<P: Into<PathBuf> + Clone>(paths: &[P], changed_tx: mpsc::UnboundedSender<()>) -> Self {
        Self {
            paths: paths.iter().cloned().map(Into::into).collect(),
            changed_tx,
        }
    }

    /// Start watching in the background. The returned watcher must be kept
    /// alive; dropping it stops the notifications.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.changed_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(paths = ?event.paths, "TLS file change detected");
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in &self.paths {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }

        tracing::info!(paths = ?self.paths, "TLS file watcher started");
        Ok(watcher)
    }
}

//! Config watcher & reconciler (C7, spec §4.7).
//!
//! The teacher has no analogue to poll against; this is grounded in
//! `other_examples/ba9fe154_Lowband21-ferrex__ferrex-core-src-scan-fs_watch-watcher.rs.rs`,
//! which watches a directory (rather than a single file) with `notify` so an
//! atomic rename-over-file survives the watch, exactly as spec §4.7 requires.

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use log::{error, info, warn};
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::options::Options;
use crate::error::{AggregatorError, Result};

/// Published on every config change whose bytes actually differ from the
/// previous snapshot (spec §4.7: "if the byte content is unchanged, do
/// nothing").
pub struct ConfigUpdate {
    pub options: Options,
}

pub struct ConfigWatcher {
    path: PathBuf,
    last_raw: String,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, initial_raw: String) -> Self {
        ConfigWatcher { path, last_raw: initial_raw }
    }

    /// Runs until `cancel` fires or the underlying notify channel breaks
    /// (spec §7 `ConfigWatcherBroken`, which is fatal and propagated to the
    /// caller so the process can exit for the orchestrator to restart it).
    pub async fn run(mut self, tx: mpsc::Sender<ConfigUpdate>, cancel: tokio_util::sync::CancellationToken) -> Result<()> {
        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| AggregatorError::ConfigWatcherBroken(format!("failed to create watcher: {e}")))?;

        let watch_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| AggregatorError::ConfigWatcherBroken(format!("failed to watch {}: {e}", watch_dir.display())))?;

        info!("Watching {} for configuration changes", watch_dir.display());

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            // std_mpsc has no async recv; poll it on a blocking interval so
            // the loop still observes cancellation promptly.
            match raw_rx.recv_timeout(std::time::Duration::from_millis(250)) {
                Ok(Ok(event)) => {
                    if !event_touches(&event, &self.path) {
                        continue;
                    }
                    self.handle_event(&tx).await;
                }
                Ok(Err(e)) => warn!("config watcher event error: {e}"),
                Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(AggregatorError::ConfigWatcherBroken("notify channel disconnected".into()));
                }
            }
        }
    }

    async fn handle_event(&mut self, tx: &mpsc::Sender<ConfigUpdate>) {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("could not read {} after change event: {e}", self.path.display());
                return;
            }
        };
        if raw == self.last_raw {
            return;
        }
        match Options::parse(&raw) {
            Ok(options) => {
                self.last_raw = raw;
                if tx.send(ConfigUpdate { options }).await.is_err() {
                    warn!("config update channel closed, dropping reload");
                }
            }
            Err(e) => {
                // ConfigInvalid at runtime: log and ignore, keep prior config (spec §7).
                error!("ignoring invalid configuration reload: {e}");
            }
        }
    }
}

fn event_touches(event: &Event, target: &Path) -> bool {
    let target_name = target.file_name();
    event.paths.iter().any(|p| p.file_name() == target_name)
}

//! Configuration file watcher for hot reload.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{OrchestratorConfig, ServerConfig};

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<OrchestratorConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<OrchestratorConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading...");
                        match load_config(&path) {
                            Ok(new_config) => {
                                let _ = tx.send(new_config);
                            }
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    "Failed to reload config, keeping current server set"
                                );
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Changes needed to move a registry from one server set to another.
#[derive(Debug, Default, PartialEq)]
pub struct ServerDiff {
    /// Configs to register (new ids, or ids whose config changed).
    pub added: Vec<ServerConfig>,
    /// Ids to unregister (removed ids, or ids whose config changed).
    pub removed: Vec<String>,
}

/// Compare the currently registered configs against a reloaded set.
///
/// A changed config is treated as remove + add since instances are immutable.
pub fn diff_servers(current: &[ServerConfig], next: &[ServerConfig]) -> ServerDiff {
    let next_ids: HashSet<&str> = next.iter().map(|s| s.id.as_str()).collect();
    let mut diff = ServerDiff::default();

    for server in current {
        let changed = next
            .iter()
            .find(|n| n.id == server.id)
            .map(|n| n != server)
            .unwrap_or(false);
        if !next_ids.contains(server.id.as_str()) || changed {
            diff.removed.push(server.id.clone());
        }
    }
    for server in next {
        match current.iter().find(|c| c.id == server.id) {
            Some(existing) if existing == server => {}
            _ => diff.added.push(server.clone()),
        }
    }
    diff
}

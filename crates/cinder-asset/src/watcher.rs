//! Watch set for asset disk sources
//!
//! Wraps a `notify-debouncer-mini` debouncer. Paths are watched one by one
//! and changes are collected without blocking from the registry's tick.

use cinder_core::{CinderError, Result};
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

pub struct DiskSourceWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
    rx: Receiver<DebounceEventResult>,
    watched: HashSet<PathBuf>,
}

impl DiskSourceWatcher {
    pub fn new(debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let debouncer = new_debouncer(debounce, tx)
            .map_err(|e| CinderError::Config(format!("Failed to create file watcher: {}", e)))?;
        Ok(Self {
            debouncer,
            rx,
            watched: HashSet::new(),
        })
    }

    /// Start watching `path`. Watching a path twice is a no-op.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        if self.watched.contains(path) {
            return Ok(());
        }
        self.debouncer
            .watcher()
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| CinderError::Storage(format!("Failed to watch {}: {}", path.display(), e)))?;
        self.watched.insert(path.to_path_buf());
        log::debug!("Watching {}", path.display());
        Ok(())
    }

    pub fn unwatch(&mut self, path: &Path) {
        if self.watched.remove(path) {
            if let Err(e) = self.debouncer.watcher().unwatch(path) {
                log::debug!("Failed to unwatch {}: {}", path.display(), e);
            }
        }
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched.contains(path)
    }

    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.watched.iter().map(|p| p.as_path())
    }

    pub fn clear(&mut self) {
        let paths: Vec<PathBuf> = self.watched.iter().cloned().collect();
        for path in paths {
            self.unwatch(&path);
        }
    }

    /// Watched paths that changed since the last poll, deduplicated
    pub fn poll(&mut self) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            match result {
                Ok(events) => {
                    for event in events {
                        if self.watched.contains(&event.path) && !changed.contains(&event.path) {
                            changed.push(event.path);
                        }
                    }
                }
                Err(e) => log::warn!("Watch error: {:?}", e),
            }
        }
        changed
    }
}

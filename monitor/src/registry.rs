//! Ordered set of watched sources and the handles of their poll loops.
//!
//! Every registration gets a fresh [`Uuid`] token and a cancellation
//! channel. Poll loops carry the token with each result; a result is only
//! accepted while the registry still holds the same id under the same token,
//! which is what keeps late results of a removed (or removed and re-added)
//! source out of the metrics and the stream.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::types::WatchedSource;

/// Registry state for one source.
#[derive(Debug)]
pub struct SourceEntry {
    pub source: WatchedSource,
    pub token: Uuid,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SourceEntry {
    /// Creates an entry and the receiver its poll loops listen on.
    ///
    /// Loops stop when `true` is sent or when the entry is dropped.
    #[must_use]
    pub fn new(source: WatchedSource) -> (Self, watch::Receiver<bool>) {
        let (cancel, cancelled) = watch::channel(false);
        let entry = Self {
            source,
            token: Uuid::new_v4(),
            cancel,
            tasks: Vec::new(),
        };
        (entry, cancelled)
    }

    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Signals the loops to stop and hands back their join handles.
    pub fn cancel(&mut self) -> Vec<JoinHandle<()>> {
        self.cancel.send_replace(true);
        std::mem::take(&mut self.tasks)
    }

    /// Stops the loops immediately, without waiting for them.
    pub fn abort(&mut self) {
        for task in self.cancel() {
            task.abort();
        }
    }
}

/// Registered sources in registration order.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    entries: Vec<SourceEntry>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|e| e.source.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SourceEntry> {
        self.entries.iter_mut().find(|e| e.source.id == id)
    }

    /// The entry for `id`, only if it is still the registration `token`
    /// belongs to.
    pub fn current_mut(&mut self, id: &str, token: Uuid) -> Option<&mut SourceEntry> {
        self.get_mut(id).filter(|e| e.token == token)
    }

    /// Adds an entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceAlreadyRegistered`] if the id is taken.
    pub fn insert(&mut self, entry: SourceEntry) -> Result<&mut SourceEntry, RegistryError> {
        if self.contains(&entry.source.id) {
            return Err(RegistryError::SourceAlreadyRegistered(entry.source.id));
        }
        self.entries.push(entry);
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    /// Removes and returns the entry for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotRegistered`] if the id is unknown.
    pub fn remove(&mut self, id: &str) -> Result<SourceEntry, RegistryError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.source.id == id)
            .ok_or_else(|| RegistryError::SourceNotRegistered(id.to_string()))?;
        Ok(self.entries.remove(index))
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.source.id.clone()).collect()
    }

    #[must_use]
    pub fn sources(&self) -> Vec<WatchedSource> {
        self.entries.iter().map(|e| e.source.clone()).collect()
    }

    /// Signals every loop to stop, returning all join handles.
    pub fn cancel_all(&mut self) -> Vec<JoinHandle<()>> {
        self.entries.iter_mut().flat_map(SourceEntry::cancel).collect()
    }
}

/// Checks a source id: it must contain a non-whitespace character.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidSourceId`] otherwise.
pub fn validate_id(id: &str) -> Result<(), RegistryError> {
    if id.trim().is_empty() {
        return Err(RegistryError::InvalidSourceId);
    }
    Ok(())
}

/// Canonicalizes a source root, which must be a readable directory.
///
/// # Errors
///
/// Returns [`RegistryError::PathNotFound`] if the path is missing, not a
/// directory, or cannot be listed.
pub fn validate_root(root: &Path) -> Result<PathBuf, RegistryError> {
    let not_found = || RegistryError::PathNotFound(root.to_path_buf());

    let canonical = fs::canonicalize(root).map_err(|_| not_found())?;
    if !canonical.is_dir() {
        return Err(not_found());
    }
    fs::read_dir(&canonical).map_err(|_| not_found())?;

    Ok(canonical)
}

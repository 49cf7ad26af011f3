//! Bounded optimistic read-modify-write over a [`StateStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Comparison, SessionMetadata, StateRecord, StateStore};
use crate::error::{LinkError, Result};

/// Result of a conditional create
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// This caller wrote version 0
    Created(StateRecord),
    /// Another writer got there first; the current record
    Exists(StateRecord),
}

/// Decision taken by an update closure after reading the current record
#[derive(Debug)]
pub enum Mutation<T> {
    /// Write the successor record with this value and metadata
    Write(Vec<u8>, SessionMetadata, T),
    /// Leave the record untouched
    Skip(T),
}

/// Outcome of [`SessionStateStore::update`]
#[derive(Debug, Clone)]
pub struct Updated<T> {
    /// Record as stored after the update (or as read, when skipped)
    pub record: StateRecord,
    /// Value returned by the closure
    pub output: T,
    /// Whether a write was applied
    pub written: bool,
}

/// Session-aware wrapper around the versioned store
#[derive(Clone)]
pub struct SessionStateStore {
    store: Arc<dyn StateStore>,
    max_attempts: u32,
}

impl SessionStateStore {
    /// Wrap `store`, retrying conflicting writes up to `max_attempts` times
    pub fn new(store: Arc<dyn StateStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempt budget per read-modify-write
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Read one record
    pub fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        let mut found = self.store.get(&[key.to_string()])?;
        Ok(found.remove(key))
    }

    /// Create `key` at version 0, or report the record that beat us to it
    pub fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        metadata: SessionMetadata,
    ) -> Result<CreateOutcome> {
        for attempt in 1..=self.max_attempts {
            let record = StateRecord::initial(key, value.clone(), metadata.clone());
            let conflicts = self.store.put(vec![record.clone()])?;
            if conflicts.is_empty() {
                debug!(key, "Created record");
                return Ok(CreateOutcome::Created(record));
            }

            if let Some(current) = self.get(key)? {
                debug!(key, version = current.version, "Create lost to existing record");
                return Ok(CreateOutcome::Exists(current));
            }

            // Deleted between our put and the re-read
            debug!(key, attempt, "Create conflicted on a vanished record");
        }

        Err(self.conflict(key))
    }

    /// Read-modify-write `key` until the write lands or the budget runs out.
    ///
    /// `f` sees the freshest record on every attempt. Errors from `f` abort the
    /// loop without writing. Returns `None` if the record does not exist.
    pub fn update<T, F>(&self, key: &str, mut f: F) -> Result<Option<Updated<T>>>
    where
        F: FnMut(&StateRecord) -> Result<Mutation<T>>,
    {
        for attempt in 1..=self.max_attempts {
            let Some(current) = self.get(key)? else {
                return Ok(None);
            };

            match f(&current)? {
                Mutation::Skip(output) => {
                    return Ok(Some(Updated {
                        record: current,
                        output,
                        written: false,
                    }));
                },
                Mutation::Write(value, metadata, output) => {
                    let next = current.successor(value, metadata);
                    let conflicts = self.store.put(vec![next.clone()])?;
                    if conflicts.is_empty() {
                        return Ok(Some(Updated {
                            record: next,
                            output,
                            written: true,
                        }));
                    }
                    debug!(key, attempt, version = next.version, "Write conflicted, re-reading");
                },
            }
        }

        Err(self.conflict(key))
    }

    /// Records whose metadata `field` equals `value`
    pub fn find_by_metadata(
        &self,
        field: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<Vec<StateRecord>> {
        Ok(self
            .store
            .filter_by_metadata(field, &value.into(), Comparison::Equal)?)
    }

    /// Records last modified strictly before `time`
    pub fn modified_before(&self, time: DateTime<Utc>) -> Result<Vec<StateRecord>> {
        Ok(self
            .store
            .filter_by_modified_time(time, Comparison::LessThan)?)
    }

    /// Delete superseded, failed and expired records last modified before
    /// `time`. Records that changed since they were read are left alone.
    /// Returns the number deleted.
    pub fn reclaim_before(&self, time: DateTime<Utc>) -> Result<usize> {
        let candidates: Vec<StateRecord> = self
            .modified_before(time)?
            .into_iter()
            .filter(|r| r.metadata.is_reclaimable())
            .collect();
        let total = candidates.len();
        if total == 0 {
            return Ok(0);
        }

        let conflicts = self.store.delete(candidates)?;
        if !conflicts.is_empty() {
            warn!(skipped = conflicts.len(), "Reclaim skipped records modified concurrently");
        }
        Ok(total - conflicts.len())
    }

    fn conflict(&self, key: &str) -> LinkError {
        warn!(key, attempts = self.max_attempts, "Optimistic write budget exhausted");
        LinkError::StateConflict {
            key: key.to_string(),
            attempts: self.max_attempts,
        }
    }
}

impl std::fmt::Debug for SessionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateStore")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

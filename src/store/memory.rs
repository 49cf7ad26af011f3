//! In-process [`StateStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{Comparison, StateRecord, StateStore, StoreError};

/// Versioned store held in a mutex-guarded map.
///
/// Availability can be toggled to exercise `BackingStoreUnavailable` paths.
#[derive(Debug)]
pub struct InMemoryStateStore {
    records: Mutex<HashMap<String, StateRecord>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of accepted writes and deletes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every stored record, sorted by key
    pub fn snapshot(&self) -> Vec<StateRecord> {
        let mut records: Vec<StateRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StateRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".to_string()))
        }
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, keys: &[String]) -> Result<HashMap<String, StateRecord>, StoreError> {
        self.check_available()?;
        let records = self.lock();
        Ok(keys
            .iter()
            .filter_map(|key| records.get(key).map(|r| (key.clone(), r.clone())))
            .collect())
    }

    fn put(&self, records: Vec<StateRecord>) -> Result<HashMap<String, StateRecord>, StoreError> {
        self.check_available()?;
        let mut stored = self.lock();
        let mut conflicts = HashMap::new();

        for record in records {
            let accepted = match stored.get(&record.key) {
                None => record.version == 0,
                Some(current) => current.version.checked_add(1) == Some(record.version),
            };

            if accepted {
                self.writes.fetch_add(1, Ordering::SeqCst);
                stored.insert(record.key.clone(), record);
            } else {
                conflicts.insert(record.key.clone(), record);
            }
        }

        Ok(conflicts)
    }

    fn delete(
        &self,
        records: Vec<StateRecord>,
    ) -> Result<HashMap<String, StateRecord>, StoreError> {
        self.check_available()?;
        let mut stored = self.lock();
        let mut conflicts = HashMap::new();

        for record in records {
            match stored.get(&record.key) {
                None => {},
                Some(current) if current.version == record.version => {
                    self.writes.fetch_add(1, Ordering::SeqCst);
                    stored.remove(&record.key);
                },
                Some(_) => {
                    conflicts.insert(record.key.clone(), record);
                },
            }
        }

        Ok(conflicts)
    }

    fn filter_by_modified_time(
        &self,
        time: DateTime<Utc>,
        comparison: Comparison,
    ) -> Result<Vec<StateRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .values()
            .filter(|r| comparison.matches(r.modified_time.cmp(&time)))
            .cloned()
            .collect())
    }

    fn filter_by_metadata(
        &self,
        field: &str,
        value: &serde_json::Value,
        comparison: Comparison,
    ) -> Result<Vec<StateRecord>, StoreError> {
        self.check_available()?;
        let records = self.lock();
        let mut matched = Vec::new();

        for record in records.values() {
            let metadata = serde_json::to_value(&record.metadata)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let field_value = metadata.get(field).unwrap_or(&serde_json::Value::Null);
            if comparison.matches_json(field_value, value) {
                matched.push(record.clone());
            }
        }

        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipStatus;
    use crate::protocol::{Identity, ProtocolState, Role, SessionId};
    use crate::store::{Counterparties, SessionMetadata};
    use serde_json::json;

    fn metadata(state: ProtocolState) -> SessionMetadata {
        SessionMetadata::new(
            Counterparties::new(
                Identity::new("alice"),
                Identity::new("bob"),
                MembershipStatus::Active,
                1,
                false,
            ),
            SessionId::generate(),
            Role::Initiator,
            state,
            1,
            Utc::now(),
            None,
        )
    }

    fn record(key: &str, version: u64) -> StateRecord {
        StateRecord {
            key: key.to_string(),
            version,
            value: vec![version as u8],
            metadata: metadata(ProtocolState::SentHello),
            modified_time: Utc::now(),
        }
    }

    #[test]
    fn test_create_requires_version_zero() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.put(vec![record("k", 1)]).unwrap().len(), 1);
        assert!(store.put(vec![record("k", 0)]).unwrap().is_empty());

        // Second create of the same key conflicts
        let conflicts = store.put(vec![record("k", 0)]).unwrap();
        assert!(conflicts.contains_key("k"));
    }

    #[test]
    fn test_update_requires_next_version() {
        let store = InMemoryStateStore::new();
        store.put(vec![record("k", 0)]).unwrap();

        assert!(store.put(vec![record("k", 1)]).unwrap().is_empty());
        assert_eq!(store.put(vec![record("k", 1)]).unwrap().len(), 1);
        assert_eq!(store.put(vec![record("k", 3)]).unwrap().len(), 1);

        let current = store.get(&["k".to_string()]).unwrap();
        assert_eq!(current["k"].version, 1);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_put_returns_only_conflicts() {
        let store = InMemoryStateStore::new();
        store.put(vec![record("a", 0)]).unwrap();

        let conflicts = store.put(vec![record("a", 0), record("b", 0)]).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts.contains_key("a"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_version_checked() {
        let store = InMemoryStateStore::new();
        store.put(vec![record("k", 0)]).unwrap();
        store.put(vec![record("k", 1)]).unwrap();

        assert_eq!(store.delete(vec![record("k", 0)]).unwrap().len(), 1);
        assert!(store.delete(vec![record("k", 1)]).unwrap().is_empty());
        assert!(store.is_empty());
        // Already gone
        assert!(store.delete(vec![record("k", 1)]).unwrap().is_empty());
    }

    #[test]
    fn test_filters() {
        let store = InMemoryStateStore::new();
        let mut established = record("e", 0);
        established.metadata = metadata(ProtocolState::Established);
        let mut old = record("o", 0);
        old.modified_time = Utc::now() - chrono::Duration::hours(1);
        store.put(vec![established, old]).unwrap();

        let found = store
            .filter_by_metadata("state", &json!("ESTABLISHED"), Comparison::Equal)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "e");

        let stale = store
            .filter_by_modified_time(Utc::now() - chrono::Duration::minutes(5), Comparison::LessThan)
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, "o");

        let by_attempt = store
            .filter_by_metadata("attempt", &json!(1), Comparison::GreaterThanOrEqual)
            .unwrap();
        assert_eq!(by_attempt.len(), 2);
    }

    #[test]
    fn test_unavailable() {
        let store = InMemoryStateStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get(&["k".to_string()]),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.put(vec![record("k", 0)]).is_err());

        store.set_available(true);
        assert!(store.put(vec![record("k", 0)]).unwrap().is_empty());
    }
}

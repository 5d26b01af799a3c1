//! In-memory storage.
//!
//! Useful for single-process use and tests. Data is lost on restart.

use std::{
    collections::{HashMap, VecDeque},
    sync::RwLock,
};

use async_trait::async_trait;
use uisee_core::{
    CommandRecord, HistoryStorage, RunFilter, RunId, RunStorage, StorageError, StoredRun,
};

/// Records kept before the oldest are dropped.
const HISTORY_LIMIT: usize = 10_000;

/// In-memory command history.
pub struct MemoryHistory {
    records: RwLock<VecDeque<CommandRecord>>,
}

impl MemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStorage for MemoryHistory {
    async fn append(&self, record: CommandRecord) -> Result<(), StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        if records.len() >= HISTORY_LIMIT {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<CommandRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

/// In-memory run storage.
pub struct MemoryRunStorage {
    runs: RwLock<HashMap<RunId, StoredRun>>,
}

impl MemoryRunStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRunStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStorage for MemoryRunStorage {
    async fn save(&self, run: StoredRun) -> Result<(), StorageError> {
        self.runs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(run.id, run);
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<StoredRun>, StorageError> {
        Ok(self
            .runs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn list(&self, filter: RunFilter) -> Result<Vec<StoredRun>, StorageError> {
        let runs = self
            .runs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<StoredRun> = runs
            .values()
            .filter(|r| filter.state.is_none_or(|state| r.state == state))
            .cloned()
            .collect();

        // Newest first
        result.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}

//! File-backed storage: JSON lines for history, one JSON document per run.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use uisee_core::{
    CommandRecord, HistoryStorage, RunFilter, RunId, RunStorage, StorageError, StoredRun,
};

/// Command history appended to a JSON-lines file.
pub struct JsonlHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStorage for JsonlHistory {
    async fn append(&self, record: CommandRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<CommandRecord>, StorageError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<CommandRecord> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "Skipping unreadable history line: {e}");
                    None
                }
            })
            .collect();
        Ok(records.into_iter().rev().take(limit).collect())
    }
}

/// Finished runs stored as `<run id>.json` in a directory.
pub struct FileRunStorage {
    dir: PathBuf,
}

impl FileRunStorage {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: RunId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl RunStorage for FileRunStorage {
    async fn save(&self, run: StoredRun) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(&run)?;
        let path = self.path_for(run.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        tracing::debug!(run_id = %run.id, path = %path.display(), "Run stored");
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<StoredRun>, StorageError> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, filter: RunFilter) -> Result<Vec<StoredRun>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<StoredRun>(&bytes) {
                Ok(run) if filter.state.is_none_or(|state| run.state == state) => result.push(run),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable run file: {e}"),
            }
        }

        // Newest first
        result.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}

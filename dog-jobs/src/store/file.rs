//! Append-only JSON-lines datafile.
//!
//! Each line holds one full record. A later line for the same id supersedes
//! earlier ones and a `{"$$deleted": true, "id": ...}` line removes it. The
//! file is compacted on [`JobStore::init`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::memory::Collection;
use crate::store::{FindOptions, JobFilter, JobPatch, JobStore};
use crate::types::{JobId, JobRecord};

const DELETED_MARKER: &str = "$$deleted";

#[derive(Serialize, Deserialize)]
struct Tombstone {
    #[serde(rename = "$$deleted")]
    deleted: bool,
    id: JobId,
}

/// Persistent store backed by a single datafile
#[derive(Clone)]
pub struct FileStore {
    path: PathBuf,
    collection: Arc<RwLock<Collection>>,
    /// Append handle; `None` until `init` has loaded the datafile
    file: Arc<Mutex<Option<fs::File>>>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            collection: Arc::new(RwLock::new(Collection::default())),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoreResult<()> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<&str> = content.lines().collect();
        let last = lines.len();
        let mut collection = self.collection.write();
        collection.clear();

        for (index, line) in lines.iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(Entry::Record(record)) => collection.upsert(record),
                Ok(Entry::Deleted(id)) => collection.delete(&id),
                // A crash mid-append can leave a torn final line
                Err(reason) if index + 1 == last => {
                    warn!(path = %self.path.display(), %reason, "dropping truncated last line of datafile");
                }
                Err(reason) => {
                    return Err(StoreError::Corrupt {
                        line: index + 1,
                        reason,
                    })
                }
            }
        }

        Ok(())
    }

    async fn compact(&self) -> StoreResult<()> {
        let records = self.collection.read().records();
        let mut buf = String::new();
        for record in &records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), records = records.len(), "compacted datafile");
        Ok(())
    }

    async fn append(file: &mut Option<fs::File>, lines: &[String]) -> StoreResult<()> {
        let file = file.as_mut().ok_or(StoreError::NotInitialized)?;
        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

enum Entry {
    Record(JobRecord),
    Deleted(JobId),
}

fn parse_line(line: &str) -> Result<Entry, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if value.get(DELETED_MARKER).and_then(Value::as_bool) == Some(true) {
        let tombstone: Tombstone = serde_json::from_value(value).map_err(|e| e.to_string())?;
        return Ok(Entry::Deleted(tombstone.id));
    }
    serde_json::from_value(value)
        .map(Entry::Record)
        .map_err(|e| e.to_string())
}

fn tombstone_line(id: &JobId) -> StoreResult<String> {
    Ok(serde_json::to_string(&Tombstone {
        deleted: true,
        id: id.clone(),
    })?)
}

#[async_trait]
impl JobStore for FileStore {
    async fn init(&self) -> StoreResult<()> {
        let mut file = self.file.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        self.load().await?;
        self.compact().await?;

        *file = Some(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?,
        );

        info!(
            path = %self.path.display(),
            records = self.collection.read().records().len(),
            "datafile loaded"
        );
        Ok(())
    }

    async fn find(&self, filter: &JobFilter, options: &FindOptions) -> StoreResult<Vec<JobRecord>> {
        Ok(self.collection.read().find(filter, options))
    }

    async fn find_one(&self, id: &JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.collection.read().find_one(id))
    }

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
        Ok(self.collection.read().count(filter))
    }

    // Every mutation holds the file lock from building its lines until the
    // collection is changed. The collection only changes after the append
    // succeeded, so readers never see a mutation the datafile lacks.

    async fn insert(&self, record: JobRecord) -> StoreResult<JobRecord> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            return Err(StoreError::NotInitialized);
        }
        if self.collection.read().contains(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        let line = serde_json::to_string(&record)?;
        Self::append(&mut file, &[line]).await?;
        self.collection.write().upsert(record.clone());
        Ok(record)
    }

    async fn update(&self, filter: &JobFilter, patch: &JobPatch) -> StoreResult<u64> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            return Err(StoreError::NotInitialized);
        }
        let updated = self.collection.read().patched(filter, patch);
        if updated.is_empty() {
            return Ok(0);
        }
        let lines = updated
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        Self::append(&mut file, &lines).await?;

        let count = updated.len() as u64;
        let mut collection = self.collection.write();
        for record in updated {
            collection.upsert(record);
        }
        Ok(count)
    }

    async fn remove(&self, filter: &JobFilter) -> StoreResult<u64> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            return Err(StoreError::NotInitialized);
        }
        let ids = self.collection.read().matching_ids(filter);
        if ids.is_empty() {
            return Ok(0);
        }
        let lines = ids
            .iter()
            .map(tombstone_line)
            .collect::<StoreResult<Vec<_>>>()?;
        Self::append(&mut file, &lines).await?;

        let mut collection = self.collection.write();
        for id in &ids {
            collection.delete(id);
        }
        Ok(ids.len() as u64)
    }
}

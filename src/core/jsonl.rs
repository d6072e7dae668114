//! Append-only ledger backed by a JSONL file.
//!
//! Events are stored as newline-delimited JSON for simplicity and easy
//! inspection. Line order is append order; sequence numbers are not written
//! to disk but re-derived from it on load.
//!
//! Several processes may share one file. Appends hold an exclusive `fs2`
//! lock, reads a shared one, and both first catch up on whatever other
//! writers added since this handle last looked.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::domain::{Event, EventDraft, EventFilter};
use crate::error::{LedgerError, Result};

use super::store::{EventStream, LedgerStore};

/// In-memory view of the file up to `offset`.
#[derive(Debug, Default)]
struct LogIndex {
    /// Bytes of the file already parsed
    offset: u64,

    /// Events in line order; `events[i]` has sequence `i + 1`
    events: Vec<Event>,
}

impl LogIndex {
    fn next_sequence(&self) -> u64 {
        self.events.len() as u64 + 1
    }

    /// Parse every complete line written after `offset`.
    ///
    /// A trailing partial line can only be a torn write from a writer that
    /// died holding the exclusive lock. Readers leave it unparsed; with
    /// `repair` (exclusive lock held) it is truncated away.
    fn catch_up(&mut self, file: &mut File, path: &Path, repair: bool) -> Result<()> {
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| LedgerError::unavailable_with_source(format!("Failed to seek {}", path.display()), e))?;

        let mut tail = Vec::new();
        file.read_to_end(&mut tail)
            .map_err(|e| LedgerError::unavailable_with_source(format!("Failed to read {}", path.display()), e))?;

        if tail.last().map_or(false, |b| *b != b'\n') {
            let complete = tail.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
            let torn_at = self.offset + complete as u64;
            tail.truncate(complete);
            if repair {
                file.set_len(torn_at).map_err(|e| {
                    LedgerError::unavailable_with_source(
                        format!("Failed to truncate torn write in {}", path.display()),
                        e,
                    )
                })?;
                warn!(path = %path.display(), byte = torn_at, "Truncated partial trailing line");
            } else {
                debug!(path = %path.display(), byte = torn_at, "Ignoring partial trailing line");
            }
        }

        let text = std::str::from_utf8(&tail).map_err(|e| {
            LedgerError::unavailable_with_source(
                format!("Invalid UTF-8 in {} after byte {}", path.display(), self.offset),
                e,
            )
        })?;

        let before = self.events.len();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(line).map_err(|e| {
                LedgerError::unavailable_with_source(
                    format!("Corrupt line in {} after byte {}", path.display(), self.offset),
                    e,
                )
            })?;
            let sequence = self.next_sequence();
            self.events.push(event.with_sequence(sequence));
        }
        self.offset += tail.len() as u64;

        if self.events.len() > before {
            debug!(path = %path.display(), loaded = self.events.len() - before, "Caught up on ledger file");
        }
        Ok(())
    }

    fn select(&self, filter: &EventFilter) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Already in sequence order; a stable sort on time_index finishes the job.
        events.sort_by(|a, b| a.time_index().cmp(b.time_index()));
        events
    }
}

/// File-based store using JSONL format.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    path: PathBuf,
    index: Arc<Mutex<LogIndex>>,
}

impl JsonlStore {
    /// Open (or lazily create) the ledger at `path`, creating parent
    /// directories as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LedgerError::unavailable_with_source(
                    format!("Failed to create ledger directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let store = Self {
            path,
            index: Arc::new(Mutex::new(LogIndex::default())),
        };
        // Load existing content eagerly so corruption surfaces at open time.
        store.count(&EventFilter::any()).await?;
        Ok(store)
    }

    /// Get the path to the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &Mutex<LogIndex>) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || work(&path, &index))
            .await
            .map_err(|e| LedgerError::unavailable_with_source(format!("{} task failed", operation), e))?
    }

    fn read_locked<T>(
        path: &Path,
        index: &Mutex<LogIndex>,
        read: impl FnOnce(&LogIndex) -> T,
    ) -> Result<T> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(read(&LogIndex::default()));
            }
            Err(e) => {
                return Err(LedgerError::unavailable_with_source(
                    format!("Failed to open ledger file: {}", path.display()),
                    e,
                ))
            }
        };
        FileExt::lock_shared(&file).map_err(|e| {
            LedgerError::unavailable_with_source("Failed to acquire shared lock on ledger file", e)
        })?;

        let mut index = index.lock();
        index.catch_up(&mut file, path, false)?;
        Ok(read(&index))
        // Lock is released when file is dropped
    }
}

#[async_trait]
impl LedgerStore for JsonlStore {
    #[instrument(skip(self, draft), fields(entity_id = %draft.entity_id, namespace = %draft.namespace))]
    async fn append(&self, draft: EventDraft) -> Result<Event> {
        draft.validate()?;
        self.blocking("append", move |path, index| {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    LedgerError::unavailable_with_source(
                        format!("Failed to open ledger file: {}", path.display()),
                        e,
                    )
                })?;

            FileExt::lock_exclusive(&file).map_err(|e| {
                LedgerError::unavailable_with_source("Failed to acquire file lock on ledger file", e)
            })?;

            let mut index = index.lock();
            index.catch_up(&mut file, path, true)?;

            let event = Event::materialize(draft, index.next_sequence());
            let json = serde_json::to_string(&event).map_err(|e| LedgerError::MalformedPayload {
                payload_type: event.payload_type().to_string(),
                message: e.to_string(),
            })?;
            let line = format!("{}\n", json);
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                // Drop whatever part of the line made it to disk
                if let Err(truncate) = file.set_len(index.offset) {
                    warn!(error = %truncate, "Failed to roll back partial write");
                }
                return Err(LedgerError::unavailable_with_source("Failed to write event", e));
            }

            index.offset += line.len() as u64;
            index.events.push(event.clone());
            debug!(sequence = event.sequence(), "Appended event");
            Ok(event)
        })
        .await
    }

    async fn iterate(&self, filter: &EventFilter) -> Result<EventStream> {
        let filter = filter.clone();
        self.blocking("iterate", move |path, index| {
            Self::read_locked(path, index, |log| EventStream::new(log.select(&filter)))
        })
        .await
    }

    async fn count(&self, filter: &EventFilter) -> Result<usize> {
        let filter = filter.clone();
        self.blocking("count", move |path, index| {
            Self::read_locked(path, index, |log| {
                log.events.iter().filter(|e| filter.matches(e)).count()
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Namespace;
    use serde_json::json;
    use tempfile::TempDir;

    fn obs(t: &str) -> EventDraft {
        EventDraft::new("exp#1", Namespace::Observation, "observation", t)
            .step_key("look-1")
            .tag("obs")
            .payload("TwoPropObsBatch", json!({"nA": 10, "nB": 10, "mA": 8, "mB": 1}))
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        let first = store.append(obs("t002")).await.unwrap();
        store.append(obs("t001")).await.unwrap();

        let reopened = JsonlStore::open(&path).await.unwrap();
        let events: Vec<Event> = reopened.iterate(&EventFilter::any()).await.unwrap().collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].time_index().as_str(), "t001");
        assert_eq!(events[1].id(), first.id());
        assert_eq!(events[1].sequence(), 1);
        assert_eq!(events[1].payload(), first.payload());
    }

    #[tokio::test]
    async fn test_sees_appends_from_other_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");

        let a = JsonlStore::open(&path).await.unwrap();
        let b = JsonlStore::open(&path).await.unwrap();

        a.append(obs("t001")).await.unwrap();
        let from_b = b.append(obs("t002")).await.unwrap();

        assert_eq!(from_b.sequence(), 2);
        assert_eq!(a.count(&EventFilter::any()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        store.append(obs("t001")).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"\n\n")
            .unwrap();
        store.append(obs("t002")).await.unwrap();

        let reopened = JsonlStore::open(&path).await.unwrap();
        assert_eq!(reopened.count(&EventFilter::any()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_store_unavailable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let err = JsonlStore::open(&path).await.unwrap_err();
        assert!(matches!(err, LedgerError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_torn_write_is_repaired_on_next_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");

        let store = JsonlStore::open(&path).await.unwrap();
        store.append(obs("t001")).await.unwrap();
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // A writer died halfway through a line
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"id\":")
            .unwrap();

        // Readers ignore the torn tail
        let reader = JsonlStore::open(&path).await.unwrap();
        assert_eq!(reader.count(&EventFilter::any()).await.unwrap(), 1);

        for t in ["t002", "t003", "t004"] {
            store.append(obs(t)).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        assert!(!content.contains("{\"id\":\n"));
        assert!(std::fs::metadata(&path).unwrap().len() > intact_len);

        let reopened = JsonlStore::open(&path).await.unwrap();
        let events: Vec<Event> = reopened.iterate(&EventFilter::any()).await.unwrap().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(reader.count(&EventFilter::any()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonlStore::open(temp.path().join("nested/ledger.jsonl"))
            .await
            .unwrap();

        assert_eq!(store.count(&EventFilter::any()).await.unwrap(), 0);
        assert!(!store.path().exists());
    }
}

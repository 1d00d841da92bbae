use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::episode::Episode;
use crate::sqlite::configure_connection;

pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress backend error: {0}")]
    Backend(String),
}

pub type ProgressResult<T> = std::result::Result<T, ProgressError>;

/// Fine-grained sub-states reported while one episode moves through the
/// pipeline. Pollers see all of these as phases of "downloading".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Downloading,
    PostProcessing,
    Uploading,
    CoverDownloading,
    CoverUploading,
    Error,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

/// Download hooks report absolute byte counts; upload hooks report per-chunk
/// increments. Both converge on the same stored event.
#[derive(Debug, Clone, Copy)]
pub enum ProgressDelta {
    Absolute(u64),
    Chunk(u64),
}

/// Deterministic key shared by the fetch-, normalize- and upload-phase hooks.
/// Strips the extension and the `_<uuid hex>` suffix so every phase of one
/// source file lands on a single entry.
pub fn progress_key(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let stem = base.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&base);
    let suffix = regex::Regex::new(r"_[0-9a-f]{32}$").ok();
    let stem = match suffix {
        Some(re) => re.replace(stem, "").to_string(),
        None => stem.to_string(),
    };
    format!("progress:{stem}")
}

#[async_trait]
pub trait ProgressBackend: Send + Sync {
    async fn set(&self, key: &str, event: &ProgressEvent, ttl: Duration) -> ProgressResult<()>;
    async fn get(&self, key: &str) -> ProgressResult<Option<ProgressEvent>>;
    async fn get_many(&self, keys: &[String])
        -> ProgressResult<HashMap<String, ProgressEvent>>;
}

/// TTL key/value store held in process memory. Entries expire lazily on
/// read; abandoned jobs disappear without explicit cleanup.
#[derive(Debug, Default)]
pub struct MemoryProgressBackend {
    entries: Mutex<HashMap<String, (Instant, ProgressEvent)>>,
}

impl MemoryProgressBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressBackend for MemoryProgressBackend {
    async fn set(&self, key: &str, event: &ProgressEvent, ttl: Duration) -> ProgressResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| ProgressError::Backend(err.to_string()))?;
        entries.insert(key.to_string(), (Instant::now() + ttl, event.clone()));
        Ok(())
    }

    async fn get(&self, key: &str) -> ProgressResult<Option<ProgressEvent>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| ProgressError::Backend(err.to_string()))?;
        let now = Instant::now();
        match entries.get(key) {
            Some((deadline, _)) if *deadline <= now => {
                entries.remove(key);
                Ok(None)
            }
            Some((_, event)) => Ok(Some(event.clone())),
            None => Ok(None),
        }
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> ProgressResult<HashMap<String, ProgressEvent>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| ProgressError::Backend(err.to_string()))?;
        let now = Instant::now();
        let mut found = HashMap::new();
        for key in keys {
            match entries.get(key) {
                Some((deadline, _)) if *deadline <= now => {
                    entries.remove(key);
                }
                Some((_, event)) => {
                    found.insert(key.clone(), event.clone());
                }
                None => {}
            }
        }
        Ok(found)
    }
}

const PROGRESS_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS progress (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);";

/// TTL key/value store persisted in its own SQLite file. One writer process
/// and any number of pollers can share it, which is what the CLI needs:
/// `run-download` and `check-state` run as separate processes.
#[derive(Debug, Clone)]
pub struct SqliteProgressBackend {
    path: PathBuf,
}

impl SqliteProgressBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> ProgressResult<Connection> {
        let conn = Connection::open(&self.path).map_err(backend_error)?;
        configure_connection(&conn).map_err(backend_error)?;
        conn.execute_batch(PROGRESS_SCHEMA).map_err(backend_error)?;
        Ok(conn)
    }

    fn read_entry(
        conn: &Connection,
        key: &str,
        now: i64,
    ) -> ProgressResult<Option<ProgressEvent>> {
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload, expires_at FROM progress WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend_error)?;
        match row {
            Some((_, expires_at)) if expires_at <= now => {
                conn.execute("DELETE FROM progress WHERE key = ?1", [key])
                    .map_err(backend_error)?;
                Ok(None)
            }
            Some((payload, _)) => {
                let event = serde_json::from_str(&payload).map_err(backend_error)?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }
}

fn backend_error(err: impl std::fmt::Display) -> ProgressError {
    ProgressError::Backend(err.to_string())
}

#[async_trait]
impl ProgressBackend for SqliteProgressBackend {
    async fn set(&self, key: &str, event: &ProgressEvent, ttl: Duration) -> ProgressResult<()> {
        let conn = self.open()?;
        let payload = serde_json::to_string(event).map_err(backend_error)?;
        let expires_at = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        conn.execute(
            "INSERT INTO progress (key, payload, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = ?2, expires_at = ?3",
            params![key, payload, expires_at],
        )
        .map_err(backend_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ProgressResult<Option<ProgressEvent>> {
        let conn = self.open()?;
        Self::read_entry(&conn, key, chrono::Utc::now().timestamp())
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> ProgressResult<HashMap<String, ProgressEvent>> {
        let conn = self.open()?;
        let now = chrono::Utc::now().timestamp();
        let mut found = HashMap::new();
        for key in keys {
            if let Some(event) = Self::read_entry(&conn, key, now)? {
                found.insert(key.clone(), event);
            }
        }
        Ok(found)
    }
}

/// Per-episode progress view consumed by the polling status endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EpisodeProgress {
    pub episode_id: i64,
    pub episode_title: String,
    pub podcast_id: i64,
    pub status: Option<ProgressStatus>,
    pub completed: u8,
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Clone)]
pub struct ProgressTracker {
    backend: std::sync::Arc<dyn ProgressBackend>,
    ttl: Duration,
}

impl ProgressTracker {
    pub fn new(backend: std::sync::Arc<dyn ProgressBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Upserts the progress record for a file. Hook failures are logged and
    /// swallowed; a broken progress store must never abort a transfer.
    pub async fn record(
        &self,
        file_name: &str,
        status: ProgressStatus,
        total_bytes: u64,
        delta: ProgressDelta,
    ) {
        let key = progress_key(file_name);
        let previous = match self.backend.get(&key).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(key = %key, error = %err, "progress read failed");
                None
            }
        };
        let processed_bytes = match delta {
            ProgressDelta::Absolute(bytes) => bytes,
            ProgressDelta::Chunk(chunk) => {
                previous.as_ref().map(|p| p.processed_bytes).unwrap_or(0) + chunk
            }
        };
        let total_bytes = if total_bytes > 0 {
            total_bytes
        } else {
            previous.as_ref().map(|p| p.total_bytes).unwrap_or(0)
        };
        let event = ProgressEvent {
            status,
            processed_bytes,
            total_bytes,
        };
        if let Err(err) = self.backend.set(&key, &event, self.ttl).await {
            warn!(key = %key, error = %err, "progress write failed");
        }
    }

    /// Batched progress lookup for a set of episodes. Episodes without a
    /// file name are skipped; input order is preserved otherwise.
    pub async fn check_state(&self, episodes: &[Episode]) -> Vec<EpisodeProgress> {
        let keys: Vec<String> = episodes
            .iter()
            .filter_map(|episode| episode.file_name.as_deref())
            .map(progress_key)
            .collect();
        let states = match self.backend.get_many(&keys).await {
            Ok(states) => states,
            Err(err) => {
                warn!(error = %err, "progress batch read failed");
                HashMap::new()
            }
        };

        let mut result = Vec::new();
        for episode in episodes {
            let Some(file_name) = episode.file_name.as_deref() else {
                warn!(episode_id = episode.id, "episode has no file name, skipping");
                continue;
            };
            let state = states.get(&progress_key(file_name));
            let (status, processed_bytes, total_bytes) = match state {
                Some(event) => (Some(event.status), event.processed_bytes, event.total_bytes),
                None => (None, 0, 0),
            };
            let completed = if total_bytes > 0 {
                ((100 * processed_bytes) / total_bytes).min(100) as u8
            } else {
                0
            };
            result.push(EpisodeProgress {
                episode_id: episode.id,
                episode_title: episode.title.clone(),
                podcast_id: episode.podcast_id,
                status,
                completed,
                processed_bytes,
                total_bytes,
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::episode::EpisodeStatus;

    fn episode(id: i64, file_name: Option<&str>) -> Episode {
        Episode {
            id,
            podcast_id: 1,
            source_id: "mIje48733uU".into(),
            title: format!("episode {id}"),
            author: None,
            description: String::new(),
            watch_url: None,
            remote_url: None,
            image_url: None,
            duration_s: 0,
            file_name: file_name.map(str::to_string),
            file_size: 0,
            status: EpisodeStatus::Downloading,
            created_at: None,
            published_at: None,
        }
    }

    #[test]
    fn key_strips_extension_and_uuid_suffix() {
        let plain = progress_key("mIje48733uU.mp3");
        let suffixed = progress_key("mIje48733uU_dba4d8220f754851b7bd91201cf97864.mp3");
        let pathed = progress_key("/tmp/audio/mIje48733uU_dba4d8220f754851b7bd91201cf97864.mp3");
        assert_eq!(plain, "progress:mIje48733uU");
        assert_eq!(suffixed, plain);
        assert_eq!(pathed, plain);
    }

    #[tokio::test]
    async fn chunk_deltas_accumulate() {
        let backend = Arc::new(MemoryProgressBackend::new());
        let tracker = ProgressTracker::new(backend.clone(), Duration::from_secs(60));
        tracker
            .record("a.mp3", ProgressStatus::Uploading, 100, ProgressDelta::Absolute(0))
            .await;
        tracker
            .record("a.mp3", ProgressStatus::Uploading, 0, ProgressDelta::Chunk(30))
            .await;
        tracker
            .record("a.mp3", ProgressStatus::Uploading, 0, ProgressDelta::Chunk(20))
            .await;
        let event = backend.get(&progress_key("a.mp3")).await.unwrap().unwrap();
        assert_eq!(event.processed_bytes, 50);
        assert_eq!(event.total_bytes, 100);
    }

    #[tokio::test]
    async fn check_state_reports_percentages() {
        let backend = Arc::new(MemoryProgressBackend::new());
        let tracker = ProgressTracker::new(backend.clone(), Duration::from_secs(60));
        tracker
            .record(
                "half.mp3",
                ProgressStatus::Downloading,
                2_097_152,
                ProgressDelta::Absolute(1_048_576),
            )
            .await;

        let episodes = vec![
            episode(1, Some("half.mp3")),
            episode(2, Some("unknown.mp3")),
            episode(3, None),
        ];
        let views = tracker.check_state(&episodes).await;
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].completed, 50);
        assert_eq!(views[0].processed_bytes, 1_048_576);
        assert_eq!(views[1].completed, 0);
        assert_eq!(views[1].total_bytes, 0);
    }

    #[tokio::test]
    async fn sqlite_backend_shares_entries_across_instances() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("progress.db");
        let event = ProgressEvent {
            status: ProgressStatus::Downloading,
            processed_bytes: 10,
            total_bytes: 40,
        };

        let writer = SqliteProgressBackend::new(&path);
        writer
            .set("progress:shared", &event, Duration::from_secs(600))
            .await
            .unwrap();

        // a second instance over the same file models a separate process
        let reader = SqliteProgressBackend::new(&path);
        assert_eq!(
            reader.get("progress:shared").await.unwrap(),
            Some(event.clone())
        );

        writer
            .set("progress:expired", &event, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(reader.get("progress:expired").await.unwrap().is_none());

        let found = reader
            .get_many(&[
                "progress:shared".to_string(),
                "progress:absent".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("progress:shared"), Some(&event));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let backend = MemoryProgressBackend::new();
        let event = ProgressEvent {
            status: ProgressStatus::Finished,
            processed_bytes: 1,
            total_bytes: 1,
        };
        backend
            .set("progress:gone", &event, Duration::from_millis(0))
            .await
            .unwrap();
        assert!(backend.get("progress:gone").await.unwrap().is_none());
    }
}

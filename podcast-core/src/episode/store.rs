use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::error::{EpisodeError, EpisodeResult};
use super::models::{Episode, EpisodeDraft, EpisodeStatus, Podcast, PodcastDraft};

const EPISODE_SCHEMA: &str = include_str!("../../../sql/episodes.sql");

#[derive(Debug, Clone)]
pub struct SqliteEpisodeStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteEpisodeStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteEpisodeStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> EpisodeResult<SqliteEpisodeStore> {
        let path = self.path.ok_or(EpisodeError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteEpisodeStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteEpisodeStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteEpisodeStore {
    pub fn builder() -> SqliteEpisodeStoreBuilder {
        SqliteEpisodeStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> EpisodeResult<Self> {
        SqliteEpisodeStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> EpisodeResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            EpisodeError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| EpisodeError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> EpisodeResult<()> {
        let conn = self.open()?;
        conn.execute_batch(EPISODE_SCHEMA)?;
        Ok(())
    }

    pub fn create_podcast(&self, draft: &PodcastDraft) -> EpisodeResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO podcasts (publish_id, name, description, download_automatically)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &draft.publish_id,
                &draft.name,
                &draft.description,
                if draft.download_automatically { 1 } else { 0 },
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn fetch_podcast(&self, podcast_id: i64) -> EpisodeResult<Podcast> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM podcasts WHERE id = ?1")?;
        stmt.query_row([podcast_id], |row| Podcast::from_row(row))
            .optional()?
            .ok_or(EpisodeError::PodcastNotFound { podcast_id })
    }

    pub fn list_podcasts(&self) -> EpisodeResult<Vec<Podcast>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM podcasts ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], |row| Podcast::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_episode(&self, draft: &EpisodeDraft) -> EpisodeResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO episodes (
                podcast_id, source_id, title, author, description, watch_url,
                image_url, duration_s, file_name, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'new')",
            params![
                draft.podcast_id,
                &draft.source_id,
                &draft.title,
                &draft.author,
                &draft.description,
                &draft.watch_url,
                &draft.image_url,
                draft.duration_s,
                &draft.file_name,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn fetch_episode(&self, episode_id: i64) -> EpisodeResult<Episode> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM episodes WHERE id = ?1")?;
        stmt.query_row([episode_id], |row| Episode::from_row(row))
            .optional()?
            .ok_or(EpisodeError::NotFound { episode_id })
    }

    /// All non-archived episodes sharing a source id, across podcasts.
    /// Recomputed fresh at every pipeline stage; new rows may appear while a
    /// job is running.
    pub fn siblings(&self, source_id: &str) -> EpisodeResult<Vec<Episode>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE source_id = ?1 AND status != 'archived'
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([source_id], |row| Episode::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn podcast_ids_for_source(&self, source_id: &str) -> EpisodeResult<Vec<i64>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT podcast_id FROM episodes
             WHERE source_id = ?1 AND status != 'archived'",
        )?;
        let rows = stmt
            .query_map([source_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Batched status change for every non-archived episode with the source
    /// id. One transaction so siblings never observe divergent status.
    pub fn set_status(&self, source_id: &str, status: EpisodeStatus) -> EpisodeResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE episodes SET status = ?1
             WHERE source_id = ?2 AND status != 'archived'",
            params![status.as_str(), source_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    pub fn set_file(
        &self,
        source_id: &str,
        file_name: &str,
        remote_url: &str,
    ) -> EpisodeResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE episodes SET file_name = ?1, remote_url = ?2
             WHERE source_id = ?3 AND status != 'archived'",
            params![file_name, remote_url, source_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    /// Publishes every non-archived sibling in one transaction. The publish
    /// timestamp sticks on re-publication so repeated runs stay idempotent.
    pub fn mark_published(&self, source_id: &str, file_size: i64) -> EpisodeResult<usize> {
        let now = Utc::now().naive_utc();
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE episodes
             SET status = 'published', file_size = ?1,
                 published_at = COALESCE(published_at, ?2)
             WHERE source_id = ?3 AND status != 'archived'",
            params![file_size, now, source_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    pub fn mark_error(&self, source_id: &str) -> EpisodeResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE episodes SET status = 'error', file_size = 0
             WHERE source_id = ?1 AND status != 'archived'",
            params![source_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    pub fn set_image_url(&self, source_id: &str, image_url: &str) -> EpisodeResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE episodes SET image_url = ?1
             WHERE source_id = ?2 AND status != 'archived'",
            params![image_url, source_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    /// Published episodes for the feed document, most recent first.
    pub fn episodes_for_feed(&self, podcast_id: i64) -> EpisodeResult<Vec<Episode>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE podcast_id = ?1 AND status = 'published' AND published_at IS NOT NULL
             ORDER BY published_at DESC, created_at DESC",
        )?;
        let rows = stmt
            .query_map([podcast_id], |row| Episode::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn episodes_in_progress(&self) -> EpisodeResult<Vec<Episode>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE status IN ('downloading', 'error')
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Episode::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Episodes that never made it to durable storage; backfill input.
    pub fn episodes_missing_remote(&self) -> EpisodeResult<Vec<Episode>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE remote_url IS NULL AND file_name IS NOT NULL
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Episode::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn episodes_with_remote(&self) -> EpisodeResult<Vec<Episode>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodes
             WHERE remote_url LIKE 'http%' AND file_name IS NOT NULL
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Episode::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether another non-archived episode still references the durable
    /// object; consulted before deleting a remote file.
    pub fn is_file_shared(&self, file_name: &str, excluding_episode: i64) -> EpisodeResult<bool> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM episodes
             WHERE file_name = ?1 AND id != ?2 AND status != 'archived'",
            params![file_name, excluding_episode],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

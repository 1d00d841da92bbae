mod error;

pub use error::{PipelineError, PipelineResult};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PodcastConfig;
use crate::episode::{Episode, EpisodeDraft, EpisodeStatus, SqliteEpisodeStore};
use crate::feed::FeedGenerator;
use crate::fetcher::{episode_file_name, SourceFetcher};
use crate::normalizer::AudioNormalizer;
use crate::progress::{EpisodeProgress, ProgressDelta, ProgressStatus, ProgressTracker};
use crate::storage::ObjectStorage;

/// Terminal state of one download job, mapped onto the runner's exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Media fetched, published and fanned out.
    Completed,
    /// Nothing to do: the durable copy already matches the record.
    Ignored,
    /// The source refused us or the upload failed; episodes reflect it.
    Failed,
}

impl DownloadOutcome {
    pub fn code(&self) -> i32 {
        match self {
            DownloadOutcome::Completed => 0,
            DownloadOutcome::Ignored => 1,
            DownloadOutcome::Failed => 2,
        }
    }
}

/// Orchestrates one episode through fetch, normalize, upload and publish.
///
/// Stages run sequentially inside a single job; parallelism lives in the
/// queue that dispatches jobs. Every status mutation is batched over all
/// non-archived episodes sharing the source id, so podcasts that registered
/// the same video move in lockstep.
pub struct EpisodePipeline {
    store: SqliteEpisodeStore,
    storage: Arc<dyn ObjectStorage>,
    fetcher: Arc<dyn SourceFetcher>,
    normalizer: AudioNormalizer,
    tracker: ProgressTracker,
    feeds: FeedGenerator,
    config: PodcastConfig,
    http: reqwest::Client,
}

impl EpisodePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SqliteEpisodeStore,
        storage: Arc<dyn ObjectStorage>,
        fetcher: Arc<dyn SourceFetcher>,
        normalizer: AudioNormalizer,
        tracker: ProgressTracker,
        feeds: FeedGenerator,
        config: PodcastConfig,
    ) -> Self {
        Self {
            store,
            storage,
            fetcher,
            normalizer,
            tracker,
            feeds,
            config,
            http: reqwest::Client::new(),
        }
    }

    fn audio_object(&self, file_name: &str) -> String {
        format!("{}/{}", self.config.storage.audio_prefix, file_name)
    }

    /// Resolves source metadata and inserts an episode row in `New` state.
    pub async fn register_episode(&self, podcast_id: i64, link: &str) -> PipelineResult<i64> {
        self.store.fetch_podcast(podcast_id)?;
        let metadata = self.fetcher.resolve_metadata(link).await?;
        let file_name = episode_file_name(&metadata.external_id, &self.config.download.audio_format);
        let draft = EpisodeDraft {
            podcast_id,
            source_id: metadata.external_id.clone(),
            title: metadata.title,
            author: metadata.author,
            description: metadata.description,
            watch_url: Some(metadata.watch_url),
            image_url: metadata.thumbnail_url,
            duration_s: metadata.duration_s,
            file_name: Some(file_name),
        };
        let episode_id = self.store.create_episode(&draft)?;
        info!(episode_id, source_id = %draft.source_id, "episode registered");
        Ok(episode_id)
    }

    /// Runs the full acquisition job for one episode record.
    pub async fn run_download(
        &self,
        source_link: &str,
        episode_id: i64,
    ) -> PipelineResult<DownloadOutcome> {
        let episode = self.store.fetch_episode(episode_id)?;
        let source_id = episode.source_id.clone();
        let file_name = episode
            .file_name
            .clone()
            .unwrap_or_else(|| episode_file_name(&source_id, &self.config.download.audio_format));

        let remote = match episode.file_name.as_deref() {
            Some(name) => self.storage.head_object(&self.audio_object(name)).await?,
            None => None,
        };

        // The durable copy already matches what we recorded: republish the
        // sibling set and refresh feeds instead of downloading again.
        if let Some(remote) = remote {
            if remote.size > 0 && episode.file_size > 0 && remote.size == episode.file_size as u64 {
                info!(episode_id, source_id = %source_id, size = remote.size, "remote copy is current");
                self.store.mark_published(&source_id, episode.file_size)?;
                self.regenerate_feeds_for_source(&source_id).await?;
                self.tracker
                    .record(
                        &file_name,
                        ProgressStatus::Finished,
                        remote.size,
                        ProgressDelta::Absolute(remote.size),
                    )
                    .await;
                return Ok(DownloadOutcome::Ignored);
            }

            // A stale object under this name would shadow the fresh upload.
            if !matches!(episode.status, EpisodeStatus::New | EpisodeStatus::Downloading) {
                warn!(
                    episode_id,
                    source_id = %source_id,
                    remote_size = remote.size,
                    recorded_size = episode.file_size,
                    "removing stale remote object"
                );
                self.storage
                    .delete_object(&self.audio_object(&file_name))
                    .await?;
            }
        }

        let claimed = self.store.set_status(&source_id, EpisodeStatus::Downloading)?;
        debug!(episode_id, source_id = %source_id, claimed, "claimed episodes");

        let local_path = match self.fetcher.fetch(source_link, &file_name, &self.tracker).await {
            Ok(path) => path,
            Err(err) if err.is_source_unavailable() => {
                warn!(episode_id, source_id = %source_id, error = %err, "source unavailable, rolling back");
                self.store.set_status(&source_id, EpisodeStatus::New)?;
                self.record_error(&file_name).await;
                return Ok(DownloadOutcome::Failed);
            }
            Err(err) => {
                self.record_error(&file_name).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.normalizer.normalize(&local_path, &self.tracker).await {
            self.store.mark_error(&source_id)?;
            self.record_error(&file_name).await;
            return Err(err.into());
        }

        let object = self.audio_object(&file_name);
        let remote_url = match self.storage.upload_object(&local_path, &object, &self.tracker).await
        {
            Ok(url) => url,
            Err(err) => {
                warn!(episode_id, source_id = %source_id, error = %err, "upload failed");
                self.store.mark_error(&source_id)?;
                self.record_error(&file_name).await;
                return Ok(DownloadOutcome::Failed);
            }
        };

        self.store.set_file(&source_id, &file_name, &remote_url)?;
        // The store, not the local filesystem, is authoritative for size.
        let file_size = match self.storage.head_object(&object).await? {
            Some(info) => info.size,
            None => tokio::fs::metadata(&local_path)
                .await
                .map_err(|source| PipelineError::Io {
                    path: local_path.clone(),
                    source,
                })?
                .len(),
        };
        self.store.mark_published(&source_id, file_size as i64)?;

        self.mirror_cover(&episode, &file_name).await;
        self.regenerate_feeds_for_source(&source_id).await?;

        self.tracker
            .record(
                &file_name,
                ProgressStatus::Finished,
                file_size,
                ProgressDelta::Absolute(file_size),
            )
            .await;

        if let Err(err) = tokio::fs::remove_file(&local_path).await {
            warn!(path = %local_path.display(), error = %err, "scratch file cleanup failed");
        }

        info!(episode_id, source_id = %source_id, file_size, "episode published");
        Ok(DownloadOutcome::Completed)
    }

    /// Uploads every episode that has a local file but never reached durable
    /// storage, then refreshes all feeds. Missing local files are skipped.
    pub async fn upload_all_pending(&self) -> PipelineResult<usize> {
        let pending = self.store.episodes_missing_remote()?;
        let mut uploaded = 0;
        let mut seen = std::collections::HashSet::new();
        for episode in &pending {
            let Some(file_name) = episode.file_name.as_deref() else {
                continue;
            };
            // sibling rows share one physical file; one upload covers them all
            if !seen.insert(file_name.to_string()) {
                continue;
            }
            let local_path = self.config.tmp_audio_dir().join(file_name);
            if !local_path.exists() {
                debug!(episode_id = episode.id, path = %local_path.display(), "no local file, skipping");
                continue;
            }
            let object = self.audio_object(file_name);
            let remote_url = self
                .storage
                .upload_object(&local_path, &object, &self.tracker)
                .await?;
            self.store
                .set_file(&episode.source_id, file_name, &remote_url)?;
            uploaded += 1;
        }

        if uploaded > 0 {
            for podcast in self.store.list_podcasts()? {
                self.feeds.regenerate(podcast.id).await?;
            }
        }
        info!(pending = pending.len(), uploaded, "backfill upload finished");
        Ok(uploaded)
    }

    /// Removes scratch files whose durable copy is confirmed byte-identical
    /// in size. IO problems are logged and skipped.
    pub async fn delete_local_files_already_remote(&self) -> PipelineResult<usize> {
        let episodes = self.store.episodes_with_remote()?;
        let mut removed = 0;
        for episode in &episodes {
            let Some(file_name) = episode.file_name.as_deref() else {
                continue;
            };
            let local_path = self.config.tmp_audio_dir().join(file_name);
            let local_size = match tokio::fs::metadata(&local_path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => continue,
            };
            let remote = match self.storage.head_object(&self.audio_object(file_name)).await {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(object = %file_name, error = %err, "head failed, keeping local file");
                    continue;
                }
            };
            match remote {
                Some(info) if info.size == local_size => {
                    if let Err(err) = tokio::fs::remove_file(&local_path).await {
                        warn!(path = %local_path.display(), error = %err, "local delete failed");
                    } else {
                        removed += 1;
                    }
                }
                _ => {
                    debug!(object = %file_name, local_size, "sizes differ, keeping local file");
                }
            }
        }
        info!(candidates = episodes.len(), removed, "local scratch cleanup finished");
        Ok(removed)
    }

    /// Drops durable objects for the given file names. Callers are expected
    /// to consult [`SqliteEpisodeStore::is_file_shared`] first so an object
    /// still referenced by another active episode survives.
    pub async fn delete_remote_files(&self, file_names: &[String]) -> usize {
        let objects: Vec<String> = file_names
            .iter()
            .map(|name| self.audio_object(name))
            .collect();
        self.storage.delete_many(&objects).await
    }

    pub async fn generate_feed(&self, podcast_id: i64) -> PipelineResult<PathBuf> {
        Ok(self.feeds.regenerate(podcast_id).await?)
    }

    /// Progress snapshot for every episode currently moving or failed.
    pub async fn check_state(&self) -> PipelineResult<Vec<EpisodeProgress>> {
        let episodes = self.store.episodes_in_progress()?;
        Ok(self.tracker.check_state(&episodes).await)
    }

    async fn regenerate_feeds_for_source(&self, source_id: &str) -> PipelineResult<()> {
        for podcast_id in self.store.podcast_ids_for_source(source_id)? {
            self.feeds.regenerate(podcast_id).await?;
        }
        Ok(())
    }

    async fn record_error(&self, file_name: &str) {
        self.tracker
            .record(file_name, ProgressStatus::Error, 0, ProgressDelta::Chunk(0))
            .await;
    }

    /// Copies the source thumbnail into our store so feeds never hotlink the
    /// origin platform. Strictly best-effort: a missing cover never fails a
    /// publish.
    async fn mirror_cover(&self, episode: &Episode, file_name: &str) {
        let Some(image_url) = episode.image_url.as_deref() else {
            return;
        };
        if image_url.starts_with(&self.config.storage.endpoint_url) {
            return;
        }

        self.tracker
            .record(
                file_name,
                ProgressStatus::CoverDownloading,
                0,
                ProgressDelta::Chunk(0),
            )
            .await;
        let bytes = match self.fetch_cover(image_url).await {
            Ok(bytes) => bytes,
            Err(reason) => {
                warn!(url = %image_url, reason, "cover download failed");
                return;
            }
        };

        self.tracker
            .record(
                file_name,
                ProgressStatus::CoverUploading,
                0,
                ProgressDelta::Chunk(0),
            )
            .await;
        let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
        let object = format!("{}/{stem}.jpg", self.config.storage.image_prefix);
        match self.storage.upload_bytes(bytes, &object, "image/jpeg").await {
            Ok(url) => {
                if let Err(err) = self.store.set_image_url(&episode.source_id, &url) {
                    warn!(source_id = %episode.source_id, error = %err, "cover url update failed");
                }
            }
            Err(err) => warn!(object = %object, error = %err, "cover upload failed"),
        }
    }

    async fn fetch_cover(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|err| err.to_string())?;
        Ok(bytes.to_vec())
    }
}

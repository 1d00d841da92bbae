#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use podcast_core::config::{
    DownloadSection, FeedSection, NormalizeSection, PathsSection, PodcastConfig, ProgressSection,
    StorageSection, SystemSection,
};
use podcast_core::episode::{EpisodeDraft, PodcastDraft, SqliteEpisodeStore};
use podcast_core::feed::FeedGenerator;
use podcast_core::fetcher::{FetchError, FetchResult, SourceFetcher, SourceMetadata};
use podcast_core::normalizer::AudioNormalizer;
use podcast_core::pipeline::EpisodePipeline;
use podcast_core::progress::{
    MemoryProgressBackend, ProgressDelta, ProgressStatus, ProgressTracker,
};
use podcast_core::storage::{ObjectInfo, ObjectStorage, StorageError, StorageResult};

pub const SOURCE_ID: &str = "mIje48733uU";
pub const FILE_NAME: &str = "mIje48733uU_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.mp3";
pub const WATCH_URL: &str = "https://www.youtube.com/watch?v=mIje48733uU";

/// In-memory object store standing in for the S3-compatible backend.
#[derive(Default)]
pub struct FakeStorage {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_uploads: AtomicBool,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(name.to_string(), bytes);
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn head_object(&self, name: &str) -> StorageResult<Option<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(name)
            .map(|bytes| ObjectInfo {
                size: bytes.len() as u64,
            }))
    }

    async fn upload_object(
        &self,
        local_path: &Path,
        name: &str,
        tracker: &ProgressTracker,
    ) -> StorageResult<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Unexpected {
                object: name.to_string(),
                reason: "injected upload failure".into(),
            });
        }
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|source| StorageError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tracker
            .record(
                &file_name,
                ProgressStatus::Uploading,
                bytes.len() as u64,
                ProgressDelta::Absolute(bytes.len() as u64),
            )
            .await;
        self.insert(name, bytes);
        Ok(self.public_url(name))
    }

    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        name: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Unexpected {
                object: name.to_string(),
                reason: "injected upload failure".into(),
            });
        }
        self.insert(name, bytes);
        Ok(self.public_url(name))
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }

    fn public_url(&self, name: &str) -> String {
        format!("http://store.test/podcasts/{name}")
    }
}

pub enum FetchBehavior {
    /// Writes the payload under the target file name.
    Payload(Vec<u8>),
    Unavailable,
    /// Panics when invoked; for runs that must short-circuit earlier.
    Refuse,
}

pub struct FakeFetcher {
    scratch_dir: PathBuf,
    behavior: FetchBehavior,
}

impl FakeFetcher {
    pub fn new(scratch_dir: impl AsRef<Path>, behavior: FetchBehavior) -> Arc<Self> {
        Arc::new(Self {
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
            behavior,
        })
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn resolve_metadata(&self, link: &str) -> FetchResult<SourceMetadata> {
        Ok(SourceMetadata {
            external_id: SOURCE_ID.to_string(),
            title: "Fixture episode".to_string(),
            author: Some("Fixture author".to_string()),
            description: "About nothing".to_string(),
            duration_s: 123,
            thumbnail_url: None,
            watch_url: link.to_string(),
        })
    }

    async fn fetch(
        &self,
        _link: &str,
        target_file_name: &str,
        tracker: &ProgressTracker,
    ) -> FetchResult<PathBuf> {
        match &self.behavior {
            FetchBehavior::Payload(payload) => {
                tokio::fs::create_dir_all(&self.scratch_dir)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: self.scratch_dir.clone(),
                        source,
                    })?;
                let path = self.scratch_dir.join(target_file_name);
                tokio::fs::write(&path, payload)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracker
                    .record(
                        target_file_name,
                        ProgressStatus::Downloading,
                        payload.len() as u64,
                        ProgressDelta::Absolute(payload.len() as u64),
                    )
                    .await;
                Ok(path)
            }
            FetchBehavior::Unavailable => {
                Err(FetchError::SourceUnavailable("Video unavailable".into()))
            }
            FetchBehavior::Refuse => panic!("fetch must not run in this scenario"),
        }
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub config: PodcastConfig,
    pub store: SqliteEpisodeStore,
    pub storage: Arc<FakeStorage>,
    pub backend: Arc<MemoryProgressBackend>,
    pub tracker: ProgressTracker,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let config = test_config(tmp.path());
        write_fake_encoder(tmp.path(), true);
        let store = SqliteEpisodeStore::new(config.database_path()).expect("store");
        store.initialize().expect("schema");
        let storage = FakeStorage::new();
        let backend = Arc::new(MemoryProgressBackend::new());
        let tracker = ProgressTracker::new(backend.clone(), config.progress.ttl());
        Self {
            tmp,
            config,
            store,
            storage,
            backend,
            tracker,
        }
    }

    /// Swaps the fake encoder for one that always exits nonzero.
    pub fn break_encoder(&self) {
        write_fake_encoder(self.tmp.path(), false);
    }

    pub fn feed_generator(&self, mirror: bool) -> FeedGenerator {
        let mut section = self.config.feed.clone();
        section.mirror_to_storage = mirror;
        FeedGenerator::new(
            self.store.clone(),
            Some(self.storage.clone() as Arc<dyn ObjectStorage>),
            section,
            self.config.rss_dir(),
            self.config.storage.feed_prefix.clone(),
        )
    }

    pub fn pipeline(&self, behavior: FetchBehavior) -> EpisodePipeline {
        let fetcher = FakeFetcher::new(self.config.tmp_audio_dir(), behavior);
        EpisodePipeline::new(
            self.store.clone(),
            self.storage.clone(),
            fetcher,
            AudioNormalizer::new(self.config.normalize.clone()),
            self.tracker.clone(),
            self.feed_generator(false),
            self.config.clone(),
        )
    }

    /// Two podcasts that both registered the same source video.
    pub fn seed_sibling_episodes(&self) -> (i64, i64) {
        let first_podcast = self
            .store
            .create_podcast(&PodcastDraft::new("Morning Show"))
            .unwrap();
        let second_podcast = self
            .store
            .create_podcast(&PodcastDraft::new("Evening Show"))
            .unwrap();
        let first = self
            .store
            .create_episode(&draft(first_podcast))
            .unwrap();
        let second = self
            .store
            .create_episode(&draft(second_podcast))
            .unwrap();
        (first, second)
    }
}

pub fn draft(podcast_id: i64) -> EpisodeDraft {
    EpisodeDraft {
        podcast_id,
        source_id: SOURCE_ID.to_string(),
        title: "Fixture episode".to_string(),
        author: Some("Fixture author".to_string()),
        description: "About nothing".to_string(),
        watch_url: Some(WATCH_URL.to_string()),
        image_url: None,
        duration_s: 123,
        file_name: Some(FILE_NAME.to_string()),
    }
}

pub fn test_config(base: &Path) -> PodcastConfig {
    PodcastConfig {
        system: SystemSection {
            node_name: "test-node".into(),
            environment: "test".into(),
        },
        paths: PathsSection {
            base_dir: base.to_string_lossy().to_string(),
            tmp_audio_dir: "tmp_audio".into(),
            rss_dir: "rss".into(),
            logs_dir: "logs".into(),
            database: "podcast.db".into(),
        },
        storage: StorageSection {
            endpoint_url: "http://store.test".into(),
            bucket: "podcasts".into(),
            audio_prefix: "audio".into(),
            feed_prefix: "rss".into(),
            image_prefix: "images".into(),
            request_timeout_seconds: 5,
            upload_chunk_kb: 64,
        },
        download: DownloadSection {
            tool: "yt-dlp".into(),
            audio_format: "mp3".into(),
            audio_quality: "192K".into(),
            timeout_seconds: 30,
        },
        normalize: NormalizeSection {
            tool: base.join("fake-encoder").to_string_lossy().to_string(),
            audio_bitrate: "128k".into(),
            timeout_seconds: 30,
        },
        progress: ProgressSection { ttl_minutes: 60 },
        feed: FeedSection {
            site_url: "http://feeds.test".into(),
            language: "en-us".into(),
            mirror_to_storage: false,
        },
    }
}

/// Stand-in for the encoder binary: copies input to output, or fails.
fn write_fake_encoder(base: &Path, succeed: bool) {
    use std::os::unix::fs::PermissionsExt;

    let path = base.join("fake-encoder");
    let script = if succeed {
        // args: -y -i <input> -vn -b:a <bitrate> <output>
        "#!/bin/sh\ncp \"$3\" \"$7\"\n"
    } else {
        "#!/bin/sh\necho 'encoder blew up' >&2\nexit 1\n"
    };
    std::fs::write(&path, script).expect("write encoder script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod encoder script");
}

pub mod config;
pub mod episode;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod normalizer;
pub mod pipeline;
pub mod progress;
pub mod sqlite;
pub mod storage;

pub use config::{
    load_podcast_config, DownloadSection, FeedSection, NormalizeSection, PathsSection,
    PodcastConfig, ProgressSection, StorageSection, SystemSection,
};
pub use episode::{
    Episode, EpisodeDraft, EpisodeError, EpisodeResult, EpisodeStatus, Podcast, PodcastDraft,
    SqliteEpisodeStore, SqliteEpisodeStoreBuilder,
};
pub use error::{ConfigError, Result};
pub use feed::{FeedError, FeedGenerator, FeedResult};
pub use fetcher::{
    episode_file_name, extract_source_id, FetchError, FetchResult, SourceFetcher, SourceMetadata,
    YtDlpFetcher,
};
pub use normalizer::{AudioNormalizer, NormalizeError, NormalizeResult};
pub use pipeline::{DownloadOutcome, EpisodePipeline, PipelineError, PipelineResult};
pub use progress::{
    progress_key, EpisodeProgress, MemoryProgressBackend, ProgressBackend, ProgressDelta,
    ProgressError, ProgressEvent, ProgressResult, ProgressStatus, ProgressTracker,
    SqliteProgressBackend, DEFAULT_PROGRESS_TTL,
};
pub use storage::{
    HttpObjectStorage, ObjectInfo, ObjectStorage, StorageError, StorageResult,
};

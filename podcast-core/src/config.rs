use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PodcastConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub storage: StorageSection,
    pub download: DownloadSection,
    pub normalize: NormalizeSection,
    pub progress: ProgressSection,
    pub feed: FeedSection,
}

impl PodcastConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn tmp_audio_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.tmp_audio_dir)
    }

    pub fn rss_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.rss_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    /// Progress entries live in a sibling file of the episodes database so
    /// pollers in other processes can read them.
    pub fn progress_db_path(&self) -> PathBuf {
        self.database_path().with_file_name("progress.db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.normalize.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "normalize.timeout_seconds".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.progress.ttl_minutes == 0 {
            return Err(ConfigError::Invalid {
                field: "progress.ttl_minutes".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub tmp_audio_dir: String,
    pub rss_dir: String,
    pub logs_dir: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub endpoint_url: String,
    pub bucket: String,
    pub audio_prefix: String,
    pub feed_prefix: String,
    pub image_prefix: String,
    pub request_timeout_seconds: u64,
    pub upload_chunk_kb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub tool: String,
    pub audio_format: String,
    pub audio_quality: String,
    pub timeout_seconds: u64,
}

impl DownloadSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizeSection {
    pub tool: String,
    pub audio_bitrate: String,
    pub timeout_seconds: u64,
}

impl NormalizeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressSection {
    pub ttl_minutes: u64,
}

impl ProgressSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSection {
    pub site_url: String,
    pub language: String,
    pub mirror_to_storage: bool,
}

pub fn load_podcast_config<P: AsRef<Path>>(path: P) -> Result<PodcastConfig> {
    let config: PodcastConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

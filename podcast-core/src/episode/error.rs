use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpisodeError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("episode {episode_id} not found")]
    NotFound { episode_id: i64 },
    #[error("podcast {podcast_id} not found")]
    PodcastNotFound { podcast_id: i64 },
    #[error("invalid episode status: {0}")]
    InvalidStatus(String),
    #[error("episode store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type EpisodeResult<T> = std::result::Result<T, EpisodeError>;

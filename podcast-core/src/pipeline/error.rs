use std::path::PathBuf;

use thiserror::Error;

use crate::episode::EpisodeError;
use crate::feed::FeedError;
use crate::fetcher::FetchError;
use crate::normalizer::NormalizeError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Episode(#[from] EpisodeError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

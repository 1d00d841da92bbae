use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::StorageSection;
use crate::progress::{ProgressDelta, ProgressStatus, ProgressTracker};

#[derive(Debug, Error)]
pub enum StorageError {
    /// The store rejected the request (4xx). The object state is known.
    #[error("storage rejected {object}: status {status}")]
    Client { object: String, status: u16 },
    /// Transport failure or 5xx; the object state is unknown.
    #[error("storage request for {object} failed: {reason}")]
    Unexpected { object: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Size probe without a download. `None` means the object does not exist.
    async fn head_object(&self, name: &str) -> StorageResult<Option<ObjectInfo>>;

    /// Streams a local file into the store and returns its public URL.
    async fn upload_object(
        &self,
        local_path: &Path,
        name: &str,
        tracker: &ProgressTracker,
    ) -> StorageResult<String>;

    /// Uploads raw bytes under the given name (cover images, feed documents).
    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> StorageResult<String>;

    async fn delete_object(&self, name: &str) -> StorageResult<()>;

    /// Best-effort batch delete. Per-object failures are logged, not
    /// propagated; returns the number of confirmed deletions.
    async fn delete_many(&self, names: &[String]) -> usize {
        let mut deleted = 0;
        for name in names {
            match self.delete_object(name).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(object = %name, error = %err, "delete failed"),
            }
        }
        deleted
    }

    /// Public URL an uploaded object will be served from.
    fn public_url(&self, name: &str) -> String;
}

/// S3-compatible store spoken over plain HTTP verbs. Objects are uploaded
/// world-readable since feed clients fetch them without credentials.
pub struct HttpObjectStorage {
    section: StorageSection,
    client: reqwest::Client,
}

impl HttpObjectStorage {
    pub fn new(section: StorageSection) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.request_timeout_seconds))
            .build()
            .map_err(|err| StorageError::Unexpected {
                object: section.bucket.clone(),
                reason: err.to_string(),
            })?;
        Ok(Self { section, client })
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.section.endpoint_url.trim_end_matches('/'),
            self.section.bucket,
            name
        )
    }

    fn unexpected(&self, name: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::Unexpected {
            object: name.to_string(),
            reason: err.to_string(),
        }
    }

    fn check_status(&self, name: &str, status: StatusCode) -> StorageResult<()> {
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(StorageError::Client {
                object: name.to_string(),
                status: status.as_u16(),
            })
        } else {
            Err(StorageError::Unexpected {
                object: name.to_string(),
                reason: format!("status {status}"),
            })
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn head_object(&self, name: &str) -> StorageResult<Option<ObjectInfo>> {
        let response = self
            .client
            .head(self.object_url(name))
            .send()
            .await
            .map_err(|err| self.unexpected(name, err))?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(None),
            status => {
                self.check_status(name, status)?;
                let size = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0);
                Ok(Some(ObjectInfo { size }))
            }
        }
    }

    async fn upload_object(
        &self,
        local_path: &Path,
        name: &str,
        tracker: &ProgressTracker,
    ) -> StorageResult<String> {
        let metadata =
            tokio::fs::metadata(local_path)
                .await
                .map_err(|source| StorageError::Io {
                    path: local_path.to_path_buf(),
                    source,
                })?;
        let total = metadata.len();
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|source| StorageError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;

        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string());
        tracker
            .record(
                &file_name,
                ProgressStatus::Uploading,
                total,
                ProgressDelta::Absolute(0),
            )
            .await;

        let chunk_size = self.section.upload_chunk_kb.max(1) * 1024;
        let tracker = tracker.clone();
        let progress_name = file_name.clone();
        let body_stream = stream::unfold(
            (file, tracker, progress_name),
            move |(mut file, tracker, progress_name)| async move {
                let mut buffer = vec![0u8; chunk_size];
                match file.read(&mut buffer).await {
                    Ok(0) => None,
                    Ok(read) => {
                        buffer.truncate(read);
                        tracker
                            .record(
                                &progress_name,
                                ProgressStatus::Uploading,
                                0,
                                ProgressDelta::Chunk(read as u64),
                            )
                            .await;
                        Some((
                            Ok::<_, std::io::Error>(buffer),
                            (file, tracker, progress_name),
                        ))
                    }
                    Err(err) => Some((Err(err), (file, tracker, progress_name))),
                }
            },
        );

        let content_type = content_type_for(name);
        debug!(object = %name, total, content_type, "uploading object");
        let response = self
            .client
            .put(self.object_url(name))
            .header("x-amz-acl", "public-read")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(|err| self.unexpected(name, err))?;
        self.check_status(name, response.status())?;

        let url = self.public_url(name);
        info!(object = %name, url = %url, total, "object uploaded");
        Ok(url)
    }

    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        let response = self
            .client
            .put(self.object_url(name))
            .header("x-amz-acl", "public-read")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| self.unexpected(name, err))?;
        self.check_status(name, response.status())?;
        Ok(self.public_url(name))
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        let response = self
            .client
            .delete(self.object_url(name))
            .send()
            .await
            .map_err(|err| self.unexpected(name, err))?;
        match response.status() {
            // deleting a missing object is a no-op
            StatusCode::NOT_FOUND => Ok(()),
            status => self.check_status(name, status),
        }
    }

    fn public_url(&self, name: &str) -> String {
        self.object_url(name)
    }
}

pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("xml") | Some("rss") => "application/rss+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("audio/a_b.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("images/cover.jpg"), "image/jpeg");
        assert_eq!(content_type_for("rss/feed.xml"), "application/rss+xml");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn object_urls_are_joined_once() {
        let storage = HttpObjectStorage::new(StorageSection {
            endpoint_url: "https://storage.example.net/".into(),
            bucket: "podcasts".into(),
            audio_prefix: "audio".into(),
            feed_prefix: "rss".into(),
            image_prefix: "images".into(),
            request_timeout_seconds: 30,
            upload_chunk_kb: 256,
        })
        .unwrap();
        assert_eq!(
            storage.public_url("audio/ep.mp3"),
            "https://storage.example.net/podcasts/audio/ep.mp3"
        );
    }
}

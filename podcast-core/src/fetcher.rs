use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DownloadSection;
use crate::progress::{ProgressDelta, ProgressStatus, ProgressTracker};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source link is not a valid watch url: {0}")]
    InvalidLink(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("source metadata malformed: {0}")]
    Metadata(String),
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status:?}: {stderr}")]
    Exit {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

impl FetchError {
    /// Recoverable condition: the remote platform refused us. The pipeline
    /// rolls claimed episodes back instead of propagating.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            FetchError::SourceUnavailable(_) | FetchError::InvalidLink(_) | FetchError::Metadata(_)
        )
    }
}

/// Canonical description of a remote video, resolved before any download is
/// queued.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    pub external_id: String,
    pub title: String,
    pub author: Option<String>,
    pub description: String,
    pub duration_s: i64,
    pub thumbnail_url: Option<String>,
    pub watch_url: String,
}

/// External video id embedded in a watch url (11 url-safe characters).
pub fn extract_source_id(link: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?:v=|/)([0-9A-Za-z_-]{11})(?:[^0-9A-Za-z_-]|$)").ok()?;
    re.captures(link)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Object name for one source id. The uuid suffix keeps re-uploads from
/// colliding with stale CDN caches; [`crate::progress::progress_key`] strips
/// it again.
pub fn episode_file_name(source_id: &str, extension: &str) -> String {
    format!("{source_id}_{}.{extension}", Uuid::new_v4().simple())
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Extracts canonical metadata without downloading anything.
    async fn resolve_metadata(&self, link: &str) -> FetchResult<SourceMetadata>;

    /// Downloads the audio stream into scratch storage under the target file
    /// name, reporting byte progress through the tracker.
    async fn fetch(
        &self,
        link: &str,
        target_file_name: &str,
        tracker: &ProgressTracker,
    ) -> FetchResult<PathBuf>;
}

/// Fetcher backed by the yt-dlp command line tool.
pub struct YtDlpFetcher {
    section: DownloadSection,
    scratch_dir: PathBuf,
}

impl YtDlpFetcher {
    pub fn new(section: DownloadSection, scratch_dir: impl AsRef<Path>) -> Self {
        Self {
            section,
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
        }
    }

    fn classify_failure(&self, status: Option<i32>, stderr: &str) -> FetchError {
        if stderr_reports_unavailable(stderr) {
            FetchError::SourceUnavailable(last_error_line(stderr))
        } else {
            FetchError::Exit {
                tool: self.section.tool.clone(),
                status,
                stderr: last_error_line(stderr),
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for YtDlpFetcher {
    async fn resolve_metadata(&self, link: &str) -> FetchResult<SourceMetadata> {
        extract_source_id(link).ok_or_else(|| FetchError::InvalidLink(link.to_string()))?;

        let mut command = Command::new(&self.section.tool);
        command
            .kill_on_drop(true)
            .arg("--dump-json")
            .arg("--no-playlist")
            .arg(link)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let execution = timeout(self.section.timeout(), command.output());
        let output = match execution.await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(FetchError::Spawn {
                    tool: self.section.tool.clone(),
                    source,
                })
            }
            Err(_) => return Err(FetchError::Timeout(self.section.timeout())),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.classify_failure(output.status.code(), &stderr));
        }

        let raw: RawMetadata = serde_json::from_slice(&output.stdout)
            .map_err(|err| FetchError::Metadata(err.to_string()))?;
        let metadata = SourceMetadata {
            external_id: raw.id,
            title: raw.title,
            author: raw.uploader,
            description: raw.description.unwrap_or_default(),
            duration_s: raw.duration.map(|d| d.round() as i64).unwrap_or(0),
            thumbnail_url: raw.thumbnail,
            watch_url: raw.webpage_url.unwrap_or_else(|| link.to_string()),
        };
        debug!(source_id = %metadata.external_id, "resolved source metadata");
        Ok(metadata)
    }

    async fn fetch(
        &self,
        link: &str,
        target_file_name: &str,
        tracker: &ProgressTracker,
    ) -> FetchResult<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| FetchError::Io {
                path: self.scratch_dir.clone(),
                source,
            })?;

        let stem = target_file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(target_file_name);
        let template = self.scratch_dir.join(format!("{stem}.%(ext)s"));
        let result_path = self.scratch_dir.join(target_file_name);

        tracker
            .record(
                target_file_name,
                ProgressStatus::Pending,
                0,
                ProgressDelta::Absolute(0),
            )
            .await;

        let mut command = Command::new(&self.section.tool);
        command
            .kill_on_drop(true)
            .arg("-f")
            .arg("bestaudio/best")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg(&self.section.audio_format)
            .arg("--audio-quality")
            .arg(&self.section.audio_quality)
            .arg("--no-playlist")
            .arg("--newline")
            .arg("-o")
            .arg(&template)
            .arg(link)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| FetchError::Spawn {
            tool: self.section.tool.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let download = async {
            let mut stderr_tail = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some((processed, total)) = parse_progress_line(&line) {
                        tracker
                            .record(
                                target_file_name,
                                ProgressStatus::Downloading,
                                total,
                                ProgressDelta::Absolute(processed),
                            )
                            .await;
                    }
                }
            }
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_tail.push_str(&line);
                    stderr_tail.push('\n');
                }
            }
            let status = child.wait().await.map_err(|source| FetchError::Spawn {
                tool: self.section.tool.clone(),
                source,
            })?;
            Ok::<_, FetchError>((status, stderr_tail))
        };

        let (status, stderr_tail) = match timeout(self.section.timeout(), download).await {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::Timeout(self.section.timeout())),
        };

        if !status.success() {
            warn!(link, stderr = %last_error_line(&stderr_tail), "download failed");
            return Err(self.classify_failure(status.code(), &stderr_tail));
        }

        let size = tokio::fs::metadata(&result_path)
            .await
            .map_err(|source| FetchError::Io {
                path: result_path.clone(),
                source,
            })?
            .len();
        tracker
            .record(
                target_file_name,
                ProgressStatus::Downloading,
                size,
                ProgressDelta::Absolute(size),
            )
            .await;
        info!(link, path = %result_path.display(), size, "download finished");
        Ok(result_path)
    }
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    id: String,
    title: String,
    uploader: Option<String>,
    description: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
}

fn stderr_reports_unavailable(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Video unavailable",
        "Private video",
        "This video is not available",
        "Sign in to confirm",
        "Unsupported URL",
        "is not a valid URL",
        "Unable to extract",
        "members-only",
        "has been removed",
    ];
    MARKERS.iter().any(|marker| stderr.contains(marker))
}

fn last_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Parses one `--newline` progress line into (processed, total) bytes.
fn parse_progress_line(line: &str) -> Option<(u64, u64)> {
    let re = regex::Regex::new(
        r"\[download\]\s+(?P<pct>[\d.]+)%\s+of\s+~?\s*(?P<size>[\d.]+)(?P<unit>[KMG]iB|B)",
    )
    .ok()?;
    let caps = re.captures(line)?;
    let percent: f64 = caps.name("pct")?.as_str().parse().ok()?;
    let size: f64 = caps.name("size")?.as_str().parse().ok()?;
    let multiplier = match caps.name("unit")?.as_str() {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    let total = (size * multiplier).round() as u64;
    let processed = ((percent / 100.0) * total as f64).round() as u64;
    Some((processed, total))
}

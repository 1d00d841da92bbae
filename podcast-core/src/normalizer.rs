use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::NormalizeSection;
use crate::progress::{ProgressDelta, ProgressStatus, ProgressTracker};

#[derive(Debug, Error)]
pub enum NormalizeError {
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
    #[error("normalization timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type NormalizeResult<T> = std::result::Result<T, NormalizeError>;

/// Re-encodes downloaded audio to a uniform bitrate with ffmpeg. Output goes
/// to a sibling temp file first; the original path is only replaced after the
/// encoder exits cleanly, so a killed run never leaves a truncated file
/// behind.
pub struct AudioNormalizer {
    section: NormalizeSection,
}

impl AudioNormalizer {
    pub fn new(section: NormalizeSection) -> Self {
        Self { section }
    }

    pub async fn normalize(
        &self,
        input: &Path,
        tracker: &ProgressTracker,
    ) -> NormalizeResult<()> {
        let file_name = input
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let input_size = tokio::fs::metadata(input)
            .await
            .map_err(|source| NormalizeError::Io {
                path: input.to_path_buf(),
                source,
            })?
            .len();
        tracker
            .record(
                &file_name,
                ProgressStatus::PostProcessing,
                input_size,
                ProgressDelta::Absolute(0),
            )
            .await;

        let scratch = scratch_path(input);
        let mut command = Command::new(&self.section.tool);
        command
            .kill_on_drop(true)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-b:a")
            .arg(&self.section.audio_bitrate)
            .arg(&scratch)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!(input = %input.display(), bitrate = %self.section.audio_bitrate, "normalizing audio");

        let execution = timeout(self.section.timeout(), command.output());
        let output = match execution.await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(NormalizeError::Spawn {
                    tool: self.section.tool.clone(),
                    source,
                })
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                return Err(NormalizeError::Timeout(self.section.timeout()));
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&scratch).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NormalizeError::Exit {
                tool: self.section.tool.clone(),
                status: output.status.code(),
                stderr: stderr_tail(&stderr),
            });
        }

        tokio::fs::rename(&scratch, input)
            .await
            .map_err(|source| NormalizeError::Io {
                path: scratch.clone(),
                source,
            })?;

        let output_size = tokio::fs::metadata(input)
            .await
            .map_err(|source| NormalizeError::Io {
                path: input.to_path_buf(),
                source,
            })?
            .len();
        tracker
            .record(
                &file_name,
                ProgressStatus::PostProcessing,
                output_size,
                ProgressDelta::Absolute(output_size),
            )
            .await;
        info!(input = %input.display(), input_size, output_size, "audio normalized");
        Ok(())
    }
}

/// Sibling scratch path with the input's own extension, so the encoder
/// infers the same container it will be renamed back to.
fn scratch_path(input: &Path) -> PathBuf {
    let extension = input
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mp3");
    input.with_extension(format!("normalize.{extension}"))
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::progress::{MemoryProgressBackend, ProgressTracker};

    #[test]
    fn scratch_path_keeps_input_container() {
        assert_eq!(
            scratch_path(Path::new("/tmp/a/x.m4a")),
            PathBuf::from("/tmp/a/x.normalize.m4a")
        );
        assert_eq!(
            scratch_path(Path::new("/tmp/a/x.ogg")),
            PathBuf::from("/tmp/a/x.normalize.ogg")
        );
        assert_eq!(
            scratch_path(Path::new("x.mp3")),
            PathBuf::from("x.normalize.mp3")
        );
    }

    #[tokio::test]
    async fn normalize_replaces_input_in_place_for_any_container() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        // stand-in encoder: copies input to output
        let tool = tmp.path().join("encoder");
        std::fs::write(&tool, "#!/bin/sh\ncp \"$3\" \"$7\"\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = tmp.path().join("episode.m4a");
        std::fs::write(&input, b"aac audio").unwrap();

        let normalizer = AudioNormalizer::new(NormalizeSection {
            tool: tool.to_string_lossy().to_string(),
            audio_bitrate: "128k".into(),
            timeout_seconds: 30,
        });
        let tracker = ProgressTracker::new(
            Arc::new(MemoryProgressBackend::new()),
            Duration::from_secs(60),
        );
        normalizer.normalize(&input, &tracker).await.unwrap();

        assert_eq!(std::fs::read(&input).unwrap(), b"aac audio");
        assert!(!tmp.path().join("episode.normalize.m4a").exists());
        assert!(!tmp.path().join("episode.normalize.mp3").exists());
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = (1..=10)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 6"));
        assert!(tail.ends_with("line 10"));
    }

    #[test]
    fn stderr_tail_skips_blank_lines() {
        assert_eq!(stderr_tail("\n\nerror: bad stream\n\n"), "error: bad stream");
    }
}

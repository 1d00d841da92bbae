use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use hex::encode as hex_encode;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::EpisodeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    New,
    Downloading,
    Published,
    Archived,
    Error,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::New => "new",
            EpisodeStatus::Downloading => "downloading",
            EpisodeStatus::Published => "published",
            EpisodeStatus::Archived => "archived",
            EpisodeStatus::Error => "error",
        }
    }

    /// Archived episodes are excluded from every batched source-id mutation.
    pub fn active(&self) -> bool {
        !matches!(self, EpisodeStatus::Archived)
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeStatus {
    type Err = EpisodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(EpisodeStatus::New),
            "downloading" => Ok(EpisodeStatus::Downloading),
            "published" => Ok(EpisodeStatus::Published),
            "archived" => Ok(EpisodeStatus::Archived),
            "error" => Ok(EpisodeStatus::Error),
            other => Err(EpisodeError::InvalidStatus(other.to_string())),
        }
    }
}

/// Insert payload for a new episode row; the row type is [`Episode`].
#[derive(Debug, Clone, Default)]
pub struct EpisodeDraft {
    pub podcast_id: i64,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub description: String,
    pub watch_url: Option<String>,
    pub image_url: Option<String>,
    pub duration_s: i64,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub id: i64,
    pub podcast_id: i64,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub description: String,
    pub watch_url: Option<String>,
    pub remote_url: Option<String>,
    pub image_url: Option<String>,
    pub duration_s: i64,
    pub file_name: Option<String>,
    pub file_size: i64,
    pub status: EpisodeStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Episode {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let published_at: Option<NaiveDateTime> = row.get("published_at")?;
        let status_index = row.as_ref().column_index("status")?;
        // a row with a status outside the lifecycle must never re-enter it
        let status = row
            .get::<_, String>(status_index)?
            .parse()
            .map_err(|err: EpisodeError| {
                rusqlite::Error::FromSqlConversionFailure(
                    status_index,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
        Ok(Self {
            id: row.get("id")?,
            podcast_id: row.get("podcast_id")?,
            source_id: row.get("source_id")?,
            title: row.get("title")?,
            author: row.get("author")?,
            description: row.get::<_, Option<String>>("description")?.unwrap_or_default(),
            watch_url: row.get("watch_url")?,
            remote_url: row.get("remote_url")?,
            image_url: row.get("image_url")?,
            duration_s: row.get::<_, Option<i64>>("duration_s")?.unwrap_or(0),
            file_name: row.get("file_name")?,
            file_size: row.get::<_, Option<i64>>("file_size")?.unwrap_or(0),
            status,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            published_at: published_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    pub fn content_type(&self) -> String {
        let extension = self
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .unwrap_or("mp3");
        format!("audio/{extension}")
    }
}

/// Insert payload for a new podcast row; the row type is [`Podcast`].
#[derive(Debug, Clone)]
pub struct PodcastDraft {
    pub publish_id: String,
    pub name: String,
    pub description: Option<String>,
    pub download_automatically: bool,
}

impl PodcastDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            publish_id: Podcast::generate_publish_id(),
            name: name.into(),
            description: None,
            download_automatically: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Podcast {
    pub id: i64,
    pub publish_id: String,
    pub name: String,
    pub description: Option<String>,
    pub download_automatically: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl Podcast {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        Ok(Self {
            id: row.get("id")?,
            publish_id: row.get("publish_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            download_automatically: match row.get::<_, Option<i64>>("download_automatically")? {
                Some(value) => value != 0,
                None => true,
            },
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    /// Public feed slug: 32 hex chars derived from a random uuid.
    pub fn generate_publish_id() -> String {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().simple().to_string().as_bytes());
        let digest = hex_encode(hasher.finalize());
        digest.chars().step_by(2).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            EpisodeStatus::New,
            EpisodeStatus::Downloading,
            EpisodeStatus::Published,
            EpisodeStatus::Archived,
            EpisodeStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<EpisodeStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<EpisodeStatus>().is_err());
    }

    #[test]
    fn publish_id_shape() {
        let first = Podcast::generate_publish_id();
        let second = Podcast::generate_publish_id();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::config::FeedSection;
use crate::episode::{Episode, EpisodeError, Podcast, SqliteEpisodeStore};
use crate::storage::{ObjectStorage, StorageError};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Episode(#[from] EpisodeError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// Renders the public RSS document for a podcast and writes it under the
/// feed directory as `<publish_id>.xml`. Only published episodes with a
/// publish timestamp appear, newest first.
pub struct FeedGenerator {
    store: SqliteEpisodeStore,
    storage: Option<Arc<dyn ObjectStorage>>,
    section: FeedSection,
    rss_dir: PathBuf,
    feed_prefix: String,
}

impl FeedGenerator {
    pub fn new(
        store: SqliteEpisodeStore,
        storage: Option<Arc<dyn ObjectStorage>>,
        section: FeedSection,
        rss_dir: impl AsRef<Path>,
        feed_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            storage,
            section,
            rss_dir: rss_dir.as_ref().to_path_buf(),
            feed_prefix: feed_prefix.into(),
        }
    }

    pub async fn regenerate(&self, podcast_id: i64) -> FeedResult<PathBuf> {
        let podcast = self.store.fetch_podcast(podcast_id)?;
        let episodes = self.store.episodes_for_feed(podcast_id)?;
        let document = self.render(&podcast, &episodes);

        tokio::fs::create_dir_all(&self.rss_dir)
            .await
            .map_err(|source| FeedError::Io {
                path: self.rss_dir.clone(),
                source,
            })?;
        let path = self.rss_dir.join(format!("{}.xml", podcast.publish_id));
        tokio::fs::write(&path, &document)
            .await
            .map_err(|source| FeedError::Io {
                path: path.clone(),
                source,
            })?;

        if self.section.mirror_to_storage {
            if let Some(storage) = &self.storage {
                let object = format!("{}/{}.xml", self.feed_prefix, podcast.publish_id);
                storage
                    .upload_bytes(document.into_bytes(), &object, "application/rss+xml")
                    .await?;
            }
        }

        info!(
            podcast_id,
            publish_id = %podcast.publish_id,
            episodes = episodes.len(),
            path = %path.display(),
            "feed regenerated"
        );
        Ok(path)
    }

    fn render(&self, podcast: &Podcast, episodes: &[Episode]) -> String {
        let mut doc = String::with_capacity(1024 + episodes.len() * 512);
        doc.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        doc.push_str("<rss version=\"2.0\">\n<channel>\n");
        push_tag(&mut doc, "title", &podcast.name);
        push_tag(
            &mut doc,
            "description",
            podcast.description.as_deref().unwrap_or(&podcast.name),
        );
        push_tag(
            &mut doc,
            "link",
            &format!(
                "{}/{}",
                self.section.site_url.trim_end_matches('/'),
                podcast.publish_id
            ),
        );
        push_tag(&mut doc, "language", &self.section.language);
        push_tag(&mut doc, "lastBuildDate", &Utc::now().to_rfc2822());

        for episode in episodes {
            doc.push_str("<item>\n");
            push_tag(&mut doc, "title", &episode.title);
            push_tag(&mut doc, "description", &episode.description);
            if let Some(author) = &episode.author {
                push_tag(&mut doc, "author", author);
            }
            push_tag(&mut doc, "guid", &episode.source_id);
            if let Some(published_at) = episode.published_at {
                push_tag(&mut doc, "pubDate", &published_at.to_rfc2822());
            }
            if let Some(remote_url) = &episode.remote_url {
                doc.push_str(&format!(
                    "<enclosure url=\"{}\" length=\"{}\" type=\"{}\"/>\n",
                    escape_xml(remote_url),
                    episode.file_size,
                    episode.content_type(),
                ));
            }
            doc.push_str("</item>\n");
        }

        doc.push_str("</channel>\n</rss>\n");
        doc
    }
}

fn push_tag(doc: &mut String, tag: &str, value: &str) {
    doc.push('<');
    doc.push_str(tag);
    doc.push('>');
    doc.push_str(&escape_xml(value));
    doc.push_str("</");
    doc.push_str(tag);
    doc.push_str(">\n");
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(
            escape_xml(r#"Tom & Jerry <live> "again""#),
            "Tom &amp; Jerry &lt;live&gt; &quot;again&quot;"
        );
    }
}

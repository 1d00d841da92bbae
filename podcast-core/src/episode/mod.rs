mod error;
mod models;
mod store;

pub use error::{EpisodeError, EpisodeResult};
pub use models::{Episode, EpisodeDraft, EpisodeStatus, Podcast, PodcastDraft};
pub use store::{SqliteEpisodeStore, SqliteEpisodeStoreBuilder};

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use podcast_core::{
    load_podcast_config, AudioNormalizer, EpisodePipeline, FeedGenerator, HttpObjectStorage,
    ObjectStorage, PodcastConfig, PodcastDraft, ProgressTracker, SqliteEpisodeStore,
    SqliteProgressBackend, YtDlpFetcher,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] podcast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("episode store error: {0}")]
    Episode(#[from] podcast_core::EpisodeError),
    #[error("storage error: {0}")]
    Storage(#[from] podcast_core::StorageError),
    #[error("feed error: {0}")]
    Feed(#[from] podcast_core::FeedError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] podcast_core::PipelineError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Podcast pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to podcast.toml
    #[arg(long, default_value = "configs/podcast.toml")]
    pub config: PathBuf,
    /// Override for the episodes database path
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Creates the working directories and database schema
    Init,
    /// Registers a new podcast
    AddPodcast(AddPodcastArgs),
    /// Registers a source video as an episode of a podcast
    AddEpisode(AddEpisodeArgs),
    /// Runs the full acquisition job for one episode
    RunDownload(RunDownloadArgs),
    /// Regenerates the RSS document for one podcast, or all of them
    GenerateFeed(GenerateFeedArgs),
    /// Uploads every episode that never reached durable storage
    UploadAll,
    /// Removes local scratch files whose durable copy is confirmed
    DeleteLocalFiles,
    /// Deletes durable objects for explicit file names
    DeleteRemoteFiles(DeleteRemoteFilesArgs),
    /// Shows progress for episodes currently downloading or failed
    CheckState,
    /// Lists registered podcasts
    ListPodcasts,
}

#[derive(Args, Debug)]
pub struct AddPodcastArgs {
    /// Podcast display name
    pub name: String,
    /// Channel description
    #[arg(long)]
    pub description: Option<String>,
    /// Skip this podcast when new videos appear on a followed source
    #[arg(long, default_value_t = false)]
    pub manual_only: bool,
}

#[derive(Args, Debug)]
pub struct AddEpisodeArgs {
    /// Target podcast id
    pub podcast_id: i64,
    /// Watch url of the source video
    pub link: String,
}

#[derive(Args, Debug)]
pub struct RunDownloadArgs {
    /// Episode id to acquire
    pub episode_id: i64,
    /// Watch url override; defaults to the recorded one
    #[arg(long)]
    pub link: Option<String>,
}

#[derive(Args, Debug)]
pub struct DeleteRemoteFilesArgs {
    /// File names as recorded on the episodes (not full object paths)
    #[arg(required = true)]
    pub file_names: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GenerateFeedArgs {
    /// Podcast id; omit to regenerate every feed
    pub podcast_id: Option<i64>,
}

/// Runs one command to completion and returns the process exit code.
/// `run-download` maps its outcome onto 0 (completed), 1 (ignored) and
/// 2 (failed) for the surrounding job queue.
pub fn run(cli: Cli) -> Result<i32> {
    init_logging();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(cli))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn execute(cli: Cli) -> Result<i32> {
    let mut config = load_podcast_config(&cli.config)?;
    if let Some(database) = &cli.database {
        config.paths.database = database.to_string_lossy().to_string();
    }
    let context = AppContext::new(config)?;

    match &cli.command {
        Commands::Init => {
            context.init().await?;
            println!("initialized at {}", context.config.paths.base_dir);
        }
        Commands::AddPodcast(args) => {
            let podcast_id = context.add_podcast(args)?;
            println!("podcast {podcast_id} created");
        }
        Commands::AddEpisode(args) => {
            let episode_id = context
                .pipeline()?
                .register_episode(args.podcast_id, &args.link)
                .await?;
            println!("episode {episode_id} registered");
        }
        Commands::RunDownload(args) => {
            let link = match &args.link {
                Some(link) => link.clone(),
                None => context.recorded_link(args.episode_id)?,
            };
            let outcome = context
                .pipeline()?
                .run_download(&link, args.episode_id)
                .await?;
            println!("{outcome:?}");
            return Ok(outcome.code());
        }
        Commands::GenerateFeed(args) => {
            let pipeline = context.pipeline()?;
            match args.podcast_id {
                Some(podcast_id) => {
                    let path = pipeline.generate_feed(podcast_id).await?;
                    println!("{}", path.display());
                }
                None => {
                    for podcast in context.store.list_podcasts()? {
                        let path = pipeline.generate_feed(podcast.id).await?;
                        println!("{}", path.display());
                    }
                }
            }
        }
        Commands::UploadAll => {
            let uploaded = context.pipeline()?.upload_all_pending().await?;
            println!("{uploaded} episodes uploaded");
        }
        Commands::DeleteLocalFiles => {
            let removed = context.pipeline()?.delete_local_files_already_remote().await?;
            println!("{removed} local files removed");
        }
        Commands::DeleteRemoteFiles(args) => {
            let deleted = context
                .pipeline()?
                .delete_remote_files(&args.file_names)
                .await;
            println!("{deleted} remote objects deleted");
        }
        Commands::CheckState => {
            let states = context.pipeline()?.check_state().await?;
            render(&states, cli.format)?;
        }
        Commands::ListPodcasts => {
            let podcasts = context.store.list_podcasts()?;
            render(&podcasts, cli.format)?;
        }
    }

    Ok(0)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for Vec<podcast_core::EpisodeProgress> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "no episodes in progress".to_string();
        }
        self.iter()
            .map(|state| {
                format!(
                    "#{} [{}] {} {}% ({}/{} bytes) {}",
                    state.episode_id,
                    state.podcast_id,
                    state.episode_title,
                    state.completed,
                    state.processed_bytes,
                    state.total_bytes,
                    state
                        .status
                        .map(|status| format!("{status:?}"))
                        .unwrap_or_else(|| "no progress entry".to_string()),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for Vec<podcast_core::Podcast> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "no podcasts registered".to_string();
        }
        self.iter()
            .map(|podcast| {
                format!(
                    "#{} {} (publish_id {}, auto-download {})",
                    podcast.id, podcast.name, podcast.publish_id, podcast.download_automatically,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct AppContext {
    config: PodcastConfig,
    store: SqliteEpisodeStore,
}

impl AppContext {
    fn new(config: PodcastConfig) -> Result<Self> {
        let store = SqliteEpisodeStore::new(config.database_path())?;
        Ok(Self { config, store })
    }

    async fn init(&self) -> Result<()> {
        for dir in [
            self.config.tmp_audio_dir(),
            self.config.rss_dir(),
            self.config.resolve_path(&self.config.paths.logs_dir),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        self.store.initialize()?;
        Ok(())
    }

    fn add_podcast(&self, args: &AddPodcastArgs) -> Result<i64> {
        let mut draft = PodcastDraft::new(&args.name);
        draft.description = args.description.clone();
        draft.download_automatically = !args.manual_only;
        Ok(self.store.create_podcast(&draft)?)
    }

    fn recorded_link(&self, episode_id: i64) -> Result<String> {
        let episode = self.store.fetch_episode(episode_id)?;
        episode.watch_url.clone().ok_or_else(|| {
            AppError::MissingResource(format!(
                "episode {episode_id} has no recorded watch url; pass --link"
            ))
        })
    }

    fn pipeline(&self) -> Result<EpisodePipeline> {
        let storage: Arc<dyn ObjectStorage> =
            Arc::new(HttpObjectStorage::new(self.config.storage.clone())?);
        let fetcher = Arc::new(YtDlpFetcher::new(
            self.config.download.clone(),
            self.config.tmp_audio_dir(),
        ));
        let tracker = ProgressTracker::new(
            Arc::new(SqliteProgressBackend::new(self.config.progress_db_path())),
            self.config.progress.ttl(),
        );
        let feeds = FeedGenerator::new(
            self.store.clone(),
            Some(storage.clone()),
            self.config.feed.clone(),
            self.config.rss_dir(),
            self.config.storage.feed_prefix.clone(),
        );
        Ok(EpisodePipeline::new(
            self.store.clone(),
            storage,
            fetcher,
            AudioNormalizer::new(self.config.normalize.clone()),
            tracker,
            feeds,
            self.config.clone(),
        ))
    }
}

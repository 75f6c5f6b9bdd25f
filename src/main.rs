mod backends;
mod config;
mod config_persistence;
mod cooldown;
mod db_manager;
mod hashtag;
mod hashtag_sync_manager;
mod protocol;
mod response_parser;
mod scoring;
mod user_baseline;

use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use backends::hashtag_api::HashtagApiBackend;
use clap::Parser;
use config::{default_config_path, default_database_path};
use config_persistence::{ensure_config_file, load_config_file, persist_current_user};
use db_manager::DbManager;
use hashtag::HashtagRecord;
use hashtag_sync_manager::{HashtagSyncManager, LookupCallback};
use log::{info, warn};
use protocol::{ChunkOutcome, SyncMessage};
use scoring::Score;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "tagsync")]
#[command(about = "Fetch hashtag engagement stats and cache them locally")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Make NAME the current user and remember it in the config file
    #[arg(long, value_name = "NAME")]
    user: Option<String>,

    /// Store the current user's daily likes before scoring
    #[arg(long, value_name = "N")]
    daily_likes: Option<i64>,

    /// Print results without writing them to the cache
    #[arg(long)]
    no_persist: bool,

    /// Tags to look up; a leading '#' is ignored and commas separate several
    tags: Vec<String>,
}

impl Cli {
    fn tag_names(&self) -> Vec<String> {
        self.tags
            .iter()
            .flat_map(|tag| tag.trim_start_matches('#').split(','))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn format_count(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

fn format_record_line(record: &HashtagRecord) -> String {
    let score = record.score.map_or(Score::Unscored, Score::Ratio);
    format!(
        "{:<30} {:>10} {:>8} {:>8} {:>7} {}",
        record.name,
        format_count(record.likes),
        format_count(record.comments),
        format_count(record.engagement),
        score,
        scoring::tier(record, score).label()
    )
}

/// Blocks until `expected` chunks of `request_id` have been reported
/// finished on the bus. Returns how many were seen.
fn wait_for_request(
    bus_receiver: &mut broadcast::Receiver<SyncMessage>,
    request_id: u64,
    expected: usize,
) -> usize {
    let mut finished = 0;
    while finished < expected {
        match bus_receiver.blocking_recv() {
            Ok(SyncMessage::ChunkFinished {
                request_id: finished_id,
                chunk,
                outcome,
            }) if finished_id == request_id => {
                finished += 1;
                match outcome {
                    ChunkOutcome::Reconciled { .. } => {}
                    ChunkOutcome::Suppressed => warn!("Lookup skipped during cooldown: {}", chunk),
                    ChunkOutcome::Throttled => warn!("Lookup throttled: {}", chunk),
                    ChunkOutcome::TransportFailed(error) | ChunkOutcome::Rejected(error) => {
                        warn!("Lookup failed for {}: {}", chunk, error)
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Sync bus lagged, skipped {} messages", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    finished
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();
    log::set_max_level(log::LevelFilter::Info);

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let cli = Cli::parse();
    let tags = cli.tag_names();
    let persist = !cli.no_persist;

    let config_path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or("could not determine config directory")?;
    ensure_config_file(&config_path)?;
    let config = load_config_file(&config_path);
    log::set_max_level(config.logging.level_filter());

    if let Some(user) = cli.user.as_deref() {
        persist_current_user(&config_path, user);
    }
    let current_user = cli.user.clone().or_else(|| config.sync.current_user.clone());
    if cli.daily_likes.is_some() && current_user.is_none() {
        return Err("--daily-likes needs a current user; pass --user or set sync.current_user".into());
    }

    let database_path = config
        .storage
        .database_path
        .clone()
        .or_else(default_database_path)
        .ok_or("could not determine data directory")?;
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db_manager = DbManager::open(&database_path)?;
    info!("Hashtag cache at {}", database_path.display());

    let backend = Arc::new(HashtagApiBackend::new(&config.remote)?);
    let (bus_sender, _) = broadcast::channel(1024);
    let (manager, handle) = HashtagSyncManager::new(
        db_manager,
        backend,
        bus_sender,
        &config.sync,
        &config.maintenance,
    );
    let mut bus_receiver = handle.subscribe();
    let worker = manager.spawn()?;

    if let Some(user) = cli.user.as_deref() {
        handle.set_current_user(user);
    }
    if let (Some(user), Some(daily_likes)) = (current_user.as_deref(), cli.daily_likes) {
        handle.refresh_user_baseline(user, Some(daily_likes));
    }

    let (record_sender, record_receiver) = mpsc::channel::<HashtagRecord>();
    if tags.is_empty() {
        info!("No tags requested");
    } else {
        let callback: LookupCallback = Arc::new(move |record: &HashtagRecord| {
            let _ = record_sender.send(record.clone());
        });
        let queued = handle.request_hashtags(&tags, Some(callback), persist);
        wait_for_request(&mut bus_receiver, queued.request_id, queued.chunks.len());
    }

    handle.shutdown();
    let db_manager = worker
        .join()
        .map_err(|_| "hashtag sync worker panicked")?;

    for record in record_receiver.try_iter() {
        println!("{}", format_record_line(&record));
    }

    if persist && !tags.is_empty() {
        let suggestions = db_manager.hashtag_suggestions(&tags)?;
        if !suggestions.is_empty() {
            println!("suggested: {}", suggestions.join(", "));
        }
    }
    Ok(())
}

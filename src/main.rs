use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

use storyfeed::api::cache::FeedKey;
use storyfeed::api::client::StoryClient;
use storyfeed::api::types::{NewStory, Story};
use storyfeed::cache::{
  LoadError, LoadRequest, LoadState, MediatorResult, PagerEvent, QueryKey, SqliteStorage,
};
use storyfeed::repository::{StoryPager, StoryRepository, StorySource};
use storyfeed::{config, db, logging};

#[derive(Parser, Debug)]
#[command(name = "storyfeed")]
#[command(about = "Offline-first client for the story feed")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storyfeed/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show a window of the feed, loading pages as needed
  Feed {
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Only stories posted with a location
    #[arg(long)]
    location: bool,
    /// Walk the whole feed, `limit` stories per read
    #[arg(long, conflicts_with = "offset")]
    all: bool,
    /// Re-issue a load that failed, once
    #[arg(long)]
    retry: bool,
  },
  /// Reload the feed from the first page
  Refresh {
    #[arg(long)]
    location: bool,
  },
  /// Fetch the next page of the feed
  More {
    #[arg(long)]
    location: bool,
  },
  /// Upload a story, then refresh the feeds it appears in
  Post {
    #[arg(long)]
    photo: PathBuf,
    #[arg(long)]
    description: String,
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,
  },
  /// Show one story
  Show { id: String },
  /// Show what is cached
  Status,
  /// Clear every cached feed
  Logout,
}

fn feed_key(location: bool) -> FeedKey {
  if location {
    FeedKey::WithLocation
  } else {
    FeedKey::AllStories
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(&db::data_dir()?.join("logs"), args.verbose)?;

  // Everything below is constructed once and passed down explicitly
  let db_path = match &config.cache.path {
    Some(path) => path.clone(),
    None => db::Database::default_path()?,
  };
  let storage = Arc::new(SqliteStorage::open(&db_path)?);
  let client = StoryClient::new(&config, config::Config::get_api_token())?;
  let repository = StoryRepository::new(storage, client, config.paging.clone());

  match args.command {
    Command::Feed {
      offset,
      limit,
      location,
      all,
      retry,
    } => {
      let mut pager = repository.pager(feed_key(location))?;

      if all {
        let mut stories = std::pin::pin!(pager.stream(limit));
        let mut index = 0;
        while let Some(story) = stories.next().await {
          print_story_line(index, &story?);
          index += 1;
        }
      } else {
        let mut stories = pager.get(offset, limit).await?;
        if retry && pager.retry().await.is_some() {
          stories = pager.get(offset, limit).await?;
        }
        for (i, story) in stories.iter().enumerate() {
          print_story_line(offset + i, story);
        }
      }

      if args.verbose {
        while let Some(event) = pager.poll_event() {
          print_event(&event);
        }
      }
      report_pager(&pager);
    }
    Command::Refresh { location } => {
      let mut pager = repository.pager(feed_key(location))?;
      let result = pager.refresh().await;
      report(&result)?;
      println!("{} stories cached", pager.item_count());
    }
    Command::More { location } => {
      let mediator = repository.mediator(feed_key(location))?;
      let result = mediator
        .load(LoadRequest::Append { boundary: None })
        .await;
      report(&result)?;
      println!("Pages hold up to {} stories", mediator.page_size());
    }
    Command::Post {
      photo,
      description,
      lat,
      lon,
    } => {
      let photo_name = photo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| eyre!("Not a file: {}", photo.display()))?;
      let bytes = tokio::fs::read(&photo)
        .await
        .map_err(|e| eyre!("Failed to read photo {}: {}", photo.display(), e))?;

      let mut story = NewStory::new(description, photo_name, bytes);
      if let (Some(lat), Some(lon)) = (lat, lon) {
        story = story.with_location(lat, lon);
      }

      for (feed, result) in repository.post_story(&story).await? {
        match result.error() {
          Some(e) => eprintln!("Posted, but refreshing {} failed: {}", feed.description(), e),
          None => println!("Refreshed {}", feed.description()),
        }
      }
      println!("Story posted");
    }
    Command::Show { id } => {
      let (story, source) = repository.story(&id).await?;
      print_story(&story, source);
    }
    Command::Status => {
      for feed in [FeedKey::AllStories, FeedKey::WithLocation] {
        let status = repository.status(feed)?;
        let cursor = match &status.remote_key {
          Some(key) => format!(
            "prev={} next={}",
            fmt_page(key.prev_key),
            fmt_page(key.next_key)
          ),
          None => "not loaded".to_string(),
        };
        println!(
          "{:<22} {:>5} stories  {}",
          status.description, status.item_count, cursor
        );
      }
    }
    Command::Logout => {
      repository.logout()?;
      println!("Cleared cached feeds");
    }
  }

  Ok(())
}

fn report(result: &MediatorResult) -> Result<()> {
  match result {
    MediatorResult::Success {
      end_of_pagination_reached: true,
    } => println!("Up to date: end of feed"),
    MediatorResult::Success { .. } => println!("Loaded; more pages available"),
    MediatorResult::Error(e) => return Err(e.clone().into()),
  }
  Ok(())
}

/// Summarize the pager's load states on stderr after a read.
fn report_pager(pager: &StoryPager) {
  let states = pager.load_states();
  if let Some(e) = states.refresh.error() {
    eprintln!("Refresh failed ({}); showing cached stories. {}", e, retry_hint(e));
  }
  if let Some(e) = states.append.error() {
    eprintln!("Loading more failed ({}). {}", e, retry_hint(e));
  } else if states.append.end_of_pagination_reached() {
    eprintln!("End of feed ({} stories cached)", pager.item_count());
  }
}

fn retry_hint(e: &LoadError) -> &'static str {
  if e.is_retryable() {
    "Run again with --retry"
  } else {
    "Check the cache database; retrying will not help"
  }
}

fn print_event(event: &PagerEvent) {
  match event {
    PagerEvent::LoadStateChanged { load_type, state } => {
      eprintln!("[{}] {}", load_type, describe_state(state));
    }
    PagerEvent::Merged {
      load_type,
      item_count,
      end_of_pagination_reached,
    } => {
      let end = if *end_of_pagination_reached { ", end of feed" } else { "" };
      eprintln!("[{}] merged, {} cached{}", load_type, item_count, end);
    }
  }
}

fn describe_state(state: &LoadState) -> String {
  match state {
    LoadState::Loading => "loading".to_string(),
    LoadState::NotLoading {
      end_of_pagination_reached: true,
    } => "idle, end of feed".to_string(),
    LoadState::NotLoading { .. } => "idle".to_string(),
    LoadState::Error(e) => format!("failed: {}", e),
  }
}

fn fmt_page(page: Option<u32>) -> String {
  page.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_story_line(index: usize, story: &Story) {
  let text = story.description.lines().next().unwrap_or_default();
  let pin = if story.location().is_some() { "*" } else { " " };
  println!(
    "{:>4} {} {}  {:<16} {}",
    index,
    pin,
    story.created_at.format("%Y-%m-%d %H:%M"),
    story.name,
    text
  );
}

fn print_story(story: &Story, source: StorySource) {
  println!("{} by {}", story.id, story.name);
  println!("posted  {}", story.created_at.to_rfc3339());
  if let Some((lat, lon)) = story.location() {
    println!("at      {:.5}, {:.5}", lat, lon);
  }
  println!("photo   {}", story.photo_url);
  if source == StorySource::Cache {
    println!("(from cache)");
  }
  println!();
  println!("{}", story.description);
}

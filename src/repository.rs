//! Story repository: the single owner of cache storage and the API client.
//!
//! Built once at startup and passed to whatever needs feed data.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::api::cache::{FeedKey, StoryFetcher};
use crate::api::client::StoryClient;
use crate::api::types::{NewStory, Story};
use crate::cache::{
  LoadRequest, MediatorResult, Pager, PagingStorage, QueryKey, RemoteKey, RemoteMediator,
  SqliteStorage,
};
use crate::config::PagingConfig;

pub type StoryMediator = RemoteMediator<StoryFetcher, SqliteStorage>;
pub type StoryPager = Pager<StoryFetcher, SqliteStorage>;

/// Snapshot of one feed's cache
#[derive(Debug, Clone)]
pub struct FeedStatus {
  pub description: String,
  pub partition_id: String,
  pub item_count: usize,
  pub remote_key: Option<RemoteKey>,
}

/// Where a story lookup was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorySource {
  Cache,
  Network,
}

pub struct StoryRepository {
  storage: Arc<SqliteStorage>,
  client: StoryClient,
  paging: PagingConfig,
  /// One mediator per partition, created on first use
  mediators: Mutex<HashMap<FeedKey, StoryMediator>>,
}

impl StoryRepository {
  pub fn new(storage: Arc<SqliteStorage>, client: StoryClient, paging: PagingConfig) -> Self {
    Self {
      storage,
      client,
      paging,
      mediators: Mutex::new(HashMap::new()),
    }
  }

  /// The mediator for a feed. Every caller gets the same instance.
  pub fn mediator(&self, feed: FeedKey) -> Result<StoryMediator> {
    let mut mediators = self
      .mediators
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mediator = mediators.entry(feed).or_insert_with(|| {
      tracing::debug!(feed = %feed.description(), "creating mediator");
      RemoteMediator::new(
        feed.cache_hash(),
        StoryFetcher::new(self.client.clone(), feed),
        Arc::clone(&self.storage),
        self.paging.page_size,
      )
    });

    Ok(mediator.clone())
  }

  /// A new paged view (session) over a feed.
  pub fn pager(&self, feed: FeedKey) -> Result<StoryPager> {
    Ok(Pager::new(self.mediator(feed)?).with_prefetch_distance(self.paging.prefetch_distance))
  }

  /// Look up a story, preferring the cached copy.
  pub async fn story(&self, id: &str) -> Result<(Story, StorySource)> {
    if let Some(story) = self.storage.find_item::<Story>(id)? {
      return Ok((story, StorySource::Cache));
    }

    let story = self.client.get_story(id).await?;
    Ok((story, StorySource::Network))
  }

  /// Upload a story, then refresh every feed it shows up in.
  ///
  /// The upload itself failing is an error. A refresh failing afterwards is
  /// reported per feed; the story is already posted at that point.
  pub async fn post_story(&self, story: &NewStory) -> Result<Vec<(FeedKey, MediatorResult)>> {
    story.validate()?;
    self.client.add_story(story).await?;

    let mut refreshed = Vec::new();
    for feed in affected_feeds(story) {
      let result = self.mediator(feed)?.load(LoadRequest::Refresh).await;
      refreshed.push((feed, result));
    }
    Ok(refreshed)
  }

  pub fn status(&self, feed: FeedKey) -> Result<FeedStatus> {
    let partition_id = feed.cache_hash();
    Ok(FeedStatus {
      description: feed.description(),
      item_count: self.storage.count(&partition_id)?,
      remote_key: self.storage.remote_key(&partition_id)?,
      partition_id,
    })
  }

  /// Forget every cached feed.
  pub fn logout(&self) -> Result<()> {
    self.storage.clear_everything()?;
    tracing::info!("cleared cached feeds");
    Ok(())
  }
}

/// Feeds a newly posted story appears in.
fn affected_feeds(story: &NewStory) -> Vec<FeedKey> {
  if story.location().is_some() {
    vec![FeedKey::AllStories, FeedKey::WithLocation]
  } else {
    vec![FeedKey::AllStories]
  }
}

//! Caching implementations for story types.

use sha2::{Digest, Sha256};
use std::future::Future;

use crate::cache::{Cacheable, FetchError, Page, PageFetcher, QueryKey};

use super::client::StoryClient;
use super::types::Story;

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Story {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "story"
  }
}

// ============================================================================
// Partition keys
// ============================================================================

/// Feeds that can be paged and cached independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeedKey {
  /// The main feed, newest first
  AllStories,
  /// Only stories posted with a location (map view)
  WithLocation,
}

impl FeedKey {
  pub fn with_location(&self) -> bool {
    matches!(self, FeedKey::WithLocation)
  }
}

impl QueryKey for FeedKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::AllStories => "stories:location=0",
      Self::WithLocation => "stories:location=1",
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::AllStories => "all stories".to_string(),
      Self::WithLocation => "stories with location".to_string(),
    }
  }
}

// ============================================================================
// Page fetcher
// ============================================================================

/// Pages one feed from the story API.
#[derive(Clone)]
pub struct StoryFetcher {
  client: StoryClient,
  feed: FeedKey,
}

impl StoryFetcher {
  pub fn new(client: StoryClient, feed: FeedKey) -> Self {
    Self { client, feed }
  }
}

impl PageFetcher for StoryFetcher {
  type Item = Story;

  fn fetch(
    &self,
    page: u32,
    page_size: u32,
  ) -> impl Future<Output = Result<Page<Story>, FetchError>> + Send {
    let client = self.client.clone();
    let with_location = self.feed.with_location();

    async move {
      let stories = client.list_stories(page, page_size, with_location).await?;
      Ok(Page::from_batch(stories, page_size))
    }
  }
}

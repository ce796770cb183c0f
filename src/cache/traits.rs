//! Core traits and types for the paging cache.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;

use super::error::{FetchError, LoadError};

/// First page number understood by the remote API.
pub const FIRST_PAGE: u32 = 1;

/// Trait for entities that can be cached.
///
/// Implementors provide a unique cache key. Items are stored as serialized
/// JSON, so the rest of the entity is opaque to the storage layer.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity within a partition (e.g., story id)
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "story")
  fn entity_type() -> &'static str;
}

/// A logical pagination scope, hashed to a stable partition id.
pub trait QueryKey {
  /// Stable, fixed-length identifier used as the partition id in storage.
  fn cache_hash(&self) -> String;

  /// Human readable description for logs and status output.
  fn description(&self) -> String;
}

/// Direction of a load against the remote ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadType {
  /// Restart from the first page, replacing the cache
  Refresh,
  /// Fetch the page before the cached head
  Prepend,
  /// Fetch the page after the cached tail
  Append,
}

impl fmt::Display for LoadType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadType::Refresh => write!(f, "refresh"),
      LoadType::Prepend => write!(f, "prepend"),
      LoadType::Append => write!(f, "append"),
    }
  }
}

/// A load issued by the paged view.
///
/// Prepend and append carry the key of the boundary item the view currently
/// holds; two requests with the same type and boundary are the same load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
  Refresh,
  Prepend { boundary: Option<String> },
  Append { boundary: Option<String> },
}

impl LoadRequest {
  pub fn load_type(&self) -> LoadType {
    match self {
      LoadRequest::Refresh => LoadType::Refresh,
      LoadRequest::Prepend { .. } => LoadType::Prepend,
      LoadRequest::Append { .. } => LoadType::Append,
    }
  }
}

/// Cursor record for a partition's cached page set.
///
/// There is at most one record per partition. It reflects the cursors implied
/// by the most recently merged page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
  pub partition_id: String,
  /// Page before the cached head, None if the head is the newest page
  pub prev_key: Option<u32>,
  /// Page after the cached tail, None if the tail is the last page
  pub next_key: Option<u32>,
}

impl RemoteKey {
  /// Cursors implied by a successfully fetched page.
  pub fn for_fetched_page(partition_id: &str, page: u32, has_more: bool) -> Self {
    Self {
      partition_id: partition_id.to_string(),
      prev_key: if page > FIRST_PAGE { Some(page - 1) } else { None },
      next_key: if has_more { Some(page + 1) } else { None },
    }
  }
}

/// One batch returned by the remote API.
#[derive(Debug, Clone)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub has_more: bool,
}

impl<T> Page<T> {
  /// Build a page from a returned batch.
  ///
  /// The API has no explicit "more" flag: a full batch means there may be more.
  pub fn from_batch(items: Vec<T>, requested_size: u32) -> Self {
    let has_more = items.len() == requested_size as usize;
    Self { items, has_more }
  }
}

/// Outcome of a mediator load.
#[derive(Debug, Clone)]
pub enum MediatorResult {
  Success { end_of_pagination_reached: bool },
  Error(LoadError),
}

impl MediatorResult {
  pub fn is_success(&self) -> bool {
    matches!(self, MediatorResult::Success { .. })
  }

  pub fn end_of_pagination_reached(&self) -> bool {
    matches!(
      self,
      MediatorResult::Success {
        end_of_pagination_reached: true
      }
    )
  }

  pub fn error(&self) -> Option<&LoadError> {
    match self {
      MediatorResult::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Stateless remote page source.
pub trait PageFetcher: Send + Sync + 'static {
  type Item: Cacheable;

  /// Fetch one page. Timeouts surface as `FetchError::Network`.
  fn fetch(
    &self,
    page: u32,
    page_size: u32,
  ) -> impl Future<Output = Result<Page<Self::Item>, FetchError>> + Send;
}

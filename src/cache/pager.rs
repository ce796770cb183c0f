//! Paged view over one partition of the local cache.
//!
//! The pager serves windows of cached items and asks the mediator for more
//! whenever a window gets close to either edge of what is cached. Load
//! progress is tracked per load type and reported as [`PagerEvent`]s, which
//! the consumer drains with [`Pager::poll_event`] from its event loop.

use color_eyre::Result;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::LoadError;
use super::mediator::RemoteMediator;
use super::storage::PagingStorage;
use super::traits::{Cacheable, LoadRequest, LoadType, MediatorResult, PageFetcher};

/// Default distance from an edge at which the next page is requested.
pub const DEFAULT_PREFETCH_DISTANCE: usize = 5;

/// Progress of one load type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
  NotLoading { end_of_pagination_reached: bool },
  Loading,
  Error(LoadError),
}

impl LoadState {
  pub fn is_loading(&self) -> bool {
    matches!(self, LoadState::Loading)
  }

  pub fn end_of_pagination_reached(&self) -> bool {
    matches!(
      self,
      LoadState::NotLoading {
        end_of_pagination_reached: true
      }
    )
  }

  pub fn error(&self) -> Option<&LoadError> {
    match self {
      LoadState::Error(e) => Some(e),
      _ => None,
    }
  }
}

impl Default for LoadState {
  fn default() -> Self {
    LoadState::NotLoading {
      end_of_pagination_reached: false,
    }
  }
}

/// Load state for each load type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStates {
  pub refresh: LoadState,
  pub prepend: LoadState,
  pub append: LoadState,
}

impl LoadStates {
  pub fn get(&self, load_type: LoadType) -> &LoadState {
    match load_type {
      LoadType::Refresh => &self.refresh,
      LoadType::Prepend => &self.prepend,
      LoadType::Append => &self.append,
    }
  }

  fn set(&mut self, load_type: LoadType, state: LoadState) {
    match load_type {
      LoadType::Refresh => self.refresh = state,
      LoadType::Prepend => self.prepend = state,
      LoadType::Append => self.append = state,
    }
  }
}

/// Notifications for the pager's consumer, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagerEvent {
  LoadStateChanged {
    load_type: LoadType,
    state: LoadState,
  },
  /// A load added or replaced cached items
  Merged {
    load_type: LoadType,
    item_count: usize,
    end_of_pagination_reached: bool,
  },
}

/// Incremental, cache-backed view of a partition.
pub struct Pager<F: PageFetcher, S: PagingStorage> {
  mediator: RemoteMediator<F, S>,
  prefetch_distance: usize,
  states: LoadStates,
  /// Whether this session has issued its refresh
  refreshed: bool,
  /// Cached item count, re-read after every load
  item_count: usize,
  last_failed: Option<LoadType>,
  events_tx: mpsc::UnboundedSender<PagerEvent>,
  events_rx: mpsc::UnboundedReceiver<PagerEvent>,
}

impl<F: PageFetcher, S: PagingStorage> Pager<F, S> {
  pub fn new(mediator: RemoteMediator<F, S>) -> Self {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    Self {
      mediator,
      prefetch_distance: DEFAULT_PREFETCH_DISTANCE,
      states: LoadStates::default(),
      refreshed: false,
      item_count: 0,
      last_failed: None,
      events_tx,
      events_rx,
    }
  }

  /// Set how close to an edge a window may get before more is loaded.
  pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
    self.prefetch_distance = distance;
    self
  }

  pub fn load_states(&self) -> &LoadStates {
    &self.states
  }

  pub fn item_count(&self) -> usize {
    self.item_count
  }

  /// Take the next pending notification, if any.
  pub fn poll_event(&mut self) -> Option<PagerEvent> {
    self.events_rx.try_recv().ok()
  }

  /// Start the session: refresh once, then serve whatever is cached.
  ///
  /// A failed refresh is reported through the refresh load state; previously
  /// cached items stay available.
  pub async fn subscribe(&mut self) -> Result<()> {
    if !self.refreshed {
      self.refreshed = true;
      self.load(LoadType::Refresh).await;
    }
    self.item_count = self.count()?;
    Ok(())
  }

  /// Start a new session from the first page.
  pub async fn refresh(&mut self) -> MediatorResult {
    self.refreshed = true;
    self.load(LoadType::Refresh).await
  }

  /// Re-issue the most recent failed load, if any.
  pub async fn retry(&mut self) -> Option<MediatorResult> {
    let load_type = self.last_failed?;
    debug!(load = %load_type, "retrying failed load");
    Some(self.load(load_type).await)
  }

  /// Read a window of items, loading adjacent pages as it nears an edge.
  pub async fn get(&mut self, offset: usize, limit: usize) -> Result<Vec<F::Item>> {
    self.subscribe().await?;

    if offset <= self.prefetch_distance && self.should_load(LoadType::Prepend) {
      self.load(LoadType::Prepend).await;
    }

    let reach = offset
      .saturating_add(limit)
      .saturating_add(self.prefetch_distance);
    while reach > self.item_count && self.should_load(LoadType::Append) {
      let before = self.item_count;
      let result = self.load(LoadType::Append).await;
      if !result.is_success() || self.item_count == before {
        break;
      }
    }

    self.mediator.storage().read_range(self.mediator.partition_id(), offset, limit)
  }

  /// Lazily walk the whole feed, loading pages as the stream is consumed.
  ///
  /// Each call starts again from the first item.
  pub fn stream(&mut self, chunk_size: usize) -> impl Stream<Item = Result<F::Item>> + '_ {
    let chunk_size = chunk_size.max(1);
    let state = (self, 0usize, VecDeque::new(), false);

    stream::unfold(state, move |(pager, offset, mut buffer, done)| async move {
      if buffer.is_empty() && !done {
        match pager.get(offset, chunk_size).await {
          Ok(items) => buffer.extend(items),
          Err(e) => return Some((Err(e), (pager, offset, buffer, true))),
        }
      }

      let item = buffer.pop_front()?;
      Some((Ok(item), (pager, offset + 1, buffer, done)))
    })
  }

  fn should_load(&self, load_type: LoadType) -> bool {
    let state = self.states.get(load_type);
    !state.is_loading() && !state.end_of_pagination_reached() && state.error().is_none()
  }

  async fn load(&mut self, load_type: LoadType) -> MediatorResult {
    let request = match load_type {
      LoadType::Refresh => LoadRequest::Refresh,
      LoadType::Prepend => LoadRequest::Prepend {
        boundary: self.boundary_key(0),
      },
      LoadType::Append => LoadRequest::Append {
        boundary: self.boundary_key(self.item_count.saturating_sub(1)),
      },
    };

    self.set_state(load_type, LoadState::Loading);
    let result = self.mediator.load(request).await;

    let result = match result {
      MediatorResult::Success {
        end_of_pagination_reached,
      } => match self.count() {
        Ok(count) => {
          let changed = count != self.item_count || load_type == LoadType::Refresh;
          self.item_count = count;
          self.on_success(load_type, end_of_pagination_reached, changed);
          MediatorResult::Success {
            end_of_pagination_reached,
          }
        }
        Err(e) => MediatorResult::Error(LoadError::Storage(e.to_string())),
      },
      error => error,
    };

    if let MediatorResult::Error(e) = &result {
      self.last_failed = Some(load_type);
      self.set_state(load_type, LoadState::Error(e.clone()));
    }
    result
  }

  fn on_success(&mut self, load_type: LoadType, end_of_pagination_reached: bool, changed: bool) {
    self.last_failed = None;
    self.set_state(
      load_type,
      LoadState::NotLoading {
        end_of_pagination_reached,
      },
    );

    if load_type == LoadType::Refresh {
      // A fresh first page has nothing before it and may have more after it.
      self.set_state(
        LoadType::Prepend,
        LoadState::NotLoading {
          end_of_pagination_reached: true,
        },
      );
      self.set_state(
        LoadType::Append,
        LoadState::NotLoading {
          end_of_pagination_reached,
        },
      );
    }

    if changed {
      self.emit(PagerEvent::Merged {
        load_type,
        item_count: self.item_count,
        end_of_pagination_reached,
      });
    }
  }

  fn set_state(&mut self, load_type: LoadType, state: LoadState) {
    if self.states.get(load_type) == &state {
      return;
    }
    self.states.set(load_type, state.clone());
    self.emit(PagerEvent::LoadStateChanged { load_type, state });
  }

  fn emit(&self, event: PagerEvent) {
    // The receiver lives in self, so sending only fails during teardown.
    let _ = self.events_tx.send(event);
  }

  fn count(&self) -> Result<usize> {
    self.mediator.storage().count(self.mediator.partition_id())
  }

  fn boundary_key(&self, index: usize) -> Option<String> {
    self
      .mediator
      .storage()
      .read_range::<F::Item>(self.mediator.partition_id(), index, 1)
      .ok()?
      .first()
      .map(Cacheable::cache_key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::error::FetchError;
  use crate::cache::mediator::tests::FakeFetcher;
  use crate::cache::mediator::DEFAULT_PAGE_SIZE;
  use crate::cache::storage::SqliteStorage;
  use futures::StreamExt;
  use std::sync::Arc;

  fn pager(fetcher: &FakeFetcher) -> Pager<FakeFetcher, SqliteStorage> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let mediator = RemoteMediator::new("feed", fetcher.clone(), storage, DEFAULT_PAGE_SIZE);
    Pager::new(mediator).with_prefetch_distance(5)
  }

  fn drain(pager: &mut Pager<FakeFetcher, SqliteStorage>) -> Vec<PagerEvent> {
    std::iter::from_fn(|| pager.poll_event()).collect()
  }

  #[tokio::test]
  async fn test_subscribe_refreshes_once() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20), (2, 20)]);
    let mut pager = pager(&fetcher);

    pager.subscribe().await.unwrap();
    pager.subscribe().await.unwrap();

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(pager.item_count(), 20);
    assert!(pager.load_states().prepend.end_of_pagination_reached());
  }

  #[tokio::test]
  async fn test_get_appends_near_the_tail() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20), (2, 20), (3, 7)]);
    let mut pager = pager(&fetcher);

    let window = pager.get(0, 10).await.unwrap();
    assert_eq!(window.len(), 10);
    assert_eq!(fetcher.calls(), 1);

    // 12 + 5 + 5 crosses the 20 cached items.
    let window = pager.get(12, 5).await.unwrap();
    assert_eq!(window[0].id, "p1-12");
    assert_eq!(pager.item_count(), 40);
    assert_eq!(fetcher.calls(), 2);

    let window = pager.get(40, 20).await.unwrap();
    assert_eq!(window.len(), 7);
    assert!(pager.load_states().append.end_of_pagination_reached());

    pager.get(40, 20).await.unwrap();
    assert_eq!(fetcher.calls(), 3);
  }

  #[tokio::test]
  async fn test_failed_append_exposes_retry() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20), (2, 20)]);
    let mut pager = pager(&fetcher);
    pager.subscribe().await.unwrap();

    fetcher.fail_next(FetchError::Network("offline".to_string()));
    let window = pager.get(15, 5).await.unwrap();

    assert_eq!(window.len(), 5);
    assert_eq!(pager.item_count(), 20);
    assert!(pager.load_states().append.error().is_some());

    // No automatic retry while the error is showing.
    pager.get(15, 5).await.unwrap();
    assert_eq!(fetcher.calls(), 2);

    let result = pager.retry().await.unwrap();
    assert!(result.is_success());
    assert_eq!(pager.item_count(), 40);
    assert!(pager.retry().await.is_none());
  }

  #[tokio::test]
  async fn test_failed_refresh_serves_cached_items() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20)]);
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let mediator = RemoteMediator::new("feed", fetcher.clone(), storage.clone(), DEFAULT_PAGE_SIZE);
    Pager::new(mediator).subscribe().await.unwrap();

    fetcher.fail_next(FetchError::Network("offline".to_string()));
    let mediator = RemoteMediator::new("feed", fetcher.clone(), storage, DEFAULT_PAGE_SIZE);
    let mut pager = Pager::new(mediator);

    let window = pager.get(0, 10).await.unwrap();
    assert_eq!(window.len(), 10);
    assert!(pager.load_states().refresh.error().is_some());
  }

  #[tokio::test]
  async fn test_events_follow_merge_order() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20), (2, 3)]);
    let mut pager = pager(&fetcher);
    pager.get(0, 20).await.unwrap();

    let merges: Vec<_> = drain(&mut pager)
      .into_iter()
      .filter_map(|e| match e {
        PagerEvent::Merged {
          load_type,
          item_count,
          end_of_pagination_reached,
        } => Some((load_type, item_count, end_of_pagination_reached)),
        _ => None,
      })
      .collect();

    assert_eq!(
      merges,
      vec![(LoadType::Refresh, 20, false), (LoadType::Append, 23, true)]
    );
  }

  #[tokio::test]
  async fn test_loading_state_is_reported() {
    let fetcher = FakeFetcher::with_pages(&[(1, 2)]);
    let mut pager = pager(&fetcher);
    pager.refresh().await;

    let events = drain(&mut pager);
    assert_eq!(
      events.first(),
      Some(&PagerEvent::LoadStateChanged {
        load_type: LoadType::Refresh,
        state: LoadState::Loading,
      })
    );
    assert!(pager.load_states().append.end_of_pagination_reached());
  }

  #[tokio::test]
  async fn test_window_past_the_end_is_empty() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20), (2, 7)]);
    let mut pager = pager(&fetcher);

    assert!(pager.get(usize::MAX, 1).await.unwrap().is_empty());
    assert!(pager.get(usize::MAX - 2, usize::MAX).await.unwrap().is_empty());
    assert_eq!(pager.item_count(), 27);
    assert!(pager.load_states().append.end_of_pagination_reached());
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_stream_walks_all_pages() {
    let fetcher = FakeFetcher::with_pages(&[(1, 20), (2, 20), (3, 7)]);
    let mut pager = pager(&fetcher);

    let items: Vec<_> = pager.stream(8).collect().await;
    assert_eq!(items.len(), 47);
    assert!(items.iter().all(|i| i.is_ok()));

    // Restarting reads from the cache again.
    let first: Vec<_> = pager.stream(8).take(3).collect().await;
    assert_eq!(first.len(), 3);
    assert_eq!(fetcher.calls(), 3);
  }
}

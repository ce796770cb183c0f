//! Remote mediator: keeps one partition's cached pages in step with the
//! remote paginated API.
//!
//! Every load runs behind a per-partition gate, so at most one load touches
//! the partition's storage at a time. A request equal to any load that is
//! still registered, running or queued on the gate, joins it instead of
//! starting another fetch. Loads run in their own
//! task: a caller that goes away may abandon the wait, but a merge that has
//! started always completes.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::error::LoadError;
use super::storage::{PageMerge, PagingStorage};
use super::traits::{
  LoadRequest, LoadType, MediatorResult, PageFetcher, RemoteKey, FIRST_PAGE,
};

/// Default number of items requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

type SharedLoad = Shared<BoxFuture<'static, MediatorResult>>;

/// What a load type resolves to given the current cursor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
  Fetch(u32),
  Done { end_of_pagination_reached: bool },
}

struct InFlight {
  id: u64,
  request: LoadRequest,
  result: SharedLoad,
}

struct Inner<F: PageFetcher, S: PagingStorage> {
  partition_id: String,
  fetcher: F,
  storage: Arc<S>,
  page_size: u32,
  /// Serializes loads for the partition (FIFO)
  gate: tokio::sync::Mutex<()>,
  /// Every registered load, running or queued, for coalescing
  in_flight: Mutex<Vec<InFlight>>,
  next_load_id: AtomicU64,
}

/// Synchronizes a partition of the local cache with the remote API.
pub struct RemoteMediator<F: PageFetcher, S: PagingStorage> {
  inner: Arc<Inner<F, S>>,
}

impl<F: PageFetcher, S: PagingStorage> RemoteMediator<F, S> {
  pub fn new(partition_id: impl Into<String>, fetcher: F, storage: Arc<S>, page_size: u32) -> Self {
    Self {
      inner: Arc::new(Inner {
        partition_id: partition_id.into(),
        fetcher,
        storage,
        page_size: page_size.max(1),
        gate: tokio::sync::Mutex::new(()),
        in_flight: Mutex::new(Vec::new()),
        next_load_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn partition_id(&self) -> &str {
    &self.inner.partition_id
  }

  pub fn page_size(&self) -> u32 {
    self.inner.page_size
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.inner.storage
  }

  /// Run a load, joining an identical one if it is already in flight.
  pub async fn load(&self, request: LoadRequest) -> MediatorResult {
    match self.join_or_start(request) {
      Ok(result) => result.await,
      Err(e) => MediatorResult::Error(e),
    }
  }

  fn join_or_start(&self, request: LoadRequest) -> Result<SharedLoad, LoadError> {
    let mut registered = self
      .inner
      .in_flight
      .lock()
      .map_err(|e| LoadError::Interrupted(format!("Lock poisoned: {}", e)))?;

    if let Some(in_flight) = registered.iter().find(|f| f.request == request) {
      debug!(
        partition = %self.inner.partition_id,
        load = %request.load_type(),
        "joining in-flight load"
      );
      return Ok(in_flight.result.clone());
    }

    let id = self.inner.next_load_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(&self.inner);
    let load_type = request.load_type();

    let handle = tokio::spawn(async move {
      let result = {
        let _gate = inner.gate.lock().await;
        inner.run(load_type).await
      };
      inner.finish(id);
      result
    });

    let result = async move {
      handle
        .await
        .unwrap_or_else(|e| MediatorResult::Error(LoadError::Interrupted(e.to_string())))
    }
    .boxed()
    .shared();

    registered.push(InFlight {
      id,
      request,
      result: result.clone(),
    });

    Ok(result)
  }
}

impl<F: PageFetcher, S: PagingStorage> Clone for RemoteMediator<F, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<F: PageFetcher, S: PagingStorage> Inner<F, S> {
  async fn run(&self, load_type: LoadType) -> MediatorResult {
    debug!(partition = %self.partition_id, load = %load_type, "load started");

    match self.execute(load_type).await {
      Ok(end_of_pagination_reached) => {
        info!(
          partition = %self.partition_id,
          load = %load_type,
          end_of_pagination_reached,
          "load finished"
        );
        MediatorResult::Success {
          end_of_pagination_reached,
        }
      }
      Err(e) => {
        warn!(partition = %self.partition_id, load = %load_type, error = %e, "load failed");
        MediatorResult::Error(e)
      }
    }
  }

  async fn execute(&self, load_type: LoadType) -> Result<bool, LoadError> {
    let page = match self.resolve(load_type)? {
      Step::Fetch(page) => page,
      Step::Done {
        end_of_pagination_reached,
      } => return Ok(end_of_pagination_reached),
    };

    // Nothing is written until the fetch has succeeded.
    let fetched = self.fetcher.fetch(page, self.page_size).await?;

    let key = RemoteKey::for_fetched_page(&self.partition_id, page, fetched.has_more);
    let replace = load_type == LoadType::Refresh;

    self
      .storage
      .merge_page(PageMerge {
        partition_id: &self.partition_id,
        replace,
        items: &fetched.items,
        key,
        expected_next_key: if replace { None } else { Some(page) },
      })
      .map_err(|e| LoadError::Storage(e.to_string()))?;

    Ok(!fetched.has_more)
  }

  fn resolve(&self, load_type: LoadType) -> Result<Step, LoadError> {
    if load_type == LoadType::Refresh {
      return Ok(Step::Fetch(FIRST_PAGE));
    }

    let key = self
      .storage
      .remote_key(&self.partition_id)
      .map_err(|e| LoadError::Storage(e.to_string()))?;

    // No record yet: nothing has been seeded, a refresh has to come first.
    let Some(key) = key else {
      return Ok(Step::Done {
        end_of_pagination_reached: false,
      });
    };

    Ok(match load_type {
      LoadType::Append => match key.next_key {
        Some(page) => Step::Fetch(page),
        None => Step::Done {
          end_of_pagination_reached: true,
        },
      },
      // The cache is a prefix anchored at the first page, so whatever page
      // prev_key names has already been merged.
      _ => Step::Done {
        end_of_pagination_reached: true,
      },
    })
  }

  fn finish(&self, id: u64) {
    if let Ok(mut registered) = self.in_flight.lock() {
      registered.retain(|f| f.id != id);
    }
  }
}

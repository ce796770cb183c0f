//! Remote-backed paging cache.
//!
//! This module keeps a local SQLite copy of a paginated remote feed:
//! - Items are upserted by key, so re-fetched pages never duplicate rows
//! - A single cursor record per partition tracks the previous/next page
//! - Pages are merged in one transaction together with their cursor record
//! - Loads are serialized per partition, identical concurrent loads coalesce
//! - The pager serves windows from the cache and loads more near the edges

mod error;
mod mediator;
mod pager;
mod storage;
mod traits;

pub use error::{FetchError, LoadError};
pub use mediator::{RemoteMediator, DEFAULT_PAGE_SIZE};
pub use pager::{LoadState, LoadStates, Pager, PagerEvent, DEFAULT_PREFETCH_DISTANCE};
pub use storage::{PageMerge, PagingStorage, SqliteStorage};
pub use traits::{
  Cacheable, LoadRequest, LoadType, MediatorResult, Page, PageFetcher, QueryKey, RemoteKey,
  FIRST_PAGE,
};

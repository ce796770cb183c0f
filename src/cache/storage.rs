//! Cache storage trait and SQLite implementation.
//!
//! Two tables back the cache: `items` (the local item store) and `remote_key`
//! (the pagination key store). Both are scoped by partition id.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{Cacheable, RemoteKey};
use crate::db::Database;

/// A fetched page ready to be applied to storage.
#[derive(Debug)]
pub struct PageMerge<'a, T> {
  pub partition_id: &'a str,
  /// Drop the partition's items and cursor record before inserting
  pub replace: bool,
  pub items: &'a [T],
  pub key: RemoteKey,
  /// When set, the stored record must still point at this page or the merge
  /// is rejected. Keeps non-adjacent pages out of the cache.
  pub expected_next_key: Option<u32>,
}

/// Trait for cache storage backends.
pub trait PagingStorage: Send + Sync + 'static {
  /// Upsert items by key. New items are placed after the current tail.
  fn insert_or_replace<T: Cacheable>(&self, partition_id: &str, items: &[T]) -> Result<()>;

  /// Delete every item in a partition.
  fn clear_all(&self, partition_id: &str) -> Result<()>;

  /// Read an ordered window of items.
  fn read_range<T: Cacheable>(
    &self,
    partition_id: &str,
    offset: usize,
    limit: usize,
  ) -> Result<Vec<T>>;

  /// Number of cached items in a partition.
  fn count(&self, partition_id: &str) -> Result<usize>;

  /// Look up an item by key in any partition.
  fn find_item<T: Cacheable>(&self, key: &str) -> Result<Option<T>>;

  /// Get the cursor record for a partition.
  fn remote_key(&self, partition_id: &str) -> Result<Option<RemoteKey>>;

  /// Store cursor records, replacing any existing record per partition.
  fn put_remote_keys(&self, keys: &[RemoteKey]) -> Result<()>;

  /// Delete every cursor record.
  fn clear_remote_keys(&self) -> Result<()>;

  /// Apply a fetched page in a single transaction.
  fn merge_page<T: Cacheable>(&self, merge: PageMerge<'_, T>) -> Result<()>;

  /// Delete all items and cursor records (logout).
  fn clear_everything(&self) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create storage at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::from_database(Database::open(path)?))
  }

  /// Create storage backed by an in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::from_database(Database::open_in_memory()?))
  }

  pub fn from_database(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl PagingStorage for SqliteStorage {
  fn insert_or_replace<T: Cacheable>(&self, partition_id: &str, items: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_items(&tx, partition_id, items)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn clear_all(&self, partition_id: &str) -> Result<()> {
    let conn = self.lock()?;
    delete_items(&conn, partition_id)
  }

  fn read_range<T: Cacheable>(
    &self,
    partition_id: &str,
    offset: usize,
    limit: usize,
  ) -> Result<Vec<T>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT data FROM items
         WHERE partition_id = ?
         ORDER BY position
         LIMIT ? OFFSET ?",
      )
      .map_err(|e| eyre!("Failed to prepare item query: {}", e))?;

    let rows: Vec<Vec<u8>> = stmt
      .query_map(
        params![partition_id, sql_int(limit), sql_int(offset)],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query items: {}", e))?
      .collect::<rusqlite::Result<Vec<Vec<u8>>>>()
      .map_err(|e| eyre!("Failed to read item row: {}", e))?;

    rows
      .iter()
      .map(|data| {
        serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize item: {}", e))
      })
      .collect()
  }

  fn count(&self, partition_id: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM items WHERE partition_id = ?",
        params![partition_id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count items: {}", e))?;

    Ok(count as usize)
  }

  fn find_item<T: Cacheable>(&self, key: &str) -> Result<Option<T>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM items WHERE entity_type = ? AND id = ?
         ORDER BY cached_at DESC LIMIT 1",
        params![T::entity_type(), key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up item {}: {}", key, e))?;

    data
      .map(|d| serde_json::from_slice(&d).map_err(|e| eyre!("Failed to deserialize item: {}", e)))
      .transpose()
  }

  fn remote_key(&self, partition_id: &str) -> Result<Option<RemoteKey>> {
    let conn = self.lock()?;
    get_remote_key(&conn, partition_id)
  }

  fn put_remote_keys(&self, keys: &[RemoteKey]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for key in keys {
      put_remote_key(&tx, key)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn clear_remote_keys(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM remote_key", [])
      .map_err(|e| eyre!("Failed to clear remote keys: {}", e))?;
    Ok(())
  }

  fn merge_page<T: Cacheable>(&self, merge: PageMerge<'_, T>) -> Result<()> {
    let mut conn = self.lock()?;

    // Dropping the transaction without commit rolls back every statement below.
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    if let Some(expected) = merge.expected_next_key {
      let current = get_remote_key(&tx, merge.partition_id)?.and_then(|k| k.next_key);
      if current != Some(expected) {
        return Err(eyre!(
          "Page {} is not adjacent to the cached tail (next key is {:?})",
          expected,
          current
        ));
      }
    }

    if merge.replace {
      delete_remote_key(&tx, merge.partition_id)?;
      delete_items(&tx, merge.partition_id)?;
    }

    insert_items(&tx, merge.partition_id, merge.items)?;
    put_remote_key(&tx, &merge.key)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit merge: {}", e))?;

    tracing::debug!(
      partition = merge.partition_id,
      items = merge.items.len(),
      replace = merge.replace,
      next_key = ?merge.key.next_key,
      "merged page"
    );
    Ok(())
  }

  fn clear_everything(&self) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM remote_key", [])
      .map_err(|e| eyre!("Failed to clear remote keys: {}", e))?;
    tx.execute("DELETE FROM items", [])
      .map_err(|e| eyre!("Failed to clear items: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }
}

// ============================================================================
// Local item store
// ============================================================================

fn insert_items<T: Cacheable>(conn: &Connection, partition_id: &str, items: &[T]) -> Result<()> {
  let mut position: i64 = conn
    .query_row(
      "SELECT COALESCE(MAX(position) + 1, 0) FROM items WHERE partition_id = ?",
      params![partition_id],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to read tail position: {}", e))?;

  // An item seen again keeps its position; only the payload is replaced.
  let mut stmt = conn
    .prepare(
      "INSERT INTO items (partition_id, id, entity_type, data, position, cached_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))
       ON CONFLICT(partition_id, id) DO UPDATE SET
         entity_type = excluded.entity_type,
         data = excluded.data,
         cached_at = excluded.cached_at",
    )
    .map_err(|e| eyre!("Failed to prepare item insert: {}", e))?;

  for item in items {
    let data = serde_json::to_vec(item).map_err(|e| eyre!("Failed to serialize item: {}", e))?;

    stmt
      .execute(params![
        partition_id,
        item.cache_key(),
        T::entity_type(),
        data,
        position
      ])
      .map_err(|e| eyre!("Failed to store item: {}", e))?;
    position += 1;
  }

  Ok(())
}

/// SQLite integers are signed; anything larger is clamped rather than wrapped
/// into a negative LIMIT/OFFSET.
fn sql_int(n: usize) -> i64 {
  i64::try_from(n).unwrap_or(i64::MAX)
}

fn delete_items(conn: &Connection, partition_id: &str) -> Result<()> {
  conn
    .execute(
      "DELETE FROM items WHERE partition_id = ?",
      params![partition_id],
    )
    .map_err(|e| eyre!("Failed to clear items: {}", e))?;
  Ok(())
}

// ============================================================================
// Pagination key store
// ============================================================================

fn get_remote_key(conn: &Connection, partition_id: &str) -> Result<Option<RemoteKey>> {
  conn
    .query_row(
      "SELECT partition_id, prev_key, next_key FROM remote_key WHERE partition_id = ?",
      params![partition_id],
      |row| {
        Ok(RemoteKey {
          partition_id: row.get(0)?,
          prev_key: row.get(1)?,
          next_key: row.get(2)?,
        })
      },
    )
    .optional()
    .map_err(|e| eyre!("Failed to read remote key: {}", e))
}

fn put_remote_key(conn: &Connection, key: &RemoteKey) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO remote_key (partition_id, prev_key, next_key, updated_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![key.partition_id, key.prev_key, key.next_key],
    )
    .map_err(|e| eyre!("Failed to store remote key: {}", e))?;
  Ok(())
}

fn delete_remote_key(conn: &Connection, partition_id: &str) -> Result<()> {
  conn
    .execute(
      "DELETE FROM remote_key WHERE partition_id = ?",
      params![partition_id],
    )
    .map_err(|e| eyre!("Failed to delete remote key: {}", e))?;
  Ok(())
}

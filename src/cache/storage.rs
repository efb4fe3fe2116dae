//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::types::{CacheEntry, CacheKey};
use crate::db::Database;
use crate::http::{Response, ResponseKind};

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches (namespaces), each mapping a
/// request identity to a stored response. Individual writes are atomic.
pub trait CacheStorage: Send + Sync + 'static {
  /// Whether the named cache exists.
  fn has(&self, cache_name: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the same key.
  fn put(&self, cache_name: &str, key: &CacheKey, response: &Response) -> Result<()>;

  /// Store a batch of responses in one transaction; either all land or none do.
  fn put_all(&self, cache_name: &str, entries: &[(CacheKey, Response)]) -> Result<()>;

  /// Look up a key in a single cache.
  fn match_in(&self, cache_name: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Look up a key across all caches, oldest cache first.
  fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Names of all caches in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Drop a cache and all of its entries. Returns whether it existed.
  fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Number of entries held by a cache.
  fn entry_count(&self, cache_name: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the given path, creating it if needed.
  pub fn open(path: &Path) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  /// Open a storage that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self {
      conn: Mutex::new(db.into_connection()),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const SELECT_ENTRY: &str = "SELECT e.cache_name, e.status, e.status_text, e.kind, e.headers, e.body, e.cached_at
   FROM cache_entries e";

/// Row shape before JSON and timestamp decoding.
struct RawEntry {
  cache_name: String,
  status: u16,
  status_text: String,
  kind: String,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl RawEntry {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      cache_name: row.get(0)?,
      status: row.get(1)?,
      status_text: row.get(2)?,
      kind: row.get(3)?,
      headers: row.get(4)?,
      body: row.get(5)?,
      cached_at: row.get(6)?,
    })
  }

  fn decode(self) -> Result<CacheEntry> {
    let kind = ResponseKind::parse(&self.kind)
      .ok_or_else(|| eyre!("Unknown response kind '{}' in cache", self.kind))?;
    let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
    let cached_at = parse_datetime(&self.cached_at)?;

    Ok(CacheEntry {
      cache_name: self.cache_name,
      response: Response {
        status: self.status,
        status_text: self.status_text,
        kind,
        headers,
        body: self.body,
      },
      cached_at,
    })
  }
}

fn insert_entry(
  conn: &Connection,
  cache_name: &str,
  key: &CacheKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache_name, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_hash, method, url, status, status_text, kind, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        cache_name,
        key.cache_hash(),
        key.method(),
        key.url(),
        response.status,
        response.status_text,
        response.kind.as_str(),
        headers,
        response.body,
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url(), cache_name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn has(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_namespaces WHERE name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache_name, e))?;
    Ok(found.is_some())
  }

  fn put(&self, cache_name: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_entry(&tx, cache_name, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn put_all(&self, cache_name: &str, entries: &[(CacheKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache_name, e))?;

    for (key, response) in entries {
      insert_entry(&tx, cache_name, key, response)?;
    }

    // Dropping the transaction on an early return rolls everything back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  fn match_in(&self, cache_name: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;
    let sql = format!("{} WHERE e.cache_name = ? AND e.request_hash = ?", SELECT_ENTRY);

    let raw = conn
      .query_row(&sql, params![cache_name, key.cache_hash()], RawEntry::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache_name, e))?;

    raw.map(RawEntry::decode).transpose()
  }

  fn match_any(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;
    let sql = format!(
      "{} INNER JOIN cache_namespaces n ON n.name = e.cache_name
       WHERE e.request_hash = ?
       ORDER BY n.rowid
       LIMIT 1",
      SELECT_ENTRY
    );

    let raw = conn
      .query_row(&sql, params![key.cache_hash()], RawEntry::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to query caches: {}", e))?;

    raw.map(RawEntry::decode).transpose()
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache_name, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, cache_name: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", cache_name, e))?;

    Ok(count as usize)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

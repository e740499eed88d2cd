//! Deduplication of delivered content.
//!
//! Once a track has been delivered, the chat network hands back a reusable
//! handle for it. [`ContentCache`] maps content keys to those handles so that
//! identical content is never uploaded twice.
//!
//! # Layers
//!
//! * A bounded in-memory layer ordered by recency
//! * An optional [`DurableStore`] behind it, written through on `set` and
//!   consulted on misses
//!
//! The durable layer is best effort. When it fails or does not answer within
//! the configured timeout, the cache carries on with the memory layer alone.

use std::{
    fmt,
    future::Future,
    num::NonZeroUsize,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::Result};

/// Reusable handle of content already uploaded to the chat network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the message behind a handle lives, so that a stale handle can be
/// derived again without fetching the content anew.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct RecoveryRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub chat_id: i64,
    pub message_id: i64,
}

/// A cached delivery. This is also the document kept by durable stores.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub handle: RemoteHandle,
    #[serde(default)]
    pub recovery: Option<RecoveryRef>,
}

/// Persistent backing for [`ContentCache`].
///
/// Implementations must make single-entry saves atomic.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn save(&self, entry: &CacheEntry) -> Result<()>;
}

pub struct ContentCache {
    hot: Mutex<LruCache<String, CacheEntry>>,
    store: Option<Arc<dyn DurableStore>>,
    store_timeout: Duration,
}

impl ContentCache {
    /// Creates a memory-only cache holding up to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            hot: Mutex::new(LruCache::new(capacity)),
            store: None,
            store_timeout: Config::DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Creates a cache sized by `config`, backed by `store` if given.
    #[must_use]
    pub fn from_config(config: &Config, store: Option<Arc<dyn DurableStore>>) -> Self {
        let mut cache = Self::new(config.cache_capacity);
        cache.store = store;
        cache.store_timeout = config.store_timeout;
        cache
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        self.store = Some(store);
        self.store_timeout = timeout;
        self
    }

    /// Returns the handle cached for `key`.
    pub async fn get(&self, key: &str) -> Option<RemoteHandle> {
        self.entry(key).await.map(|entry| entry.handle)
    }

    /// Returns the cached entry for `key`, including its recovery reference.
    ///
    /// Memory misses fall through to the durable store; hits there are
    /// copied back into memory unless `key` was set in the meantime.
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.lock().get(key) {
            trace!("cache hit for {key}");
            return Some(entry.clone());
        }

        let store = self.store.as_ref()?;
        let entry = self.durable("load", key, store.load(key)).await.flatten()?;

        let mut hot = self.lock();
        if let Some(current) = hot.get(key) {
            debug!("{key} was set while loading, keeping the newer entry");
            return Some(current.clone());
        }

        debug!("restored {key} from durable store");
        hot.put(key.to_owned(), entry.clone());
        Some(entry)
    }

    /// Caches `handle` for `key`, replacing any earlier entry.
    pub async fn set(&self, key: &str, handle: RemoteHandle, recovery: Option<RecoveryRef>) {
        let entry = CacheEntry {
            key: key.to_owned(),
            handle,
            recovery,
        };

        if let Some((evicted, _)) = self.lock().push(key.to_owned(), entry.clone()) {
            if evicted != key {
                trace!("evicted {evicted}");
            }
        }

        if let Some(store) = &self.store {
            self.durable("save", key, store.save(&entry)).await;
        }
    }

    /// Number of entries held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.hot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a durable store call under the store timeout. Failures are
    /// logged and reported as `None`.
    async fn durable<T>(
        &self,
        operation: &str,
        key: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("durable store {operation} for {key} failed: {e}");
                None
            }
            Err(_) => {
                warn!(
                    "durable store {operation} for {key} timed out after {:.1}s",
                    self.store_timeout.as_secs_f32()
                );
                None
            }
        }
    }
}

/// [`DurableStore`] on a single SQLite table of JSON documents.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    const SCHEMA: &'static str = r"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY NOT NULL,
    document TEXT NOT NULL
);
";

    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Opens a store that lives only as long as the process.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the database cannot be initialized.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key = key.to_owned();
        let document: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT document FROM cache_entries WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        document
            .map(|document| serde_json::from_str(&document).map_err(Into::into))
            .transpose()
    }

    async fn save(&self, entry: &CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        let document = serde_json::to_string(entry)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cache_entries (key, document) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET document = excluded.document",
                params![key, document],
            )?;
            Ok(())
        })
        .await
    }
}

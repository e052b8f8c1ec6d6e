//! Sled-backed durable store
//!
//! # Layout
//!
//! ```text
//! entries                   key                      -> bincode(StoredRecord)
//! entries_by_created        created_at_be ++ key     -> ()
//! entries_by_accessed       last_accessed_be ++ key  -> ()
//! analytics                 YYYY-MM-DD               -> json(AnalyticsSnapshot)
//! analytics_by_timestamp    timestamp_be ++ date     -> ()
//! ```
//!
//! Row writes update the row and both index entries in one transaction.
//! Index entries that no longer match their row are dropped when a scan
//! encounters them. All sled calls run on the blocking pool.

use std::path::PathBuf;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionResult};
use sled::Transactional;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::analytics::AnalyticsSnapshot;
use super::durable::{DurableStore, StoredRecord};
use crate::config::DurableConfig;
use crate::error::{Error, Result};

const ENTRIES_TREE: &str = "entries";
const BY_CREATED_TREE: &str = "entries_by_created";
const BY_ACCESSED_TREE: &str = "entries_by_accessed";
const ANALYTICS_TREE: &str = "analytics";
const ANALYTICS_BY_TS_TREE: &str = "analytics_by_timestamp";

#[derive(Clone)]
struct SledTrees {
    db: sled::Db,
    entries: sled::Tree,
    by_created: sled::Tree,
    by_accessed: sled::Tree,
    analytics: sled::Tree,
    analytics_by_ts: sled::Tree,
}

impl SledTrees {
    fn open(path: Option<&PathBuf>, temporary: bool) -> Result<Self> {
        let mut config = sled::Config::new().temporary(temporary);
        if let Some(path) = path {
            config = config.path(path);
        }
        let db = config.open()?;

        Ok(Self {
            entries: db.open_tree(ENTRIES_TREE)?,
            by_created: db.open_tree(BY_CREATED_TREE)?,
            by_accessed: db.open_tree(BY_ACCESSED_TREE)?,
            analytics: db.open_tree(ANALYTICS_TREE)?,
            analytics_by_ts: db.open_tree(ANALYTICS_BY_TS_TREE)?,
            db,
        })
    }
}

/// `timestamp_be ++ suffix`
fn index_key(timestamp: u64, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + suffix.len());
    key.extend_from_slice(&timestamp.to_be_bytes());
    key.extend_from_slice(suffix);
    key
}

fn split_index_key(raw: &[u8]) -> Option<(u64, &[u8])> {
    if raw.len() < 8 {
        return None;
    }
    let (ts, suffix) = raw.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(ts);
    Some((u64::from_be_bytes(buf), suffix))
}

/// Durable store on a sled database
pub struct SledStore {
    path: Option<PathBuf>,
    temporary: bool,
    trees: OnceCell<SledTrees>,
}

impl SledStore {
    /// Store at `path`. Nothing is opened until [`DurableStore::initialize`].
    pub fn new(path: impl Into<PathBuf>, temporary: bool) -> Self {
        Self {
            path: Some(path.into()),
            temporary,
            trees: OnceCell::new(),
        }
    }

    /// Store in a throwaway location, deleted on drop
    pub fn temporary() -> Self {
        Self {
            path: None,
            temporary: true,
            trees: OnceCell::new(),
        }
    }

    /// Store described by the durable tier configuration
    pub fn from_config(config: &DurableConfig) -> Self {
        Self::new(config.path.clone(), config.temporary)
    }

    fn trees(&self) -> Result<&SledTrees> {
        self.trees
            .get()
            .ok_or_else(|| Error::DurableStoreUnavailable("sled store not initialized".into()))
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&SledTrees) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let trees = self.trees()?.clone();
        tokio::task::spawn_blocking(move || f(&trees))
            .await
            .map_err(|e| Error::durable(operation, e))?
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("path", &self.path)
            .field("temporary", &self.temporary)
            .field("open", &self.trees.initialized())
            .finish()
    }
}

fn read_record(trees: &SledTrees, key: &[u8]) -> Result<Option<StoredRecord>> {
    match trees.entries.get(key)? {
        Some(bytes) => Ok(Some(StoredRecord::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

fn write_record(trees: &SledTrees, record: &StoredRecord) -> Result<()> {
    let bytes = record.to_bytes()?;
    let key = record.key.as_bytes();

    let result: TransactionResult<(), ()> = (&trees.entries, &trees.by_created, &trees.by_accessed)
        .transaction(|(entries, by_created, by_accessed)| -> ConflictableTransactionResult<(), ()> {
            if let Some(old) = entries.insert(key, bytes.as_slice())? {
                if let Ok(old) = StoredRecord::from_bytes(&old) {
                    by_created.remove(index_key(old.created_at, key))?;
                    by_accessed.remove(index_key(old.last_accessed, key))?;
                }
            }
            by_created.insert(index_key(record.created_at, key), Vec::new())?;
            by_accessed.insert(index_key(record.last_accessed, key), Vec::new())?;
            Ok(())
        });

    result.map_err(|e| Error::durable("put", format!("{:?}", e)))
}

/// Bump access metadata. The row is read and rewritten in one transaction.
fn touch_record(trees: &SledTrees, key: &[u8], accessed_at: u64) -> Result<()> {
    let result: TransactionResult<(), String> = (&trees.entries, &trees.by_accessed)
        .transaction(|(entries, by_accessed)| -> ConflictableTransactionResult<(), String> {
            let Some(bytes) = entries.get(key)? else {
                return Ok(());
            };
            let Ok(mut record) = StoredRecord::from_bytes(&bytes) else {
                return Ok(());
            };

            by_accessed.remove(index_key(record.last_accessed, key))?;
            record.last_accessed = accessed_at;
            record.access_count += 1;
            let bytes = record
                .to_bytes()
                .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
            entries.insert(key, bytes)?;
            by_accessed.insert(index_key(accessed_at, key), Vec::new())?;
            Ok(())
        });

    result.map_err(|e| Error::durable("touch", format!("{:?}", e)))
}

fn delete_record(trees: &SledTrees, key: &[u8]) -> Result<bool> {
    let result: TransactionResult<bool, ()> = (&trees.entries, &trees.by_created, &trees.by_accessed)
        .transaction(|(entries, by_created, by_accessed)| -> ConflictableTransactionResult<bool, ()> {
            let old = match entries.remove(key)? {
                Some(old) => old,
                None => return Ok(false),
            };
            if let Ok(old) = StoredRecord::from_bytes(&old) {
                by_created.remove(index_key(old.created_at, key))?;
                by_accessed.remove(index_key(old.last_accessed, key))?;
            }
            Ok(true)
        });

    result.map_err(|e| Error::durable("delete", format!("{:?}", e)))
}

/// Walk an index in timestamp order, yielding keys whose row still carries
/// the indexed timestamp. Stale index entries are removed.
fn scan_index<I>(
    index: &sled::Tree,
    entries: &sled::Tree,
    iter: I,
    field: fn(&StoredRecord) -> u64,
    limit: usize,
) -> Result<Vec<String>>
where
    I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
{
    let mut keys = Vec::new();
    for item in iter {
        if keys.len() >= limit {
            break;
        }
        let (raw, _) = item?;
        let Some((ts, key)) = split_index_key(&raw) else {
            index.remove(&raw)?;
            continue;
        };

        let live = match entries.get(key)? {
            Some(bytes) => StoredRecord::from_bytes(&bytes)
                .map(|r| field(&r) == ts)
                .unwrap_or(false),
            None => false,
        };

        if live {
            keys.push(String::from_utf8_lossy(key).into_owned());
        } else {
            debug!(index = ?String::from_utf8_lossy(&index.name()), "Dropping stale index entry");
            index.remove(&raw)?;
        }
    }
    Ok(keys)
}

#[async_trait]
impl DurableStore for SledStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn initialize(&self) -> Result<()> {
        let path = self.path.clone();
        let temporary = self.temporary;

        self.trees
            .get_or_try_init(|| async move {
                let trees = tokio::task::spawn_blocking(move || SledTrees::open(path.as_ref(), temporary))
                    .await
                    .map_err(|e| Error::DurableStoreUnavailable(e.to_string()))?
                    .map_err(|e| Error::DurableStoreUnavailable(e.to_string()))?;
                info!(rows = trees.entries.len(), "Sled store opened");
                Ok::<_, Error>(trees)
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let key = key.to_string();
        self.blocking("get", move |trees| read_record(trees, key.as_bytes()))
            .await
    }

    async fn put(&self, record: StoredRecord) -> Result<()> {
        self.blocking("put", move |trees| write_record(trees, &record))
            .await
    }

    async fn touch(&self, key: &str, accessed_at: u64) -> Result<()> {
        let key = key.to_string();
        self.blocking("touch", move |trees| touch_record(trees, key.as_bytes(), accessed_at))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.blocking("delete", move |trees| delete_record(trees, key.as_bytes()))
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.blocking("clear", |trees| {
            trees.entries.clear()?;
            trees.by_created.clear()?;
            trees.by_accessed.clear()?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.blocking("count", |trees| Ok(trees.entries.len()))
            .await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.blocking("keys", |trees| {
            trees
                .entries
                .iter()
                .keys()
                .map(|k| -> Result<String> { Ok(String::from_utf8_lossy(&k?).into_owned()) })
                .collect()
        })
        .await
    }

    async fn created_before(&self, timestamp: u64) -> Result<Vec<String>> {
        self.blocking("created_before", move |trees| {
            let upper = timestamp.to_be_bytes().to_vec();
            scan_index(
                &trees.by_created,
                &trees.entries,
                trees.by_created.range(..upper),
                |r| r.created_at,
                usize::MAX,
            )
        })
        .await
    }

    async fn least_recently_accessed(&self, limit: usize) -> Result<Vec<String>> {
        self.blocking("least_recently_accessed", move |trees| {
            scan_index(
                &trees.by_accessed,
                &trees.entries,
                trees.by_accessed.iter(),
                |r| r.last_accessed,
                limit,
            )
        })
        .await
    }

    async fn put_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        let snapshot = snapshot.clone();
        self.blocking("put_snapshot", move |trees| {
            let date = snapshot.date.as_bytes();
            let json = serde_json::to_vec(&snapshot)?;

            if let Some(old) = trees.analytics.insert(date, json)? {
                if let Ok(old) = serde_json::from_slice::<AnalyticsSnapshot>(&old) {
                    trees.analytics_by_ts.remove(index_key(old.timestamp, date))?;
                }
            }
            trees
                .analytics_by_ts
                .insert(index_key(snapshot.timestamp, date), Vec::new())?;
            Ok(())
        })
        .await
    }

    async fn snapshots_since(&self, timestamp: u64) -> Result<Vec<AnalyticsSnapshot>> {
        self.blocking("snapshots_since", move |trees| {
            let lower = timestamp.to_be_bytes().to_vec();
            let mut snapshots = Vec::new();

            for item in trees.analytics_by_ts.range(lower..) {
                let (raw, _) = item?;
                let Some((ts, date)) = split_index_key(&raw) else {
                    continue;
                };
                let Some(bytes) = trees.analytics.get(date)? else {
                    trees.analytics_by_ts.remove(&raw)?;
                    continue;
                };
                let snapshot: AnalyticsSnapshot = serde_json::from_slice(&bytes)?;
                if snapshot.timestamp == ts {
                    snapshots.push(snapshot);
                } else {
                    trees.analytics_by_ts.remove(&raw)?;
                }
            }
            Ok(snapshots)
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        let trees = self.trees()?;
        trees
            .db
            .flush_async()
            .await
            .map_err(|e| Error::durable("flush", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::analytics::CacheAnalytics;
    use std::sync::Arc;
    use assert_matches::assert_matches;

    fn record(key: &str, created_at: u64, last_accessed: u64) -> StoredRecord {
        StoredRecord {
            key: key.to_string(),
            payload: br#"{"v":1}"#.to_vec(),
            codec: None,
            created_at,
            ttl_ms: 1_000,
            retention_ms: 86_400_000,
            access_count: 1,
            last_accessed,
            stale_while_revalidate: false,
            background_refresh: false,
            encoded: false,
        }
    }

    async fn open() -> SledStore {
        let store = SledStore::temporary();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_uninitialized_store_is_unavailable() {
        let store = SledStore::temporary();
        assert_matches!(store.get("k").await, Err(Error::DurableStoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = open().await;
        store.initialize().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = open().await;
        store.put(record("a", 10, 10)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(record("a", 10, 10)));
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_creation_index() {
        let store = open().await;
        store.put(record("old", 10, 10)).await.unwrap();
        store.put(record("new", 100, 100)).await.unwrap();

        assert_eq!(store.created_before(50).await.unwrap(), vec!["old".to_string()]);

        // Overwrite moves the row in the index
        store.put(record("old", 200, 200)).await.unwrap();
        assert!(store.created_before(50).await.unwrap().is_empty());
        assert_eq!(store.created_before(150).await.unwrap(), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_access_index_follows_touch() {
        let store = open().await;
        store.put(record("a", 0, 0)).await.unwrap();
        store.put(record("b", 1, 1)).await.unwrap();
        store.put(record("c", 2, 2)).await.unwrap();

        store.touch("a", 50).await.unwrap();

        assert_eq!(
            store.least_recently_accessed(2).await.unwrap(),
            vec!["b".to_string(), "c".to_string()]
        );
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.access_count, 2);
        assert_eq!(a.last_accessed, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_touch_never_reverts_concurrent_put() {
        let store = Arc::new(open().await);

        for round in 0..20u64 {
            let key = format!("k{}", round);
            store.put(record(&key, 0, 0)).await.unwrap();

            let mut updated = record(&key, 5, 5);
            updated.payload = br#"{"v":2}"#.to_vec();

            let mut tasks = Vec::new();
            for i in 0..8u64 {
                let store = store.clone();
                let key = key.clone();
                tasks.push(tokio::spawn(async move { store.touch(&key, 10 + i).await }));
            }
            let writer = {
                let store = store.clone();
                tokio::spawn(async move { store.put(updated).await })
            };

            writer.await.unwrap().unwrap();
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            let row = store.get(&key).await.unwrap().unwrap();
            assert_eq!(row.payload, br#"{"v":2}"#.to_vec(), "round {}", round);
        }

        // One live access index entry per row
        assert_eq!(store.least_recently_accessed(100).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_clear_and_keys() {
        let store = open().await;
        store.put(record("a", 0, 0)).await.unwrap();
        store.put(record("b", 0, 0)).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.least_recently_accessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_by_day() {
        let store = open().await;
        let analytics = CacheAnalytics::new();
        const DAY: u64 = 86_400_000;

        store.put_snapshot(&analytics.snapshot(DAY)).await.unwrap();
        analytics.record_miss();
        store.put_snapshot(&analytics.snapshot(DAY + 10)).await.unwrap();
        store.put_snapshot(&analytics.snapshot(2 * DAY)).await.unwrap();

        let all = store.snapshots_since(0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp, DAY + 10);
        assert_eq!(all[0].counters.misses, 1);

        let recent = store.snapshots_since(2 * DAY).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].date, "1970-01-03");
    }

    #[tokio::test]
    async fn test_flush() {
        let store = open().await;
        store.put(record("a", 0, 0)).await.unwrap();
        store.flush().await.unwrap();
    }
}

//! # RocksDB Storage Engine
//!
//! Every observation is stored under two keys in one keyspace:
//!
//! - forward `o␟name␟sensor␟rrtype␟value`, holding the aggregate
//!   (count, last_seen, first_seen);
//! - inverse `i␟value␟sensor␟name␟rrtype`, with an empty value.
//!
//! Both entries of a batch go through a single `WriteBatch`, so the two
//! orderings never disagree on the set of live keys.

use crate::coalescer::{BatchConfig, ObservationBatcher};
use crate::config::{StorageConfig, DEFAULT_QUERY_LIMIT};
use crate::error::{Result, StoreError};
use crate::model::{
    scan_prefix, Aggregate, InputObservation, Observation, ObservationKey, FORWARD_TAG,
    INVERSE_TAG, KEY_SEPARATOR,
};
use crate::store::{write_dump_line, Backend, SearchQuery};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rocksdb::{
    checkpoint::Checkpoint, DBCompressionType, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const KEY_MANIFEST: &[u8] = b"m\x1fmanifest";
const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// Outcome of one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Distinct keys written.
    pub committed: usize,
    /// Inputs dropped because their record type was empty.
    pub skipped: usize,
    /// Inputs dropped because a field was invalid or the prior value could
    /// not be read.
    pub rejected: usize,
}

/// Synchronous engine over one RocksDB instance.
///
/// Reads run concurrently against snapshots. Writes are serialized by
/// `write_lock` so the read-merge-write of a batch is never interleaved
/// with another writer.
pub struct ObservationDb {
    db: RwLock<Option<DB>>,
    write_lock: Mutex<()>,
    path: PathBuf,
}

impl ObservationDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &StorageConfig::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, storage: &StorageConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = open_db(&path, storage)?;
        validate_or_init_manifest(&db)?;
        info!(path = %path.display(), "opened observation store");
        Ok(Self {
            db: RwLock::new(Some(db)),
            write_lock: Mutex::new(()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge one observation into the store.
    pub fn put(&self, observation: InputObservation) -> Result<()> {
        let observation = observation.normalized();
        observation.key().validate()?;
        self.commit_batch(vec![observation]).map(|_| ())
    }

    /// Deduplicate `batch` by forward key, merge each survivor with its
    /// stored aggregate and write all forward and inverse entries at once.
    ///
    /// Invalid inputs are logged and skipped without affecting siblings.
    pub fn commit_batch(&self, batch: Vec<InputObservation>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut merged: HashMap<ObservationKey, Aggregate> = HashMap::with_capacity(batch.len());

        for input in batch {
            let input = input.normalized();
            if input.rrtype.is_empty() {
                debug!(name = %input.name, sensor = %input.sensor, "skipping observation without record type");
                report.skipped += 1;
                continue;
            }
            let key = input.key();
            if let Err(err) = key.validate() {
                warn!(key = %key, error = %err, "rejecting observation");
                report.rejected += 1;
                continue;
            }
            let aggregate = Aggregate::from_input(&input);
            merged
                .entry(key)
                .and_modify(|existing| existing.merge(&aggregate))
                .or_insert(aggregate);
        }

        if merged.is_empty() {
            return Ok(report);
        }

        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let _writer = self.write_lock.lock();

        let mut write = WriteBatch::default();
        for (key, mut aggregate) in merged {
            let forward = key.forward();
            match db.get(&forward) {
                Ok(Some(stored)) => match Aggregate::decode(&stored) {
                    Some(existing) => aggregate.merge(&existing),
                    None => warn!(key = %key, "overwriting corrupt aggregate"),
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to read stored aggregate");
                    report.rejected += 1;
                    continue;
                }
            }
            write.put(&forward, aggregate.encode());
            write.put(key.inverse(), b"");
            report.committed += 1;
        }

        db.write(write)?;
        debug!(
            committed = report.committed,
            skipped = report.skipped,
            rejected = report.rejected,
            "committed batch"
        );
        Ok(report)
    }

    /// Prefix scan over the index matching the primary predicate.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<Observation>> {
        query.validate()?;
        let query = query.normalized();
        let limit = query.effective_limit(DEFAULT_QUERY_LIMIT);

        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let snapshot = db.snapshot();
        let mut results = Vec::new();

        if let Some(name) = query.name.as_deref() {
            let prefix = scan_prefix(FORWARD_TAG, name, query.sensor.as_deref());
            let iter = snapshot.iterator(IteratorMode::From(&prefix, Direction::Forward));
            for entry in iter {
                let (raw_key, raw_value) = entry?;
                if !raw_key.starts_with(&prefix) {
                    break;
                }
                let Some(key) = ObservationKey::parse_forward(&raw_key) else {
                    continue;
                };
                if !query.matches(&key) {
                    continue;
                }
                let Some(aggregate) = Aggregate::decode(&raw_value) else {
                    warn!(key = %key, "skipping corrupt aggregate");
                    continue;
                };
                results.push(Observation::from_parts(key, aggregate));
                if results.len() >= limit {
                    break;
                }
            }
        } else if let Some(value) = query.value.as_deref() {
            let prefix = scan_prefix(INVERSE_TAG, value, query.sensor.as_deref());
            let iter = snapshot.iterator(IteratorMode::From(&prefix, Direction::Forward));
            for entry in iter {
                let (raw_key, _) = entry?;
                if !raw_key.starts_with(&prefix) {
                    break;
                }
                let Some(key) = ObservationKey::parse_inverse(&raw_key) else {
                    continue;
                };
                if !query.matches(&key) {
                    continue;
                }
                let Some(stored) = snapshot.get(key.forward())? else {
                    debug!(key = %key, "inverse entry without forward entry");
                    continue;
                };
                let Some(aggregate) = Aggregate::decode(&stored) else {
                    warn!(key = %key, "skipping corrupt aggregate");
                    continue;
                };
                results.push(Observation::from_parts(key, aggregate));
                if results.len() >= limit {
                    break;
                }
            }
        }

        Ok(results)
    }

    /// Number of distinct observation keys.
    pub fn total_count(&self) -> Result<u64> {
        let mut count = 0u64;
        self.for_each_observation(|_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Visit every stored observation in forward-key order.
    pub fn for_each_observation(
        &self,
        mut f: impl FnMut(Observation) -> Result<()>,
    ) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let snapshot = db.snapshot();
        let prefix = [FORWARD_TAG, KEY_SEPARATOR];
        for entry in snapshot.iterator(IteratorMode::From(&prefix, Direction::Forward)) {
            let (raw_key, raw_value) = entry?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let (Some(key), Some(aggregate)) = (
                ObservationKey::parse_forward(&raw_key),
                Aggregate::decode(&raw_value),
            ) else {
                warn!(key = ?String::from_utf8_lossy(&raw_key), "skipping unreadable entry");
                continue;
            };
            f(Observation::from_parts(key, aggregate))?;
        }
        Ok(())
    }

    /// Write every observation to `path` as JSON lines. Returns the number
    /// of lines written.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<u64> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        let mut written = 0u64;
        self.for_each_observation(|obs| {
            write_dump_line(&mut writer, &obs)?;
            written += 1;
            Ok(())
        })?;
        writer.flush()?;
        Ok(written)
    }

    /// Consistent on-disk snapshot into a fresh directory.
    pub fn backup(&self, path: impl AsRef<Path>) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let checkpoint = Checkpoint::new(db)?;
        checkpoint.create_checkpoint(path.as_ref())?;
        info!(path = %path.as_ref().display(), "created backup checkpoint");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        db.flush()?;
        Ok(())
    }

    /// Flush and release the database. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.db.write();
        if let Some(db) = guard.take() {
            db.flush()?;
            info!(path = %self.path.display(), "closed observation store");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.db.read().is_none()
    }
}

impl Drop for ObservationDb {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Async `Backend` over an [`ObservationDb`].
///
/// Feeds are drained through an [`ObservationBatcher`]; every flushed
/// window is committed on the blocking pool.
pub struct PersistentStore {
    db: Arc<ObservationDb>,
    batch: BatchConfig,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    active_feeds: watch::Sender<usize>,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &StorageConfig::default(), BatchConfig::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        storage: &StorageConfig,
        batch: BatchConfig,
    ) -> Result<Self> {
        let db = ObservationDb::open_with_options(path, storage)?;
        Ok(Self::from_db(Arc::new(db), batch))
    }

    pub fn from_db(db: Arc<ObservationDb>, batch: BatchConfig) -> Self {
        let (stop, _) = watch::channel(false);
        let (active_feeds, _) = watch::channel(0usize);
        Self {
            db,
            batch,
            closed: AtomicBool::new(false),
            stop,
            active_feeds,
        }
    }

    pub fn db(&self) -> &Arc<ObservationDb> {
        &self.db
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn commit(&self, batch: Vec<InputObservation>) {
        let db = Arc::clone(&self.db);
        let size = batch.len();
        match tokio::task::spawn_blocking(move || db.commit_batch(batch)).await {
            Ok(Ok(report)) if report.rejected > 0 => {
                warn!(rejected = report.rejected, size, "batch committed with rejections");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, size, "batch commit failed"),
            Err(err) => warn!(error = %err, size, "batch commit task failed"),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ObservationDb) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))?
    }
}

/// Registers a running feed consumer until dropped.
struct FeedGuard<'a>(&'a watch::Sender<usize>);

impl<'a> FeedGuard<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for FeedGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn sleep_opt(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Backend for PersistentStore {
    async fn ingest(&self, observation: InputObservation) -> Result<()> {
        self.ensure_open()?;
        self.blocking(move |db| db.put(observation)).await
    }

    async fn consume_feed(&self, mut feed: mpsc::Receiver<InputObservation>) -> Result<()> {
        let _guard = FeedGuard::enter(&self.active_feeds);
        self.ensure_open()?;
        let mut stop = self.stop.subscribe();
        let mut batcher = ObservationBatcher::with_config(self.batch.clone());

        while !*stop.borrow_and_update() {
            tokio::select! {
                _ = stop.changed() => break,
                item = feed.recv() => match item {
                    Some(observation) => {
                        if let Some(batch) = batcher.add(observation) {
                            self.commit(batch).await;
                        }
                    }
                    None => break,
                },
                _ = sleep_opt(batcher.time_until_deadline()) => {
                    if let Some(batch) = batcher.tick() {
                        self.commit(batch).await;
                    }
                }
            }
        }

        feed.close();
        while let Ok(observation) = feed.try_recv() {
            if let Some(batch) = batcher.add(observation) {
                self.commit(batch).await;
            }
        }
        if let Some(batch) = batcher.flush() {
            self.commit(batch).await;
        }
        let stats = batcher.stats();
        debug!(
            inputs = stats.total_inputs,
            flushes = stats.total_flushes,
            committed = stats.total_committed,
            "feed consumer finished"
        );
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Observation>> {
        self.ensure_open()?;
        let query = query.clone();
        self.blocking(move |db| db.search(&query)).await
    }

    async fn total_count(&self) -> Result<u64> {
        self.ensure_open()?;
        self.blocking(|db| db.total_count()).await
    }

    async fn backup(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let path = path.to_path_buf();
        self.blocking(move |db| db.backup(path)).await
    }

    async fn dump(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let path = path.to_path_buf();
        let written = self.blocking(move |db| db.dump(path)).await?;
        info!(written, "dump complete");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop.send_replace(true);
        let mut feeds = self.active_feeds.subscribe();
        let _ = feeds.wait_for(|active| *active == 0).await;
        self.blocking(|db| db.close()).await
    }

    fn kind(&self) -> &'static str {
        "rocksdb"
    }
}

fn open_db(path: &Path, storage: &StorageConfig) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.set_paranoid_checks(true);
    options.set_write_buffer_size(storage.write_buffer_mb * 1024 * 1024);
    options.set_max_background_jobs(storage.max_background_jobs as i32);
    if storage.compression {
        options.set_compression_type(DBCompressionType::Lz4);
    } else {
        options.set_compression_type(DBCompressionType::None);
    }
    Ok(DB::open(&options, path)?)
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    if let Some(bytes) = db.get(KEY_MANIFEST)? {
        let manifest: StorageManifest = serde_json::from_slice(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(StoreError::Encoding(format!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION, manifest.format_version
            )));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    db.put(KEY_MANIFEST, serde_json::to_vec(&manifest)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn obs(name: &str, rrtype: &str, value: &str, sensor: &str, count: u32, t: i64) -> InputObservation {
        InputObservation::new(name, rrtype, value, sensor, count, t, t)
    }

    fn by_name(name: &str) -> SearchQuery {
        SearchQuery {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn by_value(value: &str) -> SearchQuery {
        SearchQuery {
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn repeated_key_merges_counts_and_window() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();

        db.put(InputObservation::new("foo.bar", "A", "12.34.56.78", "s1", 1, 100, 150))
            .unwrap();
        db.put(InputObservation::new("foo.bar", "A", "12.34.56.78", "s1", 2, 50, 120))
            .unwrap();

        let results = db.search(&by_name("foo.bar")).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].count, 3);
        assert_eq!(results[0].first_seen, 50);
        assert_eq!(results[0].last_seen, 150);
    }

    #[test]
    fn value_search_uses_inverse_index() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        db.commit_batch(vec![
            obs("a.com", "A", "1.2.3.4", "s1", 1, 10),
            obs("b.com", "A", "1.2.3.4", "s1", 1, 10),
            obs("c.com", "A", "5.6.7.8", "s1", 1, 10),
        ])
        .unwrap();

        assert_eq!(db.search(&by_value("1.2.3.4")).unwrap().len(), 2);

        let mut both = by_value("1.2.3.4");
        both.name = Some("a.com".to_string());
        let hits = db.search(&both).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "a.com");
    }

    #[test]
    fn forward_and_inverse_agree() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        let inputs: Vec<_> = (0..20)
            .map(|i| obs(&format!("n{}.com", i % 5), "A", &format!("10.0.0.{}", i % 3), "s1", 1, i))
            .collect();
        db.commit_batch(inputs).unwrap();

        let mut stored = Vec::new();
        db.for_each_observation(|o| {
            stored.push(o);
            Ok(())
        })
        .unwrap();
        assert_eq!(stored.len(), 15);
        for o in stored {
            assert!(db.search(&by_name(&o.name)).unwrap().contains(&o));
            assert!(db.search(&by_value(&o.value)).unwrap().contains(&o));
        }
    }

    #[test]
    fn search_without_predicate_is_invalid() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        let query = SearchQuery {
            rrtype: Some("A".to_string()),
            ..Default::default()
        };
        assert!(matches!(db.search(&query), Err(StoreError::InvalidQuery(_))));
    }

    #[test]
    fn sensor_and_type_filters_apply() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        db.commit_batch(vec![
            obs("a.com", "A", "1.1.1.1", "s1", 1, 1),
            obs("a.com", "A", "1.1.1.1", "s2", 1, 1),
            obs("a.com", "AAAA", "::1", "s1", 1, 1),
            // A sensor whose id extends another must not leak into a narrowed scan.
            obs("a.com", "A", "1.1.1.1", "s10", 1, 1),
        ])
        .unwrap();

        let mut query = by_name("a.com");
        query.sensor = Some("s1".to_string());
        assert_eq!(db.search(&query).unwrap().len(), 2);

        query.rrtype = Some("AAAA".to_string());
        let hits = db.search(&query).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, "::1");
    }

    #[test]
    fn limit_bounds_results() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        let inputs = (0..10)
            .map(|i| obs("wide.com", "A", &format!("10.0.0.{i}"), "s1", 1, 1))
            .collect();
        db.commit_batch(inputs).unwrap();

        let mut query = by_name("wide.com");
        query.limit = 3;
        assert_eq!(db.search(&query).unwrap().len(), 3);
        query.limit = 0;
        assert_eq!(db.search(&query).unwrap().len(), 10);
    }

    #[test]
    fn batch_skips_empty_type_and_invalid_fields() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        let report = db
            .commit_batch(vec![
                obs("ok.com", "A", "1.1.1.1", "s1", 1, 1),
                obs("notype.com", "", "1.1.1.1", "s1", 1, 1),
                obs("bad\x1fname", "A", "1.1.1.1", "s1", 1, 1),
            ])
            .unwrap();

        assert_eq!(
            report,
            BatchReport {
                committed: 1,
                skipped: 1,
                rejected: 1
            }
        );
        assert_eq!(db.total_count().unwrap(), 1);
    }

    #[test]
    fn empty_value_is_stored_as_placeholder() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        db.put(obs("empty.com", "TXT", "", "s1", 1, 1)).unwrap();

        let hits = db.search(&by_name("empty.com")).unwrap();
        assert_eq!(hits[0].value, crate::model::EMPTY_VALUE);
        assert_eq!(db.search(&by_value("")).unwrap().len(), 1);
    }

    #[test]
    fn permuted_batches_produce_identical_state() {
        let inputs = vec![
            InputObservation::new("p.com", "A", "1.1.1.1", "s1", 2, 30, 40),
            InputObservation::new("p.com", "A", "1.1.1.1", "s1", 1, 10, 20),
            InputObservation::new("q.com", "A", "1.1.1.1", "s1", 5, 1, 2),
            InputObservation::new("p.com", "A", "1.1.1.1", "s1", 3, 25, 50),
        ];
        let mut reversed = inputs.clone();
        reversed.reverse();

        let collect = |batch: Vec<InputObservation>| {
            let dir = tempdir().unwrap();
            let db = ObservationDb::open(dir.path()).unwrap();
            db.commit_batch(batch).unwrap();
            let mut out = Vec::new();
            db.for_each_observation(|o| {
                out.push(o);
                Ok(())
            })
            .unwrap();
            out
        };

        let left = collect(inputs);
        assert_eq!(left, collect(reversed));
        assert_eq!(left[0].count, 6);
        assert_eq!((left[0].first_seen, left[0].last_seen), (10, 50));
    }

    #[test]
    fn reopen_preserves_observations() {
        let dir = tempdir().unwrap();
        {
            let db = ObservationDb::open(dir.path()).unwrap();
            db.put(obs("keep.com", "A", "9.9.9.9", "s1", 4, 7)).unwrap();
        }
        let db = ObservationDb::open(dir.path()).unwrap();
        assert_eq!(db.total_count().unwrap(), 1);
        assert_eq!(db.search(&by_name("keep.com")).unwrap()[0].count, 4);
    }

    #[test]
    fn backup_and_dump() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path().join("db")).unwrap();
        db.put(obs("a.com", "A", "1.1.1.1", "s1", 1, 1)).unwrap();
        db.put(obs("b.com", "A", "1.1.1.1", "s1", 1, 1)).unwrap();

        let backup = dir.path().join("backup");
        db.backup(&backup).unwrap();
        let restored = ObservationDb::open(&backup).unwrap();
        assert_eq!(restored.total_count().unwrap(), 2);

        let dump = dir.path().join("dump.json");
        assert_eq!(db.dump(&dump).unwrap(), 2);
        let text = std::fs::read_to_string(&dump).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["rrname"], "a.com");
        assert_eq!(first["sensor_id"], "s1");
    }

    #[test]
    fn closed_db_rejects_operations() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path()).unwrap();
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.search(&by_name("x")), Err(StoreError::Closed)));
        assert!(matches!(
            db.put(obs("x", "A", "y", "s", 1, 1)),
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn feed_is_flushed_on_shutdown() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            PersistentStore::open_with_options(
                dir.path(),
                &StorageConfig::default(),
                BatchConfig {
                    capacity: 1000,
                    flush_interval: Duration::from_secs(3600),
                },
            )
            .unwrap(),
        );
        let (tx, rx) = mpsc::channel(16);
        let consumer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.consume_feed(rx).await })
        };

        for i in 0..5 {
            tx.send(obs("feed.com", "A", "1.2.3.4", "s1", 1, i)).await.unwrap();
        }
        let db = Arc::clone(store.db());
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.shutdown().await.unwrap();
        consumer.await.unwrap().unwrap();

        assert!(db.is_closed());
        assert!(matches!(
            store.search(&by_name("feed.com")).await,
            Err(StoreError::Closed)
        ));

        drop(db);
        drop(store);
        let reopened = ObservationDb::open(dir.path()).unwrap();
        let hits = reopened.search(&by_name("feed.com")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].count, 5);
        assert_eq!((hits[0].first_seen, hits[0].last_seen), (0, 4));
    }

    fn stored(db: &ObservationDb) -> Vec<Observation> {
        let mut out = Vec::new();
        db.for_each_observation(|o| {
            out.push(o);
            Ok(())
        })
        .unwrap();
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batched_feed_matches_individual_puts() {
        let inputs = vec![
            InputObservation::new("zero.com", "A", "1.1.1.1", "s1", 0, 5, 5),
            InputObservation::new("zero.com", "A", "1.1.1.1", "s1", 0, 10, 10),
            InputObservation::new("inv.com", "A", "2.2.2.2", "s1", 1, 50, 10),
            InputObservation::new("inv.com", "A", "2.2.2.2", "s1", 1, 20, 30),
            InputObservation::new("blank.com", "TXT", "", "s1", 1, 1, 1),
            InputObservation::new("blank.com", "TXT", "-", "s1", 2, 3, 3),
        ];

        let single_dir = tempdir().unwrap();
        let single = ObservationDb::open(single_dir.path()).unwrap();
        for input in inputs.clone() {
            single.put(input).unwrap();
        }

        let fed_dir = tempdir().unwrap();
        let store = PersistentStore::open_with_options(
            fed_dir.path(),
            &StorageConfig::default(),
            BatchConfig {
                capacity: 1000,
                flush_interval: Duration::from_secs(3600),
            },
        )
        .unwrap();
        let (tx, rx) = mpsc::channel(16);
        for input in inputs {
            tx.send(input).await.unwrap();
        }
        drop(tx);
        store.consume_feed(rx).await.unwrap();

        let fed = stored(store.db());
        assert_eq!(fed, stored(&single));
        let zero = fed.iter().find(|o| o.name == "zero.com").unwrap();
        assert_eq!(zero.count, 2);
        let inv = fed.iter().find(|o| o.name == "inv.com").unwrap();
        assert_eq!((inv.first_seen, inv.last_seen), (10, 50));
        let blank = fed.iter().find(|o| o.name == "blank.com").unwrap();
        assert_eq!(blank.count, 3);
    }

    #[test]
    fn dump_streams_every_entry() {
        let dir = tempdir().unwrap();
        let db = ObservationDb::open(dir.path().join("db")).unwrap();
        let inputs = (0..300)
            .map(|i| obs(&format!("n{i:03}.com"), "A", "10.0.0.1", "s1", 1, i))
            .collect();
        db.commit_batch(inputs).unwrap();

        let dump = dir.path().join("dump.json");
        assert_eq!(db.dump(&dump).unwrap(), 300);
        let text = std::fs::read_to_string(&dump).unwrap();
        let names: Vec<String> = text
            .lines()
            .map(|line| {
                let record: serde_json::Value = serde_json::from_str(line).unwrap();
                record["rrname"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(names.len(), 300);
        assert_eq!(names[0], "n000.com");
        assert_eq!(names[299], "n299.com");

        db.close().unwrap();
        assert!(matches!(db.dump(dir.path().join("again.json")), Err(StoreError::Closed)));
        assert!(!dir.path().join("again.json").exists());
    }

    #[tokio::test]
    async fn feed_after_shutdown_is_closed_and_unregistered() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        store.shutdown().await.unwrap();

        let (_tx, rx) = mpsc::channel(4);
        assert!(matches!(store.consume_feed(rx).await, Err(StoreError::Closed)));
        assert_eq!(*store.active_feeds.borrow(), 0);
    }
}

//! # Backend Module
//!
//! The uniform operation set shared by every storage variant: the local
//! RocksDB engine, the remote proxy, the tag-routed fan-out and the
//! in-memory store used for tests and ephemeral deployments.

use crate::config::DEFAULT_QUERY_LIMIT;
use crate::error::{Result, StoreError};
use crate::model::{Aggregate, InputObservation, Observation, ObservationKey, EMPTY_VALUE};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Search predicates. At least one of `name` or `value` must be set.
///
/// `None` means "no filter"; `Some("")` filters on the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub value: Option<String>,
    pub name: Option<String>,
    pub rrtype: Option<String>,
    pub sensor: Option<String>,
    /// Maximum number of results; 0 selects the default.
    pub limit: usize,
}

impl SearchQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_none() && self.value.is_none() {
            return Err(StoreError::InvalidQuery(
                "at least one of name or value must be given".to_string(),
            ));
        }
        Ok(())
    }

    /// Map an empty value filter onto the stored placeholder.
    pub fn normalized(&self) -> Self {
        let mut query = self.clone();
        if query.value.as_deref() == Some("") {
            query.value = Some(EMPTY_VALUE.to_string());
        }
        query
    }

    pub fn effective_limit(&self, default: usize) -> usize {
        if self.limit == 0 {
            default
        } else {
            self.limit
        }
    }

    /// Whether `key` satisfies every predicate that is set.
    pub fn matches(&self, key: &ObservationKey) -> bool {
        fn check(filter: &Option<String>, field: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == field)
        }
        check(&self.name, &key.name)
            && check(&self.value, &key.value)
            && check(&self.rrtype, &key.rrtype)
            && check(&self.sensor, &key.sensor)
    }
}

/// Storage capability implemented by every backend variant.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store one observation.
    async fn ingest(&self, observation: InputObservation) -> Result<()>;

    /// Drain `feed` until it closes or the backend shuts down.
    async fn consume_feed(&self, mut feed: mpsc::Receiver<InputObservation>) -> Result<()> {
        while let Some(observation) = feed.recv().await {
            if let Err(err) = self.ingest(observation).await {
                if matches!(err, StoreError::Closed) {
                    return Err(err);
                }
                warn!(error = %err, "dropping observation");
            }
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Observation>>;

    /// Number of distinct observations.
    async fn total_count(&self) -> Result<u64> {
        Err(StoreError::Unsupported("total_count"))
    }

    async fn backup(&self, path: &Path) -> Result<()>;

    async fn dump(&self, path: &Path) -> Result<()>;

    /// Stop accepting work, flush pending state and release resources.
    async fn shutdown(&self) -> Result<()>;

    /// Registry name of the variant.
    fn kind(&self) -> &'static str;
}

/// Start a consumer task draining a bounded feed into `backend`.
pub fn spawn_feed(
    backend: Arc<dyn Backend>,
    capacity: usize,
) -> (mpsc::Sender<InputObservation>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move { backend.consume_feed(rx).await });
    (tx, handle)
}

/// Resolves once stop is signalled. A dropped sender never resolves.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Write observations to `path` as JSON lines.
pub fn write_dump_lines<'a>(
    path: &Path,
    observations: impl Iterator<Item = &'a Observation>,
) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut written = 0u64;
    for observation in observations {
        write_dump_line(&mut writer, observation)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Append one observation as a JSON line.
pub fn write_dump_line<W: Write>(writer: &mut W, observation: &Observation) -> Result<()> {
    serde_json::to_writer(&mut *writer, &observation.to_dump_record())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// In-memory backend with the same merge and search semantics as the
/// RocksDB engine.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<ObservationKey, Aggregate>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> Vec<Observation> {
        self.entries
            .read()
            .iter()
            .map(|(key, aggregate)| Observation::from_parts(key.clone(), *aggregate))
            .collect()
    }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn ingest(&self, observation: InputObservation) -> Result<()> {
        self.ensure_open()?;
        let observation = observation.normalized();
        if observation.rrtype.is_empty() {
            debug!(name = %observation.name, "skipping observation without record type");
            return Ok(());
        }
        let key = observation.key();
        key.validate()?;
        let aggregate = Aggregate::from_input(&observation);
        self.entries
            .write()
            .entry(key)
            .and_modify(|existing| existing.merge(&aggregate))
            .or_insert(aggregate);
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Observation>> {
        self.ensure_open()?;
        query.validate()?;
        let query = query.normalized();
        let limit = query.effective_limit(DEFAULT_QUERY_LIMIT);
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| query.matches(key))
            .take(limit)
            .map(|(key, aggregate)| Observation::from_parts(key.clone(), *aggregate))
            .collect())
    }

    async fn total_count(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.entries.read().len() as u64)
    }

    async fn backup(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let snapshot = self.snapshot();
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer(file, &snapshot)?;
        Ok(())
    }

    async fn dump(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let snapshot = self.snapshot();
        write_dump_lines(path, snapshot.iter())?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(name: &str, value: &str, count: u32, t: i64) -> InputObservation {
        InputObservation::new(name, "A", value, "s1", count, t, t)
    }

    #[test]
    fn query_requires_primary_predicate() {
        let query = SearchQuery {
            sensor: Some("s1".to_string()),
            ..Default::default()
        };
        assert!(matches!(query.validate(), Err(StoreError::InvalidQuery(_))));
        assert!(SearchQuery::by_value("1.2.3.4").validate().is_ok());
    }

    #[test]
    fn empty_filter_differs_from_absent_filter() {
        let key = obs("a.com", "1.1.1.1", 1, 1).key();
        let mut query = SearchQuery::by_name("a.com");
        assert!(query.matches(&key));
        query.rrtype = Some(String::new());
        assert!(!query.matches(&key));
    }

    #[tokio::test]
    async fn memory_store_merges_and_searches() {
        let store = MemoryStore::new();
        store.ingest(obs("foo.bar", "12.34.56.78", 1, 10)).await.unwrap();
        store.ingest(obs("foo.bar", "12.34.56.78", 2, 5)).await.unwrap();
        store.ingest(obs("b.com", "12.34.56.78", 1, 7)).await.unwrap();

        let hits = store.search(&SearchQuery::by_name("foo.bar")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].count, 3);
        assert_eq!((hits[0].first_seen, hits[0].last_seen), (5, 10));

        let hits = store
            .search(&SearchQuery::by_value("12.34.56.78"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(store.total_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn memory_store_rejects_after_shutdown() {
        let store = MemoryStore::new();
        store.shutdown().await.unwrap();
        assert!(matches!(
            store.ingest(obs("a", "b", 1, 1)).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.search(&SearchQuery::by_name("a")).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn spawned_feed_drains_until_sender_dropped() {
        let store = Arc::new(MemoryStore::new());
        let (tx, handle) = spawn_feed(store.clone(), 8);
        for i in 0..10 {
            tx.send(obs("feed.com", "1.1.1.1", 1, i)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        let hits = store.search(&SearchQuery::by_name("feed.com")).await.unwrap();
        assert_eq!(hits[0].count, 10);
    }

    #[tokio::test]
    async fn dump_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.ingest(obs("a.com", "", 1, 1)).await.unwrap();
        let path = dir.path().join("dump.json");
        store.dump(&path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line["rdata"], "-");
        assert_eq!(line["count"], 1);
        assert_eq!(line["time_first"], 1);
    }
}

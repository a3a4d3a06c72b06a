//! # Fan-out Router
//!
//! Delivers every ingested observation to each configured target whose tag
//! set intersects the observation's tags. Observations without tags go to
//! the untagged targets only.

use crate::config::DEFAULT_QUERY_LIMIT;
use crate::error::{Result, StoreError};
use crate::model::{InputObservation, Observation};
use crate::store::{Backend, SearchQuery};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One routed backend.
pub struct Target {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub backend: Arc<dyn Backend>,
}

impl Target {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            backend,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts(&self, tags: &BTreeSet<String>) -> bool {
        if tags.is_empty() {
            self.tags.is_empty()
        } else {
            !self.tags.is_disjoint(tags)
        }
    }
}

pub struct FanoutBackend {
    targets: Vec<Target>,
    feed_capacity: usize,
}

impl FanoutBackend {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets,
            feed_capacity: crate::config::DEFAULT_FEED_CAPACITY,
        }
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Indices of the targets that should receive an observation tagged
    /// with `tags`.
    pub fn route(&self, tags: &BTreeSet<String>) -> Vec<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, target)| target.accepts(tags))
            .map(|(index, _)| index)
            .collect()
    }
}

#[async_trait]
impl Backend for FanoutBackend {
    async fn ingest(&self, observation: InputObservation) -> Result<()> {
        let routes = self.route(&observation.tags);
        if routes.is_empty() {
            debug!(name = %observation.name, "no target accepts observation");
            return Ok(());
        }
        let sends = routes
            .iter()
            .map(|&index| self.targets[index].backend.ingest(observation.clone()));
        let mut first_err = None;
        for (index, outcome) in routes.iter().zip(join_all(sends).await) {
            if let Err(err) = outcome {
                warn!(backend = %self.targets[*index].name, error = %err, "fan-out ingest failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn consume_feed(&self, mut feed: mpsc::Receiver<InputObservation>) -> Result<()> {
        let mut senders = Vec::with_capacity(self.targets.len());
        let mut consumers = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let (tx, rx) = mpsc::channel(self.feed_capacity);
            let backend = target.backend.clone();
            let name = target.name.clone();
            consumers.push(tokio::spawn(async move {
                if let Err(err) = backend.consume_feed(rx).await {
                    warn!(backend = %name, error = %err, "target feed stopped");
                }
            }));
            senders.push(tx);
        }

        while let Some(observation) = feed.recv().await {
            for index in self.route(&observation.tags) {
                if senders[index].send(observation.clone()).await.is_err() {
                    debug!(backend = %self.targets[index].name, "target feed closed");
                }
            }
        }

        drop(senders);
        for consumer in consumers {
            let _ = consumer.await;
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Observation>> {
        query.validate()?;
        let limit = query.effective_limit(DEFAULT_QUERY_LIMIT);
        let mut results = Vec::new();
        for target in &self.targets {
            let hits = target.backend.search(query).await?;
            results.extend(hits);
            if results.len() >= limit {
                break;
            }
        }
        results.truncate(limit);
        Ok(results)
    }

    async fn total_count(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut counted = false;
        for target in &self.targets {
            match target.backend.total_count().await {
                Ok(count) => {
                    total += count;
                    counted = true;
                }
                Err(StoreError::Unsupported(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if counted {
            Ok(total)
        } else {
            Err(StoreError::Unsupported("total_count"))
        }
    }

    /// Each target backs up into its own subdirectory of `path`.
    async fn backup(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        for target in &self.targets {
            target.backend.backup(&path.join(&target.name)).await?;
        }
        Ok(())
    }

    async fn dump(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        for target in &self.targets {
            target.backend.dump(&path.join(&target.name)).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let outcomes = join_all(self.targets.iter().map(|t| t.backend.shutdown())).await;
        let mut first_err = None;
        for (target, outcome) in self.targets.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(backend = %target.name, error = %err, "target shutdown failed");
                first_err.get_or_insert(err);
            }
        }
        info!(targets = self.targets.len(), "fan-out closed");
        first_err.map_or(Ok(()), Err)
    }

    fn kind(&self) -> &'static str {
        "fanout"
    }
}

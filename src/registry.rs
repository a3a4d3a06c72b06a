//! Backend registry: maps a configured `kind` to the constructor for that
//! variant. Built explicitly and handed to whoever wires up targets.

use crate::coalescer::BatchConfig;
use crate::config::{StoreConfig, TargetConfig};
use crate::error::{Result, StoreError};
use crate::fanout::{FanoutBackend, Target};
use crate::persistence::PersistentStore;
use crate::remote::{RemoteBackend, RemoteOptions};
use crate::store::{Backend, MemoryStore};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type BackendFactory =
    Arc<dyn Fn(TargetConfig, StoreConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, BackendFactory>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `rocksdb`, `memory` and `remote` variants.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("rocksdb", open_rocksdb);
        registry.register("memory", open_memory);
        registry.register("remote", connect_remote);
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(TargetConfig, StoreConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub async fn build(&self, target: &TargetConfig, config: &StoreConfig) -> Result<Arc<dyn Backend>> {
        let factory = self.factories.get(&target.kind).ok_or_else(|| {
            StoreError::Config(format!(
                "target `{}` has unknown kind `{}`",
                target.name, target.kind
            ))
        })?;
        let backend = factory(target.clone(), config.clone()).await?;
        info!(backend = %target.name, kind = %target.kind, "backend ready");
        Ok(backend)
    }

    /// Build every configured target and route between them by tag.
    pub async fn build_all(&self, config: &StoreConfig) -> Result<FanoutBackend> {
        if config.targets.is_empty() {
            return Err(StoreError::Config("no targets configured".to_string()));
        }
        let mut targets = Vec::with_capacity(config.targets.len());
        for target in &config.targets {
            let backend = self.build(target, config).await?;
            targets.push(Target::new(target.name.clone(), backend).with_tags(target.tags.iter().cloned()));
        }
        Ok(FanoutBackend::new(targets).with_feed_capacity(config.backend.feed_capacity))
    }
}

fn open_rocksdb(target: TargetConfig, config: StoreConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>> {
    async move {
        let path = target.db_path.ok_or_else(|| {
            StoreError::Config(format!("rocksdb target `{}` requires a db_path", target.name))
        })?;
        let batch = BatchConfig {
            capacity: config.backend.batch_size.max(1),
            flush_interval: Duration::from_millis(config.backend.flush_interval_ms),
        };
        let store = tokio::task::spawn_blocking(move || {
            PersistentStore::open_with_options(path, &config.storage, batch)
        })
        .await
        .map_err(|err| StoreError::Io(std::io::Error::other(err)))??;
        let backend: Arc<dyn Backend> = Arc::new(store);
        Ok(backend)
    }
    .boxed()
}

fn open_memory(_: TargetConfig, _: StoreConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>> {
    let backend: Arc<dyn Backend> = Arc::new(MemoryStore::new());
    futures::future::ready(Ok(backend)).boxed()
}

fn connect_remote(target: TargetConfig, _: StoreConfig) -> BoxFuture<'static, Result<Arc<dyn Backend>>> {
    async move {
        let host = target.host.clone().ok_or_else(|| {
            StoreError::Config(format!("remote target `{}` requires a host", target.name))
        })?;
        let remote = RemoteBackend::connect(host, RemoteOptions::from(&target)).await?;
        let backend: Arc<dyn Backend> = Arc::new(remote);
        Ok(backend)
    }
    .boxed()
}

//! # Remote Backend
//!
//! Proxies the backend operation set to a backend server over the wire
//! protocol. Ingest traffic uses one long-lived connection; queries borrow
//! a pooled connection (or dial a fresh one per call).
//!
//! When a write on the ingest connection fails, the connection is dropped
//! and a reconnect task retries with a fixed delay until it succeeds or the
//! backend stops. The observation whose write failed is not resent.

use crate::config::{TargetConfig, DEFAULT_CLIENT_WRITE_TIMEOUT_SECS, DEFAULT_RECONNECT_DELAY_SECS};
use crate::error::{Result, StoreError};
use crate::model::{InputObservation, Observation};
use crate::pool::{dial, ConnectionPool, PoolOptions};
use crate::protocol::{
    encode_backup, encode_dump, encode_input, encode_query, read_query_response, write_frame,
    FrameReader,
};
use crate::store::{wait_for_stop, Backend, SearchQuery};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Deadline for one write; a dead peer is detected no later than this.
    pub write_timeout: Duration,
    /// Longest stall inside a partially received response.
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Pool for query connections; `None` dials per query.
    pub pool: Option<PoolOptions>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(DEFAULT_CLIENT_WRITE_TIMEOUT_SECS),
            read_timeout: Some(Duration::from_secs(crate::config::DEFAULT_READ_TIMEOUT_SECS)),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
            pool: Some(PoolOptions::default()),
        }
    }
}

impl From<&TargetConfig> for RemoteOptions {
    fn from(target: &TargetConfig) -> Self {
        let pool = (target.pool_max > 0).then(|| PoolOptions {
            min_idle: target.pool_min,
            max_idle: target.pool_max,
            refill: target.refill,
            ..Default::default()
        });
        Self {
            write_timeout: Duration::from_secs(target.write_timeout_secs.max(1)),
            reconnect_delay: Duration::from_secs(target.reconnect_delay_secs),
            pool,
            ..Default::default()
        }
    }
}

pub struct RemoteBackend {
    host: String,
    options: RemoteOptions,
    ingest_conn: Mutex<Option<TcpStream>>,
    pool: Option<ConnectionPool>,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    reconnects: AtomicU64,
}

impl RemoteBackend {
    /// Dial the ingest connection and prepare the query pool. Fails if the
    /// host is unreachable right now.
    pub async fn connect(host: impl Into<String>, options: RemoteOptions) -> Result<Self> {
        let host = host.into();
        let ingest_conn = dial(&host, options.connect_timeout).await?;
        let pool = match &options.pool {
            Some(pool_options) => Some(ConnectionPool::connect(host.clone(), pool_options.clone()).await?),
            None => None,
        };
        let (stop, _) = watch::channel(false);
        info!(host = %host, pooled = pool.is_some(), "connected to remote backend");
        Ok(Self {
            host,
            options,
            ingest_conn: Mutex::new(Some(ingest_conn)),
            pool,
            closed: AtomicBool::new(false),
            stop,
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Completed reconnects of the ingest connection.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Write one ingest frame. On failure the connection is replaced before
    /// returning `ConnectionLost`; the frame itself is not retried.
    async fn send_ingest_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.ingest_conn.lock().await;
        let conn = match guard.take() {
            Some(conn) => conn,
            None => self.wait_for_reconnect().await?,
        };
        let conn = guard.insert(conn);

        match write_frame(conn, frame, Some(self.options.write_timeout)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(host = %self.host, error = %err, "sending observation failed; closing connection");
                guard.take();
                let fresh = self.wait_for_reconnect().await?;
                *guard = Some(fresh);
                Err(StoreError::ConnectionLost(err.to_string()))
            }
        }
    }

    /// Run a reconnect task and wait for it to deliver a connection. Returns
    /// `Closed` if the backend stops first.
    async fn wait_for_reconnect(&self) -> Result<TcpStream> {
        let (ack, connected) = oneshot::channel();
        let host = self.host.clone();
        let delay = self.options.reconnect_delay;
        let connect_timeout = self.options.connect_timeout;
        let mut task_stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut attempt = 0u64;
            loop {
                attempt += 1;
                warn!(host = %host, attempt, "reconnecting");
                match dial(&host, connect_timeout).await {
                    Ok(conn) => {
                        let _ = ack.send(conn);
                        return;
                    }
                    Err(err) => warn!(host = %host, attempt, error = %err, "reconnect failed"),
                }
                tokio::select! {
                    _ = wait_for_stop(&mut task_stop) => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        let mut stop = self.stop.subscribe();
        tokio::select! {
            conn = connected => {
                let conn = conn.map_err(|_| StoreError::Closed)?;
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(host = %self.host, "reconnected");
                Ok(conn)
            }
            _ = wait_for_stop(&mut stop) => Err(StoreError::Closed),
        }
    }

    async fn query_connection(&self) -> Result<TcpStream> {
        match &self.pool {
            Some(pool) => pool.get().await,
            None => dial(&self.host, self.options.connect_timeout).await,
        }
    }

    async fn exchange(&self, conn: &mut TcpStream, frame: &[u8]) -> Result<Vec<Observation>> {
        write_frame(conn, frame, Some(self.options.write_timeout)).await?;
        let mut reader = FrameReader::new(conn).with_read_timeout(self.options.read_timeout);
        read_query_response(&mut reader).await
    }

    /// Deliver a fire-and-forget request on a short-lived connection.
    async fn send_oneshot(&self, frame: &[u8]) -> Result<()> {
        let mut conn = dial(&self.host, self.options.connect_timeout).await?;
        write_frame(&mut conn, frame, Some(self.options.write_timeout)).await?;
        conn.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn ingest(&self, observation: InputObservation) -> Result<()> {
        self.ensure_open()?;
        let frame = encode_input(&observation)?;
        self.send_ingest_frame(&frame).await
    }

    async fn consume_feed(&self, mut feed: mpsc::Receiver<InputObservation>) -> Result<()> {
        self.ensure_open()?;
        let mut stop = self.stop.subscribe();
        loop {
            let observation = tokio::select! {
                _ = wait_for_stop(&mut stop) => {
                    info!(host = %self.host, "stop request received");
                    break;
                }
                item = feed.recv() => match item {
                    Some(observation) => observation,
                    None => break,
                },
            };
            let frame = match encode_input(&observation) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "encoding observation failed");
                    continue;
                }
            };
            match self.send_ingest_frame(&frame).await {
                Ok(()) => {}
                Err(StoreError::Closed) => break,
                Err(err) => {
                    warn!(host = %self.host, name = %observation.name, error = %err, "observation lost in flight");
                }
            }
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Observation>> {
        self.ensure_open()?;
        query.validate()?;
        let frame = encode_query(query)?;
        let mut conn = self.query_connection().await?;
        let outcome = self.exchange(&mut conn, &frame).await;
        match (&outcome, &self.pool) {
            (Err(err), _) if err.is_connection_fault() => {
                debug!(host = %self.host, error = %err, "query failed; dropping connection");
            }
            // An error-response still leaves the connection at a message boundary.
            (_, Some(pool)) => pool.release(conn).await,
            _ => {}
        }
        outcome
    }

    async fn total_count(&self) -> Result<u64> {
        Err(StoreError::Unsupported("total_count is not available over the wire"))
    }

    async fn backup(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let frame = encode_backup(&path.to_string_lossy())?;
        self.send_oneshot(&frame).await
    }

    async fn dump(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let frame = encode_dump(&path.to_string_lossy())?;
        self.send_oneshot(&frame).await
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop.send_replace(true);
        if let Some(mut conn) = self.ingest_conn.lock().await.take() {
            let _ = conn.shutdown().await;
        }
        if let Some(pool) = &self.pool {
            pool.teardown();
        }
        info!(host = %self.host, "remote backend closed");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn target_settings_map_onto_options() {
        let target = TargetConfig {
            name: "edge".to_string(),
            kind: "remote".to_string(),
            host: Some("10.0.0.1:4242".to_string()),
            pool_min: 2,
            pool_max: 4,
            refill: true,
            reconnect_delay_secs: 3,
            ..Default::default()
        };
        let options = RemoteOptions::from(&target);
        assert_eq!(options.reconnect_delay, Duration::from_secs(3));
        let pool = options.pool.expect("pool enabled");
        assert_eq!((pool.min_idle, pool.max_idle, pool.refill), (2, 4, true));

        let unpooled = RemoteOptions::from(&TargetConfig {
            pool_max: 0,
            ..target
        });
        assert!(unpooled.pool.is_none());
    }

    #[tokio::test]
    async fn connect_fails_without_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = RemoteBackend::connect(addr, RemoteOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let options = RemoteOptions {
            pool: None,
            ..Default::default()
        };
        let remote = RemoteBackend::connect(addr, options).await.unwrap();
        let _server_side = accept.await.unwrap();
        remote.shutdown().await.unwrap();

        let observation = InputObservation::new("a.com", "A", "1.1.1.1", "s1", 1, 1, 1);
        assert!(matches!(remote.ingest(observation).await, Err(StoreError::Closed)));
        assert!(matches!(
            remote.backup(Path::new("/tmp/none")).await,
            Err(StoreError::Closed)
        ));
        assert_eq!(remote.kind(), "remote");
    }
}

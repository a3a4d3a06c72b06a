//! # Query Connection Pool
//!
//! Idle connections to one backend host kept in a bounded lock-free queue.
//! `get` never blocks: an empty pool dials a fresh connection.

use crate::error::{Result, StoreError};
use crossbeam_queue::ArrayQueue;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Low-water mark restored by [`ConnectionPool::refill`].
    pub min_idle: usize,
    /// Capacity of the idle queue; 0 disables pooling.
    pub max_idle: usize,
    /// Discard connections after use and top the pool back up instead of
    /// returning them.
    pub refill: bool,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_idle: crate::config::DEFAULT_POOL_MIN,
            max_idle: crate::config::DEFAULT_POOL_MAX,
            refill: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub dialed: u64,
    pub reused: u64,
    pub discarded: u64,
    pub idle: usize,
}

pub struct ConnectionPool {
    host: String,
    idle: ArrayQueue<TcpStream>,
    options: PoolOptions,
    closed: AtomicBool,
    dialed: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool and pre-dial `min_idle` connections.
    pub async fn connect(host: impl Into<String>, options: PoolOptions) -> Result<Self> {
        if options.min_idle > options.max_idle {
            return Err(StoreError::Config(
                "pool min_idle exceeds max_idle".to_string(),
            ));
        }
        let pool = Self {
            host: host.into(),
            idle: ArrayQueue::new(options.max_idle.max(1)),
            options,
            closed: AtomicBool::new(false),
            dialed: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        };
        for _ in 0..pool.options.min_idle {
            let conn = pool.dial().await?;
            pool.put(conn);
        }
        Ok(pool)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Pop a live idle connection or dial a new one.
    pub async fn get(&self) -> Result<TcpStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        while let Some(conn) = self.idle.pop() {
            if is_alive(&conn) {
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(host = %self.host, "discarding dead pooled connection");
        }
        self.dial().await
    }

    /// Return a connection. Dropped if the pool is full, disabled or torn
    /// down.
    pub fn put(&self, conn: TcpStream) {
        if self.closed.load(Ordering::Acquire) || self.options.max_idle == 0 {
            return;
        }
        if self.idle.push(conn).is_err() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Hand a connection back after a successful exchange, following the
    /// configured refill or put-back policy.
    pub async fn release(&self, conn: TcpStream) {
        if self.options.refill {
            drop(conn);
            self.refill().await;
        } else {
            self.put(conn);
        }
    }

    /// Dial until the idle count reaches the low-water mark. Stops at the
    /// first failed dial.
    pub async fn refill(&self) {
        while !self.closed.load(Ordering::Acquire) && self.idle.len() < self.options.min_idle {
            match self.dial().await {
                Ok(conn) => self.put(conn),
                Err(err) => {
                    warn!(host = %self.host, error = %err, "pool refill failed");
                    return;
                }
            }
        }
    }

    /// Close every idle connection and refuse further use.
    pub fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        while self.idle.pop().is_some() {}
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dialed: self.dialed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle: self.idle.len(),
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let conn = dial(&self.host, self.options.connect_timeout).await?;
        self.dialed.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Open a TCP connection with a deadline.
pub async fn dial(host: &str, timeout: Duration) -> Result<TcpStream> {
    let conn = tokio::time::timeout(timeout, TcpStream::connect(host))
        .await
        .map_err(|_| StoreError::ConnectionLost(format!("connect to {host} timed out")))??;
    conn.set_nodelay(true)?;
    Ok(conn)
}

/// An idle connection is usable if a non-blocking read would block. EOF,
/// errors or unsolicited bytes all disqualify it.
fn is_alive(conn: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match conn.try_read(&mut probe) {
        Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        Ok(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn get_dials_when_empty_and_put_reuses() {
        let (listener, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..2 {
                held.push(listener.accept().await.unwrap().0);
            }
            held
        });

        let pool = ConnectionPool::connect(addr, PoolOptions::default())
            .await
            .unwrap();
        let conn = pool.get().await.unwrap();
        assert_eq!(pool.stats().dialed, 1);
        pool.put(conn);
        assert_eq!(pool.idle(), 1);

        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.stats().reused, 1);
        let _second = pool.get().await.unwrap();
        assert_eq!(pool.stats().dialed, 2);
        let _held = accept.await.unwrap();
    }

    #[tokio::test]
    async fn dead_connections_are_skipped() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::connect(
            addr,
            PoolOptions {
                min_idle: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let _conn = pool.get().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.dialed, 2);
        let _held = accept.await.unwrap();
    }

    #[tokio::test]
    async fn refill_policy_discards_and_tops_up() {
        let (listener, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..3 {
                held.push(listener.accept().await.unwrap().0);
            }
            held
        });
        let pool = ConnectionPool::connect(
            addr,
            PoolOptions {
                min_idle: 2,
                max_idle: 4,
                refill: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(pool.idle(), 2);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.idle(), 1);
        pool.release(conn).await;
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.stats().dialed, 3);
        let _held = accept.await.unwrap();
    }

    #[tokio::test]
    async fn teardown_rejects_further_use() {
        let (_listener, addr) = listener().await;
        let pool = ConnectionPool::connect(addr, PoolOptions::default())
            .await
            .unwrap();
        pool.teardown();
        assert!(matches!(pool.get().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn invalid_bounds_rejected() {
        let result = ConnectionPool::connect(
            "127.0.0.1:1",
            PoolOptions {
                min_idle: 3,
                max_idle: 1,
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}

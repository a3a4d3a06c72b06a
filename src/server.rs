//! # Backend Server
//!
//! Accepts TCP connections and serves the wire protocol against one
//! [`Backend`]. Ingest requests from every connection are funnelled into a
//! single bounded feed drained by one consumer task, so the storage write
//! path has exactly one owner. Queries are answered inline, per connection.

use crate::config::{
    BackendConfig, DEFAULT_FEED_CAPACITY, DEFAULT_MAX_CONNECTIONS, DEFAULT_QUERY_LIMIT,
    DEFAULT_READ_TIMEOUT_SECS, DEFAULT_STREAM_RESPONSES, DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::error::{Result, StoreError};
use crate::model::{InputObservation, Observation};
use crate::protocol::{
    encode_empty, encode_error, encode_query_response, encode_stream_data, write_frame,
    FrameReader, MessageType, Request,
};
use crate::store::{wait_for_stop, Backend, SearchQuery};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

/// Streamed responses are written in chunks of roughly this size.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Longest stall allowed inside a partially received message.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_connections: usize,
    pub stream_responses: bool,
    /// Limit applied to queries that carry none.
    pub default_limit: usize,
    pub feed_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)),
            write_timeout: Some(Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            stream_responses: DEFAULT_STREAM_RESPONSES,
            default_limit: DEFAULT_QUERY_LIMIT,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl From<&BackendConfig> for ServerOptions {
    fn from(config: &BackendConfig) -> Self {
        fn secs(value: u64) -> Option<Duration> {
            (value > 0).then(|| Duration::from_secs(value))
        }
        Self {
            read_timeout: secs(config.read_timeout_secs),
            write_timeout: secs(config.write_timeout_secs),
            max_connections: config.max_connections.max(1),
            stream_responses: config.stream_responses,
            default_limit: config.default_limit,
            feed_capacity: config.feed_capacity.max(1),
        }
    }
}

pub struct BackendServer {
    backend: Arc<dyn Backend>,
    options: ServerOptions,
}

/// A server running on a background task.
pub struct ServerHandle {
    pub addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Signal stop and wait for the server and its backend to wind down.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.send_replace(true);
        self.task
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))?
    }
}

impl BackendServer {
    pub fn new(backend: Arc<dyn Backend>, options: ServerOptions) -> Self {
        Self { backend, options }
    }

    /// Serve on `listener` from a background task.
    pub fn spawn(self, listener: TcpListener) -> Result<ServerHandle> {
        let addr = listener.local_addr()?;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.serve(listener, stop_rx));
        Ok(ServerHandle { addr, stop, task })
    }

    /// Accept connections until `stop` turns true, then drain connections,
    /// let the ingest consumer flush and shut the backend down.
    pub async fn serve(self, listener: TcpListener, mut stop: watch::Receiver<bool>) -> Result<()> {
        let addr = listener.local_addr()?;
        let (feed, feed_rx) = mpsc::channel::<InputObservation>(self.options.feed_capacity);
        let consumer = {
            let backend = Arc::clone(&self.backend);
            tokio::spawn(async move { backend.consume_feed(feed_rx).await })
        };
        let permits = Arc::new(Semaphore::new(self.options.max_connections));
        let mut connections = JoinSet::new();
        info!(addr = %addr, backend = self.backend.kind(), "backend server listening");

        loop {
            let permit = tokio::select! {
                _ = wait_for_stop(&mut stop) => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "connection task failed");
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (socket, peer) = tokio::select! {
                _ = wait_for_stop(&mut stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            let connection = Connection {
                backend: Arc::clone(&self.backend),
                feed: feed.clone(),
                options: self.options.clone(),
                stop: stop.clone(),
            };
            connections.spawn(async move {
                let _permit = permit;
                connection.run(socket, peer).await;
            });
        }

        info!(addr = %addr, "backend server stopping");
        drop(listener);
        while let Some(joined) = connections.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "connection task failed");
            }
        }
        drop(feed);
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "ingest consumer ended with error"),
            Err(err) => warn!(error = %err, "ingest consumer task failed"),
        }
        self.backend.shutdown().await
    }
}

struct Connection {
    backend: Arc<dyn Backend>,
    feed: mpsc::Sender<InputObservation>,
    options: ServerOptions,
    stop: watch::Receiver<bool>,
}

impl Connection {
    #[instrument(name = "connection", skip_all, fields(peer = %peer))]
    async fn run(mut self, socket: TcpStream, peer: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let (read_half, mut writer) = socket.into_split();
        let mut reader = FrameReader::new(read_half).with_read_timeout(self.options.read_timeout);
        debug!("connection opened");

        loop {
            let message = tokio::select! {
                _ = wait_for_stop(&mut self.stop) => break,
                message = reader.read_message() => message,
            };
            let message = match message {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("peer closed connection");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "dropping connection");
                    break;
                }
            };
            let request = match Request::from_message(&message) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, kind = message.kind, "undecodable request");
                    break;
                }
            };
            if let Err(err) = self.dispatch(request, &mut writer).await {
                warn!(error = %err, "dropping connection");
                break;
            }
        }
        debug!("connection closed");
    }

    async fn dispatch(&self, request: Request, writer: &mut OwnedWriteHalf) -> Result<()> {
        match request {
            Request::Input(observation) => self
                .feed
                .send(observation)
                .await
                .map_err(|_| StoreError::Closed),
            Request::Query(mut query) => {
                if query.limit == 0 {
                    query.limit = self.options.default_limit;
                }
                self.answer_query(&query, writer).await
            }
            Request::Backup(path) => {
                match self.backend.backup(&path).await {
                    Ok(()) => info!(path = %path.display(), "backup complete"),
                    Err(err) => warn!(path = %path.display(), error = %err, "backup failed"),
                }
                Ok(())
            }
            Request::Dump(path) => {
                match self.backend.dump(&path).await {
                    Ok(()) => info!(path = %path.display(), "dump complete"),
                    Err(err) => warn!(path = %path.display(), error = %err, "dump failed"),
                }
                Ok(())
            }
        }
    }

    async fn answer_query(&self, query: &SearchQuery, writer: &mut OwnedWriteHalf) -> Result<()> {
        match self.backend.search(query).await {
            Ok(results) => {
                debug!(hits = results.len(), "query answered");
                self.write_results(results, writer).await
            }
            Err(err) => {
                debug!(error = %err, "query failed");
                let frame = encode_error(err.to_string())?;
                write_frame(writer, &frame, self.options.write_timeout).await
            }
        }
    }

    async fn write_results(
        &self,
        results: Vec<Observation>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let timeout = self.options.write_timeout;
        if !self.options.stream_responses {
            let frame = encode_query_response(results)?;
            return write_frame(writer, &frame, timeout).await;
        }

        let mut out = encode_empty(MessageType::QueryStreamStart)?;
        for observation in &results {
            out.extend(encode_stream_data(observation)?);
            if out.len() >= STREAM_CHUNK_BYTES {
                write_frame(writer, &out, timeout).await?;
                out.clear();
            }
        }
        out.extend(encode_empty(MessageType::QueryStreamEnd)?);
        write_frame(writer, &out, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_input, encode_query, read_query_response};
    use crate::store::MemoryStore;
    use tokio::io::AsyncWriteExt;

    async fn start(options: ServerOptions) -> (Arc<MemoryStore>, ServerHandle) {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = BackendServer::new(store.clone(), options)
            .spawn(listener)
            .unwrap();
        (store, handle)
    }

    async fn wait_for_count(store: &MemoryStore, expected: usize) {
        for _ in 0..100 {
            if store.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("store never reached {expected} entries");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingest_then_query_over_tcp() {
        for stream_responses in [true, false] {
            let (store, handle) = start(ServerOptions {
                stream_responses,
                ..Default::default()
            })
            .await;
            let socket = TcpStream::connect(handle.addr).await.unwrap();
            let (read_half, mut write_half) = socket.into_split();

            for count in [1, 2] {
                let obs = InputObservation::new("foo.bar", "A", "12.34.56.78", "s1", count, 10, 10);
                write_half.write_all(&encode_input(&obs).unwrap()).await.unwrap();
            }
            for _ in 0..100 {
                let hits = store.search(&SearchQuery::by_name("foo.bar")).await.unwrap();
                if hits.first().map(|o| o.count) == Some(3) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            write_half
                .write_all(&encode_query(&SearchQuery::by_name("foo.bar")).unwrap())
                .await
                .unwrap();
            let mut reader = FrameReader::new(read_half);
            let results = read_query_response(&mut reader).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].count, 3);

            handle.shutdown().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_query_yields_error_response() {
        let (_store, handle) = start(ServerOptions::default()).await;
        let socket = TcpStream::connect(handle.addr).await.unwrap();
        let (read_half, mut write_half) = socket.into_split();

        let query = SearchQuery {
            rrtype: Some("A".to_string()),
            ..Default::default()
        };
        write_half.write_all(&encode_query(&query).unwrap()).await.unwrap();
        let mut reader = FrameReader::new(read_half);
        let err = read_query_response(&mut reader).await.unwrap_err();
        assert!(matches!(err, StoreError::Remote(ref m) if m.contains("invalid query")));

        // The connection survives an error response.
        write_half
            .write_all(&encode_query(&SearchQuery::by_name("none")).unwrap())
            .await
            .unwrap();
        assert!(read_query_response(&mut reader).await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_closes_only_the_offending_connection() {
        let (store, handle) = start(ServerOptions::default()).await;

        let mut bad = TcpStream::connect(handle.addr).await.unwrap();
        let good = TcpStream::connect(handle.addr).await.unwrap();
        bad.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read(&mut bad, &mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        let (read_half, mut write_half) = good.into_split();
        let obs = InputObservation::new("ok.com", "A", "1.1.1.1", "s1", 1, 1, 1);
        write_half.write_all(&encode_input(&obs).unwrap()).await.unwrap();
        wait_for_count(&store, 1).await;
        write_half
            .write_all(&encode_query(&SearchQuery::by_value("1.1.1.1")).unwrap())
            .await
            .unwrap();
        let results = read_query_response(&mut FrameReader::new(read_half)).await.unwrap();
        assert_eq!(results.len(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_closes_backend() {
        let (store, handle) = start(ServerOptions::default()).await;
        handle.shutdown().await.unwrap();
        assert!(matches!(
            store.search(&SearchQuery::by_name("x")).await,
            Err(StoreError::Closed)
        ));
    }
}

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pdnstore_rs::pool::PoolOptions;
use pdnstore_rs::{Backend, BackendServer, InputObservation, RemoteOptions, ServerHandle, ServerOptions};
use tokio::net::TcpListener;

#[allow(dead_code)]
pub async fn spawn_backend(backend: Arc<dyn Backend>) -> anyhow::Result<ServerHandle> {
    spawn_backend_on("127.0.0.1:0".parse()?, backend, ServerOptions::default()).await
}

#[allow(dead_code)]
pub async fn spawn_backend_on(
    addr: SocketAddr,
    backend: Arc<dyn Backend>,
    options: ServerOptions,
) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    Ok(BackendServer::new(backend, options).spawn(listener)?)
}

/// Client options tuned for tests: short reconnect delay and deadlines.
#[allow(dead_code)]
pub fn fast_options(pool: Option<PoolOptions>) -> RemoteOptions {
    RemoteOptions {
        write_timeout: Duration::from_secs(2),
        read_timeout: Some(Duration::from_secs(5)),
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(100),
        pool,
    }
}

#[allow(dead_code)]
pub fn observation(name: &str, value: &str, count: u32, time: i64) -> InputObservation {
    InputObservation::new(name, "A", value, "s1", count, time, time)
}

/// Poll `check` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

use std::sync::Arc;
use std::time::Duration;

use pdnstore_rs::server::ServerOptions;
use pdnstore_rs::store::spawn_feed;
use pdnstore_rs::{Backend, MemoryStore, RemoteBackend, SearchQuery, StoreError};

mod support;

use support::{eventually, fast_options, observation, spawn_backend, spawn_backend_on};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_resumes_after_backend_restart() -> anyhow::Result<()> {
    let first = Arc::new(MemoryStore::new());
    let server = spawn_backend(first.clone()).await?;
    let addr = server.addr;

    let remote = Arc::new(RemoteBackend::connect(addr.to_string(), fast_options(None)).await?);
    for i in 0..5 {
        remote.ingest(observation(&format!("before{i}.com"), "1.1.1.1", 1, i)).await?;
    }
    eventually(Duration::from_secs(5), || {
        let first = first.clone();
        async move { Ok(first.len() == 5) }
    })
    .await?;

    server.shutdown().await?;

    let second = Arc::new(MemoryStore::new());
    let restart = {
        let second = second.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            spawn_backend_on(addr, second, ServerOptions::default()).await
        })
    };

    // Writes racing the outage may be lost; later ones must arrive.
    let mut sent = 0;
    let delivered = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let _ = remote
                .ingest(observation(&format!("after{sent}.com"), "2.2.2.2", 1, sent))
                .await;
            sent += 1;
            if !second.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "no observation reached the restarted backend");
    assert!(remote.reconnects() >= 1);

    let hits = second.search(&SearchQuery::by_value("2.2.2.2")).await?;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|o| o.name.starts_with("after")));

    remote.shutdown().await?;
    restart.await??.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_a_pending_reconnect() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_backend(store.clone()).await?;
    let remote = Arc::new(RemoteBackend::connect(server.addr.to_string(), fast_options(None)).await?);
    server.shutdown().await?;

    let (feed, consumer) = spawn_feed(remote.clone(), 8);
    for i in 0..4 {
        feed.send(observation(&format!("lost{i}.com"), "3.3.3.3", 1, i)).await?;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    remote.shutdown().await?;
    tokio::time::timeout(Duration::from_secs(5), consumer).await???;

    assert!(matches!(
        remote.ingest(observation("late.com", "3.3.3.3", 1, 1)).await,
        Err(StoreError::Closed)
    ));
    drop(feed);
    Ok(())
}

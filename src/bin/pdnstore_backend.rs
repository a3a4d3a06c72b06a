use std::sync::Arc;
use std::time::Duration;

use pdnstore_rs::coalescer::BatchConfig;
use pdnstore_rs::config::{BackendOverrides, ConfigOverrides, StoreConfig};
use pdnstore_rs::{Backend, BackendServer, MemoryStore, PersistentStore, Registry, ServerOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    println!(
        r#"pdnstore backend server

USAGE:
    pdnstore_backend [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Config file (TOML); also read from PDNSTORE_CONFIG
    -l, --listen <ADDR>     Listen address [default: 127.0.0.1:4242]
    -d, --data-dir <PATH>   RocksDB data directory; in-memory store if unset
        --bundle            Answer queries with one bundled response
    -h, --help              Print help

ENVIRONMENT:
    PDNSTORE_BACKEND__LISTEN, PDNSTORE_BACKEND__DATA_DIR, ...
    RUST_LOG                Log filter [default: info]"#
    );
}

async fn open_backend(config: &StoreConfig) -> anyhow::Result<Arc<dyn Backend>> {
    if let Some(dir) = config.backend.data_dir.clone() {
        let storage = config.storage.clone();
        let batch = BatchConfig {
            capacity: config.backend.batch_size,
            flush_interval: Duration::from_millis(config.backend.flush_interval_ms),
        };
        let store = tokio::task::spawn_blocking(move || {
            PersistentStore::open_with_options(dir, &storage, batch)
        })
        .await??;
        return Ok(Arc::new(store));
    }
    if !config.targets.is_empty() {
        let fanout = Registry::with_defaults().build_all(config).await?;
        return Ok(Arc::new(fanout));
    }
    tracing::warn!("no data_dir configured; observations are kept in memory only");
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut overrides = ConfigOverrides::default();
    let mut backend_overrides = BackendOverrides::default();

    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        backend_overrides.listen = Some(listen.parse()?);
    }
    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        backend_overrides.data_dir = Some(dir.into());
    }
    if has_flag("--bundle") {
        backend_overrides.stream_responses = Some(false);
    }
    if backend_overrides.listen.is_some()
        || backend_overrides.data_dir.is_some()
        || backend_overrides.stream_responses.is_some()
    {
        overrides.backend = Some(backend_overrides);
    }

    // CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("PDNSTORE_CONFIG").ok());
    let config = StoreConfig::load(config_path.as_deref(), overrides)?;

    let backend = open_backend(&config).await?;
    let listener = TcpListener::bind(config.backend.listen).await?;
    let server = BackendServer::new(backend, ServerOptions::from(&config.backend));

    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            stop.send_replace(true);
        }
    });

    server.serve(listener, stop_rx).await?;
    Ok(())
}

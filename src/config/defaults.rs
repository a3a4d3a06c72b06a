//! Default constants for pdnstore configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default backend listen address
pub const DEFAULT_BACKEND_ADDR: &str = "127.0.0.1:4242";

/// Maximum concurrent client connections served by one backend.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Per-message read deadline on the server side (seconds).
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Write deadline on the server side (seconds).
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;

/// Write deadline on the client ingest connection (seconds).
/// A dead peer is detected at the latest after this long.
pub const DEFAULT_CLIENT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Fixed delay between reconnect attempts (seconds).
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 10;

/// Upper bound on one encoded wire message (bytes).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

// =============================================================================
// Query Defaults
// =============================================================================

/// Result limit applied when a query carries a non-positive limit.
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

/// Whether query responses are streamed instead of bundled.
pub const DEFAULT_STREAM_RESPONSES: bool = true;

// =============================================================================
// Ingest Defaults
// =============================================================================

/// Raw observations per dedup window.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Longest time a buffered observation waits for its batch (milliseconds).
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

/// Capacity of the bounded feed between connection handlers and the
/// ingest consumer.
pub const DEFAULT_FEED_CAPACITY: usize = 10_000;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default write buffer size in MB
pub const DEFAULT_WRITE_BUFFER_MB: usize = 64;

/// Default number of background compaction jobs
pub const DEFAULT_BACKGROUND_JOBS: usize = 4;

/// LZ4 compression on by default.
pub const DEFAULT_COMPRESSION: bool = true;

// =============================================================================
// Pool Defaults
// =============================================================================

/// Idle query connections kept ready per remote target.
pub const DEFAULT_POOL_MIN: usize = 0;

/// Maximum idle query connections per remote target.
pub const DEFAULT_POOL_MAX: usize = 8;

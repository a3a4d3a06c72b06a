//! # pdnstore
//!
//! A passive DNS observation store. Sightings of a name resolving to a
//! value, reported by sensors, are merged into one aggregated record per
//! `(sensor, name, rrtype, value)` and indexed name-first and value-first.
//!
//! The same [`Backend`] operation set is served by the local RocksDB engine
//! ([`PersistentStore`]), an in-memory store, a remote proxy speaking the
//! msgpack wire protocol ([`RemoteBackend`]) and a tag-routed fan-out over
//! several of those ([`FanoutBackend`]).

pub mod coalescer;
pub mod config;
pub mod error;
pub mod fanout;
pub mod model;
pub mod persistence;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod server;
pub mod store;

#[doc(hidden)]
pub mod test_support;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use fanout::{FanoutBackend, Target};
pub use model::{InputObservation, Observation, ObservationKey};
pub use persistence::{ObservationDb, PersistentStore};
pub use registry::Registry;
pub use remote::{RemoteBackend, RemoteOptions};
pub use server::{BackendServer, ServerHandle, ServerOptions};
pub use store::{Backend, MemoryStore, SearchQuery};

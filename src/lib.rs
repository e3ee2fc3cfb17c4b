//! # Object Stash
//!
//! Shared-object caching for read-heavy services:
//! - **Deduplication pools** that keep one canonical instance per distinct value
//! - **Two-tier compressed caching**: recently used values inflated, older ones
//!   as compressed bytes
//! - **Single-flight builds**: concurrent misses on one key run the factory once
//! - **Deferred reclamation**: replaced values stay readable until every
//!   transaction that could see them has ended
//!
//! ## Quick Start
//!
//! ```rust
//! use object_stash::{BoxError, CacheBuilder, Created, EpochReclaimer, ValueFactory};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! // Builds a fare table for a route and stores it as UTF-8 text when cold.
//! struct FareTables;
//!
//! impl ValueFactory<String, String> for FareTables {
//!     fn create(&self, route: &String) -> Result<Created<String>, BoxError> {
//!         Ok(Created::new(format!("fares for {route}")))
//!     }
//!
//!     fn compress(&self, table: &String) -> Result<Option<Bytes>, BoxError> {
//!         Ok(Some(Bytes::copy_from_slice(table.as_bytes())))
//!     }
//!
//!     fn uncompress(&self, blob: &[u8]) -> Result<String, BoxError> {
//!         Ok(String::from_utf8(blob.to_vec())?)
//!     }
//! }
//!
//! let reclaimer = Arc::new(EpochReclaimer::new());
//! let cache = CacheBuilder::new(128).total_capacity(1024).build(FareTables, Arc::clone(&reclaimer));
//!
//! // References handed out by the cache live as long as the transaction.
//! let txn = reclaimer.begin_transaction();
//! let table = cache.get(&txn, &String::from("YUL-NRT")).unwrap();
//! assert_eq!(table, "fares for YUL-NRT");
//!
//! // Replacing the entry retires the old table; it stays valid until `txn` ends.
//! cache.put(String::from("YUL-NRT"), String::from("revised fares"));
//! assert_eq!(table, "fares for YUL-NRT");
//! txn.end();
//! ```
//!
//! ## Deduplication
//!
//! ```rust
//! use object_stash::PoolRegistry;
//!
//! let registry = PoolRegistry::new();
//! let a = registry.share(String::from("fare rule 42"));
//! let b = registry.share(String::from("fare rule 42"));
//!
//! assert!(object_stash::Shared::ptr_eq(&a, &b));
//! assert_eq!(registry.pool::<String>().len(), 1);
//! ```
//!
//! ## Async Usage
//!
//! The cache blocks while a build is in flight, so call it from blocking
//! tasks and hold owned copies across await points:
//!
//! ```rust,ignore
//! async fn fares(cache: Arc<FareCache>, route: String) -> Result<String> {
//!     tokio::task::spawn_blocking(move || cache.get_clone(&route)).await?
//! }
//! ```

mod builder;
mod cache;
mod codec;
mod error;
mod factory;
mod header;
#[cfg(feature = "metrics")]
mod metrics;
mod pool;
mod recency;
mod reclaim;
mod registry;
mod retire;
mod shared;

pub use builder::{CacheBuilder, CacheConfig, DEFAULT_HOT_CAPACITY, DEFAULT_RETIRE_BATCH};
pub use cache::CompressedCache;
pub use codec::{Codec, CodecFactory, Lz4Codec, NoopCodec};
pub use deepsize::DeepSizeOf;
pub use error::{BoxError, Error, Result};
pub use factory::{Created, ValueFactory};
pub use header::{HEADER_LEN, RemoteStatus, ResponseHeader};
#[cfg(feature = "metrics")]
pub use metrics::CacheMetrics;
pub use pool::{DedupPool, PoolStats, PoolSummary};
pub use reclaim::{EpochReclaimer, Garbage, Transaction, TxnId};
pub use registry::PoolRegistry;
pub use shared::Shared;

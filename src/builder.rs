use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CompressedCache;
use crate::factory::ValueFactory;
use crate::reclaim::EpochReclaimer;

/// Default number of inflated entries.
pub const DEFAULT_HOT_CAPACITY: usize = 1024;

/// Default number of retired values a cache collects before handing them to
/// the reclaimer.
pub const DEFAULT_RETIRE_BATCH: usize = 100;

/// Builder for configuring a [`CompressedCache`].
///
/// # Example
///
/// ```ignore
/// use object_stash::{CacheBuilder, EpochReclaimer};
/// use std::sync::Arc;
///
/// let reclaimer = Arc::new(EpochReclaimer::new());
/// let cache = CacheBuilder::new(256)
///     .total_capacity(4096) // keep at most 4096 entries overall
///     .retire_batch(32)
///     .build(my_factory, reclaimer);
/// ```
#[derive(Debug, Clone)]
pub struct CacheBuilder {
	hot_capacity: usize,
	total_capacity: usize,
	retire_batch: usize,
}

impl CacheBuilder {
	/// Create a builder for a cache keeping up to `hot_capacity` values
	/// inflated. Zero is treated as one.
	pub fn new(hot_capacity: usize) -> Self {
		Self {
			hot_capacity,
			total_capacity: 0,
			retire_batch: DEFAULT_RETIRE_BATCH,
		}
	}

	/// Bound the number of entries overall, inflated and compressed.
	///
	/// Once exceeded, the least recently used compressed entries are dropped.
	///
	/// Default: 0 (unbounded)
	pub fn total_capacity(mut self, entries: usize) -> Self {
		self.total_capacity = entries;
		self
	}

	/// Set how many retired values are collected before they are handed to
	/// the reclaimer as one batch.
	///
	/// Default: 100
	pub fn retire_batch(mut self, values: usize) -> Self {
		assert!(values > 0, "retire_batch must be at least 1");
		self.retire_batch = values;
		self
	}

	/// Build the cache with the configured settings.
	pub fn build<K, V, F>(self, factory: F, reclaimer: Arc<EpochReclaimer>) -> CompressedCache<K, V, F>
	where
		K: Hash + Eq + Clone + Send + Sync,
		V: Send + Sync + 'static,
		F: ValueFactory<K, V>,
	{
		if self.total_capacity > 0 && self.total_capacity < self.hot_capacity {
			tracing::warn!(
				hot_capacity = self.hot_capacity,
				total_capacity = self.total_capacity,
				"total capacity is below hot capacity; cold tier will stay empty"
			);
		}
		CompressedCache::from_parts(
			factory,
			reclaimer,
			self.hot_capacity,
			self.total_capacity,
			self.retire_batch,
		)
	}
}

impl Default for CacheBuilder {
	fn default() -> Self {
		Self::new(DEFAULT_HOT_CAPACITY)
	}
}

/// Serializable cache settings, for loading from application config.
///
/// ```
/// use object_stash::CacheConfig;
///
/// let config: CacheConfig = serde_json::from_str(r#"{ "hot_capacity": 64 }"#).unwrap();
/// assert_eq!(config.hot_capacity, 64);
/// assert_eq!(config.retire_batch, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	/// Maximum number of inflated entries.
	pub hot_capacity: usize,
	/// Maximum number of entries overall, 0 for unbounded.
	pub total_capacity: usize,
	/// Retired values collected per reclaimer batch.
	pub retire_batch: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			hot_capacity: DEFAULT_HOT_CAPACITY,
			total_capacity: 0,
			retire_batch: DEFAULT_RETIRE_BATCH,
		}
	}
}

impl CacheConfig {
	/// A builder preloaded with these settings.
	pub fn builder(&self) -> CacheBuilder {
		CacheBuilder::from(self)
	}
}

impl From<&CacheConfig> for CacheBuilder {
	fn from(config: &CacheConfig) -> Self {
		Self {
			hot_capacity: config.hot_capacity,
			total_capacity: config.total_capacity,
			retire_batch: config.retire_batch.max(1),
		}
	}
}

impl From<CacheConfig> for CacheBuilder {
	fn from(config: CacheConfig) -> Self {
		Self::from(&config)
	}
}

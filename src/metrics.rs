//! Cache performance metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the counters kept by a [`CompressedCache`](crate::CompressedCache).
///
/// # Example
///
/// ```ignore
/// let metrics = cache.metrics();
/// println!("Hit rate: {:.2}%", metrics.hit_rate() * 100.0);
/// println!("Demotions: {}", metrics.demotions);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
	/// Lookups answered by an inflated entry.
	pub hits: u64,
	/// Lookups that found nothing cached.
	pub misses: u64,
	/// Successful factory builds.
	pub builds: u64,
	/// Factory builds that failed or panicked.
	pub build_failures: u64,
	/// Compressed entries inflated by a lookup.
	pub decompressions: u64,
	/// Inflated duplicates discarded because another caller won the race.
	pub discarded_duplicates: u64,
	/// Entries moved from the hot tier to the cold tier.
	pub demotions: u64,
	/// Cold entries dropped to respect the total capacity.
	pub evictions: u64,
	/// Inflated values handed to the reclaimer.
	pub retirements: u64,
	/// Current number of entries.
	pub entry_count: usize,
	/// Current number of inflated entries.
	pub hot_entries: usize,
	/// Current number of compressed entries.
	pub cold_entries: usize,
}

impl CacheMetrics {
	/// Fraction of lookups answered without building or inflating, between
	/// 0.0 and 1.0. Returns 0.0 if there have been no lookups.
	pub fn hit_rate(&self) -> f64 {
		let total = self.total_accesses();
		if total == 0 {
			0.0
		} else {
			self.hits as f64 / total as f64
		}
	}

	/// Lookups that were answered by an inflated value or had to go further.
	pub fn total_accesses(&self) -> u64 {
		self.hits + self.misses + self.decompressions
	}
}

#[derive(Default)]
pub(crate) struct Counters {
	pub hits: AtomicU64,
	pub misses: AtomicU64,
	pub builds: AtomicU64,
	pub build_failures: AtomicU64,
	pub decompressions: AtomicU64,
	pub discarded_duplicates: AtomicU64,
	pub demotions: AtomicU64,
	pub evictions: AtomicU64,
	pub retirements: AtomicU64,
}

impl Counters {
	pub fn snapshot(&self, entry_count: usize, hot_entries: usize, cold_entries: usize) -> CacheMetrics {
		CacheMetrics {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			builds: self.builds.load(Ordering::Relaxed),
			build_failures: self.build_failures.load(Ordering::Relaxed),
			decompressions: self.decompressions.load(Ordering::Relaxed),
			discarded_duplicates: self.discarded_duplicates.load(Ordering::Relaxed),
			demotions: self.demotions.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
			retirements: self.retirements.load(Ordering::Relaxed),
			entry_count,
			hot_entries,
			cold_entries,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hit_rate() {
		let metrics = CacheMetrics {
			hits: 3,
			misses: 1,
			..Default::default()
		};
		assert_eq!(metrics.hit_rate(), 0.75);
		assert_eq!(CacheMetrics::default().hit_rate(), 0.0);
	}

	#[test]
	fn test_snapshot_reads_counters() {
		let counters = Counters::default();
		counters.demotions.fetch_add(2, Ordering::Relaxed);
		counters.discarded_duplicates.fetch_add(1, Ordering::Relaxed);

		let metrics = counters.snapshot(5, 3, 2);
		assert_eq!(metrics.demotions, 2);
		assert_eq!(metrics.discarded_duplicates, 1);
		assert_eq!((metrics.entry_count, metrics.hot_entries, metrics.cold_entries), (5, 3, 2));
	}
}

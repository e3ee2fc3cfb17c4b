//! Content-addressed deduplication pool.
//!
//! A [`DedupPool`] canonicalises values by equality: inserting a value that is
//! equal to one already stored discards the argument and hands back the stored
//! instance, bumping its use-count. Equality and hashing always look through
//! the pointer at the value itself, never at its address.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use deepsize::DeepSizeOf;
use hashbrown::HashMap;
use hashbrown::hash_map::RawEntryMut;
use parking_lot::Mutex;

/// Canonical value stored in the pool.
///
/// Hashes by value. Compares by identity first, then by value.
struct Canonical<T>(Arc<T>);

impl<T: Hash> Hash for Canonical<T> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(*self.0).hash(state);
	}
}

impl<T: Eq> PartialEq for Canonical<T> {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
	}
}

impl<T: Eq> Eq for Canonical<T> {}

impl<T> Canonical<T> {
	fn matches(&self, value: &T) -> bool
	where
		T: Eq,
	{
		std::ptr::eq(Arc::as_ptr(&self.0), value) || *self.0 == *value
	}
}

/// Memory accounting for a pool, see [`DedupPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
	/// Bytes that sharing avoided allocating.
	pub bytes_saved: usize,
	/// Bytes that sharing cost over plain ownership (bookkeeping on values
	/// that were only used once).
	pub bytes_lost: usize,
	/// Memory the pool actually holds, bookkeeping included.
	pub actual_mem_used: usize,
	/// Memory every user would hold with its own private copy.
	pub hypothetical_mem_used: usize,
}

impl PoolStats {
	/// Net saving; negative when the pool costs more than it saves.
	pub fn balance(&self) -> i64 {
		self.bytes_saved as i64 - self.bytes_lost as i64
	}
}

/// Diagnostic summary of a pool.
///
/// The numeric fields follow [`DedupPool::stats`]; the `Display` prose is
/// informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
	/// Name of the pooled type.
	pub type_name: &'static str,
	/// Number of distinct canonical values.
	pub entries: usize,
	/// Sum of all use-counts.
	pub total_usage: usize,
	/// Memory accounting.
	pub stats: PoolStats,
}

impl fmt::Display for PoolSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "dedup pool <{}>", self.type_name)?;
		writeln!(f, "  entries:           {}", self.entries)?;
		writeln!(f, "  total usage count: {}", self.total_usage)?;
		writeln!(f, "  bytes saved:       {}", self.stats.bytes_saved)?;
		writeln!(f, "  bytes lost:        {}", self.stats.bytes_lost)?;
		writeln!(f, "  balance:           {}", self.stats.balance())?;
		writeln!(f, "  actual memory:     {}", self.stats.actual_mem_used)?;
		write!(f, "  hypothetical mem:  {}", self.stats.hypothetical_mem_used)
	}
}

/// Thread-safe deduplication pool for values of type `T`.
///
/// Each pool owns one lock; pools for different types never contend.
///
/// # Example
///
/// ```
/// use object_stash::DedupPool;
/// use std::sync::Arc;
///
/// let pool = DedupPool::new();
/// let a = pool.insert(String::from("YYZ-LHR"));
/// let b = pool.insert(String::from("YYZ-LHR"));
///
/// assert!(Arc::ptr_eq(&a, &b));
/// assert_eq!(pool.len(), 1);
/// assert_eq!(pool.usage_count(&a), 2);
///
/// assert!(pool.erase(&a));
/// assert!(pool.erase(&b));
/// assert!(!pool.erase(&b));
/// assert!(pool.is_empty());
/// ```
pub struct DedupPool<T> {
	storage: Mutex<HashMap<Canonical<T>, usize, RandomState>>,
	entry_overhead: usize,
}

/// Bookkeeping cost of one pool slot: the canonical pointer plus its count.
const fn default_entry_overhead<T>() -> usize {
	std::mem::size_of::<(Arc<T>, usize)>()
}

impl<T> DedupPool<T>
where
	T: Hash + Eq,
{
	/// Create an empty pool.
	pub fn new() -> Self {
		Self::with_entry_overhead(default_entry_overhead::<T>())
	}

	/// Create an empty pool that charges `bytes` of bookkeeping per entry in
	/// [`stats`](Self::stats).
	pub fn with_entry_overhead(bytes: usize) -> Self {
		Self {
			storage: Mutex::new(HashMap::with_hasher(RandomState::new())),
			entry_overhead: bytes,
		}
	}

	/// Bookkeeping bytes charged per entry.
	pub fn entry_overhead(&self) -> usize {
		self.entry_overhead
	}

	/// Offer `value` to the pool and return the canonical instance.
	///
	/// If an equal value is already stored, `value` is dropped and the
	/// stored instance's use-count is incremented. Otherwise `value` becomes
	/// canonical with a use-count of one.
	pub fn insert(&self, value: T) -> Arc<T> {
		self.insert_arc(Arc::new(value))
	}

	/// Like [`insert`](Self::insert) for a value that is already behind an
	/// `Arc`. Re-inserting the canonical instance itself registers another use.
	pub fn insert_arc(&self, value: Arc<T>) -> Arc<T> {
		let mut storage = self.storage.lock();
		let hash = storage.hasher().hash_one(&*value);

		match storage.raw_entry_mut().from_hash(hash, |stored| stored.matches(&value)) {
			RawEntryMut::Occupied(mut occupied) => {
				*occupied.get_mut() += 1;
				Arc::clone(&occupied.key().0)
			}
			RawEntryMut::Vacant(vacant) => {
				let canonical = Arc::clone(&value);
				vacant.insert_hashed_nocheck(hash, Canonical(value), 1);
				canonical
			}
		}
	}

	/// Release one use of `value`.
	///
	/// The stored entry is matched by identity first and by value second.
	/// When its use-count drops to zero the pool releases the value. Returns
	/// `false` if no matching entry is tracked; the caller still owns `value`.
	pub fn erase(&self, value: &T) -> bool {
		let removed = {
			let mut storage = self.storage.lock();
			let hash = storage.hasher().hash_one(value);

			match storage.raw_entry_mut().from_hash(hash, |stored| stored.matches(value)) {
				RawEntryMut::Occupied(mut occupied) => {
					let count = occupied.get_mut();
					*count -= 1;
					if *count == 0 {
						Some(Some(occupied.remove_entry().0))
					} else {
						Some(None)
					}
				}
				RawEntryMut::Vacant(_) => None,
			}
		};

		// The last pool-held reference is released outside the lock.
		match removed {
			Some(last) => {
				drop(last);
				true
			}
			None => false,
		}
	}

	/// Use-count of the entry matching `value`, zero if untracked.
	pub fn usage_count(&self, value: &T) -> usize {
		let storage = self.storage.lock();
		let hash = storage.hasher().hash_one(value);
		storage
			.raw_entry()
			.from_hash(hash, |stored| stored.matches(value))
			.map_or(0, |(_, count)| *count)
	}

	/// Whether a value equal to `value` is stored.
	pub fn contains(&self, value: &T) -> bool {
		self.usage_count(value) > 0
	}

	/// Sum of the use-counts of every stored value.
	pub fn total_usage_count(&self) -> usize {
		self.storage.lock().values().sum()
	}

	/// Number of distinct canonical values.
	pub fn len(&self) -> usize {
		self.storage.lock().len()
	}

	/// Whether the pool holds no values.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Memory accounting with a caller-supplied deep-size estimator.
	///
	/// For every stored value `v` used `n` times:
	/// `hypothetical = n * deep_size(v)` and
	/// `actual = deep_size(v) + entry_overhead`. Savings and losses are the
	/// positive parts of `hypothetical - actual` and `actual - hypothetical`.
	pub fn stats_with<F>(&self, deep_size: F) -> PoolStats
	where
		F: Fn(&T) -> usize,
	{
		let storage = self.storage.lock();
		storage.iter().fold(PoolStats::default(), |mut stats, (canonical, &count)| {
			let size = deep_size(&*canonical.0);
			let hypothetical = count * size;
			let actual = size + self.entry_overhead;

			stats.bytes_saved += hypothetical.saturating_sub(actual);
			stats.bytes_lost += actual.saturating_sub(hypothetical);
			stats.actual_mem_used += actual;
			stats.hypothetical_mem_used += hypothetical;
			stats
		})
	}

	/// Memory accounting using [`DeepSizeOf`] as the estimator.
	pub fn stats(&self) -> PoolStats
	where
		T: DeepSizeOf,
	{
		self.stats_with(|value| value.deep_size_of())
	}

	/// Full diagnostic summary of the pool.
	pub fn summary(&self) -> PoolSummary
	where
		T: DeepSizeOf,
	{
		// Counts and stats are taken under separate locks; the summary is
		// advisory when the pool is being mutated concurrently.
		let (entries, total_usage) = {
			let storage = self.storage.lock();
			(storage.len(), storage.values().sum())
		};
		PoolSummary {
			type_name: std::any::type_name::<T>(),
			entries,
			total_usage,
			stats: self.stats(),
		}
	}
}

impl<T: Hash + Eq> Default for DedupPool<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> fmt::Debug for DedupPool<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let storage = self.storage.lock();
		f.debug_struct("DedupPool")
			.field("type", &std::any::type_name::<T>())
			.field("entries", &storage.len())
			.field("entry_overhead", &self.entry_overhead)
			.finish()
	}
}

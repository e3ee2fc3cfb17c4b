#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::factory::{Created, ValueFactory};
#[cfg(feature = "metrics")]
use crate::metrics::{CacheMetrics, Counters};
use crate::reclaim::{EpochReclaimer, Transaction};
use crate::recency::{Position, RecencyList, Tier};
use crate::retire::Retirer;

/// Outcome of one in-flight build, shared with every caller waiting on it.
#[derive(Default)]
struct Flight {
	failure: OnceLock<Error>,
}

enum Slot<V> {
	/// The first build of this key is in flight.
	Building,
	/// Inflated value, plus its compressed form once one is known.
	Ready { value: Box<V>, compressed: Option<Bytes> },
	/// Compressed bytes only.
	Compressed(Bytes),
}

struct Entry<V> {
	slot: Slot<V>,
	position: Option<Position>,
}

struct CacheState<K, V> {
	entries: HashMap<K, Entry<V>, RandomState>,
	hot: RecencyList<K>,
	cold: RecencyList<K>,
	/// Factory calls in flight. Outlives the `Building` slot when a `put`
	/// lands mid-build.
	flights: HashMap<K, Arc<Flight>, RandomState>,
	tick: u64,
}

impl<K: Hash + Eq + Clone, V> CacheState<K, V> {
	fn new() -> Self {
		Self {
			entries: HashMap::with_hasher(RandomState::new()),
			hot: RecencyList::new(),
			cold: RecencyList::new(),
			flights: HashMap::with_hasher(RandomState::new()),
			tick: 0,
		}
	}

	fn list_mut(&mut self, tier: Tier) -> &mut RecencyList<K> {
		match tier {
			Tier::Hot => &mut self.hot,
			Tier::Cold => &mut self.cold,
		}
	}

	/// Make `key` the most recently used member of `tier`, leaving whatever
	/// list it was in before.
	fn place(&mut self, key: &K, tier: Tier) {
		self.tick += 1;
		let stamp = self.tick;
		let Some(entry) = self.entries.get_mut(key) else {
			return;
		};
		let previous = entry.position.replace(Position {
			tier,
			stamp,
		});
		self.unlink(previous);
		self.list_mut(tier).push_back(stamp, key.clone());
	}

	fn unlink(&mut self, position: Option<Position>) {
		if let Some(position) = position {
			self.list_mut(position.tier).remove(position.stamp);
		}
	}

	/// Forget `flight` once its factory call has returned.
	fn land(&mut self, key: &K, flight: &Arc<Flight>) {
		if self.flights.get(key).is_some_and(|current| Arc::ptr_eq(current, flight)) {
			self.flights.remove(key);
		}
	}

	/// Whether a finished build still owns its key: the sentinel is in
	/// place, or the entry was cleared while building.
	fn owns_build(&self, key: &K) -> bool {
		matches!(self.entries.get(key).map(|entry| &entry.slot), Some(Slot::Building) | None)
	}
}

/// What a lookup found under the lock.
enum Lookup<V> {
	Hit(*const V),
	Wait(Arc<Flight>),
	Inflate(Bytes),
	Miss,
}

/// Two-tier cache keeping recently used values inflated and older ones as
/// compressed bytes.
///
/// # Tiers
///
/// - At most `hot_capacity` entries hold an inflated value. When the hot tier
///   overflows, its least recently used entry is compressed (through the
///   [`ValueFactory`]) and its value is retired.
/// - With a non-zero `total_capacity`, the least recently used compressed
///   entries are dropped once the cache holds more entries than that.
///
/// # Reading
///
/// Values are read through a [`Transaction`] registered with the cache's
/// [`EpochReclaimer`] and are returned as plain references that live as long
/// as the transaction. Reads take no per-value reference count. Values that
/// leave the cache (replaced, invalidated, demoted or cleared) are retired to
/// the reclaimer and destroyed only after every transaction that could still
/// see them has ended.
///
/// # Single flight
///
/// At most one factory call per key is in flight. Concurrent callers asking
/// for a key that is being built wait for that build and share its result,
/// or its failure.
///
/// # Example
///
/// ```
/// use object_stash::{BoxError, CacheBuilder, Created, EpochReclaimer, ValueFactory};
/// use bytes::Bytes;
/// use std::sync::Arc;
///
/// struct Squares;
///
/// impl ValueFactory<u64, u64> for Squares {
///     fn create(&self, key: &u64) -> Result<Created<u64>, BoxError> {
///         Ok(Created::new(key * key))
///     }
///
///     fn compress(&self, value: &u64) -> Result<Option<Bytes>, BoxError> {
///         Ok(Some(Bytes::copy_from_slice(&value.to_le_bytes())))
///     }
///
///     fn uncompress(&self, blob: &[u8]) -> Result<u64, BoxError> {
///         Ok(u64::from_le_bytes(blob.try_into()?))
///     }
/// }
///
/// let reclaimer = Arc::new(EpochReclaimer::new());
/// let cache = CacheBuilder::new(2).build(Squares, Arc::clone(&reclaimer));
///
/// let txn = reclaimer.begin_transaction();
/// assert_eq!(*cache.get(&txn, &3).unwrap(), 9);
/// assert_eq!(*cache.get(&txn, &4).unwrap(), 16);
/// assert_eq!(*cache.get(&txn, &5).unwrap(), 25);
///
/// // key 3 was demoted to the compressed tier
/// assert_eq!(cache.hot_len(), 2);
/// assert_eq!(cache.cold_len(), 1);
/// assert_eq!(*cache.get(&txn, &3).unwrap(), 9);
/// ```
pub struct CompressedCache<K, V, F>
where
	V: Send + Sync + 'static,
{
	state: Mutex<CacheState<K, V>>,
	/// Signalled whenever a build finishes or a sentinel is replaced.
	ready: Condvar,
	factory: F,
	retirer: Retirer,
	hot_capacity: usize,
	total_capacity: usize,
	#[cfg(feature = "metrics")]
	counters: Counters,
}

impl<K, V, F> CompressedCache<K, V, F>
where
	K: Hash + Eq + Clone + Send + Sync,
	V: Send + Sync + 'static,
	F: ValueFactory<K, V>,
{
	/// Create a cache with the default retirement batch size and no total
	/// capacity. See [`CacheBuilder`](crate::CacheBuilder) for the other knobs.
	pub fn new(hot_capacity: usize, factory: F, reclaimer: Arc<EpochReclaimer>) -> Self {
		crate::builder::CacheBuilder::new(hot_capacity).build(factory, reclaimer)
	}

	pub(crate) fn from_parts(
		factory: F,
		reclaimer: Arc<EpochReclaimer>,
		hot_capacity: usize,
		total_capacity: usize,
		retire_batch: usize,
	) -> Self {
		Self {
			state: Mutex::new(CacheState::new()),
			ready: Condvar::new(),
			factory,
			retirer: Retirer::new(reclaimer, retire_batch),
			hot_capacity: hot_capacity.max(1),
			total_capacity,
			#[cfg(feature = "metrics")]
			counters: Counters::default(),
		}
	}

	/// Return the value for `key`, building it if it is not cached.
	///
	/// Blocks while another caller is building the same key. If that build
	/// fails, every waiting caller receives the same error and may retry.
	///
	/// # Errors
	///
	/// - [`Error::ForeignTransaction`] if `txn` belongs to another reclaimer.
	/// - [`Error::Factory`] if building or uncompressing the value failed.
	/// - [`Error::FactoryPanicked`] if the build this call waited on panicked.
	pub fn get<'t>(&self, txn: &'t Transaction, key: &K) -> Result<&'t V> {
		self.check_transaction(txn)?;
		let Some(value) = self.fetch(key, true)? else {
			unreachable!("a creating lookup always yields a value");
		};
		// SAFETY: the value was reachable from the cache while `txn` was
		// active. Values leave the cache only through the retirer, and the
		// reclaimer does not destroy them before `txn` ends. `txn` outlives 't.
		Ok(unsafe { &*value })
	}

	/// Return the value for `key` if it is cached, without building it.
	///
	/// Compressed entries are inflated. A build in flight for `key` is waited
	/// for, since it may be about to produce the value.
	pub fn get_if_present<'t>(&self, txn: &'t Transaction, key: &K) -> Result<Option<&'t V>> {
		self.check_transaction(txn)?;
		let value = self.fetch(key, false)?;
		// SAFETY: see `get`.
		Ok(value.map(|value| unsafe { &*value }))
	}

	/// Clone the value for `key` out of the cache, building it if needed.
	///
	/// Runs inside a short internal transaction, so the result can be held
	/// for as long as the caller likes.
	pub fn get_clone(&self, key: &K) -> Result<V>
	where
		V: Clone,
	{
		let txn = self.retirer.reclaimer().begin_transaction();
		self.get(&txn, key).cloned()
	}

	/// Install `value` for `key`, replacing any cached value.
	///
	/// A previously inflated value is retired rather than dropped, and any
	/// compressed form is discarded.
	pub fn put(&self, key: K, value: V) {
		let mut state = self.state.lock();
		let previous = state.entries.insert(
			key.clone(),
			Entry {
				slot: Slot::Ready {
					value: Box::new(value),
					compressed: None,
				},
				position: None,
			},
		);

		if let Some(previous) = previous {
			state.unlink(previous.position);
			match previous.slot {
				Slot::Ready { value, .. } => self.retire(value),
				// waiters on the replaced build pick up the new value
				Slot::Building => {
					self.ready.notify_all();
				}
				Slot::Compressed(_) => {}
			}
		}

		state.place(&key, Tier::Hot);
		self.enforce_capacity(&mut state);
	}

	/// Remove `key` from the cache. Returns `false` if it was not cached.
	///
	/// If the key is being built, waits for the build to finish first, even
	/// when a `put` already replaced its placeholder.
	pub fn invalidate(&self, key: &K) -> bool {
		let mut state = self.state.lock();
		while state.flights.contains_key(key) {
			self.ready.wait(&mut state);
		}

		let Some(entry) = state.entries.remove(key) else {
			return false;
		};
		state.unlink(entry.position);
		if let Slot::Ready { value, .. } = entry.slot {
			self.retire(value);
		}
		tracing::trace!("invalidated cache entry");
		true
	}

	/// Point-in-time copy of the cached keys. Keys still being built for the
	/// first time are not included.
	pub fn keys(&self) -> Vec<K> {
		let state = self.state.lock();
		state
			.entries
			.iter()
			.filter(|(_, entry)| !matches!(entry.slot, Slot::Building))
			.map(|(key, _)| key.clone())
			.collect()
	}

	/// Remove every cached entry, retiring all inflated values.
	///
	/// Builds in flight are left alone; they complete and install their value
	/// as usual.
	pub fn clear(&self) {
		let removed: Vec<Entry<V>> = {
			let mut state = self.state.lock();
			let removed = state
				.entries
				.extract_if(|_, entry| !matches!(entry.slot, Slot::Building))
				.map(|(_, entry)| entry)
				.collect();
			state.hot.clear();
			state.cold.clear();
			removed
		};

		for entry in removed {
			if let Slot::Ready { value, .. } = entry.slot {
				self.retire(value);
			}
		}
		self.retirer.flush();
	}

	/// Whether `key` currently has a cached value, inflated or compressed.
	pub fn contains(&self, key: &K) -> bool {
		let state = self.state.lock();
		state.entries.get(key).is_some_and(|entry| !matches!(entry.slot, Slot::Building))
	}

	/// Number of entries, including keys whose first build is in flight.
	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	/// Whether the cache has no entries.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of entries holding an inflated value.
	pub fn hot_len(&self) -> usize {
		self.state.lock().hot.len()
	}

	/// Number of entries holding only compressed bytes.
	pub fn cold_len(&self) -> usize {
		self.state.lock().cold.len()
	}

	/// Maximum number of inflated entries.
	pub fn hot_capacity(&self) -> usize {
		self.hot_capacity
	}

	/// Maximum number of entries overall, zero if unbounded.
	pub fn total_capacity(&self) -> usize {
		self.total_capacity
	}

	/// The reclaimer values are retired to.
	pub fn reclaimer(&self) -> &Arc<EpochReclaimer> {
		self.retirer.reclaimer()
	}

	/// Hand all locally queued retired values to the reclaimer.
	pub fn flush_retired(&self) {
		self.retirer.flush();
	}

	/// Number of retired values queued locally and not yet handed to the
	/// reclaimer.
	pub fn queued_retirements(&self) -> usize {
		self.retirer.queued()
	}

	/// Snapshot of the cache counters.
	#[cfg(feature = "metrics")]
	pub fn metrics(&self) -> CacheMetrics {
		let (entry_count, hot_entries, cold_entries) = {
			let state = self.state.lock();
			(state.entries.len(), state.hot.len(), state.cold.len())
		};
		self.counters.snapshot(entry_count, hot_entries, cold_entries)
	}

	fn check_transaction(&self, txn: &Transaction) -> Result<()> {
		if Arc::ptr_eq(txn.reclaimer(), self.retirer.reclaimer()) {
			Ok(())
		} else {
			Err(Error::ForeignTransaction(txn.id()))
		}
	}

	fn retire(&self, value: Box<V>) {
		#[cfg(feature = "metrics")]
		self.counters.retirements.fetch_add(1, Ordering::Relaxed);
		self.retirer.retire(value);
	}

	fn fetch(&self, key: &K, create: bool) -> Result<Option<*const V>> {
		let mut state = self.state.lock();
		loop {
			let lookup = match state.entries.get(key).map(|entry| &entry.slot) {
				Some(Slot::Ready { value, .. }) => Lookup::Hit(&**value as *const V),
				Some(Slot::Compressed(blob)) => Lookup::Inflate(blob.clone()),
				Some(Slot::Building) | None => match state.flights.get(key) {
					Some(flight) => Lookup::Wait(Arc::clone(flight)),
					None => Lookup::Miss,
				},
			};

			match lookup {
				Lookup::Hit(value) => {
					state.place(key, Tier::Hot);
					#[cfg(feature = "metrics")]
					self.counters.hits.fetch_add(1, Ordering::Relaxed);
					return Ok(Some(value));
				}
				Lookup::Wait(flight) => {
					self.ready.wait(&mut state);
					if let Some(err) = flight.failure.get() {
						return Err(err.clone());
					}
				}
				Lookup::Inflate(blob) => {
					if let Some(value) = self.inflate(&mut state, key, blob)? {
						return Ok(Some(value));
					}
				}
				Lookup::Miss if !create => {
					#[cfg(feature = "metrics")]
					self.counters.misses.fetch_add(1, Ordering::Relaxed);
					return Ok(None);
				}
				Lookup::Miss => {
					#[cfg(feature = "metrics")]
					self.counters.misses.fetch_add(1, Ordering::Relaxed);
					let flight = Arc::new(Flight::default());
					state.flights.insert(key.clone(), Arc::clone(&flight));
					state.entries.insert(
						key.clone(),
						Entry {
							slot: Slot::Building,
							position: None,
						},
					);
					if let Some(value) = self.build(&mut state, key, flight)? {
						return Ok(Some(value));
					}
				}
			}
		}
	}

	/// Uncompress `blob` with the lock released and install the result.
	///
	/// Returns `None` when another caller changed the entry in the meantime;
	/// the duplicate is destroyed and the lookup starts over.
	fn inflate(
		&self,
		state: &mut MutexGuard<'_, CacheState<K, V>>,
		key: &K,
		blob: Bytes,
	) -> Result<Option<*const V>> {
		let value = MutexGuard::unlocked(state, || self.factory.uncompress(&blob)).map_err(Error::factory)?;
		#[cfg(feature = "metrics")]
		self.counters.decompressions.fetch_add(1, Ordering::Relaxed);

		let Some(entry) = state.entries.get_mut(key) else {
			MutexGuard::unlocked(state, || self.factory.destroy(key, value));
			return Ok(None);
		};
		let unchanged = matches!(&entry.slot, Slot::Compressed(current) if same_bytes(current, &blob));
		if !unchanged {
			#[cfg(feature = "metrics")]
			self.counters.discarded_duplicates.fetch_add(1, Ordering::Relaxed);
			MutexGuard::unlocked(state, || self.factory.destroy(key, value));
			return Ok(None);
		}

		let value = Box::new(value);
		let ptr = &*value as *const V;
		entry.slot = Slot::Ready {
			value,
			compressed: Some(blob),
		};
		state.place(key, Tier::Hot);
		self.enforce_capacity(state);
		Ok(Some(ptr))
	}

	/// Run the factory for `key` with the lock released. The caller has
	/// already registered `flight` and installed the `Building` sentinel.
	///
	/// Returns `None` when a `put` replaced the sentinel while building; the
	/// built value is destroyed, or the failure dropped, and the lookup
	/// starts over.
	fn build(
		&self,
		state: &mut MutexGuard<'_, CacheState<K, V>>,
		key: &K,
		flight: Arc<Flight>,
	) -> Result<Option<*const V>> {
		tracing::debug!("building cache entry");
		let outcome = MutexGuard::unlocked(state, || {
			panic::catch_unwind(AssertUnwindSafe(|| self.factory.create(key)))
		});

		let Created {
			value,
			compressed,
		} = match outcome {
			Ok(Ok(created)) => created,
			Ok(Err(err)) => {
				let err = Error::factory(err);
				tracing::debug!(error = %err, "cache entry build failed");
				return if self.abandon(state, key, &flight, err.clone()) { Err(err) } else { Ok(None) };
			}
			Err(payload) => {
				tracing::warn!("value factory panicked; releasing waiters");
				self.abandon(state, key, &flight, Error::FactoryPanicked);
				panic::resume_unwind(payload)
			}
		};
		#[cfg(feature = "metrics")]
		self.counters.builds.fetch_add(1, Ordering::Relaxed);

		state.land(key, &flight);
		let ours = state.owns_build(key);
		self.ready.notify_all();
		if !ours {
			MutexGuard::unlocked(state, || self.factory.destroy(key, value));
			return Ok(None);
		}

		let value = Box::new(value);
		let ptr = &*value as *const V;
		state.entries.insert(
			key.clone(),
			Entry {
				slot: Slot::Ready {
					value,
					compressed,
				},
				position: None,
			},
		);
		state.place(key, Tier::Hot);
		self.enforce_capacity(state);
		Ok(Some(ptr))
	}

	/// Retire a failed build and wake its waiters.
	///
	/// Returns whether the failure is reported. When a `put` replaced the
	/// sentinel meanwhile, waiters re-run their lookup and find that value.
	fn abandon(&self, state: &mut CacheState<K, V>, key: &K, flight: &Arc<Flight>, err: Error) -> bool {
		state.land(key, flight);
		let ours = state.owns_build(key);
		if ours {
			state.entries.remove(key);
			let _ = flight.failure.set(err);
		}
		#[cfg(feature = "metrics")]
		self.counters.build_failures.fetch_add(1, Ordering::Relaxed);
		self.ready.notify_all();
		ours
	}

	/// Demote hot entries beyond `hot_capacity`, then drop cold entries while
	/// the cache holds more than `total_capacity` entries.
	fn enforce_capacity(&self, state: &mut MutexGuard<'_, CacheState<K, V>>) {
		while state.hot.len() > self.hot_capacity {
			let Some((stamp, key)) = state.hot.front().map(|(stamp, key)| (stamp, key.clone())) else {
				break;
			};

			// `None` when the compressed form is already known.
			let target = match state.entries.get(&key).map(|entry| &entry.slot) {
				Some(Slot::Ready {
					value,
					compressed,
				}) => compressed.is_none().then_some(&**value as *const V),
				_ => {
					debug_assert!(false, "only inflated entries are in the hot tier");
					break;
				}
			};

			match target {
				None => self.demote(state, &key),
				Some(target) => self.compress_front(state, &key, stamp, target),
			}
		}

		if self.total_capacity == 0 {
			return;
		}
		while state.entries.len() > self.total_capacity {
			let Some((stamp, key)) = state.cold.front().map(|(stamp, key)| (stamp, key.clone())) else {
				break;
			};
			state.cold.remove(stamp);
			// Compressed bytes are immutable buffers nobody borrows through a
			// transaction, so they are freed right away.
			state.entries.remove(&key);
			#[cfg(feature = "metrics")]
			self.counters.evictions.fetch_add(1, Ordering::Relaxed);
			tracing::trace!(entries = state.entries.len(), "evicted cold cache entry");
		}
	}

	/// Compress the value of the oldest hot entry with the lock released.
	fn compress_front(
		&self,
		state: &mut MutexGuard<'_, CacheState<K, V>>,
		key: &K,
		stamp: u64,
		target: *const V,
	) {
		// The pin keeps `target` alive even if the entry is retired while the
		// lock is released.
		let pin = self.retirer.reclaimer().begin_transaction();
		let outcome = MutexGuard::unlocked(state, || {
			// SAFETY: `target` was inflated in the cache when `pin` began, so
			// it is not destroyed before `pin` ends.
			self.factory.compress(unsafe { &*target })
		});

		let (unchanged, still_front) = match state.entries.get(key) {
			Some(Entry {
				slot: Slot::Ready {
					value,
					..
				},
				position,
			}) if std::ptr::eq(&**value, target) => (
				true,
				*position
					== Some(Position {
						tier: Tier::Hot,
						stamp,
					}),
			),
			_ => (false, false),
		};

		match outcome {
			Ok(Some(blob)) if unchanged => {
				if let Some(Entry {
					slot: Slot::Ready {
						compressed,
						..
					},
					..
				}) = state.entries.get_mut(key)
				{
					*compressed = Some(blob);
				}
				if still_front {
					self.demote(state, key);
				}
			}
			Ok(Some(_)) => {}
			Ok(None) if unchanged => {
				tracing::debug!("value has no compressed form; dropping it from the cache");
				self.discard(state, key);
			}
			Ok(None) => {}
			Err(err) => {
				tracing::warn!(error = %err, "failed to compress cache value; dropping it from the cache");
				if unchanged {
					self.discard(state, key);
				}
			}
		}

		// Ending the pin may destroy retired values; keep that outside the lock.
		MutexGuard::unlocked(state, || drop(pin));
	}

	/// Move an inflated entry with a known compressed form to the cold tier.
	fn demote(&self, state: &mut CacheState<K, V>, key: &K) {
		let Some(entry) = state.entries.get_mut(key) else {
			return;
		};
		match std::mem::replace(&mut entry.slot, Slot::Compressed(Bytes::new())) {
			Slot::Ready {
				value,
				compressed: Some(blob),
			} => {
				entry.slot = Slot::Compressed(blob);
				self.retire(value);
				state.place(key, Tier::Cold);
				#[cfg(feature = "metrics")]
				self.counters.demotions.fetch_add(1, Ordering::Relaxed);
				tracing::trace!(hot = state.hot.len(), cold = state.cold.len(), "demoted cache entry");
			}
			other => entry.slot = other,
		}
	}

	/// Drop an entry entirely, retiring its inflated value.
	fn discard(&self, state: &mut CacheState<K, V>, key: &K) {
		if let Some(entry) = state.entries.remove(key) {
			state.unlink(entry.position);
			if let Slot::Ready { value, .. } = entry.slot {
				self.retire(value);
			}
		}
	}
}

impl<K, V, F> Drop for CompressedCache<K, V, F>
where
	V: Send + Sync + 'static,
{
	fn drop(&mut self) {
		// Readers may still hold references under live transactions, so
		// inflated values go through the reclaimer like any other removal.
		let state = self.state.get_mut();
		for (_, entry) in state.entries.drain() {
			if let Slot::Ready { value, .. } = entry.slot {
				self.retirer.retire(value);
			}
		}
		self.retirer.flush();
	}
}

impl<K, V, F> std::fmt::Debug for CompressedCache<K, V, F>
where
	V: Send + Sync + 'static,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock();
		f.debug_struct("CompressedCache")
			.field("entries", &state.entries.len())
			.field("hot", &state.hot.len())
			.field("cold", &state.cold.len())
			.field("hot_capacity", &self.hot_capacity)
			.field("total_capacity", &self.total_capacity)
			.finish()
	}
}

/// Whether two handles refer to the same buffer.
fn same_bytes(a: &Bytes, b: &Bytes) -> bool {
	a.as_ptr() == b.as_ptr() && a.len() == b.len()
}

//! Deferred reclamation keyed by active transactions.
//!
//! Readers register a [`Transaction`] before touching cached values and may
//! keep plain references to those values until the transaction ends. Writers
//! never free a value that was reachable from a cache; they hand it to the
//! [`EpochReclaimer`] instead, which groups retired values into batches. Each
//! batch remembers how many of the transactions active at its creation are
//! still running, and the batch is destroyed by whichever thread ends the
//! last of them.
//!
//! # Bookkeeping
//!
//! - Every active transaction records the batches that wait on it.
//! - Every pending batch counts the transactions it still waits on.
//! - Ending a transaction only visits its own batches, so the cost does not
//!   grow with the number of unrelated pending batches.
//! - Retiring while no transaction is active destroys the values on the spot
//!   without creating a batch.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Identifier of a registered transaction. Ids are handed out in increasing
/// order and never reused by the same reclaimer.
pub type TxnId = u64;

/// A retired value awaiting destruction.
pub type Garbage = Box<dyn Any + Send>;

type BatchId = u64;

struct PendingBatch {
	/// Number of transactions from the creation snapshot still active.
	waiting_on: usize,
	garbage: Vec<Garbage>,
}

#[derive(Default)]
struct ReclaimState {
	/// Active transactions and the batches each one holds back.
	active: HashMap<TxnId, Vec<BatchId>, RandomState>,
	batches: HashMap<BatchId, PendingBatch, RandomState>,
	next_batch: BatchId,
	pending_values: usize,
}

/// Tracks active transactions and defers destruction of retired values until
/// every transaction that might still reference them has ended.
///
/// ```
/// use object_stash::EpochReclaimer;
/// use std::sync::Arc;
///
/// let reclaimer = Arc::new(EpochReclaimer::new());
/// let txn = reclaimer.begin_transaction();
///
/// reclaimer.retire_values(vec![String::from("stale fare")]);
/// assert_eq!(reclaimer.pending_values(), 1);
///
/// reclaimer.end_transaction(txn);
/// assert_eq!(reclaimer.pending_values(), 0);
/// ```
pub struct EpochReclaimer {
	next_txn: AtomicU64,
	state: Mutex<ReclaimState>,
}

impl EpochReclaimer {
	/// Create a reclaimer with no active transactions.
	pub fn new() -> Self {
		Self {
			next_txn: AtomicU64::new(1),
			state: Mutex::new(ReclaimState::default()),
		}
	}

	/// Register a new transaction.
	///
	/// Values retired while the returned guard is alive are not destroyed
	/// before it ends. The transaction ends when the guard is passed to
	/// [`end_transaction`](Self::end_transaction) or dropped.
	pub fn begin_transaction(self: &Arc<Self>) -> Transaction {
		let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
		self.state.lock().active.insert(id, Vec::new());
		tracing::trace!(txn = id, "transaction started");
		Transaction {
			id,
			reclaimer: Arc::clone(self),
		}
	}

	/// End a transaction, destroying every batch that was only waiting on it.
	pub fn end_transaction(&self, txn: Transaction) {
		debug_assert!(std::ptr::eq(Arc::as_ptr(&txn.reclaimer), self));
		drop(txn);
	}

	fn finish(&self, id: TxnId) {
		let ready = {
			let mut state = self.state.lock();
			let Some(held) = state.active.remove(&id) else {
				return;
			};

			let mut ready = Vec::new();
			for batch_id in held {
				let Some(batch) = state.batches.get_mut(&batch_id) else {
					continue;
				};
				batch.waiting_on -= 1;
				if batch.waiting_on == 0 {
					if let Some(batch) = state.batches.remove(&batch_id) {
						state.pending_values -= batch.garbage.len();
						ready.push(batch.garbage);
					}
				}
			}
			ready
		};

		tracing::trace!(txn = id, batches = ready.len(), "transaction ended");
		for garbage in ready {
			finalize(garbage);
		}
	}

	/// Retire a batch of values.
	///
	/// The batch is tagged with the set of currently active transactions and
	/// destroyed once all of them have ended. With no active transaction the
	/// values are destroyed immediately on the calling thread.
	pub fn retire(&self, garbage: Vec<Garbage>) {
		if garbage.is_empty() {
			return;
		}

		let garbage = {
			let mut state = self.state.lock();
			if state.active.is_empty() {
				garbage
			} else {
				let batch_id = state.next_batch;
				state.next_batch += 1;

				let waiting_on = state.active.len();
				for held in state.active.values_mut() {
					held.push(batch_id);
				}
				state.pending_values += garbage.len();
				tracing::debug!(
					batch = batch_id,
					values = garbage.len(),
					waiting_on,
					"deferred retired values"
				);
				state.batches.insert(
					batch_id,
					PendingBatch {
						waiting_on,
						garbage,
					},
				);
				return;
			}
		};

		finalize(garbage);
	}

	/// Retire a collection of concrete values.
	pub fn retire_values<V, I>(&self, values: I)
	where
		V: Send + 'static,
		I: IntoIterator<Item = V>,
	{
		self.retire(values.into_iter().map(|value| Box::new(value) as Garbage).collect());
	}

	/// Number of transactions currently registered.
	pub fn active_transactions(&self) -> usize {
		self.state.lock().active.len()
	}

	/// Whether the transaction with `id` is still registered.
	pub fn is_active(&self, id: TxnId) -> bool {
		self.state.lock().active.contains_key(&id)
	}

	/// Number of batches awaiting destruction.
	pub fn pending_batches(&self) -> usize {
		self.state.lock().batches.len()
	}

	/// Number of retired values awaiting destruction.
	pub fn pending_values(&self) -> usize {
		self.state.lock().pending_values
	}
}

impl Default for EpochReclaimer {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for EpochReclaimer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock();
		f.debug_struct("EpochReclaimer")
			.field("active_transactions", &state.active.len())
			.field("pending_batches", &state.batches.len())
			.field("pending_values", &state.pending_values)
			.finish()
	}
}

/// Destroy retired values. A panicking destructor is logged and skipped so
/// one bad value cannot take down the thread that happens to reclaim it.
fn finalize(garbage: Vec<Garbage>) {
	let mut failures = 0usize;
	for value in garbage {
		if panic::catch_unwind(AssertUnwindSafe(move || drop(value))).is_err() {
			failures += 1;
		}
	}
	if failures > 0 {
		tracing::warn!(failures, "destructor panicked while reclaiming retired values");
	}
}

/// A registered unit of work.
///
/// While a `Transaction` is alive, values read from caches sharing its
/// reclaimer stay valid even if they are replaced, invalidated or demoted
/// concurrently. References handed out by a cache borrow the transaction, so
/// they cannot outlive it:
///
/// ```compile_fail
/// use object_stash::{CacheBuilder, Created, EpochReclaimer, ValueFactory, BoxError};
/// use std::sync::Arc;
///
/// struct Square;
/// impl ValueFactory<u64, u64> for Square {
///     fn create(&self, key: &u64) -> Result<Created<u64>, BoxError> {
///         Ok(Created::new(key * key))
///     }
///     fn compress(&self, value: &u64) -> Result<Option<bytes::Bytes>, BoxError> {
///         Ok(Some(bytes::Bytes::copy_from_slice(&value.to_le_bytes())))
///     }
///     fn uncompress(&self, blob: &[u8]) -> Result<u64, BoxError> {
///         Ok(u64::from_le_bytes(blob.try_into()?))
///     }
/// }
///
/// let reclaimer = Arc::new(EpochReclaimer::new());
/// let cache = CacheBuilder::new(4).build(Square, Arc::clone(&reclaimer));
/// let value = {
///     let txn = reclaimer.begin_transaction();
///     cache.get(&txn, &3).unwrap()
/// };
/// assert_eq!(*value, 9);
/// ```
#[must_use = "a transaction ends as soon as it is dropped"]
pub struct Transaction {
	id: TxnId,
	reclaimer: Arc<EpochReclaimer>,
}

impl Transaction {
	/// Identifier of this transaction.
	pub fn id(&self) -> TxnId {
		self.id
	}

	/// The reclaimer this transaction is registered with.
	pub fn reclaimer(&self) -> &Arc<EpochReclaimer> {
		&self.reclaimer
	}

	/// End the transaction now.
	pub fn end(self) {}
}

impl Drop for Transaction {
	fn drop(&mut self) {
		self.reclaimer.finish(self.id);
	}
}

impl std::fmt::Debug for Transaction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transaction").field("id", &self.id).finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	/// Counts its own destruction.
	struct Tracked(Arc<AtomicUsize>);

	impl Drop for Tracked {
		fn drop(&mut self) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	struct Exploding;

	impl Drop for Exploding {
		fn drop(&mut self) {
			panic!("destructor failure");
		}
	}

	#[test]
	fn test_transaction_ids_increase() {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let a = reclaimer.begin_transaction();
		let b = reclaimer.begin_transaction();

		assert!(b.id() > a.id());
		assert_eq!(reclaimer.active_transactions(), 2);
		assert!(reclaimer.is_active(a.id()));

		let id = a.id();
		reclaimer.end_transaction(a);
		assert!(!reclaimer.is_active(id));
		assert_eq!(reclaimer.active_transactions(), 1);
		b.end();
		assert_eq!(reclaimer.active_transactions(), 0);
	}

	#[test]
	fn test_retire_without_transactions_destroys_immediately() {
		let reclaimer = EpochReclaimer::new();
		let drops = Arc::new(AtomicUsize::new(0));

		reclaimer.retire_values(vec![Tracked(drops.clone()), Tracked(drops.clone())]);

		assert_eq!(drops.load(Ordering::SeqCst), 2);
		assert_eq!(reclaimer.pending_batches(), 0);
		assert_eq!(reclaimer.pending_values(), 0);
	}

	#[test]
	fn test_batch_waits_for_every_snapshot_member() {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let drops = Arc::new(AtomicUsize::new(0));

		let first = reclaimer.begin_transaction();
		let second = reclaimer.begin_transaction();
		reclaimer.retire_values(vec![Tracked(drops.clone())]);
		assert_eq!(reclaimer.pending_batches(), 1);

		first.end();
		assert_eq!(drops.load(Ordering::SeqCst), 0);

		second.end();
		assert_eq!(drops.load(Ordering::SeqCst), 1);
		assert_eq!(reclaimer.pending_batches(), 0);
	}

	#[test]
	fn test_later_transactions_do_not_hold_back_batches() {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let drops = Arc::new(AtomicUsize::new(0));

		let early = reclaimer.begin_transaction();
		reclaimer.retire_values(vec![Tracked(drops.clone())]);
		let late = reclaimer.begin_transaction();

		early.end();
		assert_eq!(drops.load(Ordering::SeqCst), 1);
		late.end();
		assert_eq!(reclaimer.pending_values(), 0);
	}

	#[test]
	fn test_batches_finalize_independently() {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let drops = Arc::new(AtomicUsize::new(0));

		let a = reclaimer.begin_transaction();
		reclaimer.retire_values(vec![Tracked(drops.clone())]);
		let b = reclaimer.begin_transaction();
		reclaimer.retire_values(vec![Tracked(drops.clone()), Tracked(drops.clone())]);
		assert_eq!(reclaimer.pending_batches(), 2);
		assert_eq!(reclaimer.pending_values(), 3);

		// the second batch still waits on `a`
		b.end();
		assert_eq!(drops.load(Ordering::SeqCst), 0);

		a.end();
		assert_eq!(drops.load(Ordering::SeqCst), 3);
		assert_eq!(reclaimer.pending_batches(), 0);
	}

	#[test]
	fn test_panicking_destructor_is_swallowed() {
		let reclaimer = EpochReclaimer::new();
		let drops = Arc::new(AtomicUsize::new(0));

		reclaimer.retire(vec![
			Box::new(Tracked(drops.clone())) as Garbage,
			Box::new(Exploding),
			Box::new(Tracked(drops.clone())),
		]);

		assert_eq!(drops.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn test_ending_on_another_thread() {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let drops = Arc::new(AtomicUsize::new(0));

		let txn = reclaimer.begin_transaction();
		reclaimer.retire_values(vec![Tracked(drops.clone())]);

		std::thread::spawn(move || txn.end()).join().expect("thread should not panic");
		assert_eq!(drops.load(Ordering::SeqCst), 1);
	}
}

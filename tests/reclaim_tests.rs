//! Retired cache values must outlive every transaction that could still see
//! them, and no longer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use bytes::Bytes;
use object_stash::{BoxError, CacheBuilder, Created, EpochReclaimer, ValueFactory};
use proptest::prelude::*;

/// Fare record that reports its own destruction.
struct Fare {
	cents: u64,
	drops: Arc<AtomicUsize>,
}

impl Drop for Fare {
	fn drop(&mut self) {
		self.drops.fetch_add(1, Ordering::SeqCst);
	}
}

struct Fares {
	drops: Arc<AtomicUsize>,
}

impl ValueFactory<u64, Fare> for Fares {
	fn create(&self, key: &u64) -> Result<Created<Fare>, BoxError> {
		Ok(Created::new(Fare {
			cents: key * 100,
			drops: Arc::clone(&self.drops),
		}))
	}

	fn compress(&self, value: &Fare) -> Result<Option<Bytes>, BoxError> {
		Ok(Some(Bytes::copy_from_slice(&value.cents.to_le_bytes())))
	}

	fn uncompress(&self, blob: &[u8]) -> Result<Fare, BoxError> {
		Ok(Fare {
			cents: u64::from_le_bytes(blob.try_into()?),
			drops: Arc::clone(&self.drops),
		})
	}
}

fn setup(hot: usize, batch: usize) -> (Arc<EpochReclaimer>, object_stash::CompressedCache<u64, Fare, Fares>, Arc<AtomicUsize>) {
	let drops = Arc::new(AtomicUsize::new(0));
	let reclaimer = Arc::new(EpochReclaimer::new());
	let cache = CacheBuilder::new(hot).retire_batch(batch).build(
		Fares {
			drops: Arc::clone(&drops),
		},
		Arc::clone(&reclaimer),
	);
	(reclaimer, cache, drops)
}

#[test]
fn test_replaced_value_survives_open_transaction() {
	let (reclaimer, cache, drops) = setup(4, 1);
	let txn = reclaimer.begin_transaction();

	let old = cache.get(&txn, &5).expect("build");
	cache.put(
		5,
		Fare {
			cents: 1,
			drops: Arc::clone(&drops),
		},
	);

	assert_eq!(old.cents, 500);
	assert_eq!(drops.load(Ordering::SeqCst), 0);

	txn.end();
	assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_retire_without_transactions_is_synchronous() {
	let (reclaimer, cache, drops) = setup(4, 1);
	{
		let txn = reclaimer.begin_transaction();
		cache.get(&txn, &1).expect("build");
	}

	assert!(cache.invalidate(&1));
	assert_eq!(drops.load(Ordering::SeqCst), 1);
	assert_eq!(reclaimer.pending_batches(), 0);
}

#[test]
fn test_demoted_value_stays_readable() {
	let (reclaimer, cache, drops) = setup(1, 1);
	let txn = reclaimer.begin_transaction();

	let first = cache.get(&txn, &1).expect("build");
	cache.get(&txn, &2).expect("build");
	assert_eq!(cache.cold_len(), 1);

	assert_eq!(first.cents, 100);
	assert_eq!(drops.load(Ordering::SeqCst), 0);
	drop(txn);
	assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transaction_started_after_retirement_does_not_delay_it() {
	let (reclaimer, cache, drops) = setup(4, 1);
	let early = reclaimer.begin_transaction();
	cache.get(&early, &1).expect("build");
	assert!(cache.invalidate(&1));

	let late = reclaimer.begin_transaction();
	early.end();
	assert_eq!(drops.load(Ordering::SeqCst), 1);
	late.end();
}

#[test]
fn test_dropping_cache_defers_to_live_readers() {
	let (reclaimer, cache, drops) = setup(4, 100);
	let txn = reclaimer.begin_transaction();
	let cents = {
		let fare = cache.get(&txn, &3).expect("build");
		fare.cents
	};

	drop(cache);
	assert_eq!(cents, 300);
	assert_eq!(drops.load(Ordering::SeqCst), 0);
	assert_eq!(reclaimer.pending_values(), 1);

	txn.end();
	assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_batching_defers_handoff_until_flush() {
	let (reclaimer, cache, drops) = setup(4, 8);
	let txn = reclaimer.begin_transaction();
	for key in 0..3 {
		cache.get(&txn, &key).expect("build");
		cache.invalidate(&key);
	}
	assert_eq!(cache.queued_retirements(), 3);
	drop(txn);

	// nothing was handed over while the transaction ran
	assert_eq!(drops.load(Ordering::SeqCst), 0);
	cache.flush_retired();
	assert_eq!(drops.load(Ordering::SeqCst), 3);
}

#[test]
fn test_threads_hold_values_across_replacements() {
	const READERS: usize = 4;
	let (reclaimer, cache, drops) = setup(2, 4);
	let cache = Arc::new(cache);
	let barrier = Arc::new(Barrier::new(READERS + 1));

	let readers: Vec<_> = (0..READERS)
		.map(|_| {
			let cache = Arc::clone(&cache);
			let reclaimer = Arc::clone(&reclaimer);
			let barrier = Arc::clone(&barrier);
			thread::spawn(move || {
				barrier.wait();
				for _ in 0..100 {
					let txn = reclaimer.begin_transaction();
					let fare = cache.get(&txn, &7).expect("lookup");
					let cents = fare.cents;
					thread::yield_now();
					// the reference stays valid and unchanged within the transaction
					assert_eq!(fare.cents, cents);
					assert!(cents == 700 || cents == 1);
				}
			})
		})
		.collect();

	barrier.wait();
	for _ in 0..100 {
		cache.put(
			7,
			Fare {
				cents: 1,
				drops: Arc::clone(&drops),
			},
		);
		cache.invalidate(&7);
	}

	for reader in readers {
		reader.join().expect("reader should not panic");
	}
	drop(cache);
	assert_eq!(reclaimer.active_transactions(), 0);
	assert_eq!(reclaimer.pending_values(), 0);
}

proptest! {
	#[test]
	fn test_value_outlives_every_overlapping_transaction(before in 1usize..5, after in 0usize..5) {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let drops = Arc::new(AtomicUsize::new(0));

		let overlapping: Vec<_> = (0..before).map(|_| reclaimer.begin_transaction()).collect();
		reclaimer.retire_values(vec![Fare { cents: 0, drops: Arc::clone(&drops) }]);
		let later: Vec<_> = (0..after).map(|_| reclaimer.begin_transaction()).collect();

		for (ended, txn) in overlapping.into_iter().enumerate() {
			prop_assert_eq!(drops.load(Ordering::SeqCst), 0, "destroyed after {} of {} ends", ended, before);
			txn.end();
		}
		prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
		drop(later);
		prop_assert_eq!(reclaimer.pending_batches(), 0);
	}
}

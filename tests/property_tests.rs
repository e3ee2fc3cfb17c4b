use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use object_stash::{
	BoxError, CacheBuilder, Created, DedupPool, EpochReclaimer, RemoteStatus, ResponseHeader, Shared, ValueFactory,
};
use proptest::prelude::*;

/// Stores values as their little-endian bytes.
struct Words;

impl ValueFactory<u16, u64> for Words {
	fn create(&self, key: &u16) -> Result<Created<u64>, BoxError> {
		Ok(Created::new(u64::from(*key) * 1_000_003))
	}

	fn compress(&self, value: &u64) -> Result<Option<Bytes>, BoxError> {
		Ok(Some(Bytes::copy_from_slice(&value.to_le_bytes())))
	}

	fn uncompress(&self, blob: &[u8]) -> Result<u64, BoxError> {
		Ok(u64::from_le_bytes(blob.try_into()?))
	}
}

fn status() -> impl Strategy<Value = RemoteStatus> {
	(0u64..15).prop_map(|code| RemoteStatus::from_code(code).expect("codes 0..15 are known"))
}

proptest! {
	#[test]
	fn test_dedup_uniqueness(values in prop::collection::vec("[a-d]{0,2}", 1..60)) {
		let pool = DedupPool::new();
		let mut expected: HashMap<String, usize> = HashMap::new();

		for value in &values {
			pool.insert(value.clone());
			*expected.entry(value.clone()).or_default() += 1;
		}

		prop_assert_eq!(pool.len(), expected.len());
		prop_assert_eq!(pool.total_usage_count(), values.len());
		for (value, count) in &expected {
			prop_assert_eq!(pool.usage_count(value), *count);
		}
	}

	#[test]
	fn test_balanced_erase(values in prop::collection::vec(0u8..8, 1..40)) {
		let pool = DedupPool::new();
		let handles: Vec<Arc<u8>> = values.iter().map(|value| pool.insert(*value)).collect();

		for handle in &handles {
			prop_assert!(pool.erase(handle));
		}
		prop_assert!(pool.is_empty());
		prop_assert_eq!(pool.total_usage_count(), 0);
		prop_assert!(!pool.erase(&handles[0]));
	}

	#[test]
	fn test_shared_handles_release_their_uses(values in prop::collection::vec(0u32..5, 0..30), keep in 0usize..30) {
		let pool = Arc::new(DedupPool::new());
		let mut handles: Vec<Shared<u32>> = values.iter().map(|value| Shared::new_in(&pool, *value)).collect();
		handles.truncate(keep);

		prop_assert_eq!(pool.total_usage_count(), handles.len());
		drop(handles);
		prop_assert!(pool.is_empty());
	}

	#[test]
	fn test_hot_capacity_bound(hot in 1usize..6, keys in prop::collection::vec(0u16..40, 1..80)) {
		let reclaimer = Arc::new(EpochReclaimer::new());
		let cache = CacheBuilder::new(hot).build(Words, Arc::clone(&reclaimer));
		let txn = reclaimer.begin_transaction();

		for key in &keys {
			let value = cache.get(&txn, key).expect("lookup");
			prop_assert_eq!(*value, u64::from(*key) * 1_000_003);
			prop_assert!(cache.hot_len() <= hot);
		}
		// entries beyond the hot bound are all compressed
		prop_assert_eq!(cache.hot_len() + cache.cold_len(), cache.len());
	}

	#[test]
	fn test_total_capacity_bound(hot in 1usize..4, extra in 0usize..4, keys in prop::collection::vec(0u16..40, 1..80)) {
		let total = hot + extra;
		let reclaimer = Arc::new(EpochReclaimer::new());
		let cache = CacheBuilder::new(hot).total_capacity(total).build(Words, Arc::clone(&reclaimer));
		let txn = reclaimer.begin_transaction();

		for key in &keys {
			cache.get(&txn, key).expect("lookup");
			prop_assert!(cache.len() <= total);
		}
	}

	#[test]
	fn test_header_round_trip(
		status in status(),
		version in 0u32..10_000,
		payload_len in 0u64..100_000_000_000,
		inflated_len in prop_oneof![Just(0u64), 0u64..100_000_000_000],
	) {
		let header = ResponseHeader { status, version, payload_len, inflated_len };
		let bytes = header.encode().expect("fields fit");
		prop_assert_eq!(ResponseHeader::decode(&bytes).expect("valid header"), header);
	}
}

//! Exact LRU ordering for the cache tiers.
//!
//! Each access stamps an entry with a fresh, strictly increasing tick from a
//! counter shared by both tiers. A tier keeps its members ordered by stamp, so
//! the front is always the least recently used entry and ties cannot occur.

use std::collections::BTreeMap;

/// Which recency list an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
	/// Entries holding an inflated value.
	Hot,
	/// Entries holding only compressed bytes.
	Cold,
}

/// Position of an entry: its tier and its current stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Position {
	pub tier: Tier,
	pub stamp: u64,
}

pub(crate) struct RecencyList<K> {
	order: BTreeMap<u64, K>,
}

impl<K> RecencyList<K> {
	pub fn new() -> Self {
		Self {
			order: BTreeMap::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	#[cfg(test)]
	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}

	/// Append `key` as the most recently used member.
	pub fn push_back(&mut self, stamp: u64, key: K) {
		let previous = self.order.insert(stamp, key);
		debug_assert!(previous.is_none(), "recency stamps must be unique");
	}

	pub fn remove(&mut self, stamp: u64) -> Option<K> {
		self.order.remove(&stamp)
	}

	/// Least recently used member.
	pub fn front(&self) -> Option<(u64, &K)> {
		self.order.first_key_value().map(|(stamp, key)| (*stamp, key))
	}

	pub fn clear(&mut self) {
		self.order.clear();
	}

	/// Members from least to most recently used.
	#[cfg(test)]
	pub fn keys(&self) -> impl Iterator<Item = &K> {
		self.order.values()
	}
}

//! Owning handle for values that may live in a [`DedupPool`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use deepsize::{Context, DeepSizeOf};

use crate::pool::DedupPool;

enum Ownership<T: Hash + Eq> {
	/// One registered use of a canonical value owned by `pool`.
	PoolOwned { pool: Arc<DedupPool<T>>, value: Arc<T> },
	/// A value that was never handed to a pool.
	LocallyOwned(Arc<T>),
}

/// A value that is either shared through a [`DedupPool`] or owned locally.
///
/// Dropping a pool-owned handle releases its use in the pool. If the pool no
/// longer tracks the value (for instance because it was erased by hand), the
/// handle simply drops its own reference instead.
///
/// Cloning a pool-owned handle registers one more use, so every clone is
/// released independently.
///
/// # Example
///
/// ```
/// use object_stash::{DedupPool, Shared};
/// use std::sync::Arc;
///
/// let pool = Arc::new(DedupPool::new());
/// let a = Shared::new_in(&pool, vec![1u16, 2, 3]);
/// let b = Shared::new_in(&pool, vec![1u16, 2, 3]);
///
/// assert!(Shared::ptr_eq(&a, &b));
/// assert_eq!(pool.usage_count(&a), 2);
///
/// drop(a);
/// drop(b);
/// assert!(pool.is_empty());
/// ```
pub struct Shared<T: Hash + Eq> {
	ownership: Ownership<T>,
}

impl<T: Hash + Eq> Shared<T> {
	/// Offer `value` to `pool` and hold one use of the canonical instance.
	pub fn new_in(pool: &Arc<DedupPool<T>>, value: T) -> Self {
		let value = pool.insert(value);
		Self {
			ownership: Ownership::PoolOwned {
				pool: Arc::clone(pool),
				value,
			},
		}
	}

	/// Wrap a value without sharing it.
	pub fn local(value: T) -> Self {
		Self {
			ownership: Ownership::LocallyOwned(Arc::new(value)),
		}
	}

	/// Whether this handle holds a use registered in a pool.
	pub fn is_pooled(&self) -> bool {
		matches!(self.ownership, Ownership::PoolOwned { .. })
	}

	/// Whether both handles point at the same physical value.
	pub fn ptr_eq(this: &Self, other: &Self) -> bool {
		Arc::ptr_eq(this.arc(), other.arc())
	}

	fn arc(&self) -> &Arc<T> {
		match &self.ownership {
			Ownership::PoolOwned { value, .. } => value,
			Ownership::LocallyOwned(value) => value,
		}
	}
}

impl<T: Hash + Eq> Drop for Shared<T> {
	fn drop(&mut self) {
		if let Ownership::PoolOwned { pool, value } = &self.ownership {
			if !pool.erase(value) {
				tracing::debug!(
					value_type = std::any::type_name::<T>(),
					"shared value no longer tracked by its pool; dropping locally"
				);
			}
		}
	}
}

impl<T: Hash + Eq> Clone for Shared<T> {
	fn clone(&self) -> Self {
		let ownership = match &self.ownership {
			Ownership::PoolOwned { pool, value } => Ownership::PoolOwned {
				pool: Arc::clone(pool),
				value: pool.insert_arc(Arc::clone(value)),
			},
			Ownership::LocallyOwned(value) => Ownership::LocallyOwned(Arc::clone(value)),
		};
		Self { ownership }
	}
}

impl<T: Hash + Eq> Deref for Shared<T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.arc()
	}
}

impl<T: Hash + Eq> PartialEq for Shared<T> {
	fn eq(&self, other: &Self) -> bool {
		Shared::ptr_eq(self, other) || **self == **other
	}
}

impl<T: Hash + Eq> Eq for Shared<T> {}

impl<T: Hash + Eq> Hash for Shared<T> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(**self).hash(state);
	}
}

impl<T: Hash + Eq + fmt::Debug> fmt::Debug for Shared<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Shared").field("pooled", &self.is_pooled()).field("value", &**self).finish()
	}
}

/// Pool-owned payloads are accounted for by the pool, so only locally-owned
/// values contribute their heap size here.
impl<T: Hash + Eq + DeepSizeOf> DeepSizeOf for Shared<T> {
	fn deep_size_of_children(&self, context: &mut Context) -> usize {
		match &self.ownership {
			Ownership::PoolOwned { .. } => 0,
			Ownership::LocallyOwned(value) => value.deep_size_of_children(context),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Hash, PartialEq, Eq, Debug, Clone, DeepSizeOf)]
	struct RuleFragment {
		carrier: String,
		priority: u16,
	}

	fn fragment(carrier: &str) -> RuleFragment {
		RuleFragment {
			carrier: carrier.to_string(),
			priority: 1,
		}
	}

	#[test]
	fn test_pooled_handles_share_one_value() {
		let pool = Arc::new(DedupPool::new());
		let a = Shared::new_in(&pool, fragment("AC"));
		let b = Shared::new_in(&pool, fragment("AC"));

		assert!(a.is_pooled());
		assert!(Shared::ptr_eq(&a, &b));
		assert_eq!(pool.usage_count(&fragment("AC")), 2);

		drop(a);
		assert_eq!(pool.usage_count(&fragment("AC")), 1);
		drop(b);
		assert!(pool.is_empty());
	}

	#[test]
	fn test_clone_registers_another_use() {
		let pool = Arc::new(DedupPool::new());
		let a = Shared::new_in(&pool, fragment("LH"));
		let b = a.clone();

		assert!(Shared::ptr_eq(&a, &b));
		assert_eq!(pool.usage_count(&a), 2);
		drop(a);
		drop(b);
		assert_eq!(pool.total_usage_count(), 0);
	}

	#[test]
	fn test_drop_after_manual_erase_falls_back_to_local_drop() {
		let pool = Arc::new(DedupPool::new());
		let a = Shared::new_in(&pool, fragment("BA"));

		assert!(pool.erase(&a));
		assert!(pool.is_empty());
		assert_eq!(a.carrier, "BA");
		// erase reports "not tracked"; the handle releases its own reference
		drop(a);
		assert!(pool.is_empty());
	}

	#[test]
	fn test_local_handles_are_independent() {
		let a = Shared::local(fragment("QF"));
		let b = Shared::local(fragment("QF"));

		assert!(!a.is_pooled());
		assert!(!Shared::ptr_eq(&a, &b));
		assert_eq!(a, b);
		assert!(Shared::ptr_eq(&a, &a.clone()));
	}

	#[test]
	fn test_deep_size_skips_pool_owned_payload() {
		let pool = Arc::new(DedupPool::new());
		let pooled = Shared::new_in(&pool, fragment("a-long-carrier-name"));
		let local = Shared::local(fragment("a-long-carrier-name"));

		assert_eq!(pooled.deep_size_of(), std::mem::size_of::<Shared<RuleFragment>>());
		assert!(local.deep_size_of() > pooled.deep_size_of());
	}
}

//! Explicit context object holding one [`DedupPool`] per value type.

use std::any::{Any, TypeId};
use std::hash::Hash;
use std::sync::Arc;

use deepsize::DeepSizeOf;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::pool::{DedupPool, PoolSummary};
use crate::shared::Shared;

/// Type-erased view of a pool used for diagnostics.
trait PoolDiagnostics: Send + Sync {
	fn summary(&self) -> PoolSummary;
}

impl<T> PoolDiagnostics for DedupPool<T>
where
	T: Hash + Eq + DeepSizeOf + Send + Sync,
{
	fn summary(&self) -> PoolSummary {
		DedupPool::summary(self)
	}
}

struct Registered {
	/// Holds an `Arc<DedupPool<T>>`.
	pool: Box<dyn Any + Send + Sync>,
	diagnostics: Arc<dyn PoolDiagnostics>,
}

/// Registry of deduplication pools, keyed by value type.
///
/// Pools are created lazily on first use and live as long as the registry
/// (or any handle into them). Pass the registry to whatever builds shared
/// values instead of relying on process-wide statics.
///
/// ```
/// use object_stash::PoolRegistry;
///
/// let registry = PoolRegistry::new();
/// let a = registry.share(String::from("NUC-1"));
/// let b = registry.share(String::from("NUC-1"));
///
/// assert!(object_stash::Shared::ptr_eq(&a, &b));
/// assert_eq!(registry.pool::<String>().len(), 1);
/// ```
#[derive(Default)]
pub struct PoolRegistry {
	pools: Mutex<HashMap<TypeId, Registered>>,
}

impl PoolRegistry {
	/// Create an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// The pool for values of type `T`, created on first request.
	pub fn pool<T>(&self) -> Arc<DedupPool<T>>
	where
		T: Hash + Eq + DeepSizeOf + Send + Sync + 'static,
	{
		let mut pools = self.pools.lock();
		if let Some(existing) = pools
			.get(&TypeId::of::<T>())
			.and_then(|registered| registered.pool.downcast_ref::<Arc<DedupPool<T>>>())
		{
			return Arc::clone(existing);
		}

		let pool = Arc::new(DedupPool::<T>::new());
		tracing::debug!(value_type = std::any::type_name::<T>(), "registered dedup pool");
		pools.insert(
			TypeId::of::<T>(),
			Registered {
				pool: Box::new(Arc::clone(&pool)),
				diagnostics: pool.clone(),
			},
		);
		pool
	}

	/// Share `value` through the pool for its type.
	pub fn share<T>(&self, value: T) -> Shared<T>
	where
		T: Hash + Eq + DeepSizeOf + Send + Sync + 'static,
	{
		Shared::new_in(&self.pool::<T>(), value)
	}

	/// Number of registered pools.
	pub fn len(&self) -> usize {
		self.pools.lock().len()
	}

	/// Whether no pool has been registered yet.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Diagnostic summary of every registered pool, ordered by type name.
	pub fn summaries(&self) -> Vec<PoolSummary> {
		// Summaries lock each pool; collect the handles first so the registry
		// lock is not held across them.
		let diagnostics: Vec<_> =
			self.pools.lock().values().map(|registered| Arc::clone(&registered.diagnostics)).collect();
		let mut summaries: Vec<_> = diagnostics.iter().map(|pool| pool.summary()).collect();
		summaries.sort_by(|a, b| a.type_name.cmp(b.type_name));
		summaries
	}
}

impl std::fmt::Debug for PoolRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PoolRegistry").field("pools", &self.len()).finish()
	}
}

//! How the cache obtains values and their compressed forms.

use bytes::Bytes;

use crate::error::BoxError;

/// A freshly built value, optionally with its compressed form.
#[derive(Debug, Clone, PartialEq)]
pub struct Created<V> {
	/// The inflated value.
	pub value: V,
	/// Compressed bytes, if building the value produced them anyway.
	/// `None` means the value is compressed on its first demotion.
	pub compressed: Option<Bytes>,
}

impl<V> Created<V> {
	/// A value with no precompressed form.
	pub fn new(value: V) -> Self {
		Self {
			value,
			compressed: None,
		}
	}

	/// A value together with its compressed form.
	pub fn with_compressed(value: V, compressed: Bytes) -> Self {
		Self {
			value,
			compressed: Some(compressed),
		}
	}
}

/// Builds, compresses and restores the values held by a
/// [`CompressedCache`](crate::CompressedCache).
///
/// Every method is called with no cache lock held, so implementations are
/// free to perform I/O. `compress` and `uncompress` must round-trip:
/// `uncompress(compress(v)) == v` for every value `create` produces.
pub trait ValueFactory<K, V>: Send + Sync {
	/// Build the value for `key`.
	fn create(&self, key: &K) -> Result<Created<V>, BoxError>;

	/// Compress `value`. `Ok(None)` means the value cannot be kept in
	/// compressed form; such entries are dropped instead of demoted.
	fn compress(&self, value: &V) -> Result<Option<Bytes>, BoxError>;

	/// Rebuild a value from bytes produced by [`compress`](Self::compress)
	/// or by [`create`](Self::create).
	fn uncompress(&self, blob: &[u8]) -> Result<V, BoxError>;

	/// Dispose of a value the cache built but never published, such as a
	/// decompressed duplicate that lost a race.
	fn destroy(&self, key: &K, value: V) {
		let _ = key;
		drop(value);
	}
}

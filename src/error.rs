//! Error types shared by the pool, the cache and the wire header.

use std::sync::Arc;

use thiserror::Error;

/// Error type returned by external collaborators (value factories, codecs).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the caching core.
///
/// Misses are never errors: lookups report them through `Option` or `bool`.
/// The type is `Clone` so that a single factory failure can be delivered to
/// every caller that was waiting on the same in-flight build.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// The value factory failed to create, compress or uncompress a value.
	#[error("value factory failed: {0}")]
	Factory(Arc<dyn std::error::Error + Send + Sync>),

	/// The value factory panicked while building an entry.
	#[error("value factory panicked while building an entry")]
	FactoryPanicked,

	/// A transaction registered with a different reclaimer was used to read
	/// from a cache.
	#[error("transaction {0} is not registered with this cache's reclaimer")]
	ForeignTransaction(u64),

	/// A header buffer was shorter than the fixed header length.
	#[error("remote cache header too short: expected {expected} bytes, got {actual}")]
	HeaderTruncated { expected: usize, actual: usize },

	/// A header field held something other than NUL-padded decimal digits.
	#[error("remote cache header field `{field}` is not a NUL-padded decimal number")]
	HeaderMalformed { field: &'static str },

	/// A value does not fit in its fixed-width header field.
	#[error("value {value} does not fit in the {width}-digit header field `{field}`")]
	HeaderOverflow {
		field: &'static str,
		value: u64,
		width: usize,
	},

	/// A header carried a status code outside the known set.
	#[error("unknown remote cache status code {0}")]
	UnknownStatus(u64),
}

impl Error {
	/// Wrap an error raised by a value factory.
	pub fn factory(err: BoxError) -> Self {
		Error::Factory(Arc::from(err))
	}

	/// Returns `true` if the error came from (or while running) the factory.
	pub fn is_factory(&self) -> bool {
		matches!(self, Error::Factory(_) | Error::FactoryPanicked)
	}
}

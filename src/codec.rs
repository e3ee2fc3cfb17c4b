//! Byte codecs and a [`ValueFactory`] assembled from one.
//!
//! [`CodecFactory`] covers the common case where values are serializable:
//! the value is rendered with `serde_json` and the resulting bytes are run
//! through a [`Codec`].
//!
//! ```
//! use object_stash::{CacheBuilder, CodecFactory, EpochReclaimer, Lz4Codec};
//! use std::sync::Arc;
//!
//! let factory = CodecFactory::new(Lz4Codec::default(), |route: &String| {
//!     Ok::<_, object_stash::BoxError>(vec![route.clone(); 3])
//! });
//! let reclaimer = Arc::new(EpochReclaimer::new());
//! let cache = CacheBuilder::new(1).build(factory, Arc::clone(&reclaimer));
//!
//! let txn = reclaimer.begin_transaction();
//! cache.get(&txn, &String::from("LHR-JFK")).unwrap();
//! cache.get(&txn, &String::from("CDG-SFO")).unwrap(); // demotes LHR-JFK
//! assert_eq!(cache.get(&txn, &String::from("LHR-JFK")).unwrap()[0], "LHR-JFK");
//! ```

use std::marker::PhantomData;

use bytes::Bytes;
use lz4::block::CompressionMode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BoxError;
use crate::factory::{Created, ValueFactory};

/// A reversible byte transform.
pub trait Codec: Send + Sync {
	/// Short name for diagnostics.
	fn name(&self) -> &'static str;

	fn compress(&self, data: &[u8]) -> Result<Bytes, BoxError>;

	fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, BoxError>;
}

/// Pass-through codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCodec;

impl Codec for NoopCodec {
	fn name(&self) -> &'static str {
		"none"
	}

	fn compress(&self, data: &[u8]) -> Result<Bytes, BoxError> {
		Ok(Bytes::copy_from_slice(data))
	}

	fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
		Ok(data.to_vec())
	}
}

/// LZ4 block compression. Output carries the uncompressed length as a
/// prefix, so decompression needs no side channel.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Codec {
	level: Option<i32>,
}

impl Lz4Codec {
	/// Fast mode.
	pub fn new() -> Self {
		Self {
			level: None,
		}
	}

	/// High-compression mode at `level`.
	pub fn with_level(level: i32) -> Self {
		Self {
			level: Some(level),
		}
	}
}

impl Default for Lz4Codec {
	fn default() -> Self {
		Self::new()
	}
}

impl Codec for Lz4Codec {
	fn name(&self) -> &'static str {
		"lz4"
	}

	fn compress(&self, data: &[u8]) -> Result<Bytes, BoxError> {
		let mode = self.level.map(CompressionMode::HIGHCOMPRESSION);
		let compressed = lz4::block::compress(data, mode, true)?;
		Ok(Bytes::from(compressed))
	}

	fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
		Ok(lz4::block::decompress(data, None)?)
	}
}

/// A [`ValueFactory`] that builds values with a closure and stores them as
/// codec-compressed JSON.
pub struct CodecFactory<K, V, C, B> {
	codec: C,
	build: B,
	eager: bool,
	_marker: PhantomData<fn(&K) -> V>,
}

impl<K, V, C, B> CodecFactory<K, V, C, B>
where
	V: Serialize + DeserializeOwned,
	C: Codec,
	B: Fn(&K) -> Result<V, BoxError> + Send + Sync,
{
	pub fn new(codec: C, build: B) -> Self {
		Self {
			codec,
			build,
			eager: false,
			_marker: PhantomData,
		}
	}

	/// Compress every value as soon as it is built, so its first demotion
	/// costs nothing.
	pub fn eager(mut self, eager: bool) -> Self {
		self.eager = eager;
		self
	}

	pub fn codec(&self) -> &C {
		&self.codec
	}

	fn encode(&self, value: &V) -> Result<Bytes, BoxError> {
		let json = serde_json::to_vec(value)?;
		self.codec.compress(&json)
	}
}

impl<K, V, C, B> ValueFactory<K, V> for CodecFactory<K, V, C, B>
where
	V: Serialize + DeserializeOwned,
	C: Codec,
	B: Fn(&K) -> Result<V, BoxError> + Send + Sync,
{
	fn create(&self, key: &K) -> Result<Created<V>, BoxError> {
		let value = (self.build)(key)?;
		if self.eager {
			let compressed = self.encode(&value)?;
			Ok(Created::with_compressed(value, compressed))
		} else {
			Ok(Created::new(value))
		}
	}

	fn compress(&self, value: &V) -> Result<Option<Bytes>, BoxError> {
		self.encode(value).map(Some)
	}

	fn uncompress(&self, blob: &[u8]) -> Result<V, BoxError> {
		let json = self.codec.decompress(blob)?;
		Ok(serde_json::from_slice(&json)?)
	}
}

impl<K, V, C: Codec, B> std::fmt::Debug for CodecFactory<K, V, C, B> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CodecFactory").field("codec", &self.codec.name()).field("eager", &self.eager).finish()
	}
}

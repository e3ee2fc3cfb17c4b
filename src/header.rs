//! Response header of the remote cache protocol.
//!
//! The header is a fixed 30-byte block of four fields. Each field holds a
//! left-aligned ASCII decimal number padded with NUL bytes to its width:
//!
//! | bytes     | field          |
//! |-----------|----------------|
//! | `[0,4)`   | status code    |
//! | `[4,8)`   | format version |
//! | `[8,19)`  | payload length |
//! | `[19,30)` | inflated length (0 for uncompressed payloads) |

use std::fmt;
use std::ops::Range;

use bytes::BufMut;

use crate::error::{Error, Result};

/// Length of an encoded header in bytes.
pub const HEADER_LEN: usize = 30;

const STATUS: Range<usize> = 0..4;
const VERSION: Range<usize> = 4..8;
const PAYLOAD_LEN: Range<usize> = 8..19;
const INFLATED_LEN: Range<usize> = 19..30;

/// Status reported by a remote cache server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RemoteStatus {
	None = 0,
	CompressedValue = 1,
	NotClientOrDisabled = 2,
	ConnectionRefused = 3,
	ReadError = 4,
	WriteError = 5,
	BadRequest = 6,
	NotFound = 7,
	UncompressedValue = 8,
	NotCompressedCache = 9,
	VersionMismatch = 10,
	InternalServerError = 11,
	NotImplemented = 12,
	Timeout = 13,
	Busy = 14,
}

impl RemoteStatus {
	const ALL: [RemoteStatus; 15] = [
		RemoteStatus::None,
		RemoteStatus::CompressedValue,
		RemoteStatus::NotClientOrDisabled,
		RemoteStatus::ConnectionRefused,
		RemoteStatus::ReadError,
		RemoteStatus::WriteError,
		RemoteStatus::BadRequest,
		RemoteStatus::NotFound,
		RemoteStatus::UncompressedValue,
		RemoteStatus::NotCompressedCache,
		RemoteStatus::VersionMismatch,
		RemoteStatus::InternalServerError,
		RemoteStatus::NotImplemented,
		RemoteStatus::Timeout,
		RemoteStatus::Busy,
	];

	/// Numeric wire code.
	pub fn code(self) -> u16 {
		self as u16
	}

	/// Look up a status by its wire code.
	pub fn from_code(code: u64) -> Result<Self> {
		usize::try_from(code)
			.ok()
			.and_then(|index| Self::ALL.get(index).copied())
			.ok_or(Error::UnknownStatus(code))
	}

	/// Whether the response carries a value payload.
	pub fn is_value(self) -> bool {
		matches!(self, RemoteStatus::CompressedValue | RemoteStatus::UncompressedValue)
	}

	/// Whether the payload is compressed.
	pub fn is_compressed(self) -> bool {
		self == RemoteStatus::CompressedValue
	}

	pub fn as_str(self) -> &'static str {
		match self {
			RemoteStatus::None => "none",
			RemoteStatus::CompressedValue => "compressed value",
			RemoteStatus::NotClientOrDisabled => "not a client or disabled",
			RemoteStatus::ConnectionRefused => "connection refused",
			RemoteStatus::ReadError => "read error",
			RemoteStatus::WriteError => "write error",
			RemoteStatus::BadRequest => "bad request",
			RemoteStatus::NotFound => "not found",
			RemoteStatus::UncompressedValue => "uncompressed value",
			RemoteStatus::NotCompressedCache => "not a compressed cache",
			RemoteStatus::VersionMismatch => "version mismatch",
			RemoteStatus::InternalServerError => "internal server error",
			RemoteStatus::NotImplemented => "not implemented",
			RemoteStatus::Timeout => "timeout",
			RemoteStatus::Busy => "busy",
		}
	}
}

impl fmt::Display for RemoteStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Decoded remote cache response header.
///
/// ```
/// use object_stash::{RemoteStatus, ResponseHeader};
///
/// let header = ResponseHeader {
///     status: RemoteStatus::CompressedValue,
///     version: 3,
///     payload_len: 512,
///     inflated_len: 4096,
/// };
/// let bytes = header.encode().unwrap();
/// assert_eq!(&bytes[..6], b"1\0\0\x003\0");
/// assert_eq!(ResponseHeader::decode(&bytes).unwrap(), header);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
	pub status: RemoteStatus,
	pub version: u32,
	pub payload_len: u64,
	/// Size of the payload once uncompressed, 0 when it is sent uncompressed.
	pub inflated_len: u64,
}

impl ResponseHeader {
	/// Header for a payload sent as is.
	pub fn uncompressed(version: u32, payload_len: u64) -> Self {
		Self {
			status: RemoteStatus::UncompressedValue,
			version,
			payload_len,
			inflated_len: 0,
		}
	}

	/// Header for a compressed payload.
	pub fn compressed(version: u32, payload_len: u64, inflated_len: u64) -> Self {
		Self {
			status: RemoteStatus::CompressedValue,
			version,
			payload_len,
			inflated_len,
		}
	}

	/// Header with no payload, reporting `status`.
	pub fn status_only(status: RemoteStatus, version: u32) -> Self {
		Self {
			status,
			version,
			payload_len: 0,
			inflated_len: 0,
		}
	}

	/// Encode into the fixed wire layout.
	///
	/// Fails with [`Error::HeaderOverflow`] if a number has more digits than
	/// its field holds.
	pub fn encode(&self) -> Result<[u8; HEADER_LEN]> {
		let mut out = [0u8; HEADER_LEN];
		put_field(&mut out[STATUS], "status", u64::from(self.status.code()))?;
		put_field(&mut out[VERSION], "version", u64::from(self.version))?;
		put_field(&mut out[PAYLOAD_LEN], "payload_len", self.payload_len)?;
		put_field(&mut out[INFLATED_LEN], "inflated_len", self.inflated_len)?;
		Ok(out)
	}

	/// Encode and append to `buf`.
	pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
		let encoded = self.encode()?;
		buf.put_slice(&encoded);
		Ok(())
	}

	/// Decode the first [`HEADER_LEN`] bytes of `buf`.
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let Some(raw) = buf.get(..HEADER_LEN) else {
			return Err(Error::HeaderTruncated {
				expected: HEADER_LEN,
				actual: buf.len(),
			});
		};

		let status = RemoteStatus::from_code(read_field(&raw[STATUS], "status")?)?;
		let version = read_field(&raw[VERSION], "version")?;
		Ok(Self {
			status,
			version: u32::try_from(version).map_err(|_| Error::HeaderMalformed {
				field: "version",
			})?,
			payload_len: read_field(&raw[PAYLOAD_LEN], "payload_len")?,
			inflated_len: read_field(&raw[INFLATED_LEN], "inflated_len")?,
		})
	}
}

fn put_field(field: &mut [u8], name: &'static str, value: u64) -> Result<()> {
	let digits = value.to_string();
	if digits.len() > field.len() {
		return Err(Error::HeaderOverflow {
			field: name,
			value,
			width: field.len(),
		});
	}
	field[..digits.len()].copy_from_slice(digits.as_bytes());
	Ok(())
}

/// Parse a NUL-padded decimal field. An all-NUL field reads as zero.
fn read_field(field: &[u8], name: &'static str) -> Result<u64> {
	let malformed = || Error::HeaderMalformed {
		field: name,
	};
	let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
	let (digits, padding) = field.split_at(end);
	if padding.iter().any(|&b| b != 0) {
		return Err(malformed());
	}

	digits.iter().try_fold(0u64, |acc, &b| {
		if !b.is_ascii_digit() {
			return Err(malformed());
		}
		acc.checked_mul(10).and_then(|acc| acc.checked_add(u64::from(b - b'0'))).ok_or_else(malformed)
	})
}

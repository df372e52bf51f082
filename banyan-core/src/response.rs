//! The head of an outbound response and its wire form.

// ----------

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// ResponseHead

/// The status line and headers of a response. Defaults to `200 OK` until
/// a handler says otherwise.
#[derive(Debug)]
pub struct ResponseHead {
	status: StatusCode,
	version: Version,
	headers: HeaderMap,
}

impl ResponseHead {
	pub fn new() -> Self {
		Self {
			status: StatusCode::OK,
			version: Version::HTTP_11,
			headers: HeaderMap::new(),
		}
	}

	#[inline(always)]
	pub fn status(&self) -> StatusCode {
		self.status
	}

	#[inline(always)]
	pub fn set_status(&mut self, status: StatusCode) {
		self.status = status;
	}

	#[inline(always)]
	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	#[inline(always)]
	pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
		self.headers.insert(name, value);
	}

	/// Serializes the status line, the headers, and the terminating blank
	/// line. Body framing headers are the caller's responsibility.
	pub fn to_bytes(&self) -> Bytes {
		let version = match self.version {
			Version::HTTP_10 => "HTTP/1.0",
			_ => "HTTP/1.1",
		};

		let mut buffer = BytesMut::with_capacity(128 + self.headers.len() * 32);
		buffer.put_slice(version.as_bytes());
		buffer.put_u8(b' ');
		buffer.put_slice(self.status.as_str().as_bytes());
		buffer.put_u8(b' ');
		buffer.put_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
		buffer.put_slice(b"\r\n");

		for (name, value) in &self.headers {
			buffer.put_slice(name.as_str().as_bytes());
			buffer.put_slice(b": ");
			buffer.put_slice(value.as_bytes());
			buffer.put_slice(b"\r\n");
		}

		buffer.put_slice(b"\r\n");
		buffer.freeze()
	}
}

impl Default for ResponseHead {
	fn default() -> Self {
		Self::new()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

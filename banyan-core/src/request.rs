//! The parsed head of an inbound request.

// ----------

use http::{
	header::{AsHeaderName, CONNECTION, CONTENT_LENGTH, UPGRADE},
	HeaderMap, Method, Version,
};

use crate::http::ConnectionType;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// RequestHead

/// The request line and headers of a request, parsed off the stream
/// before any body byte is consumed.
#[derive(Debug)]
pub struct RequestHead {
	method: Method,
	target: String,
	version: Version,
	headers: HeaderMap,
}

impl RequestHead {
	pub fn new(method: Method, target: impl Into<String>, version: Version, headers: HeaderMap) -> Self {
		Self {
			method,
			target: target.into(),
			version,
			headers,
		}
	}

	#[inline(always)]
	pub fn method(&self) -> &Method {
		&self.method
	}

	/// The raw request target as it appeared on the request line.
	#[inline(always)]
	pub fn target(&self) -> &str {
		&self.target
	}

	#[inline(always)]
	pub fn version(&self) -> Version {
		self.version
	}

	#[inline(always)]
	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Returns the named header as a `str` if it's present and valid UTF-8.
	pub fn header_str(&self, name: impl AsHeaderName) -> Option<&str> {
		self.headers.get(name).and_then(|value| value.to_str().ok())
	}

	/// The declared `Content-Length`. `None` when the header is absent or
	/// not a decimal number.
	pub fn content_length(&self) -> Option<usize> {
		self
			.header_str(CONTENT_LENGTH)
			.and_then(|value| value.trim().parse().ok())
	}

	/// Classifies the request as a plain HTTP exchange or a WebSocket
	/// upgrade.
	pub fn connection_type(&self) -> ConnectionType {
		if self.has_connection_upgrade_token()
			&& self
				.headers
				.get(UPGRADE)
				.is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"))
		{
			return ConnectionType::WebSocket;
		}

		ConnectionType::Http
	}

	// The Connection header is a comma-separated token list; `upgrade` may
	// appear alongside `keep-alive`.
	fn has_connection_upgrade_token(&self) -> bool {
		self.header_str(CONNECTION).is_some_and(|value| {
			value
				.split(',')
				.any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
		})
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

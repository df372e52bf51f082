//! Types related to the HTTP protocol.

// ----------

pub use http::{header, method, status, uri, version};
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// ConnectionType

/// A discriminator on an incoming request: plain HTTP, or a WebSocket
/// upgrade (`Connection: Upgrade` carrying the `upgrade` token together
/// with `Upgrade: websocket`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
	Http,
	WebSocket,
}

// --------------------------------------------------
// Methods

/// The set of HTTP methods a routing entry responds to.
#[derive(Debug, Clone)]
pub enum Methods {
	/// Matches every method.
	Any,
	List(Vec<Method>),
}

impl Methods {
	#[inline]
	pub fn contains(&self, method: &Method) -> bool {
		match self {
			Methods::Any => true,
			Methods::List(methods) => methods.contains(method),
		}
	}
}

impl From<Method> for Methods {
	fn from(method: Method) -> Self {
		Methods::List(vec![method])
	}
}

impl<const N: usize> From<[Method; N]> for Methods {
	fn from(methods: [Method; N]) -> Self {
		Methods::List(methods.into())
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

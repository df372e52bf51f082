//! Pluggable per-connection handlers.
//!
//! One interceptor is selected per connection on the first prepare event
//! and owns the connection's HTTP event loop from then on.

// ----------

use http::StatusCode;

use crate::connection::Connection;

// --------------------------------------------------

pub mod default;
pub mod websocket;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// InterceptorResult

/// What an interceptor wants done with the connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorResult {
	/// Keep the connection; more events are expected.
	Keep,
	/// Flush any pending response bytes and close the socket.
	Disconnect,
}

// --------------------------------------------------
// CloseReason

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// The interceptor finished with the connection.
	Local,
	/// The peer closed the socket.
	Peer,
	/// The owning server is being stopped.
	ServerStop,
}

// --------------------------------------------------
// Interceptor

/// A per-connection protocol driver.
///
/// Events arrive strictly in the order prepare, data (any number of
/// times), then either error or close, all on the connection's own task.
pub trait Interceptor: Send + Sync {
	/// Whether this interceptor claims the request. The first claimant in
	/// the server's mount order is bound for the rest of the connection.
	fn is_for_request(&self, connection: &Connection) -> bool;

	/// Called once the request head is complete.
	fn on_prepare(&self, connection: &mut Connection) -> InterceptorResult;

	/// Called for every chunk of bytes that follows the head.
	fn on_data(&self, connection: &mut Connection, chunk: &[u8]) -> InterceptorResult;

	/// Called when the connection fails; `status` describes the failure.
	fn on_error(&self, connection: &mut Connection, status: StatusCode);

	/// Called exactly once when the connection ends without an error.
	fn on_closed(&self, connection: &mut Connection, reason: CloseReason);
}

// --------------------------------------------------------------------------------

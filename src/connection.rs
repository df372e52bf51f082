//! The per-connection pipeline.
//!
//! A [`Connection`] owns exactly one [`Request`] and one [`Response`] and
//! a cursor to the interceptor that was bound on the first prepare event.
//! The binding is sticky: every later event for the connection targets the
//! same interceptor until the connection ends.

// ----------

use std::{mem, net::SocketAddr, sync::Arc};

use banyan_core::{
	http::ConnectionType,
	request::RequestHead,
	response::ResponseHead,
};
use bytes::{Bytes, BytesMut};
use http::{
	header::{AsHeaderName, CONTENT_LENGTH},
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
	common::next_connection_id,
	interceptor::{CloseReason, Interceptor, InterceptorResult},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// Request

/// An inbound request: the parsed head plus the body accumulated so far.
pub struct Request {
	head: RequestHead,
	content_length: usize,
	connection_type: ConnectionType,
	body: BytesMut,
	some_captures: Option<PathCaptures>,
}

impl Request {
	pub(crate) fn new(head: RequestHead) -> Self {
		let content_length = head.content_length().unwrap_or(0);
		let connection_type = head.connection_type();

		Self {
			head,
			content_length,
			connection_type,
			body: BytesMut::new(),
			some_captures: None,
		}
	}

	#[inline(always)]
	pub fn head(&self) -> &RequestHead {
		&self.head
	}

	#[inline(always)]
	pub fn method(&self) -> &Method {
		self.head.method()
	}

	#[inline(always)]
	pub fn target(&self) -> &str {
		self.head.target()
	}

	#[inline(always)]
	pub fn headers(&self) -> &HeaderMap {
		self.head.headers()
	}

	#[inline(always)]
	pub fn header_str(&self, name: impl AsHeaderName) -> Option<&str> {
		self.head.header_str(name)
	}

	/// The declared content length; zero when the header is absent.
	#[inline(always)]
	pub fn content_length(&self) -> usize {
		self.content_length
	}

	#[inline(always)]
	pub fn connection_type(&self) -> ConnectionType {
		self.connection_type
	}

	#[inline(always)]
	pub fn body(&self) -> &[u8] {
		&self.body
	}

	#[inline(always)]
	pub(crate) fn body_mut(&mut self) -> &mut BytesMut {
		&mut self.body
	}

	/// The match groups of the pattern that won the dispatch. Present only
	/// while a handler is being invoked.
	pub fn captures(&self) -> Option<&PathCaptures> {
		self.some_captures.as_ref()
	}

	pub(crate) fn set_captures(&mut self, captures: PathCaptures) {
		self.some_captures = Some(captures);
	}
}

// --------------------------------------------------
// PathCaptures

/// The capture groups of the winning pattern, group 0 being the whole
/// match.
pub struct PathCaptures(Vec<Option<String>>);

impl PathCaptures {
	pub(crate) fn new(groups: Vec<Option<String>>) -> Self {
		Self(groups)
	}

	pub fn group(&self, index: usize) -> Option<&str> {
		self.0.get(index).and_then(|group| group.as_deref())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

// --------------------------------------------------
// Response

/// The outbound side of a connection.
///
/// A response is sent either in one shot with [`send`](Self::send), or as
/// a bare head with [`send_head`](Self::send_head) followed by raw bytes
/// with [`send_raw`](Self::send_raw) once the protocol has switched. All
/// writes go through a channel drained by the connection's writer task, so
/// sending never blocks on the socket.
pub struct Response {
	head: ResponseHead,
	body: Vec<u8>,
	sender: UnboundedSender<Bytes>,
	head_sent: bool,
}

impl Response {
	pub(crate) fn new(sender: UnboundedSender<Bytes>) -> Self {
		Self {
			head: ResponseHead::new(),
			body: Vec::new(),
			sender,
			head_sent: false,
		}
	}

	#[inline(always)]
	pub fn status(&self) -> StatusCode {
		self.head.status()
	}

	#[inline(always)]
	pub fn set_status(&mut self, status: StatusCode) {
		self.head.set_status(status);
	}

	#[inline(always)]
	pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
		self.head.set_header(name, value);
	}

	/// Stages the body bytes; nothing goes out until [`send`](Self::send).
	pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
		self.body = body.into();
	}

	/// Whether the head has already been written out.
	#[inline(always)]
	pub fn is_sent(&self) -> bool {
		self.head_sent
	}

	/// Sends the head with a `Content-Length` and the staged body in one
	/// shot. A second call is a no-op returning false.
	pub fn send(&mut self) -> bool {
		if self.head_sent {
			return false;
		}

		self.head_sent = true;
		self
			.head
			.set_header(CONTENT_LENGTH, HeaderValue::from(self.body.len()));

		if self.sender.send(self.head.to_bytes()).is_err() {
			return false;
		}

		if self.body.is_empty() {
			return true;
		}

		let body = mem::take(&mut self.body);

		self.sender.send(Bytes::from(body)).is_ok()
	}

	// Sends the head alone, without body framing. The WebSocket handshake
	// uses this for its `101 Switching Protocols`.
	pub(crate) fn send_head(&mut self) -> bool {
		if self.head_sent {
			return false;
		}

		self.head_sent = true;

		self.sender.send(self.head.to_bytes()).is_ok()
	}

	/// Queues raw bytes on the socket. Valid after a protocol switch.
	pub fn send_raw(&self, bytes: Bytes) -> bool {
		self.sender.send(bytes).is_ok()
	}

	pub(crate) fn sender(&self) -> UnboundedSender<Bytes> {
		self.sender.clone()
	}
}

// --------------------------------------------------
// Connection

/// One accepted connection and its event pipeline.
pub struct Connection {
	id: u64,
	peer_address: SocketAddr,
	request: Request,
	response: Response,
	interceptors: Vec<Arc<dyn Interceptor>>,
	some_selected: Option<Arc<dyn Interceptor>>,
}

impl Connection {
	pub(crate) fn new(
		peer_address: SocketAddr,
		head: RequestHead,
		sender: UnboundedSender<Bytes>,
		interceptors: Vec<Arc<dyn Interceptor>>,
	) -> Self {
		Self {
			id: next_connection_id(),
			peer_address,
			request: Request::new(head),
			response: Response::new(sender),
			interceptors,
			some_selected: None,
		}
	}

	#[inline(always)]
	pub fn id(&self) -> u64 {
		self.id
	}

	#[inline(always)]
	pub fn peer_address(&self) -> SocketAddr {
		self.peer_address
	}

	#[inline(always)]
	pub fn request(&self) -> &Request {
		&self.request
	}

	#[inline(always)]
	pub fn request_mut(&mut self) -> &mut Request {
		&mut self.request
	}

	#[inline(always)]
	pub fn response(&self) -> &Response {
		&self.response
	}

	#[inline(always)]
	pub fn response_mut(&mut self) -> &mut Response {
		&mut self.response
	}

	/// Splits the borrow so a handler can read the request while writing
	/// the response.
	#[inline(always)]
	pub fn request_and_response_mut(&mut self) -> (&Request, &mut Response) {
		(&self.request, &mut self.response)
	}

	// Binds the first interceptor that claims the request and forwards the
	// prepare event to it. The binding never changes afterwards.
	pub(crate) fn on_prepared(&mut self) -> InterceptorResult {
		let some_interceptor = self
			.interceptors
			.iter()
			.find(|interceptor| interceptor.is_for_request(self))
			.cloned();

		let Some(interceptor) = some_interceptor else {
			tracing::error!(connection = self.id, "no interceptor claimed the request");

			return InterceptorResult::Disconnect;
		};

		self.some_selected = Some(interceptor.clone());

		interceptor.on_prepare(self)
	}

	pub(crate) fn on_data(&mut self, chunk: &[u8]) -> InterceptorResult {
		let Some(interceptor) = self.some_selected.clone() else {
			return InterceptorResult::Disconnect;
		};

		interceptor.on_data(self, chunk)
	}

	pub(crate) fn on_error(&mut self, status: StatusCode) {
		if let Some(interceptor) = self.some_selected.clone() {
			interceptor.on_error(self, status);
		}
	}

	pub(crate) fn on_closed(&mut self, reason: CloseReason) {
		if let Some(interceptor) = self.some_selected.clone() {
			interceptor.on_closed(self, reason);
		}
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

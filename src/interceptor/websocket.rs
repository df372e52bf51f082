//! The WebSocket interceptor: opening handshake, per-connection frame
//! loop, and the heartbeat ticker.

// ----------

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use banyan_core::{
	frame::{Frame, FrameParseStatus, OpCode},
	http::ConnectionType,
};
use base64::prelude::*;
use bytes::Bytes;
use http::{
	header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE},
	HeaderValue, StatusCode,
};
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle, time::MissedTickBehavior};

use crate::{
	common::SCOPE_VALIDITY,
	connection::Connection,
	interceptor::{CloseReason, Interceptor, InterceptorResult},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const HANDSHAKE_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// How often every connected client is pinged.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

const PING_PAYLOAD: &[u8] = b"OvenMediaEngine";

// --------------------------------------------------
// Handler types

pub type ConnectHandler = Box<dyn Fn(&Arc<WebSocketClient>) -> InterceptorResult + Send + Sync>;
pub type MessageHandler =
	Box<dyn Fn(&Arc<WebSocketClient>, &Frame) -> InterceptorResult + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&Arc<WebSocketClient>, StatusCode) + Send + Sync>;
pub type CloseHandler = Box<dyn Fn(&Arc<WebSocketClient>, CloseReason) + Send + Sync>;

// --------------------------------------------------
// WebSocketClient

/// A handle to a connected WebSocket peer. Frames queued here go out
/// through the connection's writer task, so sending never blocks.
pub struct WebSocketClient {
	connection_id: u64,
	peer_address: SocketAddr,
	sender: UnboundedSender<Bytes>,
}

impl WebSocketClient {
	fn new(connection_id: u64, peer_address: SocketAddr, sender: UnboundedSender<Bytes>) -> Self {
		Self {
			connection_id,
			peer_address,
			sender,
		}
	}

	#[inline(always)]
	pub fn connection_id(&self) -> u64 {
		self.connection_id
	}

	#[inline(always)]
	pub fn peer_address(&self) -> SocketAddr {
		self.peer_address
	}

	/// Queues a single frame. Returns false once the connection is gone.
	pub fn send_frame(&self, opcode: OpCode, payload: &[u8]) -> bool {
		self.sender.send(Frame::encode(opcode, payload)).is_ok()
	}

	#[inline]
	pub fn send_text(&self, text: &str) -> bool {
		self.send_frame(OpCode::Text, text.as_bytes())
	}

	#[inline]
	pub fn send_binary(&self, payload: &[u8]) -> bool {
		self.send_frame(OpCode::Binary, payload)
	}

	#[inline]
	pub fn send_ping(&self, payload: &[u8]) -> bool {
		self.send_frame(OpCode::Ping, payload)
	}

	#[inline]
	pub fn send_pong(&self, payload: &[u8]) -> bool {
		self.send_frame(OpCode::Pong, payload)
	}
}

// --------------------------------------------------
// WebSocketSession

// One entry per upgraded connection. The frame slot is empty between
// completed frames and holds the partially parsed frame otherwise.
struct WebSocketSession {
	client: Arc<WebSocketClient>,
	active_frame: Mutex<Option<Frame>>,
}

type ClientTable = RwLock<HashMap<u64, WebSocketSession>>;

// --------------------------------------------------
// WebSocketInterceptor

/// Claims requests with a WebSocket upgrade indication, answers the
/// RFC 6455 opening handshake, and drives the frame loop until the peer
/// closes, a frame fails to parse, or the server stops.
///
/// A peer's `ConnectionClose` frame tears the connection down without a
/// reciprocal close frame; the socket closing is the signal.
///
/// # Panics
/// `new` spawns the heartbeat ticker and must be called within a Tokio
/// runtime.
pub struct WebSocketInterceptor {
	clients: Arc<ClientTable>,
	some_connect_handler: Option<ConnectHandler>,
	some_message_handler: Option<MessageHandler>,
	some_error_handler: Option<ErrorHandler>,
	some_close_handler: Option<CloseHandler>,
	ping_ticker: JoinHandle<()>,
}

impl WebSocketInterceptor {
	pub fn new() -> Self {
		let clients = Arc::new(ClientTable::default());

		Self {
			ping_ticker: spawn_ping_ticker(clients.clone()),
			clients,
			some_connect_handler: None,
			some_message_handler: None,
			some_error_handler: None,
			some_close_handler: None,
		}
	}

	/// Called after a successful handshake; its result may refuse the
	/// connection.
	pub fn with_connect_handler<Func>(mut self, handler: Func) -> Self
	where
		Func: Fn(&Arc<WebSocketClient>) -> InterceptorResult + Send + Sync + 'static,
	{
		self.some_connect_handler = Some(Box::new(handler));

		self
	}

	/// Called for every completed data frame with a non-empty payload.
	pub fn with_message_handler<Func>(mut self, handler: Func) -> Self
	where
		Func: Fn(&Arc<WebSocketClient>, &Frame) -> InterceptorResult + Send + Sync + 'static,
	{
		self.some_message_handler = Some(Box::new(handler));

		self
	}

	pub fn with_error_handler<Func>(mut self, handler: Func) -> Self
	where
		Func: Fn(&Arc<WebSocketClient>, StatusCode) + Send + Sync + 'static,
	{
		self.some_error_handler = Some(Box::new(handler));

		self
	}

	pub fn with_close_handler<Func>(mut self, handler: Func) -> Self
	where
		Func: Fn(&Arc<WebSocketClient>, CloseReason) + Send + Sync + 'static,
	{
		self.some_close_handler = Some(Box::new(handler));

		self
	}

	/// The number of live sessions.
	pub fn client_count(&self) -> usize {
		self.clients.read().len()
	}

	fn remove_session(&self, connection_id: u64) -> Option<WebSocketSession> {
		self.clients.write().remove(&connection_id)
	}
}

impl Default for WebSocketInterceptor {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for WebSocketInterceptor {
	fn drop(&mut self) {
		self.ping_ticker.abort();
	}
}

impl Interceptor for WebSocketInterceptor {
	fn is_for_request(&self, connection: &Connection) -> bool {
		connection.request().connection_type() == ConnectionType::WebSocket
	}

	fn on_prepare(&self, connection: &mut Connection) -> InterceptorResult {
		let accept_value = {
			let Some(key) = connection.request().header_str(SEC_WEBSOCKET_KEY) else {
				tracing::debug!(connection = connection.id(), "missing Sec-WebSocket-Key");

				return InterceptorResult::Disconnect;
			};

			sec_websocket_accept_value_from(key.as_bytes())
		};

		let response = connection.response_mut();
		response.set_status(StatusCode::SWITCHING_PROTOCOLS);
		response.set_header(UPGRADE, HeaderValue::from_static("websocket"));
		response.set_header(CONNECTION, HeaderValue::from_static("Upgrade"));
		response.set_header(SEC_WEBSOCKET_ACCEPT, accept_value);
		response.send_head();

		let client = Arc::new(WebSocketClient::new(
			connection.id(),
			connection.peer_address(),
			connection.response().sender(),
		));

		self.clients.write().insert(
			connection.id(),
			WebSocketSession {
				client: client.clone(),
				active_frame: Mutex::new(None),
			},
		);

		tracing::debug!(
			connection = connection.id(),
			peer = %client.peer_address(),
			"websocket session opened",
		);

		if let Some(handler) = &self.some_connect_handler {
			return handler(&client);
		}

		InterceptorResult::Keep
	}

	fn on_data(&self, connection: &mut Connection, chunk: &[u8]) -> InterceptorResult {
		// A single read may carry several frames; they are drained in byte
		// order until the parser runs out of input.
		let mut offset = 0;

		while offset < chunk.len() {
			let (client, completed_frame) = {
				let clients = self.clients.read();
				let Some(session) = clients.get(&connection.id()) else {
					tracing::debug!(connection = connection.id(), "data for an unknown client");

					return InterceptorResult::Disconnect;
				};

				let mut frame_slot = session.active_frame.lock();
				let frame = frame_slot.get_or_insert_with(Frame::new);

				let (status, consumed) = frame.parse(&chunk[offset..]);
				offset += consumed;

				match status {
					FrameParseStatus::Prepare | FrameParseStatus::Parsing => {
						return InterceptorResult::Keep;
					}
					FrameParseStatus::Error => {
						tracing::debug!(
							connection = connection.id(),
							error = ?frame.error(),
							"frame parse failure",
						);

						return InterceptorResult::Disconnect;
					}
					FrameParseStatus::Completed => {
						(session.client.clone(), frame_slot.take().expect(SCOPE_VALIDITY))
					}
				}
			};

			match completed_frame.opcode() {
				OpCode::ConnectionClose => return InterceptorResult::Disconnect,
				OpCode::Ping => {
					client.send_pong(completed_frame.payload());
				}
				OpCode::Pong => {}
				_ => {
					if let Some(handler) = &self.some_message_handler {
						if !completed_frame.payload().is_empty() {
							if let InterceptorResult::Disconnect = handler(&client, &completed_frame) {
								return InterceptorResult::Disconnect;
							}
						}
					}
				}
			}
		}

		InterceptorResult::Keep
	}

	fn on_error(&self, connection: &mut Connection, status: StatusCode) {
		connection.response_mut().set_status(status);

		if let Some(session) = self.remove_session(connection.id()) {
			tracing::debug!(connection = connection.id(), %status, "websocket session failed");

			if let Some(handler) = &self.some_error_handler {
				handler(&session.client, status);
			}
		}
	}

	fn on_closed(&self, connection: &mut Connection, reason: CloseReason) {
		if let Some(session) = self.remove_session(connection.id()) {
			tracing::debug!(connection = connection.id(), ?reason, "websocket session closed");

			if let Some(handler) = &self.some_close_handler {
				handler(&session.client, reason);
			}
		}
	}
}

// --------------------------------------------------

fn sec_websocket_accept_value_from(key: &[u8]) -> HeaderValue {
	let mut sha1 = Sha1::new();
	sha1.update(key);
	sha1.update(HANDSHAKE_GUID);

	let b64 = BASE64_STANDARD.encode(sha1.finalize());
	HeaderValue::try_from(b64).expect("base64 encoded value must be a valid header value")
}

// The ticker holds a shared lock while broadcasting; sends are channel
// pushes, so the lock is never held across I/O.
fn spawn_ping_ticker(clients: Arc<ClientTable>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(PING_INTERVAL);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

		// A tokio interval yields its first tick immediately.
		interval.tick().await;

		loop {
			interval.tick().await;

			let clients = clients.read();
			for session in clients.values() {
				session.client.send_ping(PING_PAYLOAD);
			}
		}
	})
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

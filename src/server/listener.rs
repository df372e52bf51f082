//! The listening side of a server: the accept loop and the per-connection
//! event task.

// ----------

use std::{io::Error as IoError, net::ToSocketAddrs, sync::Arc, time::Duration};

use banyan_core::request::RequestHead;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use parking_lot::RwLock;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	sync::{
		mpsc::{self, UnboundedSender},
		watch, Semaphore,
	},
};
use tokio_rustls::{rustls::ServerConfig as TlsServerConfig, TlsAcceptor};

use crate::{
	connection::Connection,
	interceptor::{CloseReason, Interceptor, InterceptorResult},
	server::ListenEndpoint,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The `worker_count` sentinel asking for the default worker pool size.
pub const WORKER_COUNT_DEFAULT: usize = 0;

const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADER_COUNT: usize = 64;
const ACCEPT_ERROR_LIMIT: u32 = 3;

const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n";
const HEAD_TOO_LARGE_RESPONSE: &[u8] =
	b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\n\r\n";

type InterceptorList = Arc<RwLock<Vec<Arc<dyn Interceptor>>>>;

// --------------------------------------------------
// Listener

// Owns the accept task. Stopping is a broadcast: the accept loop and every
// live connection task observe the same watch channel.
pub(crate) struct Listener {
	local_address: std::net::SocketAddr,
	worker_count: usize,
	shutdown: watch::Sender<bool>,
}

impl Listener {
	// Must be called within a Tokio runtime; the accept loop is spawned
	// before this returns.
	pub(crate) fn start(
		server_name: String,
		endpoint: &ListenEndpoint,
		worker_count: usize,
		some_tls_config: Option<Arc<TlsServerConfig>>,
		interceptors: InterceptorList,
	) -> Result<Self, IoError> {
		let mut addresses = (endpoint.host(), endpoint.port()).to_socket_addrs()?;

		let std_listener = loop {
			let Some(address) = addresses.next() else {
				return Err(IoError::new(
					std::io::ErrorKind::AddrNotAvailable,
					format!("no bindable address for {}", endpoint),
				));
			};

			if let Ok(listener) = std::net::TcpListener::bind(address) {
				break listener;
			}
		};

		std_listener.set_nonblocking(true)?;
		let listener = TcpListener::from_std(std_listener)?;
		let local_address = listener.local_addr()?;

		let worker_count = if worker_count == WORKER_COUNT_DEFAULT {
			std::thread::available_parallelism()
				.map(std::num::NonZeroUsize::get)
				.unwrap_or(8)
		} else {
			worker_count
		};

		let (shutdown, shutdown_receiver) = watch::channel(false);

		tracing::info!(server = %server_name, address = %local_address, worker_count, "listening");

		tokio::spawn(accept_loop(
			server_name,
			listener,
			some_tls_config.map(TlsAcceptor::from),
			interceptors,
			Arc::new(Semaphore::new(worker_count)),
			shutdown_receiver,
		));

		Ok(Self {
			local_address,
			worker_count,
			shutdown,
		})
	}

	pub(crate) fn local_address(&self) -> std::net::SocketAddr {
		self.local_address
	}

	pub(crate) fn worker_count(&self) -> usize {
		self.worker_count
	}

	pub(crate) fn stop(&self) -> bool {
		self.shutdown.send(true).is_ok()
	}
}

// --------------------------------------------------
// Accept loop

async fn accept_loop(
	server_name: String,
	listener: TcpListener,
	some_tls_acceptor: Option<TlsAcceptor>,
	interceptors: InterceptorList,
	workers: Arc<Semaphore>,
	mut shutdown_receiver: watch::Receiver<bool>,
) {
	let mut accept_error_count = 0;

	loop {
		tokio::select! {
			connection = listener.accept() => {
				match connection {
					Ok((stream, peer_address)) => {
						let Ok(permit) = workers.clone().acquire_owned().await else {
							break;
						};

						tokio::spawn(serve_connection(
							server_name.clone(),
							stream,
							some_tls_acceptor.clone(),
							peer_address,
							interceptors.clone(),
							shutdown_receiver.clone(),
							permit,
						));
					}
					Err(error) => {
						tracing::warn!(server = %server_name, %error, "accept failure");
						tokio::time::sleep(Duration::from_secs(1)).await;

						if accept_error_count < ACCEPT_ERROR_LIMIT {
							accept_error_count += 1;

							continue;
						}

						tracing::error!(server = %server_name, "giving up on accepting connections");

						break;
					}
				}
			},
			_ = shutdown_receiver.changed() => break,
		}
	}
}

async fn serve_connection(
	server_name: String,
	stream: TcpStream,
	some_tls_acceptor: Option<TlsAcceptor>,
	peer_address: std::net::SocketAddr,
	interceptors: InterceptorList,
	shutdown_receiver: watch::Receiver<bool>,
	_permit: tokio::sync::OwnedSemaphorePermit,
) {
	match some_tls_acceptor {
		Some(tls_acceptor) => match tls_acceptor.accept(stream).await {
			Ok(stream) => {
				drive(stream, &server_name, peer_address, interceptors, shutdown_receiver).await
			}
			Err(error) => {
				tracing::debug!(server = %server_name, peer = %peer_address, %error, "TLS accept failure");
			}
		},
		None => drive(stream, &server_name, peer_address, interceptors, shutdown_receiver).await,
	}
}

// --------------------------------------------------
// Connection task

// Drives one connection: parse the head, bind an interceptor via the
// prepare event, then forward every chunk until someone disconnects. All
// writes pass through the channel so the writer task can flush them before
// the socket closes.
async fn drive<S>(
	stream: S,
	server_name: &str,
	peer_address: std::net::SocketAddr,
	interceptors: InterceptorList,
	mut shutdown_receiver: watch::Receiver<bool>,
) where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	let (mut read_half, mut write_half) = tokio::io::split(stream);
	let (sender, mut receiver) = mpsc::unbounded_channel::<Bytes>();

	let writer = tokio::spawn(async move {
		while let Some(bytes) = receiver.recv().await {
			if write_half.write_all(&bytes).await.is_err() {
				break;
			}
		}

		let _ = write_half.shutdown().await;
	});

	let mut buffer = BytesMut::with_capacity(4 * 1024);
	let some_head = read_head(&mut read_half, &mut buffer, &sender, &mut shutdown_receiver).await;

	if let Some(head) = some_head {
		let snapshot = interceptors.read().clone();
		let mut connection = Connection::new(peer_address, head, sender.clone(), snapshot);

		tracing::debug!(
			server = server_name,
			connection = connection.id(),
			peer = %peer_address,
			method = %connection.request().method(),
			request_target = connection.request().target(),
			"request prepared",
		);

		let mut result = connection.on_prepared();

		// Body bytes that arrived with the head.
		if result == InterceptorResult::Keep && !buffer.is_empty() {
			let chunk = buffer.split().freeze();
			result = connection.on_data(&chunk);
		}

		if result == InterceptorResult::Disconnect {
			connection.on_closed(CloseReason::Local);
		} else {
			loop {
				tokio::select! {
					read = read_half.read_buf(&mut buffer) => match read {
						Ok(0) => {
							connection.on_closed(CloseReason::Peer);

							break;
						}
						Ok(_) => {
							let chunk = buffer.split().freeze();
							if connection.on_data(&chunk) == InterceptorResult::Disconnect {
								connection.on_closed(CloseReason::Local);

								break;
							}
						}
						Err(error) => {
							tracing::debug!(
								server = server_name,
								connection = connection.id(),
								%error,
								"read failure",
							);

							connection.on_error(StatusCode::INTERNAL_SERVER_ERROR);

							break;
						}
					},
					_ = shutdown_receiver.changed() => {
						connection.on_closed(CloseReason::ServerStop);

						break;
					}
				}
			}
		}
	}

	// Dropping the last sender lets the writer flush and shut the socket.
	drop(sender);
	let _ = writer.await;
}

// Reads until the head is complete and returns it, with its bytes consumed
// from the buffer. `None` means the connection is done: the peer vanished,
// the server stopped, or the head was unusable (answered right here).
async fn read_head<R>(
	read_half: &mut R,
	buffer: &mut BytesMut,
	sender: &UnboundedSender<Bytes>,
	shutdown_receiver: &mut watch::Receiver<bool>,
) -> Option<RequestHead>
where
	R: AsyncRead + Unpin,
{
	loop {
		if !buffer.is_empty() {
			match parse_head(buffer) {
				Ok(Some((head, head_size))) => {
					let _ = buffer.split_to(head_size);

					return Some(head);
				}
				Ok(None) => {
					if buffer.len() > MAX_HEAD_SIZE {
						let _ = sender.send(Bytes::from_static(HEAD_TOO_LARGE_RESPONSE));

						return None;
					}
				}
				Err(error) => {
					tracing::debug!(%error, "unparsable request head");
					let _ = sender.send(Bytes::from_static(BAD_REQUEST_RESPONSE));

					return None;
				}
			}
		}

		tokio::select! {
			read = read_half.read_buf(buffer) => match read {
				Ok(0) => return None,
				Ok(_) => {}
				Err(_) => return None,
			},
			_ = shutdown_receiver.changed() => return None,
		}
	}
}

// --------------------------------------------------
// Head parsing

#[derive(Debug, crate::ImplError)]
enum HeadParseError {
	#[error(transparent)]
	Syntax(#[from] httparse::Error),
	#[error(transparent)]
	InvalidMethod(#[from] http::method::InvalidMethod),
	#[error(transparent)]
	InvalidHeaderName(#[from] http::header::InvalidHeaderName),
	#[error(transparent)]
	InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}

// `Ok(None)` means the head is still incomplete.
fn parse_head(buffer: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadParseError> {
	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
	let mut parsed = httparse::Request::new(&mut headers);

	let head_size = match parsed.parse(buffer)? {
		httparse::Status::Complete(head_size) => head_size,
		httparse::Status::Partial => return Ok(None),
	};

	let method = parsed
		.method
		.expect("a complete head has a method")
		.parse::<Method>()?;

	let target = parsed.path.expect("a complete head has a target").to_owned();

	let version = match parsed.version.expect("a complete head has a version") {
		0 => Version::HTTP_10,
		_ => Version::HTTP_11,
	};

	let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
	for header in parsed.headers.iter() {
		let name = HeaderName::from_bytes(header.name.as_bytes())?;
		let value = HeaderValue::from_bytes(header.value)?;
		header_map.append(name, value);
	}

	Ok(Some((
		RequestHead::new(method, target, version, header_map),
		head_size,
	)))
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use banyan_core::frame::{Frame, OpCode};

	use crate::{
		interceptor::default::{DefaultInterceptor, NextHandler},
		interceptor::websocket::WebSocketInterceptor,
		server::registry::registry,
		ListenEndpoint,
	};

	use super::*;

	#[test]
	fn parse_head_complete() {
		let bytes =
			b"POST /v1/apps HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\nbody";

		let (head, head_size) = parse_head(bytes).unwrap().expect("a complete head");

		assert_eq!(head.method(), Method::POST);
		assert_eq!(head.target(), "/v1/apps");
		assert_eq!(head.version(), Version::HTTP_11);
		assert_eq!(head.content_length(), Some(4));
		assert_eq!(&bytes[head_size..], b"body");
	}

	#[test]
	fn parse_head_partial() {
		assert!(parse_head(b"GET /v1/stats HTTP/1.1\r\nHost: loc")
			.unwrap()
			.is_none());
	}

	#[test]
	fn parse_head_malformed() {
		assert!(parse_head(b"\0\0\0\r\n\r\n").is_err());
	}

	// ----------
	// Socket-level runs through a live listener. Each test keys the
	// registry with its own loopback host; see the registry tests.

	async fn read_until_eof(stream: &mut TcpStream) -> Vec<u8> {
		let mut bytes = Vec::new();
		stream
			.read_to_end(&mut bytes)
			.await
			.expect("the server closes after the response");

		bytes
	}

	async fn read_response_head(stream: &mut TcpStream) -> String {
		let mut bytes = Vec::new();
		let mut byte = [0_u8; 1];

		while !bytes.ends_with(b"\r\n\r\n") {
			let count = stream.read(&mut byte).await.expect("a response head");
			assert_ne!(count, 0, "the stream ended inside the response head");
			bytes.push(byte[0]);
		}

		String::from_utf8(bytes).unwrap()
	}

	fn masked_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
		let key = [0xDE, 0xAD, 0xBE, 0xEF];
		let opcode_bits: u8 = match opcode {
			OpCode::Continuation => 0x0,
			OpCode::Text => 0x1,
			OpCode::Binary => 0x2,
			OpCode::ConnectionClose => 0x8,
			OpCode::Ping => 0x9,
			OpCode::Pong => 0xA,
		};

		assert!(payload.len() < 126);

		let mut bytes = vec![0x80 | opcode_bits, 0x80 | payload.len() as u8];
		bytes.extend_from_slice(&key);
		bytes.extend(
			payload
				.iter()
				.enumerate()
				.map(|(index, byte)| byte ^ key[index % 4]),
		);

		bytes
	}

	#[tokio::test]
	async fn http_request_through_the_socket() {
		let server = registry()
			.create_plain("e2e-http", ListenEndpoint::new("127.0.2.1", 0), WORKER_COUNT_DEFAULT)
			.unwrap();

		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::GET, "/v1/stats", |_, response| {
			response.set_body("all good");

			NextHandler::DoNotCall
		});
		server.add_interceptor(Arc::new(interceptor));

		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream
			.write_all(b"GET /v1/stats HTTP/1.1\r\nHost: localhost\r\n\r\n")
			.await
			.unwrap();

		let response = String::from_utf8(read_until_eof(&mut stream).await).unwrap();

		assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(response.ends_with("all good"));

		assert!(registry().release(&server));
	}

	#[tokio::test]
	async fn request_body_may_arrive_in_pieces() {
		let server = registry()
			.create_plain("e2e-body", ListenEndpoint::new("127.0.2.2", 0), WORKER_COUNT_DEFAULT)
			.unwrap();

		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::POST, "/v1/apps", |request, response| {
			assert_eq!(request.body(), b"0123456789");
			response.set_status(StatusCode::CREATED);

			NextHandler::DoNotCall
		});
		server.add_interceptor(Arc::new(interceptor));

		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream
			.write_all(b"POST /v1/apps HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\n01234")
			.await
			.unwrap();
		stream.flush().await.unwrap();

		// Let the first half land as its own chunk.
		tokio::time::sleep(Duration::from_millis(50)).await;

		stream.write_all(b"56789").await.unwrap();

		let response = String::from_utf8(read_until_eof(&mut stream).await).unwrap();

		assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));

		assert!(registry().release(&server));
	}

	#[tokio::test]
	async fn websocket_session_through_the_socket() {
		let server = registry()
			.create_plain("e2e-ws", ListenEndpoint::new("127.0.2.3", 0), WORKER_COUNT_DEFAULT)
			.unwrap();

		server.add_interceptor(Arc::new(
			WebSocketInterceptor::new()
				.with_message_handler(|client, frame| {
					client.send_binary(frame.payload());

					crate::InterceptorResult::Keep
				}),
		));
		server.add_interceptor(Arc::new(DefaultInterceptor::new()));

		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream
			.write_all(
				b"GET /signal HTTP/1.1\r\n\
				Host: localhost\r\n\
				Connection: Upgrade\r\n\
				Upgrade: websocket\r\n\
				Sec-WebSocket-Version: 13\r\n\
				Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
			)
			.await
			.unwrap();

		let handshake = read_response_head(&mut stream).await;
		assert!(handshake.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
		assert!(handshake.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

		// Ping round-trips as a pong with the same payload.
		stream
			.write_all(&masked_frame(OpCode::Ping, b"hi"))
			.await
			.unwrap();

		let mut pong = [0_u8; 4];
		stream.read_exact(&mut pong).await.unwrap();
		assert_eq!(pong, [0x8A, 0x02, b'h', b'i']);

		// A data frame reaches the message handler, which echoes it.
		stream
			.write_all(&masked_frame(OpCode::Binary, b"echo me"))
			.await
			.unwrap();

		let expected = Frame::encode(OpCode::Binary, b"echo me");
		let mut echoed = vec![0_u8; expected.len()];
		stream.read_exact(&mut echoed).await.unwrap();
		assert_eq!(echoed, expected);

		// A close frame ends the connection without a reciprocal close.
		stream
			.write_all(&masked_frame(OpCode::ConnectionClose, b""))
			.await
			.unwrap();

		assert!(read_until_eof(&mut stream).await.is_empty());

		assert!(registry().release(&server));
	}

	#[tokio::test]
	async fn websocket_upgrade_wins_over_the_default_interceptor() {
		let server = registry()
			.create_plain("e2e-select", ListenEndpoint::new("127.0.2.4", 0), WORKER_COUNT_DEFAULT)
			.unwrap();

		server.add_interceptor(Arc::new(WebSocketInterceptor::new()));

		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::GET, "/signal", |_, response| {
			response.set_body("plain");

			NextHandler::DoNotCall
		});
		server.add_interceptor(Arc::new(interceptor));

		// Without upgrade headers the same path lands on the default
		// interceptor.
		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream
			.write_all(b"GET /signal HTTP/1.1\r\nHost: localhost\r\n\r\n")
			.await
			.unwrap();

		let response = String::from_utf8(read_until_eof(&mut stream).await).unwrap();
		assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(response.ends_with("plain"));

		// With them, the WebSocket interceptor claims the connection.
		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream
			.write_all(
				b"GET /signal HTTP/1.1\r\n\
				Host: localhost\r\n\
				Connection: Upgrade\r\n\
				Upgrade: websocket\r\n\
				Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
			)
			.await
			.unwrap();

		let handshake = read_response_head(&mut stream).await;
		assert!(handshake.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

		assert!(registry().release(&server));
	}

	#[tokio::test]
	async fn stopping_the_server_ends_live_sessions() {
		let server = registry()
			.create_plain("e2e-stop", ListenEndpoint::new("127.0.2.5", 0), WORKER_COUNT_DEFAULT)
			.unwrap();

		server.add_interceptor(Arc::new(WebSocketInterceptor::new()));

		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream
			.write_all(
				b"GET /signal HTTP/1.1\r\n\
				Host: localhost\r\n\
				Connection: Upgrade\r\n\
				Upgrade: websocket\r\n\
				Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
			)
			.await
			.unwrap();

		read_response_head(&mut stream).await;

		assert!(registry().release(&server));

		// The shutdown broadcast reaches the connection task, which closes
		// the socket.
		assert!(read_until_eof(&mut stream).await.is_empty());
	}

	#[tokio::test]
	async fn malformed_head_is_answered_with_400() {
		let server = registry()
			.create_plain("e2e-bad", ListenEndpoint::new("127.0.2.6", 0), WORKER_COUNT_DEFAULT)
			.unwrap();

		server.add_interceptor(Arc::new(DefaultInterceptor::new()));

		let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
		stream.write_all(b"\0\0\0\r\n\r\n").await.unwrap();

		let response = String::from_utf8(read_until_eof(&mut stream).await).unwrap();
		assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

		assert!(registry().release(&server));
	}
}

//! The default interceptor: body accumulation and ordered pattern
//! dispatch.

// ----------

use banyan_core::http::Methods;
use http::{StatusCode, Uri};
use regex::Regex;

use crate::{
	connection::{Connection, PathCaptures, Request, Response},
	interceptor::{CloseReason, Interceptor, InterceptorResult},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The largest request body the interceptor accepts.
pub const BODY_SIZE_LIMIT: usize = 1024 * 1024;

// --------------------------------------------------
// NextHandler

/// A handler's verdict on whether the dispatch walk continues past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHandler {
	/// Later matching entries are still considered.
	Call,
	/// The walk stops here.
	DoNotCall,
}

/// A routing handler. Reads the request, writes the response, and says
/// whether the walk continues.
pub type Handler = Box<dyn Fn(&Request, &mut Response) -> NextHandler + Send + Sync>;

// --------------------------------------------------
// PatternEntry

struct PatternEntry {
	methods: Methods,
	regex: Regex,
	pattern: String,
	handler: Handler,
}

// --------------------------------------------------
// DefaultInterceptor

/// Accumulates the request body up to [`BODY_SIZE_LIMIT`], then walks its
/// pattern entries in registration order. Registration order is match
/// precedence; the response defaults to 404 or 405 when no handler runs.
///
/// Claims every request, so it should be mounted after any interceptor
/// with a narrower claim.
pub struct DefaultInterceptor {
	prefix: String,
	entries: Vec<PatternEntry>,
}

impl DefaultInterceptor {
	pub fn new() -> Self {
		Self::with_prefix("")
	}

	/// An interceptor whose entries all match under `prefix`.
	pub fn with_prefix(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
			entries: Vec::new(),
		}
	}

	/// Appends an entry matching `^<prefix><pattern>$` for the given
	/// methods. Returns false when the pattern doesn't compile, leaving
	/// the entries untouched.
	pub fn register<M, Func>(&mut self, methods: M, pattern: &str, handler: Func) -> bool
	where
		M: Into<Methods>,
		Func: Fn(&Request, &mut Response) -> NextHandler + Send + Sync + 'static,
	{
		let anchored_pattern = format!("^{}{}$", self.prefix, pattern);
		let regex = match Regex::new(&anchored_pattern) {
			Ok(regex) => regex,
			Err(error) => {
				tracing::error!(pattern = %anchored_pattern, %error, "pattern rejected");

				return false;
			}
		};

		self.entries.push(PatternEntry {
			methods: methods.into(),
			regex,
			pattern: anchored_pattern,
			handler: Box::new(handler),
		});

		true
	}

	// Walks the entries against the request path and sends the response.
	// Runs exactly once per connection, after the whole body has arrived.
	fn dispatch(&self, connection: &mut Connection) -> InterceptorResult {
		let Ok(uri) = connection.request().target().parse::<Uri>() else {
			tracing::debug!(
				connection = connection.id(),
				request_target = connection.request().target(),
				"unparsable request target",
			);

			return InterceptorResult::Disconnect;
		};

		let path = uri.path().to_owned();
		let method = connection.request().method().clone();

		let mut regex_found = false;
		let mut handler_count = 0_usize;

		for entry in &self.entries {
			let Some(captures) = entry.regex.captures(&path) else {
				continue;
			};

			regex_found = true;
			tracing::trace!(connection = connection.id(), pattern = %entry.pattern, "pattern matched");

			if !entry.methods.contains(&method) {
				continue;
			}

			handler_count += 1;

			let groups = captures
				.iter()
				.map(|some_group| some_group.map(|group| group.as_str().to_owned()))
				.collect();

			connection.request_mut().set_captures(PathCaptures::new(groups));

			let (request, response) = connection.request_and_response_mut();
			if let NextHandler::DoNotCall = (entry.handler)(request, response) {
				break;
			}
		}

		if handler_count == 0 {
			let status = if regex_found {
				StatusCode::METHOD_NOT_ALLOWED
			} else {
				StatusCode::NOT_FOUND
			};

			connection.response_mut().set_status(status);
		}

		connection.response_mut().send();

		// One response per request; keep-alive is not modeled.
		InterceptorResult::Disconnect
	}
}

impl Default for DefaultInterceptor {
	fn default() -> Self {
		Self::new()
	}
}

impl Interceptor for DefaultInterceptor {
	fn is_for_request(&self, _: &Connection) -> bool {
		true
	}

	fn on_prepare(&self, connection: &mut Connection) -> InterceptorResult {
		let content_length = connection.request().content_length();

		if content_length > BODY_SIZE_LIMIT {
			tracing::debug!(
				connection = connection.id(),
				content_length,
				"request body over the size limit",
			);

			return InterceptorResult::Disconnect;
		}

		if content_length == 0 {
			// Nothing to wait for; no data event will come.
			return self.dispatch(connection);
		}

		connection.request_mut().body_mut().reserve(content_length);

		InterceptorResult::Keep
	}

	fn on_data(&self, connection: &mut Connection, chunk: &[u8]) -> InterceptorResult {
		let content_length = connection.request().content_length();
		let current = connection.request().body().len();

		if current >= content_length {
			tracing::debug!(
				connection = connection.id(),
				"data past the declared content length",
			);

			return InterceptorResult::Disconnect;
		}

		// An overflowing chunk is cut down to the expected remainder; the
		// extra bytes are discarded.
		let chunk = if current + chunk.len() > content_length {
			&chunk[..content_length - current]
		} else {
			chunk
		};

		connection.request_mut().body_mut().extend_from_slice(chunk);

		if connection.request().body().len() >= content_length {
			return self.dispatch(connection);
		}

		InterceptorResult::Keep
	}

	fn on_error(&self, connection: &mut Connection, status: StatusCode) {
		tracing::debug!(connection = connection.id(), %status, "connection failed");
	}

	fn on_closed(&self, _: &mut Connection, _: CloseReason) {}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use banyan_core::http::Method;
	use tokio::sync::mpsc::UnboundedReceiver;

	use crate::connection::test_support::{collect_output, connection_with};

	use super::*;

	// Runs a bodyless request through the interceptor and returns the
	// wire output.
	fn run(
		interceptor: DefaultInterceptor,
		method: Method,
		target: &str,
	) -> (InterceptorResult, String) {
		let interceptor: Arc<dyn Interceptor> = Arc::new(interceptor);
		let (mut connection, mut receiver) =
			connection_with(method, target, &[], vec![interceptor]);

		let result = connection.on_prepared();
		let output = String::from_utf8(collect_output(&mut receiver)).unwrap();

		(result, output)
	}

	fn status_line(output: &str) -> &str {
		output.split("\r\n").next().unwrap_or("")
	}

	#[test]
	fn dispatch_in_registration_order() {
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));

		let mut interceptor = DefaultInterceptor::new();

		let order_clone = order.clone();
		interceptor.register(Methods::Any, "/v1/.+", move |_, _| {
			order_clone.lock().unwrap().push("first");

			NextHandler::Call
		});

		let order_clone = order.clone();
		interceptor.register(Methods::Any, "/v1/app", move |_, response| {
			order_clone.lock().unwrap().push("second");
			response.set_body("app");

			NextHandler::DoNotCall
		});

		let order_clone = order.clone();
		interceptor.register(Methods::Any, ".+", move |_, _| {
			order_clone.lock().unwrap().push("unreached");

			NextHandler::Call
		});

		let (result, output) = run(interceptor, Method::GET, "/v1/app");

		assert_eq!(result, InterceptorResult::Disconnect);
		assert_eq!(status_line(&output), "HTTP/1.1 200 OK");
		assert_eq!(*order.lock().unwrap(), ["first", "second"]);
	}

	#[test]
	fn method_mismatch_is_405() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::POST, "/v1/app", |_, _| NextHandler::DoNotCall);

		let (_, output) = run(interceptor, Method::GET, "/v1/app");

		assert_eq!(status_line(&output), "HTTP/1.1 405 Method Not Allowed");
	}

	#[test]
	fn unmatched_path_is_404() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::GET, "/v1/app", |_, _| NextHandler::DoNotCall);

		let (_, output) = run(interceptor, Method::GET, "/v2/other");

		assert_eq!(status_line(&output), "HTTP/1.1 404 Not Found");
	}

	#[test]
	fn same_pattern_twice_runs_both_on_call() {
		let count = Arc::new(AtomicUsize::new(0));

		let mut interceptor = DefaultInterceptor::new();

		let count_clone = count.clone();
		interceptor.register(Method::GET, "/twice", move |_, _| {
			count_clone.fetch_add(1, Ordering::SeqCst);

			NextHandler::Call
		});

		let count_clone = count.clone();
		interceptor.register(Method::GET, "/twice", move |_, _| {
			count_clone.fetch_add(1, Ordering::SeqCst);

			NextHandler::Call
		});

		let (_, output) = run(interceptor, Method::GET, "/twice");

		assert_eq!(count.load(Ordering::SeqCst), 2);
		assert_eq!(status_line(&output), "HTTP/1.1 200 OK");
	}

	#[test]
	fn invalid_pattern_is_rejected() {
		let mut interceptor = DefaultInterceptor::new();

		assert!(!interceptor.register(Methods::Any, "(unclosed", |_, _| NextHandler::Call));
		assert!(interceptor.entries.is_empty());
	}

	#[test]
	fn prefix_anchors_the_pattern() {
		let mut interceptor = DefaultInterceptor::with_prefix("/v1");
		interceptor.register(Method::GET, "/stats", |_, response| {
			response.set_body("stats");

			NextHandler::DoNotCall
		});

		let (_, output) = run(interceptor, Method::GET, "/v1/stats");
		assert_eq!(status_line(&output), "HTTP/1.1 200 OK");

		let mut interceptor = DefaultInterceptor::with_prefix("/v1");
		interceptor.register(Method::GET, "/stats", |_, _| NextHandler::DoNotCall);

		let (_, output) = run(interceptor, Method::GET, "/stats");
		assert_eq!(status_line(&output), "HTTP/1.1 404 Not Found");
	}

	#[test]
	fn captures_are_published() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::GET, "/apps/(?<app>[^/]+)/streams/(.+)", |request, response| {
			let captures = request.captures().expect("a matched entry publishes captures");
			assert_eq!(captures.group(0), Some("/apps/music/streams/live"));
			assert_eq!(captures.group(1), Some("music"));
			assert_eq!(captures.group(2), Some("live"));

			response.set_body("ok");

			NextHandler::DoNotCall
		});

		let (_, output) = run(interceptor, Method::GET, "/apps/music/streams/live");

		assert_eq!(status_line(&output), "HTTP/1.1 200 OK");
	}

	#[test]
	fn query_is_not_part_of_the_path() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::GET, "/v1/stats", |_, _| NextHandler::DoNotCall);

		let (_, output) = run(interceptor, Method::GET, "/v1/stats?period=60");

		assert_eq!(status_line(&output), "HTTP/1.1 200 OK");
	}

	// ----------

	fn body_connection(
		interceptor: Arc<dyn Interceptor>,
		content_length: &'static str,
	) -> (crate::connection::Connection, UnboundedReceiver<bytes::Bytes>) {
		connection_with(
			Method::POST,
			"/ingest",
			&[("content-length", content_length)],
			vec![interceptor],
		)
	}

	#[test]
	fn body_at_the_limit_is_accepted() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::POST, "/ingest", |request, _| {
			assert_eq!(request.body().len(), BODY_SIZE_LIMIT);

			NextHandler::DoNotCall
		});

		let interceptor: Arc<dyn Interceptor> = Arc::new(interceptor);
		let (mut connection, mut receiver) = body_connection(interceptor, "1048576");

		assert_eq!(connection.on_prepared(), InterceptorResult::Keep);
		assert_eq!(
			connection.on_data(&vec![0_u8; BODY_SIZE_LIMIT]),
			InterceptorResult::Disconnect,
		);

		let output = String::from_utf8(collect_output(&mut receiver)).unwrap();
		assert_eq!(status_line(&output), "HTTP/1.1 200 OK");
	}

	#[test]
	fn body_over_the_limit_is_rejected_at_prepare() {
		let interceptor: Arc<dyn Interceptor> = Arc::new(DefaultInterceptor::new());
		let (mut connection, mut receiver) = body_connection(interceptor, "1048577");

		assert_eq!(connection.on_prepared(), InterceptorResult::Disconnect);
		assert!(collect_output(&mut receiver).is_empty());
	}

	#[test]
	fn overflowing_chunk_is_truncated() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::POST, "/ingest", |request, _| {
			assert_eq!(request.body(), b"12345");

			NextHandler::DoNotCall
		});

		let interceptor: Arc<dyn Interceptor> = Arc::new(interceptor);
		let (mut connection, _receiver) = body_connection(interceptor, "5");

		assert_eq!(connection.on_prepared(), InterceptorResult::Keep);
		assert_eq!(
			connection.on_data(b"1234567890"),
			InterceptorResult::Disconnect,
		);
	}

	#[test]
	fn data_past_a_complete_body_disconnects() {
		let interceptor: Arc<dyn Interceptor> = Arc::new(DefaultInterceptor::new());
		let (mut connection, _receiver) = body_connection(interceptor, "0");

		// A zero-length body dispatches on prepare; any data afterwards is
		// a protocol violation.
		connection.on_prepared();

		assert_eq!(connection.on_data(b"extra"), InterceptorResult::Disconnect);
	}

	#[test]
	fn zero_length_body_dispatches_on_prepare() {
		let dispatched = Arc::new(AtomicUsize::new(0));

		let mut interceptor = DefaultInterceptor::new();

		let dispatched_clone = dispatched.clone();
		interceptor.register(Method::POST, "/ingest", move |_, _| {
			dispatched_clone.fetch_add(1, Ordering::SeqCst);

			NextHandler::DoNotCall
		});

		let interceptor: Arc<dyn Interceptor> = Arc::new(interceptor);
		let (mut connection, _receiver) = body_connection(interceptor, "0");

		assert_eq!(connection.on_prepared(), InterceptorResult::Disconnect);
		assert_eq!(dispatched.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn chunked_body_dispatches_once_complete() {
		let mut interceptor = DefaultInterceptor::new();
		interceptor.register(Method::POST, "/ingest", |request, _| {
			assert_eq!(request.body(), b"abcdef");

			NextHandler::DoNotCall
		});

		let interceptor: Arc<dyn Interceptor> = Arc::new(interceptor);
		let (mut connection, _receiver) = body_connection(interceptor, "6");

		assert_eq!(connection.on_prepared(), InterceptorResult::Keep);
		assert_eq!(connection.on_data(b"abc"), InterceptorResult::Keep);
		assert_eq!(connection.on_data(b"def"), InterceptorResult::Disconnect);
	}
}

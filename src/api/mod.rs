//! The administrative API surface: a Basic-auth gate in front of the
//! mounted controllers and a catch-all fallback behind them.

// ----------

use base64::prelude::*;
use http::{
	header::{AUTHORIZATION, CONTENT_TYPE},
	HeaderValue, StatusCode,
};

use banyan_core::http::Methods;

use crate::{
	connection::{Request, Response},
	interceptor::default::{DefaultInterceptor, NextHandler},
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// ApiRoot

/// The root of the API tree.
///
/// The access gate is registered before anything else, so every request
/// passes it first; [`into_interceptor`](Self::into_interceptor) appends
/// the catch-all last, so it answers only what no controller handled.
///
/// With an empty access token, debug builds let everything through and
/// release builds refuse everything.
pub struct ApiRoot {
	interceptor: DefaultInterceptor,
}

impl ApiRoot {
	pub fn new(prefix: impl Into<String>, access_token: impl Into<String>) -> Self {
		let mut interceptor = DefaultInterceptor::with_prefix(prefix);

		let access_token = access_token.into();
		interceptor.register(Methods::Any, ".+", move |request, response| {
			access_gate(&access_token, request, response)
		});

		Self { interceptor }
	}

	/// Registers a controller handler under the API prefix. Returns false
	/// when the pattern doesn't compile.
	pub fn register<M, Func>(&mut self, methods: M, pattern: &str, handler: Func) -> bool
	where
		M: Into<Methods>,
		Func: Fn(&Request, &mut Response) -> NextHandler + Send + Sync + 'static,
	{
		self.interceptor.register(methods, pattern, handler)
	}

	/// Seals the tree with the not-found fallback and hands out the
	/// interceptor to mount.
	pub fn into_interceptor(mut self) -> DefaultInterceptor {
		self
			.interceptor
			.register(Methods::Any, ".+", |_, response| {
				send_reason(response, StatusCode::NOT_FOUND, "Controller not found");

				NextHandler::DoNotCall
			});

		self.interceptor
	}
}

// --------------------------------------------------
// The access gate

// Reasons are checked in order; the first failure answers with 403 and
// stops the walk.
fn access_gate(access_token: &str, request: &Request, response: &mut Response) -> NextHandler {
	if access_token.is_empty() {
		if cfg!(debug_assertions) {
			return NextHandler::Call;
		}

		// Fail closed: without a token no credential is acceptable.
		return forbid(response, "Invalid credential");
	}

	let Some(authorization) = request.header_str(AUTHORIZATION) else {
		return forbid(response, "Authorization header is required to call API");
	};

	let tokens = authorization.split(' ').collect::<Vec<_>>();
	let (scheme, credential) = match tokens[..] {
		[scheme, credential] => (scheme, credential),
		_ => return forbid(response, "Invalid authorization header"),
	};

	if !scheme.eq_ignore_ascii_case("basic") {
		return forbid(response, &format!("Not supported credential type: {}", scheme));
	}

	let Ok(decoded) = BASE64_STANDARD.decode(credential) else {
		return forbid(response, "Invalid credential format");
	};

	if decoded != access_token.as_bytes() {
		return forbid(response, "Invalid credential");
	}

	NextHandler::Call
}

fn forbid(response: &mut Response, reason: &str) -> NextHandler {
	send_reason(response, StatusCode::FORBIDDEN, reason);

	NextHandler::DoNotCall
}

fn send_reason(response: &mut Response, status: StatusCode, reason: &str) {
	response.set_status(status);
	response.set_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
	response.set_body(reason);
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

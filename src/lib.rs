//! Banyan is the HTTP request dispatch and WebSocket upgrade core of a
//! media-server control plane.
//!
//! Servers sharing a listen endpoint are merged through a process-wide
//! [registry](crate::server::registry). Each accepted connection is bound
//! to exactly one [interceptor](crate::interceptor::Interceptor): the
//! default interceptor accumulates the body and dispatches by method and
//! path pattern, while the WebSocket interceptor performs the opening
//! handshake and drives the frame loop for the life of the connection.
//! The [api](crate::api) module guards the administrative surface with
//! HTTP Basic authentication.

// ----------

pub(crate) use thiserror::Error as ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub mod api;
pub(crate) mod common;
pub mod connection;
pub mod interceptor;
pub mod server;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub use banyan_core::{
	frame::{Frame, FrameParseStatus, OpCode},
	http::{ConnectionType, Methods},
	BoxedError, StdError,
};

pub use api::ApiRoot;
pub use connection::{Connection, PathCaptures, Request, Response};
pub use interceptor::{
	default::{DefaultInterceptor, NextHandler},
	websocket::{WebSocketClient, WebSocketInterceptor},
	CloseReason, Interceptor, InterceptorResult,
};
pub use server::{
	registry::{registry, RegistryError, ServerRegistry},
	Certificate, ListenEndpoint, Server, ServerKind, VirtualHost, WORKER_COUNT_DEFAULT,
};

// --------------------------------------------------------------------------------

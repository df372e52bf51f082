//! The process-wide server registry.
//!
//! Servers are keyed by their listen endpoint. Creating a server on an
//! endpoint that already has one merges the two when their kinds agree.
//! Every successful create must be paired with a [`release`]; the
//! listener stops and the entry disappears on the last one.
//!
//! [`release`]: ServerRegistry::release

// ----------

use std::{collections::HashMap, io::Error as IoError, sync::Arc, sync::OnceLock};

use parking_lot::Mutex;

use crate::server::{
	listener::WORKER_COUNT_DEFAULT, Certificate, CertificateError, ListenEndpoint, Server,
	ServerKind, VirtualHost,
};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

static REGISTRY: OnceLock<ServerRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static ServerRegistry {
	REGISTRY.get_or_init(ServerRegistry::new)
}

// --------------------------------------------------
// RegistryError

/// An error type of server creation failures. The endpoint's existing
/// server, when there is one, is never affected.
#[derive(Debug, crate::ImplError)]
pub enum RegistryError {
	/// The endpoint already serves the other kind.
	#[error("endpoint already in use by a server of a different kind")]
	EndpointKindConflict,
	/// The endpoint's server holds a different certificate.
	#[error("certificate differs from the one the endpoint already uses")]
	CertificateMismatch,
	/// A secure server was requested without usable certificate material.
	#[error("no certificate to start a secure server with")]
	NoCertificate,
	#[error("certificate rejected: {0}")]
	Certificate(#[from] CertificateError),
	#[error("listener failed to start: {0}")]
	ListenerStart(IoError),
}

// --------------------------------------------------
// ServerRegistry

struct RegistryEntry {
	server: Arc<Server>,
	use_count: usize,
}

/// The keyed mapping from listen endpoints to live servers.
pub struct ServerRegistry {
	table: Mutex<HashMap<ListenEndpoint, RegistryEntry>>,
}

impl ServerRegistry {
	fn new() -> Self {
		Self {
			table: Mutex::new(HashMap::new()),
		}
	}

	/// A plain HTTP server on `endpoint`, new or merged with the existing
	/// one. `worker_count` of [`WORKER_COUNT_DEFAULT`] asks for the
	/// default pool size; on a merge the existing count wins and a
	/// disagreeing explicit count is only warned about.
	///
	/// # Panics
	/// Must be called within a Tokio runtime.
	///
	/// [`WORKER_COUNT_DEFAULT`]: crate::server::WORKER_COUNT_DEFAULT
	pub fn create_plain(
		&self,
		name: impl Into<String>,
		endpoint: ListenEndpoint,
		worker_count: usize,
	) -> Result<Arc<Server>, RegistryError> {
		let mut table = self.table.lock();

		if let Some(entry) = table.get_mut(&endpoint) {
			if entry.server.kind() != ServerKind::Plain {
				tracing::error!(%endpoint, "endpoint already in use by a secure server");

				return Err(RegistryError::EndpointKindConflict);
			}

			if worker_count != WORKER_COUNT_DEFAULT && worker_count != entry.server.worker_count() {
				tracing::warn!(
					%endpoint,
					requested = worker_count,
					current = entry.server.worker_count(),
					"ignoring the worker count of a later creator",
				);
			}

			entry.use_count += 1;

			return Ok(entry.server.clone());
		}

		let server = Arc::new(Server::start(name, endpoint.clone(), None, worker_count)?);

		table.insert(
			endpoint,
			RegistryEntry {
				server: server.clone(),
				use_count: 1,
			},
		);

		Ok(server)
	}

	/// An HTTPS server on `endpoint` with exactly one certificate, new or
	/// merged with the existing one. Merging requires the certificate to
	/// be byte-equal to the one already in use.
	///
	/// # Panics
	/// Must be called within a Tokio runtime.
	pub fn create_secure(
		&self,
		name: impl Into<String>,
		endpoint: ListenEndpoint,
		certificate: Certificate,
		worker_count: usize,
	) -> Result<Arc<Server>, RegistryError> {
		let mut table = self.table.lock();

		if let Some(entry) = table.get_mut(&endpoint) {
			if entry.server.kind() != ServerKind::Secure {
				tracing::error!(%endpoint, "endpoint already in use by a plain server");

				return Err(RegistryError::EndpointKindConflict);
			}

			if !entry.server.set_certificate(&certificate) {
				tracing::error!(%endpoint, "certificate differs from the endpoint's");

				return Err(RegistryError::CertificateMismatch);
			}

			entry.use_count += 1;

			return Ok(entry.server.clone());
		}

		let server = Arc::new(Server::start(
			name,
			endpoint.clone(),
			Some(certificate),
			worker_count,
		)?);

		table.insert(
			endpoint,
			RegistryEntry {
				server: server.clone(),
				use_count: 1,
			},
		);

		Ok(server)
	}

	/// Like [`create_secure`](Self::create_secure), taking the certificate
	/// of the **first** virtual host. There is no SNI; the one certificate
	/// serves every host.
	pub fn create_secure_from_virtual_hosts(
		&self,
		name: impl Into<String>,
		endpoint: ListenEndpoint,
		virtual_hosts: &[VirtualHost],
		worker_count: usize,
	) -> Result<Arc<Server>, RegistryError> {
		let Some(certificate) = virtual_hosts
			.first()
			.and_then(|virtual_host| virtual_host.certificate())
		else {
			tracing::error!(%endpoint, "no virtual host carries a certificate");

			return Err(RegistryError::NoCertificate);
		};

		self.create_secure(name, endpoint, certificate.clone(), worker_count)
	}

	/// Hands back one use of the server. The last release stops the
	/// listener, removes the entry, and returns the stop flag; earlier
	/// releases return true. A server the registry doesn't know returns
	/// false.
	pub fn release(&self, server: &Arc<Server>) -> bool {
		let mut table = self.table.lock();

		let Some(entry) = table.get_mut(server.endpoint()) else {
			return false;
		};

		if !Arc::ptr_eq(&entry.server, server) {
			return false;
		}

		entry.use_count -= 1;

		if entry.use_count > 0 {
			return true;
		}

		let stopped = entry.server.stop();
		table.remove(server.endpoint());

		tracing::info!(endpoint = %server.endpoint(), "server released");

		stopped
	}

}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

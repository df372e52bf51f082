//! Servers and the endpoint registry.

// ----------

use std::{
	fmt::{self, Display},
	net::SocketAddr,
	sync::Arc,
};

use parking_lot::RwLock;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;

use crate::interceptor::Interceptor;

// --------------------------------------------------

pub(crate) mod listener;
pub mod registry;

use listener::Listener;
pub use listener::WORKER_COUNT_DEFAULT;
use registry::RegistryError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// ListenEndpoint

/// A host and port pair; the registry's key. Hosts are canonicalized to
/// ASCII lowercase so equal endpoints compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenEndpoint {
	host: String,
	port: u16,
}

impl ListenEndpoint {
	pub fn new(host: impl AsRef<str>, port: u16) -> Self {
		Self {
			host: host.as_ref().to_ascii_lowercase(),
			port,
		}
	}

	#[inline(always)]
	pub fn host(&self) -> &str {
		&self.host
	}

	#[inline(always)]
	pub fn port(&self) -> u16 {
		self.port
	}
}

impl Display for ListenEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl From<SocketAddr> for ListenEndpoint {
	fn from(address: SocketAddr) -> Self {
		Self::new(address.ip().to_string(), address.port())
	}
}

// --------------------------------------------------
// Certificate

/// TLS certificate material: a PEM certificate chain and its private key.
/// Two certificates are equal when their bytes are.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
	certificate_pem: Vec<u8>,
	private_key_pem: Vec<u8>,
}

impl Certificate {
	pub fn from_pem(certificate_pem: impl Into<Vec<u8>>, private_key_pem: impl Into<Vec<u8>>) -> Self {
		Self {
			certificate_pem: certificate_pem.into(),
			private_key_pem: private_key_pem.into(),
		}
	}

	pub(crate) fn to_tls_config(&self) -> Result<TlsServerConfig, CertificateError> {
		let certificates = rustls_pemfile::certs(&mut &self.certificate_pem[..])
			.collect::<Result<Vec<CertificateDer<'static>>, _>>()?;

		if certificates.is_empty() {
			return Err(CertificateError::NoCertificate);
		}

		let private_key: PrivateKeyDer<'static> =
			rustls_pemfile::private_key(&mut &self.private_key_pem[..])?
				.ok_or(CertificateError::NoPrivateKey)?;

		TlsServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(certificates, private_key)
			.map_err(CertificateError::Rejected)
	}
}

impl fmt::Debug for Certificate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Certificate").finish_non_exhaustive()
	}
}

// --------------------------------------------------
// CertificateError

/// An error type of certificate failures.
#[derive(Debug, crate::ImplError)]
pub enum CertificateError {
	#[error("malformed PEM")]
	Malformed(#[from] std::io::Error),
	#[error("no certificate in the PEM data")]
	NoCertificate,
	#[error("no private key in the PEM data")]
	NoPrivateKey,
	#[error(transparent)]
	Rejected(tokio_rustls::rustls::Error),
}

// --------------------------------------------------
// VirtualHost

/// Virtual-host information as supplied by the orchestrator.
#[derive(Debug, Clone)]
pub struct VirtualHost {
	name: String,
	some_certificate: Option<Certificate>,
}

impl VirtualHost {
	pub fn new(name: impl Into<String>, some_certificate: Option<Certificate>) -> Self {
		Self {
			name: name.into(),
			some_certificate,
		}
	}

	#[inline(always)]
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn certificate(&self) -> Option<&Certificate> {
		self.some_certificate.as_ref()
	}
}

// --------------------------------------------------
// ServerKind

/// The variant of a server; fixed for the lifetime of its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
	Plain,
	Secure,
}

// --------------------------------------------------
// Server

/// A live server on one listen endpoint.
///
/// Create and release through the [registry](crate::server::registry),
/// where servers sharing an endpoint are merged. Interceptors are mounted
/// in order; the first to claim a request keeps it.
pub struct Server {
	name: String,
	endpoint: ListenEndpoint,
	some_certificate: Option<Certificate>,
	interceptors: Arc<RwLock<Vec<Arc<dyn Interceptor>>>>,
	listener: Listener,
}

impl Server {
	// Binds the endpoint and starts accepting. Everything else about the
	// server is fixed from here on.
	pub(crate) fn start(
		name: impl Into<String>,
		endpoint: ListenEndpoint,
		some_certificate: Option<Certificate>,
		worker_count: usize,
	) -> Result<Self, RegistryError> {
		let name = name.into();

		let some_tls_config = match &some_certificate {
			Some(certificate) => Some(Arc::new(certificate.to_tls_config()?)),
			None => None,
		};

		let interceptors = Arc::new(RwLock::new(Vec::<Arc<dyn Interceptor>>::new()));
		let listener = Listener::start(
			name.clone(),
			&endpoint,
			worker_count,
			some_tls_config,
			interceptors.clone(),
		)
		.map_err(RegistryError::ListenerStart)?;

		Ok(Self {
			name,
			endpoint,
			some_certificate,
			interceptors,
			listener,
		})
	}

	#[inline(always)]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[inline(always)]
	pub fn endpoint(&self) -> &ListenEndpoint {
		&self.endpoint
	}

	pub fn kind(&self) -> ServerKind {
		if self.some_certificate.is_some() {
			ServerKind::Secure
		} else {
			ServerKind::Plain
		}
	}

	/// The address the listener actually bound; differs from the endpoint
	/// when port 0 was requested.
	pub fn local_address(&self) -> SocketAddr {
		self.listener.local_address()
	}

	pub fn worker_count(&self) -> usize {
		self.listener.worker_count()
	}

	/// Appends an interceptor to the mount order. Mount the default
	/// interceptor last; it claims everything.
	pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
		self.interceptors.write().push(interceptor);
	}

	// A secure server's certificate is fixed; "setting" one succeeds only
	// when it's byte-equal to the current one.
	pub(crate) fn set_certificate(&self, certificate: &Certificate) -> bool {
		self.some_certificate.as_ref() == Some(certificate)
	}

	pub(crate) fn stop(&self) -> bool {
		self.listener.stop()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

//! Dialing the instances that functions resolve to.
//!
//! A [Connector] is a [`hyper-util`] connector: the host of each request URI
//! is taken to be a function name, which is resolved through a
//! [ServiceResolver] and dialed according to the [TransportMode].

pub mod mesh;

use crate::endpoint::{Address, Endpoint};
use crate::resolver::{self, ServiceResolver};
use mesh::MeshClient;

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection as HyperUtilConnection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use pin_project::pin_project;
use std::future::Future;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("request URI has no host")]
    MissingHost,

    #[error(transparent)]
    Resolve(#[from] resolver::Error),

    #[error("failed to connect to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("TLS handshake with the mesh sidecar failed")]
    Tls(#[source] io::Error),

    #[error("timed out in the TLS handshake with the mesh sidecar")]
    HandshakeTimeout,

    #[error("{0:?} is not a valid mesh identity")]
    InvalidIdentity(String),

    #[error("resolved {endpoint}, which this transport cannot dial")]
    Mismatch { endpoint: Endpoint },

    #[error("mesh client is closed")]
    Closed,
}

impl Error {
    /// The status a gateway reports when dialing fails this way.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            Error::Resolve(err) => err.status_code(),
            Error::ConnectTimeout(_) | Error::HandshakeTimeout => http::StatusCode::GATEWAY_TIMEOUT,
            Error::MissingHost => http::StatusCode::BAD_REQUEST,
            Error::Mismatch { .. } => http::StatusCode::INTERNAL_SERVER_ERROR,
            Error::Connect { .. }
            | Error::Tls(_)
            | Error::InvalidIdentity(_)
            | Error::Closed => http::StatusCode::BAD_GATEWAY,
        }
    }
}

/// Timeouts and pool sizing of proxied connections.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Default: 10 seconds
    pub tls_handshake_timeout: Duration,

    /// How long an idle connection stays pooled.
    ///
    /// Default: 120 seconds
    pub idle_conn_timeout: Duration,

    /// Default: 1024
    pub max_idle_conns: usize,

    /// Default: 1024
    pub max_idle_conns_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            idle_conn_timeout: Duration::from_secs(120),
            max_idle_conns: 1024,
            max_idle_conns_per_host: 1024,
        }
    }
}

impl TransportConfig {
    // The pool only bounds idle connections per host, so the overall bound
    // caps the per-host one.
    fn idle_per_host(&self) -> usize {
        self.max_idle_conns_per_host.min(self.max_idle_conns)
    }
}

/// How connections to resolved functions are made.
#[derive(Clone, Debug)]
pub enum TransportMode {
    /// Plain TCP to the address of an instance.
    Catalog,

    /// Mutual TLS to the local mesh sidecar, which routes by identity.
    Mesh(MeshClient),
}

impl TransportMode {
    pub fn is_mesh(&self) -> bool {
        matches!(self, TransportMode::Mesh(_))
    }
}

/// Dials functions by name.
#[derive(Clone, Debug)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

#[derive(Debug)]
struct ConnectorInner {
    resolver: ServiceResolver,
    mode: TransportMode,
    config: TransportConfig,
}

impl Connector {
    pub fn new(resolver: ServiceResolver, mode: TransportMode, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                resolver,
                mode,
                config,
            }),
        }
    }

    /// Resolves `function` and connects to what it resolved to.
    #[instrument(level = "debug", skip(self), err, name = "Connector::dial")]
    pub async fn dial(&self, function: &str) -> Result<Stream, Error> {
        let endpoint = self.inner.resolver.resolve(function).await?;
        match (&self.inner.mode, endpoint) {
            (TransportMode::Catalog, Endpoint::Address(address)) => {
                self.dial_address(&address).await
            }
            (TransportMode::Mesh(mesh), Endpoint::Identity(identity)) => {
                let config = &self.inner.config;
                let stream = mesh
                    .dial(&identity, config.connect_timeout, config.tls_handshake_timeout)
                    .await?;
                Ok(Stream::Mesh(TokioIo::new(stream)))
            }
            (_, endpoint) => Err(Error::Mismatch { endpoint }),
        }
    }

    async fn dial_address(&self, address: &Address) -> Result<Stream, Error> {
        let connect = TcpStream::connect((&*address.host, address.port));
        let sock = tokio::time::timeout(self.inner.config.connect_timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(address.to_string()))?
            .map_err(|source| Error::Connect {
                endpoint: address.to_string(),
                source,
            })?;
        if let Err(err) = sock.set_nodelay(true) {
            event!(Level::DEBUG, ?err, "Failed to set TCP_NODELAY");
        }
        Ok(Stream::Plain(TokioIo::new(sock)))
    }

    /// Builds a pooled HTTP client which dials through this connector.
    pub fn build_client<B>(self) -> Client<Self, B>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
    {
        let config = &self.inner.config;
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_conn_timeout)
            .pool_max_idle_per_host(config.idle_per_host())
            .build(self)
    }
}

/// Returns the function named by the host of a request URI.
fn function_of(uri: &http::Uri) -> Option<&str> {
    let host = uri.host()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then_some(host)
}

impl tower_service::Service<http::Uri> for Connector {
    type Response = Stream;
    type Error = Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: http::Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let function = function_of(&uri).ok_or(Error::MissingHost)?;
            connector.dial(function).await
        })
    }
}

/// A connection made by a [Connector].
#[pin_project(project = StreamProj)]
pub enum Stream {
    Plain(#[pin] TokioIo<TcpStream>),
    Mesh(#[pin] TokioIo<TlsStream<TcpStream>>),
}

impl Read for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Plain(sock) => sock.poll_read(cx, buf),
            StreamProj::Mesh(sock) => sock.poll_read(cx, buf),
        }
    }
}

impl Write for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            StreamProj::Plain(sock) => sock.poll_write(cx, buf),
            StreamProj::Mesh(sock) => sock.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Plain(sock) => sock.poll_flush(cx),
            StreamProj::Mesh(sock) => sock.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Plain(sock) => sock.poll_shutdown(cx),
            StreamProj::Mesh(sock) => sock.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            StreamProj::Plain(sock) => sock.poll_write_vectored(cx, bufs),
            StreamProj::Mesh(sock) => sock.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(sock) => sock.is_write_vectored(),
            Stream::Mesh(sock) => sock.is_write_vectored(),
        }
    }
}

impl HyperUtilConnection for Stream {
    fn connected(&self) -> Connected {
        match self {
            Stream::Plain(sock) => sock.connected(),
            Stream::Mesh(_) => Connected::new(),
        }
    }
}

//! Mutual-TLS connections through the local mesh sidecar.

use super::Error as DialError;
use crate::endpoint::{Identity, MeshDomain};

use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid mesh TLS configuration")]
    Tls(#[from] rustls::Error),
}

/// Configuration for dialing through the mesh sidecar.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Default: 127.0.0.1:21000
    pub sidecar: SocketAddr,

    pub domain: MeshDomain,

    /// CA which signed the sidecar's certificate, in PEM form.
    pub ca_cert: PathBuf,

    /// Certificate presented to the sidecar, in PEM form.
    pub client_cert: PathBuf,

    /// Key of `client_cert`, in PEM form.
    pub client_key: PathBuf,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            sidecar: SocketAddr::from(([127, 0, 0, 1], 21000)),
            domain: MeshDomain::default(),
            ca_cert: PathBuf::new(),
            client_cert: PathBuf::new(),
            client_key: PathBuf::new(),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<std::fs::File>, Error> {
    std::fs::File::open(path)
        .map(BufReader::new)
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(Error::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| Error::NoPrivateKey(path.to_path_buf()))
}

/// Builds the client TLS configuration presented to the sidecar.
pub fn client_config(config: &MeshConfig) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.ca_cert)? {
        roots.add(cert)?;
    }
    let certs = load_certs(&config.client_cert)?;
    let key = load_key(&config.client_key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    Ok(tls)
}

/// Dials services through the mesh sidecar.
///
/// Every connection goes to the same sidecar; the identity of the service,
/// sent as the TLS server name, tells the sidecar where to route it.
#[derive(Clone)]
pub struct MeshClient {
    inner: Arc<Inner>,
}

struct Inner {
    sidecar: SocketAddr,
    tls: TlsConnector,
    closed: AtomicBool,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("sidecar", &self.inner.sidecar)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MeshClient {
    pub fn new(config: &MeshConfig) -> Result<Self, Error> {
        let tls = client_config(config)?;
        Ok(Self::with_tls_config(config.sidecar, Arc::new(tls)))
    }

    pub fn with_tls_config(sidecar: SocketAddr, tls: Arc<ClientConfig>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sidecar,
                tls: TlsConnector::from(tls),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Opens a connection to the service named by `identity`.
    pub async fn dial(
        &self,
        identity: &Identity,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<TlsStream<TcpStream>, DialError> {
        if self.is_closed() {
            return Err(DialError::Closed);
        }
        let server_name = ServerName::try_from(identity.as_str().to_string())
            .map_err(|_| DialError::InvalidIdentity(identity.to_string()))?;

        let sidecar = self.inner.sidecar;
        let sock = tokio::time::timeout(connect_timeout, TcpStream::connect(sidecar))
            .await
            .map_err(|_| DialError::ConnectTimeout(sidecar.to_string()))?
            .map_err(|source| DialError::Connect {
                endpoint: sidecar.to_string(),
                source,
            })?;
        tokio::time::timeout(handshake_timeout, self.inner.tls.connect(server_name, sock))
            .await
            .map_err(|_| DialError::HandshakeTimeout)?
            .map_err(DialError::Tls)
    }

    /// Stops new connections through the sidecar. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            event!(Level::INFO, sidecar = %self.inner.sidecar, "Closed mesh client");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::MeshPki;
    use std::sync::Arc;

    const ECHO: &str = "faas-fn-echo.default.dc1.internal.consul";
    const SECOND: Duration = Duration::from_secs(1);

    fn client(sidecar: SocketAddr) -> MeshClient {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        MeshClient::with_tls_config(sidecar, Arc::new(tls))
    }

    fn identity(s: &str) -> Identity {
        Identity(Arc::from(s))
    }

    #[test]
    fn missing_material_is_reported() {
        let err = MeshClient::new(&MeshConfig {
            ca_cert: PathBuf::from("/nonexistent/ca.pem"),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn mutual_tls_names_the_identity() {
        let pki = MeshPki::generate(ECHO);
        let (sidecar, handshake) = pki.sidecar().await;
        let client = MeshClient::new(&pki.mesh_config(sidecar)).unwrap();

        let stream = client.dial(&identity(ECHO), SECOND, SECOND).await.unwrap();
        let handshake = handshake.await.unwrap();
        assert_eq!(handshake.server_name.as_deref(), Some(ECHO));
        assert_eq!(handshake.client_certificates, 1);
        drop(stream);
    }

    #[tokio::test]
    async fn closed_client_refuses_to_dial() {
        let client = client("127.0.0.1:1".parse().unwrap());
        client.close();
        client.close();
        assert!(client.is_closed());
        let err = client
            .dial(&identity(ECHO), SECOND, SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Closed), "{err:?}");
    }

    #[tokio::test]
    async fn invalid_identity_is_rejected() {
        let client = client("127.0.0.1:1".parse().unwrap());
        let err = client
            .dial(&identity("not a hostname"), SECOND, SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::InvalidIdentity(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unreachable_sidecar_times_out() {
        // A listener which never accepts, with its backlog filled, leaves
        // further connection attempts waiting.
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let sidecar = socket.local_addr().unwrap();
        let _listener = socket.listen(1).unwrap();
        let mut held = Vec::new();
        for _ in 0..64 {
            let connect = TcpStream::connect(sidecar);
            match tokio::time::timeout(Duration::from_millis(200), connect).await {
                Ok(Ok(sock)) => held.push(sock),
                _ => break,
            }
        }

        let client = client(sidecar);
        let err = client
            .dial(&identity(ECHO), Duration::from_millis(100), SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::ConnectTimeout(_)), "{err:?}");
        assert_eq!(err.status_code(), http::StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn silent_sidecar_times_out() {
        // Accepts the connection but never answers the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sidecar = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let client = client(sidecar);
        let err = client
            .dial(&identity(ECHO), SECOND, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::HandshakeTimeout), "{err:?}");
        server.abort();
    }
}

//! Utilities to help with testing the bridge

use crate::catalog::{self, Catalog, QueryOptions, QueryResult};
use crate::catalogs::fixed::FixedCatalog;
use crate::endpoint::MeshDomain;
use crate::service;
use crate::transport::mesh::MeshConfig;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    // Each test installs its own; only the first one sticks.
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds, panicking after ten seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}

/// A test-only catalog which can be told to fail every query, to mimic
/// an unreachable agent.
pub struct FlakyCatalog {
    inner: FixedCatalog,
    failing: AtomicBool,
    failures: AtomicUsize,
}

impl FlakyCatalog {
    /// Creates a catalog answering from `inner` until told to fail.
    pub fn new(inner: FixedCatalog) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Number of queries failed so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for FlakyCatalog {
    async fn query(
        &self,
        service: &service::Name,
        options: &QueryOptions,
    ) -> Result<QueryResult, catalog::Error> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            // Fail slowly enough that a retrying caller doesn't spin.
            tokio::time::sleep(Duration::from_millis(5)).await;
            return Err(catalog::Error::Other(anyhow!("catalog unavailable")));
        }
        self.inner.query(service, options).await
    }
}

/// Serves `handler` over HTTP/1 on an ephemeral local port until the
/// runtime shuts down.
pub async fn serve<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let response = handler(request);
                    async move { Ok::<_, Infallible>(response.await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(sock), service)
                    .await;
            });
        }
    });
    addr
}

/// Requests seen by a [serve] handler, as path-and-query and token.
#[derive(Clone, Default)]
pub struct Recorded {
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Recorded {
    pub fn record(&self, request: &Request<Incoming>) {
        let uri = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        let token = request
            .headers()
            .get("x-consul-token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.requests.lock().unwrap().push((uri, token));
    }

    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

/// A throwaway mesh CA, with a sidecar certificate for one identity and a
/// client certificate for the bridge.
///
/// The client's material is written as PEM files, the way [MeshConfig]
/// expects it; they are removed on drop.
pub struct MeshPki {
    dir: PathBuf,
    ca: CertificateDer<'static>,
    sidecar_cert: CertificateDer<'static>,
    sidecar_key: Vec<u8>,
}

impl MeshPki {
    pub fn generate(identity: &str) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "faas-bridge-pki-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = distinguished_name("faas-bridge test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let issue = |common_name: &str, san: &str| {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(vec![san.to_string()]).unwrap();
            params.distinguished_name = distinguished_name(common_name);
            let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
            (cert, key)
        };
        let (sidecar_cert, sidecar_key) = issue("sidecar", identity);
        let (client_cert, client_key) = issue("bridge", "bridge.internal");

        std::fs::write(dir.join("ca.pem"), ca.pem()).unwrap();
        std::fs::write(dir.join("client.pem"), client_cert.pem()).unwrap();
        std::fs::write(dir.join("client-key.pem"), client_key.serialize_pem()).unwrap();

        Self {
            dir,
            ca: ca.der().clone(),
            sidecar_cert: sidecar_cert.der().clone(),
            sidecar_key: sidecar_key.serialize_der(),
        }
    }

    /// Configuration for dialing a sidecar at `sidecar` with this material.
    pub fn mesh_config(&self, sidecar: SocketAddr) -> MeshConfig {
        MeshConfig {
            sidecar,
            domain: MeshDomain::default(),
            ca_cert: self.dir.join("ca.pem"),
            client_cert: self.dir.join("client.pem"),
            client_key: self.dir.join("client-key.pem"),
        }
    }

    fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.sidecar_key.clone()));
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.sidecar_cert.clone()], key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    /// Starts a sidecar which completes one handshake, requiring a client
    /// certificate signed by this CA, and reports what the client sent.
    pub async fn sidecar(&self) -> (SocketAddr, JoinHandle<Handshake>) {
        let acceptor = self.acceptor();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let stream = acceptor.accept(sock).await.unwrap();
            let (_, connection) = stream.get_ref();
            Handshake {
                server_name: connection.server_name().map(str::to_string),
                client_certificates: connection.peer_certificates().map_or(0, |certs| certs.len()),
            }
        });
        (addr, handle)
    }
}

impl Drop for MeshPki {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// What a [MeshPki::sidecar] saw of the client's handshake.
#[derive(Debug)]
pub struct Handshake {
    pub server_name: Option<String>,
    pub client_certificates: usize,
}

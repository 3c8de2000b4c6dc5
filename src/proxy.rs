//! Forwarding of function invocations to the instances they resolve to.

use crate::catalog;
use crate::catalogs::consul::ConsulCatalog;
use crate::config::ProviderConfig;
use crate::resolver::ServiceResolver;
use crate::service::is_valid_function_name;
use crate::transport::mesh::{self, MeshClient};
use crate::transport::{self, Connector, TransportConfig, TransportMode};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, instrument, Level};

/// Body of proxied requests and responses.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Port on which function instances serve invocations.
pub const WATCHDOG_PORT: u16 = 8080;

const FUNCTION_PREFIX: &str = "/function/";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

const PROXIED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create the catalog client")]
    Catalog(#[from] catalog::Error),

    #[error("failed to create the mesh client")]
    Mesh(#[from] mesh::Error),
}

/// Configuration of the proxy.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// How long to wait for an upstream response to begin.
    ///
    /// Default: 10 seconds
    pub read_timeout: Duration,

    pub transport: TransportConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            transport: TransportConfig::default(),
        }
    }
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Splits `/function/{name}[/{rest}]` into the name and `/{rest}`.
fn split_function_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(FUNCTION_PREFIX)?;
    let (name, tail) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, "/"),
    };
    is_valid_function_name(name).then_some((name, tail))
}

// Walks the error chain for the connector's error, which knows what went
// wrong; anything else is the upstream misbehaving.
fn gateway_status(err: &(dyn std::error::Error + 'static)) -> StatusCode {
    let mut source = Some(err);
    while let Some(err) = source {
        if let Some(err) = err.downcast_ref::<transport::Error>() {
            return err.status_code();
        }
        source = err.source();
    }
    StatusCode::BAD_GATEWAY
}

type ProxyClient = Client<Connector, ProxyBody>;

/// A cloneable HTTP service forwarding invocations to function instances.
///
/// Clones share one pooled client, which [ProxyHandler::close] takes away
/// from all of them at once.
#[derive(Clone, Debug)]
pub struct ProxyService {
    client: Arc<ArcSwapOption<ProxyClient>>,
    read_timeout: Duration,
    peer: Option<SocketAddr>,
}

impl ProxyService {
    /// Returns a service which reports `peer` as the client address.
    pub fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..self.clone()
        }
    }

    /// Forwards `request` to an instance of the function named in its path.
    ///
    /// Failures are reported as responses, never as errors.
    #[instrument(
        level = "debug",
        skip(self, request),
        fields(method = %request.method(), path = request.uri().path()),
        name = "ProxyService::forward",
    )]
    pub async fn forward(&self, request: Request<ProxyBody>) -> Response<ProxyBody> {
        if !PROXIED_METHODS.contains(request.method()) {
            return text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("Method {} is not allowed", request.method()),
            );
        }
        let Some((function, rest)) = split_function_path(request.uri().path()) else {
            return text_response(
                StatusCode::BAD_REQUEST,
                "Provide function name in the request path".to_string(),
            );
        };
        let function = function.to_string();
        // In-flight requests keep their own handle; the pool goes away with
        // the last of them.
        let Some(client) = self.client.load_full() else {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Proxy is closed, cannot forward to: {function}."),
            );
        };
        let path_and_query = match request.uri().query() {
            Some(query) => format!("{rest}?{query}"),
            None => rest.to_string(),
        };

        let upstream = match self.upstream_request(request, &function, &path_and_query) {
            Ok(upstream) => upstream,
            Err(err) => {
                event!(Level::WARN, %function, ?err, "Cannot build upstream request");
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid request for function {function}"),
                );
            }
        };

        match tokio::time::timeout(self.read_timeout, client.request(upstream)).await {
            Ok(Ok(response)) => response.map(BodyExt::boxed),
            Ok(Err(err)) => {
                let status = gateway_status(&err);
                event!(Level::WARN, %function, %status, ?err, "Proxy request failed");
                let message = if status == StatusCode::NOT_FOUND {
                    format!("Cannot find service: {function}.")
                } else {
                    format!("Can't reach service for: {function}.")
                };
                text_response(status, message)
            }
            Err(_) => {
                event!(Level::WARN, %function, timeout = ?self.read_timeout, "Proxy request timed out");
                text_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("Timed out waiting for: {function}."),
                )
            }
        }
    }

    fn upstream_request(
        &self,
        request: Request<ProxyBody>,
        function: &str,
        path_and_query: &str,
    ) -> Result<Request<ProxyBody>, http::Error> {
        let uri = Uri::builder()
            .scheme("http")
            .authority(format!("{function}:{WATCHDOG_PORT}"))
            .path_and_query(path_and_query)
            .build()?;

        let (mut parts, body) = request.into_parts();
        let original_host = parts
            .headers
            .remove(HOST)
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
            });
        if !parts.headers.contains_key(X_FORWARDED_HOST) {
            if let Some(host) = original_host {
                parts.headers.insert(X_FORWARDED_HOST, host);
            }
        }
        if !parts.headers.contains_key(X_FORWARDED_FOR) {
            if let Some(peer) = self.peer {
                parts
                    .headers
                    .insert(X_FORWARDED_FOR, HeaderValue::from_str(&peer.ip().to_string())?);
            }
        }
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        Ok(Request::from_parts(parts, body))
    }
}

impl hyper::service::Service<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.forward(request.map(BodyExt::boxed)).await) })
    }
}

/// Owns the resolver and transport behind the proxy, and their shutdown.
#[derive(Debug)]
pub struct ProxyHandler {
    resolver: ServiceResolver,
    mode: TransportMode,
    service: ProxyService,
    closed: AtomicBool,
}

impl ProxyHandler {
    /// Creates a handler dialing with `mode`.
    ///
    /// In mesh mode, `resolver` should be configured with a mesh domain so
    /// that it resolves to identities; addresses cannot be dialed through
    /// the sidecar.
    pub fn new(resolver: ServiceResolver, mode: TransportMode, config: ProxyConfig) -> Self {
        let connector = Connector::new(resolver.clone(), mode.clone(), config.transport);
        let service = ProxyService {
            client: Arc::new(ArcSwapOption::from_pointee(connector.build_client())),
            read_timeout: config.read_timeout,
            peer: None,
        };
        Self {
            resolver,
            mode,
            service,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates the catalog client, resolver and transport described by
    /// `config`, and a handler owning them.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, Error> {
        let catalog = Arc::new(ConsulCatalog::new(&config.consul)?);
        let mode = if config.connect_aware {
            TransportMode::Mesh(MeshClient::new(&config.mesh_config())?)
        } else {
            TransportMode::Catalog
        };
        let resolver = ServiceResolver::new(catalog, config.canonicalizer(), config.policy())
            .unwrap_or_else(|err| {
                event!(Level::WARN, %err, "Continuing without USDT probes");
                err.into_inner()
            });
        event!(
            Level::INFO,
            mesh = mode.is_mesh(),
            strategy = config.proxy.strategy.as_str(),
            "Created proxy handler",
        );
        Ok(Self::new(resolver, mode, config.proxy_config()))
    }

    /// Returns the HTTP service forwarding invocations.
    pub fn handler(&self) -> ProxyService {
        self.service.clone()
    }

    pub fn resolver(&self) -> &ServiceResolver {
        &self.resolver
    }

    pub fn mode(&self) -> &TransportMode {
        &self.mode
    }

    /// Drops the pooled connections, releases the mesh client and stops
    /// the resolver's worker.
    ///
    /// Idempotent. Requests forwarded afterwards, through any clone of
    /// [Self::handler], fail with 503.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.service.client.store(None);
        if let TransportMode::Mesh(client) = &self.mode {
            client.close();
        }
        self.resolver.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalogs::fixed::FixedCatalog;
    use crate::endpoint::Endpoint;
    use crate::policy::Policy;
    use crate::resolver::RegistrationError;
    use crate::service::Canonicalizer;
    use crate::test_utils::{serve, setup_tracing_subscriber};

    async fn echo_upstream() -> SocketAddr {
        serve(|request: Request<Incoming>| async move {
            let (parts, body) = request.into_parts();
            let body = body.collect().await.unwrap().to_bytes();
            let mut response = Response::new(Full::new(Bytes::from(format!(
                "{} {} {}",
                parts.method,
                parts.uri,
                String::from_utf8_lossy(&body),
            ))));
            for name in [X_FORWARDED_HOST, X_FORWARDED_FOR] {
                if let Some(value) = parts.headers.get(name) {
                    response.headers_mut().insert(name, value.clone());
                }
            }
            response
        })
        .await
    }

    fn handler(catalog: FixedCatalog, config: ProxyConfig) -> ProxyHandler {
        let resolver = ServiceResolver::new(Arc::new(catalog), Canonicalizer::default(), Policy::default())
            .unwrap_or_else(RegistrationError::into_inner);
        ProxyHandler::new(resolver, TransportMode::Catalog, config)
    }

    fn request(method: Method, uri: &str, body: &'static str) -> Request<ProxyBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "gateway.example:8080")
            .body(full(body))
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn splits_function_paths() {
        assert_eq!(split_function_path("/function/echo"), Some(("echo", "/")));
        assert_eq!(
            split_function_path("/function/echo/a/b"),
            Some(("echo", "/a/b"))
        );
        assert_eq!(split_function_path("/function/"), None);
        assert_eq!(split_function_path("/function"), None);
        assert_eq!(split_function_path("/system/functions"), None);
    }

    #[tokio::test]
    async fn forwards_to_resolved_instance() {
        setup_tracing_subscriber();
        let upstream = echo_upstream().await;
        let catalog = FixedCatalog::new().with_service("faas-fn-echo", [Endpoint::from(upstream)]);
        let handler = handler(catalog, ProxyConfig::default());
        let service = handler.handler().for_peer("192.0.2.7:5555".parse().unwrap());

        let response = service
            .forward(request(Method::POST, "/function/echo/hello?x=1", "ping"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[X_FORWARDED_HOST],
            "gateway.example:8080"
        );
        assert_eq!(response.headers()[X_FORWARDED_FOR], "192.0.2.7");
        assert_eq!(body_text(response).await, "POST /hello?x=1 ping");

        let response = service
            .forward(request(Method::GET, "/function/echo.default", ""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "GET / ");
        handler.close();
    }

    #[tokio::test]
    async fn reports_resolution_failures() {
        setup_tracing_subscriber();
        let handler = handler(FixedCatalog::new(), ProxyConfig::default());
        let service = handler.handler();

        let response = service
            .forward(request(Method::GET, "/function/missing", ""))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Cannot find service: missing.");

        let response = service.forward(request(Method::GET, "/function/", "")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = service
            .forward(request(Method::TRACE, "/function/echo", ""))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        handler.close();
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        setup_tracing_subscriber();
        let upstream = serve(|_request: Request<Incoming>| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Response::new(Full::new(Bytes::from_static(b"late")))
        })
        .await;
        let catalog = FixedCatalog::new().with_service("faas-fn-slow", [Endpoint::from(upstream)]);
        let handler = handler(
            catalog,
            ProxyConfig {
                read_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );

        let response = handler
            .handler()
            .forward(request(Method::GET, "/function/slow", ""))
            .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        handler.close();
    }

    #[tokio::test]
    async fn closed_handler_stops_forwarding() {
        setup_tracing_subscriber();
        let upstream = echo_upstream().await;
        let catalog = FixedCatalog::new().with_service("faas-fn-echo", [Endpoint::from(upstream)]);
        let handler = handler(catalog, ProxyConfig::default());
        let service = handler.handler();

        // Leaves a pooled connection to the instance behind.
        let response = service
            .forward(request(Method::GET, "/function/echo", ""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "GET / ");

        handler.close();
        handler.close();
        assert!(handler.resolver().is_terminated());

        let response = service
            .forward(request(Method::GET, "/function/echo", ""))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_text(response).await,
            "Proxy is closed, cannot forward to: echo."
        );

        let response = handler
            .handler()
            .forward(request(Method::GET, "/function/echo", ""))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

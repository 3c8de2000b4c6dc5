//! Serves the function proxy over HTTP until told to stop.

use anyhow::{anyhow, Context};
use bytes::Bytes;
use clap::Parser;
use faas_bridge::config::{LogConfig, LogFormat, ProviderConfig};
use faas_bridge::proxy::{ProxyBody, ProxyHandler, ProxyService};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// JSON file of settings; keys it leaves out are read from the
    /// environment
    #[clap(long, short = 'c')]
    pub config: Option<PathBuf>,
}

fn setup_logging(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&log.level)
        .with_context(|| format!("invalid log level {:?}", log.level))?;
    let writer = match &log.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match log.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| anyhow!("failed to install logger: {err}"))
}

async fn route(proxy: ProxyService, request: Request<Incoming>) -> Response<ProxyBody> {
    if request.uri().path() == "/healthz" {
        let body = Full::new(Bytes::from_static(b"OK"))
            .map_err(|never| match never {})
            .boxed();
        return Response::new(body);
    }
    proxy.forward(request.map(BodyExt::boxed)).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ProviderConfig::from_file(path),
        None => ProviderConfig::from_env(),
    }
    .context("failed to load configuration")?;
    setup_logging(&config.log)?;

    let handler = ProxyHandler::from_config(&config).context("failed to create proxy")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.faas.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        consul = %config.consul.address,
        mesh = handler.mode().is_mesh(),
        "Listening"
    );

    let graceful = GracefulShutdown::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (sock, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let proxy = handler.handler().for_peer(peer);
                let service = service_fn(move |request| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, Infallible>(route(proxy, request).await) }
                });
                let connection = graceful.watch(
                    http1::Builder::new().serve_connection(TokioIo::new(sock), service),
                );
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(%peer, error = %e, "Connection ended with error");
                    }
                });
            }
            () = &mut shutdown => break,
        }
    }

    drop(listener);
    if tokio::time::timeout(config.faas.write_timeout, graceful.shutdown())
        .await
        .is_err()
    {
        warn!(timeout = ?config.faas.write_timeout, "Abandoning in-flight requests");
    }
    handler.close();
    handler.resolver().terminate().await;
    info!("Shutdown complete");
    Ok(())
}

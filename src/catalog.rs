//! The interface for the service catalog, which tracks healthy instances.

use crate::endpoint::Endpoint;
use crate::service;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("catalog request failed")]
    Http(#[from] reqwest::Error),

    #[error("catalog responded with status {0}")]
    Status(reqwest::StatusCode),

    #[error("failed to decode catalog response")]
    Decode(#[source] reqwest::Error),

    #[error("catalog response has a missing or invalid {0} header")]
    InvalidHeader(&'static str),

    #[error("failed to read catalog TLS material from {path}")]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Parameters of a single catalog query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// When non-zero, the catalog holds the query open until its state moves
    /// past this index or `wait` elapses.
    pub index: u64,

    /// Upper bound on how long a blocking query is held open.
    pub wait: Option<Duration>,

    /// Allows any catalog server to answer, not only the leader.
    pub allow_stale: bool,
}

impl QueryOptions {
    /// A query which returns immediately.
    pub fn immediate() -> Self {
        Self {
            index: 0,
            wait: None,
            allow_stale: true,
        }
    }

    /// A query which blocks until the catalog moves past `index`.
    pub fn blocking(index: u64, wait: Duration) -> Self {
        Self {
            index: index.max(1),
            wait: Some(wait),
            allow_stale: true,
        }
    }
}

/// The healthy instances of a service, as of some catalog index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub index: u64,

    /// How long since the answering server last heard from the leader.
    pub last_contact: Duration,

    pub endpoints: Vec<Endpoint>,
}

/// Looks up the instances of a service which pass their health checks.
///
/// Implementations report what the catalog knows; they do not cache, balance,
/// or retry.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn query(
        &self,
        service: &service::Name,
        options: &QueryOptions,
    ) -> Result<QueryResult, Error>;
}

/// Helper type for anything that implements the Catalog interface.
pub type SharedCatalog = Arc<dyn Catalog>;

/// Issues `options` against `catalog`, repeating it as a consistent read if
/// the stale answer lags the leader by more than `max_stale`.
pub async fn query_bounded(
    catalog: &dyn Catalog,
    service: &service::Name,
    options: &QueryOptions,
    max_stale: Duration,
) -> Result<QueryResult, Error> {
    let result = catalog.query(service, options).await?;
    if !options.allow_stale || result.last_contact <= max_stale {
        return Ok(result);
    }
    event!(
        Level::DEBUG,
        %service,
        last_contact = ?result.last_contact,
        "Stale catalog answer; retrying as a consistent read",
    );
    let consistent = QueryOptions {
        allow_stale: false,
        ..options.clone()
    };
    catalog.query(service, &consistent).await
}

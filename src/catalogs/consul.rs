//! Implementation of [Catalog] against the Consul health API.

use crate::catalog::{Catalog, Error, QueryOptions, QueryResult};
use crate::endpoint::{Address, Endpoint};
use crate::service;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{event, instrument, Level};

const INDEX_HEADER: &str = "X-Consul-Index";
const LAST_CONTACT_HEADER: &str = "X-Consul-LastContact";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Configuration for talking to a Consul agent.
///
/// Deserializes from the flat `consul_*` settings keys.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Base URL of the agent.
    ///
    /// Default: http://localhost:8500
    #[serde(rename = "consul_addr", deserialize_with = "crate::config::de::string")]
    pub address: String,

    /// ACL token sent with every request.
    #[serde(rename = "consul_token", deserialize_with = "crate::config::de::optional_string")]
    pub token: Option<String>,

    /// CA used to verify the agent, in PEM form.
    #[serde(rename = "consul_tls_ca", deserialize_with = "crate::config::de::optional_path")]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate presented to the agent, in PEM form.
    #[serde(rename = "consul_tls_cert", deserialize_with = "crate::config::de::optional_path")]
    pub client_cert: Option<PathBuf>,

    /// Key of `client_cert`, in PEM form.
    #[serde(rename = "consul_tls_key", deserialize_with = "crate::config::de::optional_path")]
    pub client_key: Option<PathBuf>,

    /// Default: false
    #[serde(rename = "consul_tls_skip_verify", deserialize_with = "crate::config::de::boolean")]
    pub tls_skip_verify: bool,

    /// Timeout of a query which does not block.
    ///
    /// Default: 10 seconds
    #[serde(skip)]
    pub query_timeout: Duration,

    /// Added to the wait time of blocking queries to form their timeout.
    ///
    /// Consul adds up to `wait / 16` of jitter to a blocking query; this
    /// covers that and the round trip.
    ///
    /// Default: 5 seconds
    #[serde(skip)]
    pub blocking_margin: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8500".to_string(),
            token: None,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            tls_skip_verify: false,
            query_timeout: Duration::from_secs(10),
            blocking_margin: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: Node,
    service: AgentService,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Node {
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(default)]
    address: String,
    port: u16,
}

impl HealthEntry {
    fn into_endpoint(self) -> Endpoint {
        let host = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };
        Endpoint::Address(Address::new(host, self.service.port))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|source| Error::Tls {
        path: path.to_path_buf(),
        source,
    })
}

fn header_u64(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>, Error> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or(Error::InvalidHeader(name))
}

/// A [`Catalog`] asking a Consul agent for the passing instances of a service.
#[derive(Clone, Debug)]
pub struct ConsulCatalog {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
    query_timeout: Duration,
    blocking_margin: Duration,
}

impl ConsulCatalog {
    pub fn new(config: &ConsulConfig) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(config.tls_skip_verify);

        if let Some(ca) = &config.ca_cert {
            let ca = reqwest::Certificate::from_pem(&read_pem(ca)?)?;
            builder = builder.add_root_certificate(ca);
        }
        if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
            let mut pem = read_pem(cert)?;
            pem.push(b'\n');
            pem.extend(read_pem(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            query_timeout: config.query_timeout,
            blocking_margin: config.blocking_margin,
        })
    }
}

#[async_trait]
impl Catalog for ConsulCatalog {
    #[instrument(level = "trace", skip(self), err, name = "ConsulCatalog::query")]
    async fn query(
        &self,
        service: &service::Name,
        options: &QueryOptions,
    ) -> Result<QueryResult, Error> {
        let url = format!("{}/v1/health/service/{}", self.address, service);
        let mut params = vec![("passing", String::new())];
        if options.allow_stale {
            params.push(("stale", String::new()));
        }
        let mut timeout = self.query_timeout;
        if options.index > 0 {
            params.push(("index", options.index.to_string()));
            if let Some(wait) = options.wait {
                params.push(("wait", format!("{}ms", wait.as_millis())));
                timeout = wait + wait / 16 + self.blocking_margin;
            }
        }

        let mut request = self.client.get(&url).query(&params).timeout(timeout);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status));
        }

        let index =
            header_u64(response.headers(), INDEX_HEADER)?.ok_or(Error::InvalidHeader(INDEX_HEADER))?;
        let last_contact = header_u64(response.headers(), LAST_CONTACT_HEADER)?
            .map(Duration::from_millis)
            .unwrap_or_default();

        let entries: Vec<HealthEntry> = response.json().await.map_err(Error::Decode)?;
        let endpoints: Vec<Endpoint> = entries.into_iter().map(HealthEntry::into_endpoint).collect();
        event!(
            Level::TRACE,
            %service,
            index,
            endpoints = endpoints.len(),
            "Catalog answered",
        );

        Ok(QueryResult {
            index,
            last_contact,
            endpoints,
        })
    }
}

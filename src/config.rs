//! Provider configuration, read from the environment or a JSON file.
//!
//! Settings are flat keys (`consul_addr`, `read_timeout`, ...), matched
//! case-insensitively against environment variables. Every setting has a
//! default; see [ProviderConfig::from_file] for how sources are layered.

use crate::balancer::Strategy;
use crate::catalogs::consul::ConsulConfig;
use crate::endpoint::MeshDomain;
use crate::policy::Policy;
use crate::proxy::ProxyConfig;
use crate::service::Canonicalizer;
use crate::transport::mesh::MeshConfig;
use crate::transport::TransportConfig;

use figment::providers::{Env, Format, Json};
use figment::value::{Dict, Map, Value};
use figment::{Figment, Metadata, Profile, Provider};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Figment(Box<figment::Error>),

    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Wraps a provider, dropping settings which are empty or null so that
/// they read as unset.
struct NonEmpty<P>(P);

impl<P: Provider> Provider for NonEmpty<P> {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut data = self.0.data()?;
        for dict in data.values_mut() {
            dict.retain(|_, value| match value {
                Value::String(_, s) => !s.is_empty(),
                Value::Empty(..) => false,
                _ => true,
            });
        }
        Ok(data)
    }

    fn profile(&self) -> Option<Profile> {
        self.0.profile()
    }
}

/// How the function names handed to the bridge map to scheduler jobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Default: "faas-fn-"
    #[serde(rename = "job_name_prefix", deserialize_with = "de::string")]
    pub job_name_prefix: String,

    /// Default: "default"
    #[serde(rename = "job_namespace", deserialize_with = "de::string")]
    pub namespace: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            job_name_prefix: "faas-fn-".to_string(),
            namespace: "default".to_string(),
        }
    }
}

/// Balancing and caching of resolved functions.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Unknown names fall back to round robin.
    #[serde(rename = "proxy_strategy", deserialize_with = "de::strategy")]
    pub strategy: Strategy,

    /// Zero reads as unset.
    ///
    /// Default: None, the cache is never reset
    #[serde(
        rename = "proxy_cache_reset_interval",
        deserialize_with = "de::optional_duration"
    )]
    pub cache_reset_interval: Option<Duration>,
}

/// Where the mesh sidecar listens, and what the bridge presents to it.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Default: 127.0.0.1:21000
    #[serde(rename = "mesh_sidecar_addr", deserialize_with = "de::parsed")]
    pub sidecar: SocketAddr,

    /// Default: "dc1"
    #[serde(rename = "mesh_datacenter", deserialize_with = "de::string")]
    pub datacenter: String,

    /// Default: "consul"
    #[serde(rename = "mesh_trust_domain", deserialize_with = "de::string")]
    pub trust_domain: String,

    #[serde(rename = "mesh_tls_ca", deserialize_with = "de::path")]
    pub ca_cert: PathBuf,

    #[serde(rename = "mesh_tls_cert", deserialize_with = "de::path")]
    pub client_cert: PathBuf,

    #[serde(rename = "mesh_tls_key", deserialize_with = "de::path")]
    pub client_key: PathBuf,
}

impl Default for MeshSettings {
    fn default() -> Self {
        let mesh = MeshConfig::default();
        Self {
            sidecar: mesh.sidecar,
            datacenter: mesh.domain.datacenter,
            trust_domain: mesh.domain.trust_domain,
            ca_cert: mesh.ca_cert,
            client_cert: mesh.client_cert,
            client_key: mesh.client_key,
        }
    }
}

/// Settings of the HTTP surface and the connections behind it.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FaasConfig {
    /// Default: 8080
    #[serde(deserialize_with = "de::parsed")]
    pub port: u16,

    /// Bounds dialing an instance and waiting for its response.
    ///
    /// Default: 10 seconds
    #[serde(deserialize_with = "de::duration")]
    pub read_timeout: Duration,

    /// Bounds draining in-flight requests at shutdown.
    ///
    /// Default: 10 seconds
    #[serde(deserialize_with = "de::duration")]
    pub write_timeout: Duration,

    /// Default: 1024
    #[serde(deserialize_with = "de::parsed")]
    pub max_idle_conns: usize,

    /// Default: 1024
    #[serde(deserialize_with = "de::parsed")]
    pub max_idle_conns_per_host: usize,

    /// Default: 120 seconds
    #[serde(deserialize_with = "de::duration")]
    pub idle_conn_timeout: Duration,

    /// Default: 10 seconds
    #[serde(deserialize_with = "de::duration")]
    pub tls_handshake_timeout: Duration,
}

impl Default for FaasConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_idle_conns: 1024,
            max_idle_conns_per_host: 1024,
            idle_conn_timeout: Duration::from_secs(120),
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A `tracing` filter directive.
    ///
    /// Default: "info"
    #[serde(rename = "log_level", deserialize_with = "de::string")]
    pub level: String,

    #[serde(rename = "log_format", deserialize_with = "de::parsed")]
    pub format: LogFormat,

    /// Default: None, logs go to stdout
    #[serde(rename = "log_file", deserialize_with = "de::optional_path")]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Everything the bridge can be configured with.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub consul: ConsulConfig,

    /// Whether functions are reached through the mesh sidecar.
    ///
    /// Default: false
    #[serde(
        rename = "consul_connect_aware",
        default,
        deserialize_with = "de::boolean"
    )]
    pub connect_aware: bool,

    #[serde(flatten)]
    pub scheduling: SchedulingConfig,

    #[serde(flatten)]
    pub proxy: ProxySettings,

    #[serde(flatten)]
    pub mesh: MeshSettings,

    #[serde(flatten)]
    pub faas: FaasConfig,

    #[serde(flatten)]
    pub log: LogConfig,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parses `value` as a duration: a bare number of seconds, or a number with
/// one of the `ms`, `s`, `m` or `h` suffixes.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(at) => value.split_at(at),
        None => (value, "s"),
    };
    let number: f64 = number.parse().ok()?;
    let secs = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

/// Deserializers for settings.
///
/// The environment provider types the values it can parse (`8080` arrives
/// as a number, `true` as a boolean) and JSON files are typed already, so
/// every setting is first read back as the text it was written as.
pub(crate) mod de {
    use super::{parse_bool, parse_duration};
    use crate::balancer::Strategy;

    use serde::de::{Error, Visitor};
    use serde::Deserializer;
    use std::fmt;
    use std::path::PathBuf;
    use std::str::FromStr;
    use std::time::Duration;

    struct Scalar;

    impl Visitor<'_> for Scalar {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string, number or boolean")
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_char<E: Error>(self, v: char) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_bool<E: Error>(self, v: bool) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: Error>(self, v: f64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    fn scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        deserializer.deserialize_any(Scalar)
    }

    fn invalid<E: Error>(value: &str) -> E {
        E::custom(format!("invalid value {value:?}"))
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        scalar(deserializer)
    }

    pub fn optional_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Some(scalar(deserializer)?).filter(|value| !value.is_empty()))
    }

    pub fn path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        scalar(deserializer).map(PathBuf::from)
    }

    pub fn optional_path<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<PathBuf>, D::Error> {
        Ok(optional_string(deserializer)?.map(PathBuf::from))
    }

    pub fn boolean<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let value = scalar(deserializer)?;
        parse_bool(&value).ok_or_else(|| invalid(&value))
    }

    pub fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = scalar(deserializer)?;
        parse_duration(&value).ok_or_else(|| invalid(&value))
    }

    /// A zero duration reads as unset.
    pub fn optional_duration<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Some(duration(deserializer)?).filter(|duration| !duration.is_zero()))
    }

    pub fn strategy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Strategy, D::Error> {
        Ok(Strategy::from_name_or_default(&scalar(deserializer)?))
    }

    pub fn parsed<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
    {
        let value = scalar(deserializer)?;
        value.trim().parse().map_err(|_| invalid(&value))
    }
}

impl ProviderConfig {
    /// Reads every setting from `figment`, using defaults for those unset.
    ///
    /// Unknown balancing strategies fall back to round robin; any other
    /// value which does not parse is an error.
    pub fn extract(figment: Figment) -> Result<Self, Error> {
        Ok(figment.extract()?)
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::extract(Figment::from(NonEmpty(Env::raw())))
    }

    /// Reads settings from the JSON object at `path`, falling back to the
    /// process environment for keys the file leaves unset or empty.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let figment = Figment::from(NonEmpty(Env::raw())).merge(NonEmpty(Json::file(path)));
        Self::extract(figment)
    }

    pub fn canonicalizer(&self) -> Canonicalizer {
        Canonicalizer::new(
            self.scheduling.job_name_prefix.as_str(),
            self.scheduling.namespace.as_str(),
        )
    }

    /// Mesh identities live in the job namespace.
    pub fn mesh_domain(&self) -> MeshDomain {
        MeshDomain {
            namespace: self.scheduling.namespace.clone(),
            datacenter: self.mesh.datacenter.clone(),
            trust_domain: self.mesh.trust_domain.clone(),
        }
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            sidecar: self.mesh.sidecar,
            domain: self.mesh_domain(),
            ca_cert: self.mesh.ca_cert.clone(),
            client_cert: self.mesh.client_cert.clone(),
            client_key: self.mesh.client_key.clone(),
        }
    }

    /// Resolver policy; in mesh mode, functions resolve to mesh identities.
    pub fn policy(&self) -> Policy {
        Policy {
            strategy: self.proxy.strategy,
            reset_interval: self.proxy.cache_reset_interval,
            mesh_domain: self.connect_aware.then(|| self.mesh_domain()),
            ..Default::default()
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.faas.read_timeout,
            tls_handshake_timeout: self.faas.tls_handshake_timeout,
            idle_conn_timeout: self.faas.idle_conn_timeout,
            max_idle_conns: self.faas.max_idle_conns,
            max_idle_conns_per_host: self.faas.max_idle_conns_per_host,
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            read_timeout: self.faas.read_timeout,
            transport: self.transport(),
        }
    }
}

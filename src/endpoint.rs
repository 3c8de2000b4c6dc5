//! Resolved locations of function instances.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::service;

/// The network address of a single live instance of a service.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Address {
    pub host: Arc<str>,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Arc::from(host.into()),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(address: SocketAddr) -> Self {
        Self::new(address.ip().to_string(), address.port())
    }
}

/// A name under which the service mesh routes to a service.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Identity(pub Arc<str>);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The outcome of resolving a function.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub enum Endpoint {
    /// An instance reachable over plain `http`.
    Address(Address),

    /// A service reachable through the mesh sidecar.
    Identity(Identity),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Address(address) => address.fmt(f),
            Endpoint::Identity(identity) => identity.fmt(f),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(address: SocketAddr) -> Self {
        Endpoint::Address(address.into())
    }
}

impl From<Address> for Endpoint {
    fn from(address: Address) -> Self {
        Endpoint::Address(address)
    }
}

/// Where a service lives within the mesh.
///
/// Combined with a service name, this forms the identity the sidecar uses to
/// route a connection, which is also the TLS server name presented to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshDomain {
    /// Default: "default"
    pub namespace: String,
    /// Default: "dc1"
    pub datacenter: String,
    /// Default: "consul"
    pub trust_domain: String,
}

impl Default for MeshDomain {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            datacenter: "dc1".to_string(),
            trust_domain: "consul".to_string(),
        }
    }
}

impl MeshDomain {
    pub fn identity(&self, service: &service::Name) -> Identity {
        Identity(Arc::from(format!(
            "{}.{}.{}.internal.{}",
            service, self.namespace, self.datacenter, self.trust_domain
        )))
    }
}

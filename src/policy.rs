//! Configuration options which can alter the behavior of the resolver.

use crate::balancer::Strategy;
use crate::endpoint::MeshDomain;
use crate::watcher::WatchConfig;

use std::time::Duration;

/// Policy which is applicable to a [crate::resolver::ServiceResolver].
#[derive(Clone, Debug, Default)]
pub struct Policy {
    /// How one instance is chosen among the healthy instances of a service.
    ///
    /// Default: round robin
    pub strategy: Strategy,

    /// How often the whole cache is discarded, along with every watch.
    ///
    /// Default: None, the cache is never reset
    pub reset_interval: Option<Duration>,

    /// When set, services resolve to their identity within this mesh
    /// domain rather than to an instance address.
    ///
    /// Default: None
    pub mesh_domain: Option<MeshDomain>,

    /// Configuration of the watches keeping cache entries current.
    pub watch: WatchConfig,
}

//! faas-bridge connects a FaaS gateway to functions scheduled on a cluster.
//!
//! Functions are discovered through a service catalog, and invocations are
//! proxied to one of their healthy instances, optionally through a
//! mutual-TLS service mesh.
//!
//! It uses the following terminology:
//! * Functions are what the gateway invokes, by name, optionally qualified
//!   with a namespace (`echo`, `echo.default`).
//! * Services are the catalog's view of a function: the canonical name
//!   under which its instances are registered (`faas-fn-echo`).
//! * Endpoints are what a service resolves to: the address of one
//!   instance, or, in mesh mode, the identity of the service.
//!
//! # Usage
//!
//! * The main interface for this crate is [proxy::ProxyHandler], which
//!   forwards requests for `/function/{name}` to an instance of `name`.
//! * Underneath it, [resolver::ServiceResolver] maps function names to
//!   endpoints. It is built from a [catalog::Catalog], which answers "where
//!   are the instances of this service", and keeps a cache of answers
//!   current by watching the catalog.
//! * [transport::Connector] dials resolved endpoints, either directly or
//!   through the mesh sidecar, for use with a `hyper` client.
//!
//! # DTrace probes
//!
//! faas-bridge contains a number of DTrace USDT probes, which fire as the
//! resolver serves lookups and maintains its cache. The full list of probes
//! is:
//!
//! - `resolve-start`: Fires before resolving a function.
//! - `resolve-done`: Fires after resolving a function successfully.
//! - `resolve-failed`: Fires when a function cannot be resolved.
//! - `cache-miss`: Fires before querying the catalog for an uncached service.
//! - `delta-applied`: Fires when a watch updates the instances of a service.
//! - `cache-reset`: Fires when the whole cache is discarded.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly
//! enabled, by tracing the program with the `dtrace(1)` command-line tool.
//!
//! Registering the probes is fallible, so
//! [resolver::ServiceResolver::new] returns a
//! [resolver::RegistrationError] on failure, from which the resolver itself
//! can still be extracted.

// Public API
pub mod balancer;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod endpoint;
pub mod policy;
pub mod proxy;
pub mod resolver;
pub mod service;
pub mod transport;
pub mod watcher;

// Necessary for implementation
mod backoff;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod catalogs;

/// USDT probes for tracing how functions are resolved.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "faas_bridge")]
mod probes {
    /// Fires right before resolving a function.
    fn resolve__start(function: &str) {}

    /// Fires when a function resolves to an endpoint.
    fn resolve__done(function: &str) {}

    /// Fires when a function cannot be resolved, with a string identifying
    /// the reason.
    fn resolve__failed(function: &str, reason: &str) {}

    /// Fires before the catalog is queried for a service missing from the
    /// cache.
    fn cache__miss(service: &str) {}

    /// Fires when a watch replaces the instances of a cached service.
    fn delta__applied(service: &str, endpoints: u64) {}

    /// Fires when the cache is discarded, with the number of entries
    /// dropped.
    fn cache__reset(entries: u64) {}
}

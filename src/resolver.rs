//! Resolution of function names into healthy instances.

#[cfg(feature = "probes")]
use crate::probes;

use crate::balancer::Balancer;
use crate::cache::{CacheEntry, ResolutionCache};
use crate::catalog::{self, QueryOptions, SharedCatalog};
use crate::endpoint::Endpoint;
use crate::policy::Policy;
use crate::service::{self, Canonicalizer};
use crate::watcher::{Delta, Watcher};

use arc_swap::ArcSwap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("no healthy instances of {0}")]
    NotFound(service::Name),

    #[error("catalog lookup of {service} failed")]
    Upstream {
        service: service::Name,
        #[source]
        source: catalog::Error,
    },

    #[error("cannot resolve: {0}")]
    Internal(String),

    #[error("resolver terminated")]
    Terminated,
}

impl Error {
    #[cfg_attr(not(feature = "probes"), allow(dead_code))]
    const fn as_str(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::Upstream { .. } => "Upstream",
            Error::Internal(_) => "Internal",
            Error::Terminated => "Terminated",
        }
    }

    /// The status a gateway reports when resolution fails this way.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            Error::NotFound(_) => http::StatusCode::NOT_FOUND,
            Error::Upstream { .. } => http::StatusCode::BAD_GATEWAY,
            Error::Internal(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            Error::Terminated => http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// Everything subscribed since the last reset
struct Generation {
    cache: ResolutionCache,
    watcher: Watcher,
}

struct Shared {
    catalog: SharedCatalog,
    canonicalizer: Canonicalizer,
    balancer: Balancer,
    policy: Policy,
    generation: ArcSwap<Generation>,
    deltas_tx: mpsc::UnboundedSender<Delta>,
    terminated: AtomicBool,
}

impl Shared {
    fn new_generation(&self) -> Generation {
        Generation {
            cache: ResolutionCache::new(),
            watcher: Watcher::new(
                self.catalog.clone(),
                self.deltas_tx.clone(),
                self.policy.watch.clone(),
            ),
        }
    }

    fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.generation.load().cache.clear();
        event!(Level::INFO, cancelled, "Resolver terminated");
    }
}

struct Worker {
    shared: Arc<Shared>,
    deltas: UnboundedReceiverStream<Delta>,
}

impl Worker {
    async fn run(mut self, mut terminate_rx: oneshot::Receiver<()>) {
        let mut reset = self.shared.policy.reset_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let next_reset = async {
                match reset.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut terminate_rx => return,
                Some(delta) = self.deltas.next() => self.apply(delta),
                _ = next_reset => self.reset(),
            }
        }
    }

    fn apply(&self, delta: Delta) {
        let service = delta.service.clone();
        let count = delta.endpoints.len();
        if self.shared.generation.load().cache.apply(delta) {
            event!(Level::DEBUG, %service, endpoints = count, "Applied delta");
            #[cfg(feature = "probes")]
            probes::delta__applied!(|| (service.as_str(), count as u64));
        } else {
            event!(Level::TRACE, %service, "Discarded delta from a cancelled watch");
        }
    }

    // The new generation is installed before the old one's watches are
    // cancelled.
    #[instrument(skip(self), name = "Worker::reset")]
    fn reset(&self) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            return;
        }
        let old = self
            .shared
            .generation
            .swap(Arc::new(self.shared.new_generation()));
        let cancelled = old.cache.clear();
        event!(Level::INFO, cancelled, "Reset resolution cache");
        #[cfg(feature = "probes")]
        probes::cache__reset!(|| cancelled as u64);
    }
}

struct WorkerHandle {
    handle: Mutex<Option<JoinHandle<()>>>,
    terminate_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn propagate_panics(result: Result<(), JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

/// USDT probe registration failed.
///
/// Holds the resolver, which works regardless.
pub struct RegistrationError(ServiceResolver);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained resolver.
    pub fn into_inner(self) -> ServiceResolver {
        self.0
    }
}

/// Resolves function names to healthy instances, caching what it learns and
/// watching the catalog to keep the cache current.
///
/// Clones share the same cache and background worker. The worker stops on
/// [ServiceResolver::terminate], or when the last clone is dropped.
#[derive(Clone)]
pub struct ServiceResolver {
    shared: Arc<Shared>,
    worker: Arc<WorkerHandle>,
}

impl std::fmt::Debug for ServiceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceResolver")
            .field("canonicalizer", &self.shared.canonicalizer)
            .field("strategy", &self.shared.balancer.strategy())
            .finish_non_exhaustive()
    }
}

impl ServiceResolver {
    /// Creates a resolver and starts its background worker.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # DTrace probe registration
    ///
    /// Registering the USDT probes is fallible. The `Err` variant still
    /// carries a working resolver; only the probes are unavailable. Without
    /// the `"probes"` feature this is infallible.
    pub fn new(
        catalog: SharedCatalog,
        canonicalizer: Canonicalizer,
        policy: Policy,
    ) -> Result<Self, RegistrationError> {
        let balancer = Balancer::new(policy.strategy);
        Self::with_balancer(catalog, canonicalizer, policy, balancer)
    }

    /// Like [ServiceResolver::new], selecting instances with `balancer`
    /// rather than one built from the policy.
    #[instrument(skip(catalog, balancer), name = "ServiceResolver::new")]
    pub fn with_balancer(
        catalog: SharedCatalog,
        canonicalizer: Canonicalizer,
        policy: Policy,
        balancer: Balancer,
    ) -> Result<Self, RegistrationError> {
        let (deltas_tx, deltas_rx) = mpsc::unbounded_channel();
        let first = Generation {
            cache: ResolutionCache::new(),
            watcher: Watcher::new(catalog.clone(), deltas_tx.clone(), policy.watch.clone()),
        };
        let shared = Arc::new(Shared {
            catalog,
            canonicalizer,
            balancer,
            policy,
            generation: ArcSwap::from_pointee(first),
            deltas_tx,
            terminated: AtomicBool::new(false),
        });

        let worker = Worker {
            shared: shared.clone(),
            deltas: UnboundedReceiverStream::new(deltas_rx),
        };
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::task::spawn(worker.run(terminate_rx));

        let self_ = Self {
            shared,
            worker: Arc::new(WorkerHandle {
                handle: Mutex::new(Some(handle)),
                terminate_tx: Mutex::new(Some(terminate_tx)),
            }),
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Returns one healthy instance of `function`.
    ///
    /// In mesh mode the instance is not returned; instead, the mesh identity
    /// of the function's service is.
    #[instrument(level = "debug", skip(self), err, name = "ServiceResolver::resolve")]
    pub async fn resolve(&self, function: &str) -> Result<Endpoint, Error> {
        #[cfg(feature = "probes")]
        probes::resolve__start!(|| function);
        let result = self.do_resolve(function).await;
        #[cfg(feature = "probes")]
        match &result {
            Ok(_) => probes::resolve__done!(|| function),
            Err(e) => probes::resolve__failed!(|| (function, e.as_str())),
        }
        result
    }

    async fn do_resolve(&self, function: &str) -> Result<Endpoint, Error> {
        let (service, entry) = self.lookup(function).await?;
        let endpoint = self.shared.balancer.select(&service, &entry)?;
        Ok(match &self.shared.policy.mesh_domain {
            Some(domain) => Endpoint::Identity(domain.identity(&service)),
            None => endpoint,
        })
    }

    /// Returns every healthy instance of `function`, without affecting which
    /// instance [ServiceResolver::resolve] picks next.
    #[instrument(level = "debug", skip(self), err, name = "ServiceResolver::resolve_all")]
    pub async fn resolve_all(&self, function: &str) -> Result<Vec<Endpoint>, Error> {
        let (_, entry) = self.lookup(function).await?;
        Ok(entry.endpoints().as_ref().clone())
    }

    /// Forgets what is known about `function` and stops watching it.
    ///
    /// Idempotent; the next resolve queries the catalog afresh.
    pub fn remove_cache_item(&self, function: &str) {
        let Ok(service) = self.shared.canonicalizer.canonicalize(function) else {
            return;
        };
        if self.shared.generation.load().cache.remove(&service) {
            event!(Level::INFO, %service, "Removed cache entry");
        }
    }

    /// Stops the background worker and cancels every watch. Idempotent.
    ///
    /// Resolves fail with [Error::Terminated] afterwards.
    pub async fn terminate(&self) {
        self.shutdown();
        let handle = self.worker.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            propagate_panics(handle.await);
        }
    }

    /// Like [ServiceResolver::terminate], without waiting for the worker to
    /// exit.
    pub fn shutdown(&self) {
        self.shared.shutdown();
        if let Some(terminate_tx) = self.worker.terminate_tx.lock().unwrap().take() {
            let _send_result = terminate_tx.send(());
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    async fn lookup(&self, function: &str) -> Result<(service::Name, Arc<CacheEntry>), Error> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        let service = self
            .shared
            .canonicalizer
            .canonicalize(function)
            .map_err(|err| Error::Internal(err.to_string()))?;

        let generation = self.shared.generation.load_full();
        if let Some(entry) = generation.cache.get(&service) {
            return Ok((service, entry));
        }

        event!(Level::DEBUG, %service, "Cache miss; querying catalog");
        #[cfg(feature = "probes")]
        probes::cache__miss!(|| service.as_str());
        let result = catalog::query_bounded(
            &*self.shared.catalog,
            &service,
            &QueryOptions::immediate(),
            self.shared.policy.watch.max_stale,
        )
        .await
        .map_err(|source| Error::Upstream {
            service: service.clone(),
            source,
        })?;

        // Another task may have filled the entry during the query; its entry
        // and subscription are kept, and this answer is dropped.
        let entry = generation.cache.get_or_insert_with(service.clone(), || {
            let subscription =
                generation
                    .watcher
                    .watch(service.clone(), result.index, result.endpoints.clone());
            CacheEntry::new(result.endpoints, subscription)
        });

        // Terminated during the query: the entry was inserted after the
        // cache was cleared, so cancel it here.
        if self.is_terminated() {
            generation.cache.clear();
            return Err(Error::Terminated);
        }
        Ok((service, entry))
    }
}

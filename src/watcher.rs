//! Push subscriptions against the catalog, realized as long-poll tasks.

use crate::backoff::ExponentialBackoff;
use crate::catalog::{self, QueryOptions, SharedCatalog};
use crate::endpoint::Endpoint;
use crate::service;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{event, instrument, Level};

// How long may a blocking query be held open by the catalog?
pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);

// How far may a stale answer lag the catalog leader before it is refused?
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(10);

/// Configuration options for watching services.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// How long the catalog may hold each blocking query.
    ///
    /// Default: 60 seconds
    pub wait: Duration,

    /// How far a stale read may lag the leader before being repeated as a
    /// consistent read.
    ///
    /// Default: 10 seconds
    pub max_stale: Duration,

    /// Delay before the first retry of a failed query.
    ///
    /// Default: 250 milliseconds
    pub retry_initial: Duration,

    /// Cap on the delay between retries of failed queries.
    ///
    /// Default: 30 seconds
    pub retry_max: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            wait: DEFAULT_WAIT,
            max_stale: DEFAULT_MAX_STALE,
            retry_initial: Duration::from_millis(250),
            retry_max: Duration::from_secs(30),
        }
    }
}

/// Uniquely identifies a subscription within this process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A change to the healthy instances of a watched service.
#[derive(Clone, Debug)]
pub struct Delta {
    pub service: service::Name,
    pub subscription: SubscriptionId,
    pub endpoints: Vec<Endpoint>,
}

/// A live watch of one service.
///
/// The watch stops when cancelled or dropped.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    service: service::Name,
    handle: AbortHandle,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stops the watch. Idempotent.
    pub fn cancel(&self) {
        if !self.handle.is_finished() {
            event!(Level::DEBUG, service = %self.service, id = ?self.id, "Cancelling watch");
        }
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Starts subscriptions which report changes on a shared channel.
#[derive(Clone)]
pub struct Watcher {
    catalog: SharedCatalog,
    deltas: mpsc::UnboundedSender<Delta>,
    config: Arc<WatchConfig>,
}

impl Watcher {
    pub fn new(
        catalog: SharedCatalog,
        deltas: mpsc::UnboundedSender<Delta>,
        config: WatchConfig,
    ) -> Self {
        Self {
            catalog,
            deltas,
            config: Arc::new(config),
        }
    }

    /// Watches `service` for changes after catalog `index`.
    ///
    /// `endpoints` is what the caller already knows as of `index`; only
    /// answers which differ from it produce a [Delta].
    pub fn watch(
        &self,
        service: service::Name,
        index: u64,
        endpoints: Vec<Endpoint>,
    ) -> Subscription {
        let id = SubscriptionId::next();
        let worker = WatchWorker {
            id,
            service: service.clone(),
            catalog: self.catalog.clone(),
            deltas: self.deltas.clone(),
            config: self.config.clone(),
            index,
            endpoints,
        };
        let handle = tokio::task::spawn(worker.run()).abort_handle();
        Subscription {
            id,
            service,
            handle,
        }
    }
}

struct WatchWorker {
    id: SubscriptionId,
    service: service::Name,
    catalog: SharedCatalog,
    deltas: mpsc::UnboundedSender<Delta>,
    config: Arc<WatchConfig>,

    // Catalog index of the last answer, used to block the next query
    index: u64,

    // The last endpoints reported for this service
    endpoints: Vec<Endpoint>,
}

impl WatchWorker {
    #[instrument(skip(self), fields(service = %self.service, id = self.id.0), name = "WatchWorker::run")]
    async fn run(mut self) {
        let mut retry = self.config.retry_initial;
        loop {
            let options = QueryOptions::blocking(self.index, self.config.wait);
            let result = catalog::query_bounded(
                &*self.catalog,
                &self.service,
                &options,
                self.config.max_stale,
            )
            .await;

            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    event!(
                        Level::WARN,
                        err = ?err,
                        "Watch query failed; keeping last known endpoints",
                    );
                    tokio::time::sleep(retry.add_spread(retry / 2)).await;
                    retry = retry.exponential_backoff(self.config.retry_max);
                    continue;
                }
            };
            retry = self.config.retry_initial;

            // An index which went backwards (e.g. after a snapshot restore)
            // restarts the watch from zero.
            self.index = if result.index < self.index {
                0
            } else {
                result.index
            };

            if result.endpoints == self.endpoints {
                continue;
            }
            event!(
                Level::DEBUG,
                index = self.index,
                endpoints = result.endpoints.len(),
                "Service changed",
            );
            self.endpoints = result.endpoints.clone();
            let delta = Delta {
                service: self.service.clone(),
                subscription: self.id,
                endpoints: result.endpoints,
            };
            if self.deltas.send(delta).is_err() {
                return;
            }
        }
    }
}

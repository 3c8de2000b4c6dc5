//! The resolution cache, holding one entry per watched service.

use crate::endpoint::Endpoint;
use crate::service;
use crate::watcher::{Delta, Subscription, SubscriptionId};

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The known instances of one service, and the watch keeping them current.
#[derive(Debug)]
pub struct CacheEntry {
    endpoints: ArcSwap<Vec<Endpoint>>,

    // Advanced by each round-robin selection
    counter: AtomicUsize,

    subscription: Subscription,
}

impl CacheEntry {
    pub fn new(endpoints: Vec<Endpoint>, subscription: Subscription) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            counter: AtomicUsize::new(0),
            subscription,
        }
    }

    /// Returns the current instances.
    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        self.endpoints.load_full()
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Returns the counter value and advances it.
    pub fn next_count(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn replace(&self, endpoints: Vec<Endpoint>) {
        self.endpoints.store(Arc::new(endpoints));
    }

    fn cancel(&self) {
        self.subscription.cancel();
    }
}

/// Maps service names to their [CacheEntry].
///
/// Entries are only created by [ResolutionCache::get_or_insert_with]; deltas
/// update existing entries and never create them.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: DashMap<service::Name, Arc<CacheEntry>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service: &service::Name) -> Option<Arc<CacheEntry>> {
        self.entries.get(service).map(|entry| entry.value().clone())
    }

    /// Returns the entry for `service`, inserting the one built by `make` if
    /// none exists.
    ///
    /// `make` runs at most once, and only if this call inserts.
    pub fn get_or_insert_with(
        &self,
        service: service::Name,
        make: impl FnOnce() -> CacheEntry,
    ) -> Arc<CacheEntry> {
        match self.entries.entry(service) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let created = Arc::new(make());
                entry.insert(created.clone());
                created
            }
        }
    }

    /// Replaces the endpoints of the entry owning the delta's subscription.
    ///
    /// Returns false if no such entry exists, in which case the delta came
    /// from a cancelled subscription and is discarded.
    pub fn apply(&self, delta: Delta) -> bool {
        match self.entries.get(&delta.service) {
            Some(entry) if entry.subscription() == delta.subscription => {
                entry.replace(delta.endpoints);
                true
            }
            _ => false,
        }
    }

    /// Cancels the subscription of the entry for `service`, then removes the
    /// entry. Idempotent.
    pub fn remove(&self, service: &service::Name) -> bool {
        let Some(entry) = self.get(service) else {
            return false;
        };
        entry.cancel();
        self.entries
            .remove_if(service, |_, resident| Arc::ptr_eq(resident, &entry))
            .is_some()
    }

    /// Cancels every subscription, then empties the cache.
    pub fn clear(&self) -> usize {
        self.entries.iter().for_each(|entry| entry.value().cancel());
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalogs::fixed::FixedCatalog;
    use crate::watcher::{WatchConfig, Watcher};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn endpoint(s: &str) -> Endpoint {
        s.parse::<SocketAddr>().unwrap().into()
    }

    fn watcher() -> (Watcher, mpsc::UnboundedReceiver<Delta>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Watcher::new(Arc::new(FixedCatalog::new()), tx, WatchConfig::default()),
            rx,
        )
    }

    fn delta(service: &service::Name, subscription: SubscriptionId, endpoints: Vec<Endpoint>) -> Delta {
        Delta {
            service: service.clone(),
            subscription,
            endpoints,
        }
    }

    #[tokio::test]
    async fn first_insert_wins() {
        let (watcher, _rx) = watcher();
        let cache = ResolutionCache::new();
        let name = service::Name::from("faas-fn-echo");

        let first = cache.get_or_insert_with(name.clone(), || {
            CacheEntry::new(vec![endpoint("10.0.0.1:8080")], watcher.watch(name.clone(), 1, vec![]))
        });
        let second = cache.get_or_insert_with(name.clone(), || {
            panic!("an entry already exists");
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn delta_replaces_endpoints_but_keeps_counter() {
        let (watcher, _rx) = watcher();
        let cache = ResolutionCache::new();
        let name = service::Name::from("faas-fn-echo");

        let entry = cache.get_or_insert_with(name.clone(), || {
            CacheEntry::new(vec![endpoint("10.0.0.1:8080")], watcher.watch(name.clone(), 1, vec![]))
        });
        entry.next_count();
        entry.next_count();

        assert!(cache.apply(delta(&name, entry.subscription(), vec![])));
        let entry = cache.get(&name).expect("empty delta keeps the entry");
        assert!(entry.endpoints().is_empty());

        assert!(cache.apply(delta(
            &name,
            entry.subscription(),
            vec![endpoint("10.0.0.2:8080"), endpoint("10.0.0.3:8080")],
        )));
        assert_eq!(entry.endpoints().len(), 2);
        assert_eq!(entry.next_count(), 2);
    }

    #[tokio::test]
    async fn deltas_never_create_entries() {
        let cache = ResolutionCache::new();
        let name = service::Name::from("faas-fn-echo");
        assert!(!cache.apply(delta(&name, SubscriptionId(u64::MAX), vec![endpoint("10.0.0.1:8080")])));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn removed_subscription_cannot_repopulate() {
        let (watcher, _rx) = watcher();
        let cache = ResolutionCache::new();
        let name = service::Name::from("faas-fn-echo");

        let old = cache
            .get_or_insert_with(name.clone(), || {
                CacheEntry::new(vec![endpoint("10.0.0.1:8080")], watcher.watch(name.clone(), 1, vec![]))
            })
            .subscription();
        assert!(cache.remove(&name));
        assert!(!cache.remove(&name));

        assert!(!cache.apply(delta(&name, old, vec![endpoint("10.0.0.9:8080")])));
        assert!(cache.get(&name).is_none());

        let fresh = cache.get_or_insert_with(name.clone(), || {
            CacheEntry::new(vec![endpoint("10.0.0.2:8080")], watcher.watch(name.clone(), 1, vec![]))
        });
        assert_ne!(fresh.subscription(), old);
        assert!(!cache.apply(delta(&name, old, vec![endpoint("10.0.0.9:8080")])));
        assert_eq!(*fresh.endpoints(), vec![endpoint("10.0.0.2:8080")]);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let (watcher, _rx) = watcher();
        let cache = ResolutionCache::new();
        for function in ["a", "b", "c"] {
            let name = service::Name::from(function);
            cache.get_or_insert_with(name.clone(), || {
                CacheEntry::new(vec![], watcher.watch(name.clone(), 1, vec![]))
            });
        }
        assert_eq!(cache.clear(), 3);
        assert!(cache.is_empty());
    }
}

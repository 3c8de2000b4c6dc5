//! Selection of one instance among the healthy instances of a service.

use crate::cache::CacheEntry;
use crate::endpoint::Endpoint;
use crate::resolver::Error;
use crate::service;

use debug_ignore::DebugIgnore;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{event, Level};

/// How [Balancer] picks an instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Cycles through the instances in catalog order.
    #[default]
    RoundRobin,

    /// Picks an instance uniformly at random.
    Random,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown balancing strategy {0:?}")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roundrobin" | "round-robin" | "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

impl Strategy {
    /// Parses `name`, falling back to round robin if it is not recognized.
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|err: UnknownStrategy| {
            event!(Level::WARN, %err, "Falling back to round robin");
            Strategy::RoundRobin
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "roundrobin",
            Strategy::Random => "random",
        }
    }
}

/// Picks instances for a resolver, according to a fixed [Strategy].
#[derive(Debug)]
pub struct Balancer {
    strategy: Strategy,
    rng: Mutex<DebugIgnore<Box<dyn RngCore + Send>>>,
}

impl Balancer {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_rng(strategy, StdRng::from_os_rng())
    }

    /// Creates a balancer drawing random choices from `rng`.
    pub fn with_rng(strategy: Strategy, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            strategy,
            rng: Mutex::new(DebugIgnore(Box::new(rng))),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Picks one of the current instances of `entry`.
    ///
    /// Fails with [Error::NotFound] if the service has no healthy instances.
    pub fn select(
        &self,
        service: &service::Name,
        entry: &CacheEntry,
    ) -> Result<Endpoint, Error> {
        let endpoints = entry.endpoints();
        if endpoints.is_empty() {
            return Err(Error::NotFound(service.clone()));
        }
        let index = match self.strategy {
            Strategy::RoundRobin => entry.next_count() % endpoints.len(),
            Strategy::Random => self.rng.lock().unwrap().random_range(0..endpoints.len()),
        };
        Ok(endpoints[index].clone())
    }
}

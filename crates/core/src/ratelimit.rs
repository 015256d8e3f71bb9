//! The rate-limit capability interface and token-bucket engine.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

/// Actions that can be rate-limited per account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitedAction {
    BlobPull,
    BlobPush,
    ManifestPull,
    ManifestPush,
    /// Blob bytes pulled via anycast; the `amount` is the byte count.
    AnycastBlobBytePull,
}

impl RateLimitedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlobPull => "pullblob",
            Self::BlobPush => "pushblob",
            Self::ManifestPull => "pullmanifest",
            Self::ManifestPush => "pushmanifest",
            Self::AnycastBlobBytePull => "pullblobbytesanycast",
        }
    }
}

/// A rate limit: `rate` units per `period`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateQuota {
    pub rate: NonZeroU32,
    pub period: Duration,
}

/// Strategy that determines the rate limits of each account.
pub trait RateLimitDriver: Send + Sync {
    /// `None` means the action has no rate limit for this account.
    fn get_rate_limit(&self, account_name: &str, action: RateLimitedAction) -> Option<RateQuota>;
}

/// Driver that imposes no limits.
#[derive(Debug, Default)]
pub struct TrivialRateLimitDriver;

impl RateLimitDriver for TrivialRateLimitDriver {
    fn get_rate_limit(&self, _account_name: &str, _action: RateLimitedAction) -> Option<RateQuota> {
        None
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket rate limiting keyed by `(account, action)`.
///
/// Buckets are created lazily from the driver's quota and rebuilt when the
/// quota changes.
pub struct RateLimitEngine {
    driver: Arc<dyn RateLimitDriver>,
    buckets: DashMap<String, (RateQuota, Arc<DirectLimiter>)>,
}

impl RateLimitEngine {
    pub fn new(driver: Arc<dyn RateLimitDriver>) -> Self {
        Self {
            driver,
            buckets: DashMap::new(),
        }
    }

    /// Check whether `amount` units of the given action are allowed for
    /// the account right now, consuming them if so.
    pub fn allows(&self, account_name: &str, action: RateLimitedAction, amount: u32) -> bool {
        let Some(quota) = self.driver.get_rate_limit(account_name, action) else {
            return true;
        };
        let Some(amount) = NonZeroU32::new(amount) else {
            return true;
        };

        let key = format!("{}-{}", action.as_str(), account_name);
        let limiter = {
            let mut entry = self.buckets.entry(key).or_insert_with(|| {
                (quota, Arc::new(RateLimiter::direct(quota_to_governor(quota))))
            });
            if entry.value().0 != quota {
                // quota changed at runtime; start a fresh bucket
                let fresh = Arc::new(RateLimiter::direct(quota_to_governor(quota)));
                *entry.value_mut() = (quota, fresh.clone());
                fresh
            } else {
                entry.value().1.clone()
            }
        };

        match limiter.check_n(amount) {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            // the request is larger than the bucket can ever hold
            Err(_) => false,
        }
    }
}

fn quota_to_governor(quota: RateQuota) -> Quota {
    let replenish = quota.period / quota.rate.get();
    Quota::with_period(replenish)
        .unwrap_or_else(|| Quota::per_second(quota.rate))
        .allow_burst(quota.rate)
}

type RateLimitDriverFactory = fn(&AppConfig) -> Result<Arc<dyn RateLimitDriver>>;

static RATELIMIT_DRIVER_FACTORIES: LazyLock<
    RwLock<HashMap<&'static str, RateLimitDriverFactory>>,
> = LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a rate-limit driver factory. Call once per driver at startup.
pub fn register_ratelimit_driver(name: &'static str, factory: RateLimitDriverFactory) {
    let mut factories = RATELIMIT_DRIVER_FACTORIES.write().unwrap();
    if factories.insert(name, factory).is_some() {
        panic!("attempted to register multiple rate-limit drivers with name = {name}");
    }
}

/// Instantiate the rate-limit driver selected by configuration. The
/// "trivial" driver is always available.
pub fn new_ratelimit_driver(name: &str, config: &AppConfig) -> Result<Arc<dyn RateLimitDriver>> {
    if name == "trivial" {
        return Ok(Arc::new(TrivialRateLimitDriver));
    }
    let factories = RATELIMIT_DRIVER_FACTORIES.read().unwrap();
    match factories.get(name) {
        Some(factory) => factory(config),
        None => Err(Error::Driver(format!("no such rate-limit driver: {name}"))),
    }
}

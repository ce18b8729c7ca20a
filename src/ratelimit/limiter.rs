//! Keyed limiter service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use super::backend::LimiterBackend;
use super::bucket::{Limit, LimiterState, MaxWait, Reservation};
use super::clock::{Clock, SystemClock};
use super::rules::LimitRules;
use crate::error::{Result, TollgateError};
use crate::store::StateStore;

/// Owns every keyed limiter: loads state, applies bucket arithmetic and
/// persists the result.
///
/// Mutations of one key are serialized through a per-key async mutex, so a
/// read-modify-write never races another for the same key. Different keys
/// never contend with each other.
pub struct LimiterService {
    /// Persisted state per key
    store: Arc<dyn StateStore>,
    /// Source of "now" for every decision
    clock: Arc<dyn Clock>,
    /// Seeds for keys without persisted state
    rules: RwLock<LimitRules>,
    /// Single-writer lock per key
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LimiterService {
    /// Create a service over `store` using the system clock.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a service over `store` reading time from `clock`.
    pub fn with_clock(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rules: RwLock::new(LimitRules::new()),
            locks: DashMap::new(),
        }
    }

    /// Builder-style variant of [`Self::set_rules`].
    pub fn with_rules(self, rules: LimitRules) -> Self {
        self.set_rules(rules);
        self
    }

    /// Replace the seeding rules. Keys that already have state are unaffected.
    pub fn set_rules(&self, rules: LimitRules) {
        let mut current = self.rules.write();
        *current = rules;
    }

    /// Number of keys with a mutation in progress or queued.
    ///
    /// Lock entries are evicted as soon as their last holder is done.
    pub fn busy_keys(&self) -> usize {
        self.locks.len()
    }

    /// Persisted state of `key`, or the state it would start from.
    pub async fn state(&self, key: &str) -> Result<LimiterState> {
        validate_key(key)?;
        let now = self.clock.now();
        self.load(key, now).await
    }

    /// Tokens available for `key` now.
    pub async fn tokens(&self, key: &str) -> Result<f64> {
        validate_key(key)?;
        let now = self.clock.now();
        let state = self.load(key, now).await?;
        Ok(state.tokens_available(now))
    }

    /// Reserve `n` permits on `key`.
    pub async fn reserve_n(&self, key: &str, n: u32, max_wait: MaxWait) -> Result<Reservation> {
        validate_key(key)?;
        let _guard = self.lock(key).await;

        let now = self.clock.now();
        let mut state = self.load(key, now).await?;
        let reservation = state.reserve_n(now, n, max_wait);

        if !reservation.ok {
            debug!(
                key = %key,
                n = n,
                burst = state.burst,
                limit = %state.limit,
                max_wait = ?max_wait,
                "Reservation rejected"
            );
            return Ok(reservation);
        }

        if !reservation.limit.is_infinite() {
            self.store.set(key, &state).await?;
        }

        trace!(
            key = %key,
            n = n,
            tokens = state.tokens,
            now = %now,
            time_to_act = %reservation.time_to_act,
            "Reservation granted"
        );

        Ok(reservation)
    }

    /// Change the rate and/or burst of `key` from now on.
    pub async fn set_rate(&self, key: &str, limit: Option<Limit>, burst: Option<u32>) -> Result<()> {
        validate_key(key)?;
        validate_limit(limit)?;
        if limit.is_none() && burst.is_none() {
            return Ok(());
        }

        let _guard = self.lock(key).await;

        let now = self.clock.now();
        let mut state = match self.store.get(key).await? {
            Some(state) => state,
            None => match self.seed(key, now) {
                Some(seeded) => seeded,
                // A brand-new key starts with a full bucket at the requested settings
                None => LimiterState::new(limit.unwrap_or_default(), burst.unwrap_or(0), now),
            },
        };

        state.set_rate(now, limit, burst);
        self.store.set(key, &state).await?;

        debug!(
            key = %key,
            limit = %state.limit,
            burst = state.burst,
            tokens = state.tokens,
            "Rate updated"
        );

        Ok(())
    }

    /// Cancel a reservation previously granted on `key`.
    pub async fn cancel_reservation(&self, key: &str, reservation: &Reservation) -> Result<()> {
        validate_key(key)?;
        let _guard = self.lock(key).await;

        let now = self.clock.now();
        let Some(mut state) = self.store.get(key).await? else {
            trace!(key = %key, "Nothing to cancel for unknown key");
            return Ok(());
        };

        let before = state.clone();
        let restored = state.cancel(now, reservation);
        if state != before {
            self.store.set(key, &state).await?;
        }

        debug!(
            key = %key,
            reservation = %reservation.id,
            restored = restored,
            tokens = state.tokens,
            "Reservation cancelled"
        );

        Ok(())
    }

    async fn lock<'a>(&'a self, key: &'a str) -> KeyGuard<'a> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load(&self, key: &str, now: DateTime<Utc>) -> Result<LimiterState> {
        if let Some(state) = self.store.get(key).await? {
            return Ok(state);
        }
        Ok(self.seed(key, now).unwrap_or_default())
    }

    fn seed(&self, key: &str, now: DateTime<Utc>) -> Option<LimiterState> {
        let (limit, burst) = self.rules.read().settings_for(key)?;
        trace!(key = %key, limit = %limit, burst = burst, "Seeding limiter from rules");
        Some(LimiterState::new(limit, burst, now))
    }
}

/// Holds a key's write lock and drops its table entry once nobody else wants it.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold their own clone, so a shared entry is kept.
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TollgateError::InvalidArgument("key is required".to_string()));
    }
    Ok(())
}

fn validate_limit(limit: Option<Limit>) -> Result<()> {
    match limit {
        Some(Limit::PerSecond(rate)) if !rate.is_finite() => Err(TollgateError::InvalidArgument(
            format!("limit must be finite, got {}", rate),
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl LimiterBackend for LimiterService {
    async fn state(&self, key: &str) -> Result<LimiterState> {
        self.state(key).await
    }

    async fn tokens(&self, key: &str) -> Result<f64> {
        self.tokens(key).await
    }

    async fn reserve_n(&self, key: &str, n: u32, max_wait: MaxWait) -> Result<Reservation> {
        self.reserve_n(key, n, max_wait).await
    }

    async fn set_rate(&self, key: &str, limit: Option<Limit>, burst: Option<u32>) -> Result<()> {
        self.set_rate(key, limit, burst).await
    }

    async fn cancel_reservation(&self, key: &str, reservation: &Reservation) -> Result<()> {
        self.cancel_reservation(key, reservation).await
    }
}

//! Client-side handle for a single keyed limiter.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::backend::LimiterBackend;
use super::bucket::{Limit, MaxWait, Reservation, Wait};
use super::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};

/// A handle on the limiter stored under one key.
///
/// Cheap to clone; every call goes through the backend, which may be the
/// in-process [`super::LimiterService`] or a remote server.
#[derive(Clone)]
pub struct Limiter {
    backend: Arc<dyn LimiterBackend>,
    key: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter").field("key", &self.key).finish()
    }
}

impl Limiter {
    pub fn new(backend: Arc<dyn LimiterBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for [`ReservationHandle::delay`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The maximum overall event rate.
    pub async fn limit(&self) -> Result<Limit> {
        Ok(self.backend.state(&self.key).await?.limit)
    }

    /// The maximum number of permits a single call may consume.
    ///
    /// A zero burst allows no events unless the limit is infinite.
    pub async fn burst(&self) -> Result<u32> {
        Ok(self.backend.state(&self.key).await?.burst)
    }

    /// Tokens available now.
    pub async fn tokens(&self) -> Result<f64> {
        self.backend.tokens(&self.key).await
    }

    /// Shorthand for `allow_n(1)`.
    pub async fn allow(&self) -> Result<bool> {
        self.allow_n(1).await
    }

    /// Whether `n` events may happen now. Use this to drop events that exceed the limit.
    pub async fn allow_n(&self, n: u32) -> Result<bool> {
        let r = self.backend.reserve_n(&self.key, n, MaxWait::NONE).await?;
        Ok(r.ok)
    }

    /// Shorthand for `reserve_n(1)`.
    pub async fn reserve(&self) -> Result<ReservationHandle> {
        self.reserve_n(1).await
    }

    /// Reserve `n` permits however long it takes for them to become available.
    ///
    /// The reservation is not granted (`ok() == false`) only if `n` exceeds the burst,
    /// or the limiter can never produce the tokens.
    pub async fn reserve_n(&self, n: u32) -> Result<ReservationHandle> {
        self.reserve_n_within(n, MaxWait::Unbounded).await
    }

    /// Reserve `n` permits that become available within `max_wait`.
    pub async fn reserve_n_within(&self, n: u32, max_wait: MaxWait) -> Result<ReservationHandle> {
        let reservation = self.backend.reserve_n(&self.key, n, max_wait).await?;
        Ok(ReservationHandle {
            limiter: self.clone(),
            reservation,
        })
    }

    /// Set a new limit. Reservations already granted keep their time to act.
    pub async fn set_limit(&self, limit: Limit) -> Result<()> {
        self.backend.set_rate(&self.key, Some(limit), None).await
    }

    /// Set a new burst size.
    pub async fn set_burst(&self, burst: u32) -> Result<()> {
        self.backend.set_rate(&self.key, None, Some(burst)).await
    }

    /// Set both limit and burst in one step.
    pub async fn set_rate(&self, limit: Limit, burst: u32) -> Result<()> {
        self.backend.set_rate(&self.key, Some(limit), Some(burst)).await
    }

    /// Shorthand for `wait_n(1, MaxWait::Unbounded)`.
    pub async fn wait(&self) -> Result<()> {
        self.wait_n(1, MaxWait::Unbounded).await
    }

    /// Wait until `n` events may happen.
    ///
    /// Fails with a terminal error if `n` exceeds the burst or the wait would
    /// exceed `max_wait`. If this future is dropped while sleeping (for example
    /// by a timeout), the reservation is cancelled in the background.
    pub async fn wait_n(&self, n: u32, max_wait: MaxWait) -> Result<()> {
        self.wait_n_or_cancel(n, max_wait, std::future::pending()).await
    }

    /// Like [`Self::wait_n`], but gives up when `cancel` completes first.
    ///
    /// On cancellation the reservation is cancelled in the background and
    /// [`TollgateError::Cancelled`] is returned without waiting for it.
    pub async fn wait_n_or_cancel<F>(&self, n: u32, max_wait: MaxWait, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handle = self.reserve_n_within(n, max_wait).await?;

        let delay = match handle.delay_from(handle.reservation.creation_time) {
            Wait::For(delay) => delay,
            Wait::Forever => {
                return Err(match max_wait {
                    MaxWait::Unbounded => TollgateError::BurstExceeded {
                        key: self.key.clone(),
                        n,
                    },
                    MaxWait::Within(_) => TollgateError::WaitExceeded {
                        key: self.key.clone(),
                        n,
                    },
                })
            }
        };

        if delay.is_zero() {
            return Ok(());
        }

        debug!(key = %self.key, n = n, delay = ?delay, "Waiting for reservation");

        let mut guard = CancelOnDrop(Some(handle));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                guard.disarm();
                Ok(())
            }
            _ = cancel => {
                debug!(key = %self.key, n = n, "Wait cancelled, returning reservation");
                Err(TollgateError::Cancelled)
            }
        }
    }
}

/// A reservation together with the limiter it was taken from.
#[derive(Debug, Clone)]
pub struct ReservationHandle {
    limiter: Limiter,
    reservation: Reservation,
}

impl ReservationHandle {
    /// Whether the reservation was granted.
    pub fn ok(&self) -> bool {
        self.reservation.ok
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// How long to wait from `t` before acting. `Forever` if not granted.
    pub fn delay_from(&self, t: DateTime<Utc>) -> Wait {
        self.reservation.delay_from(t)
    }

    /// How long to wait from now before acting.
    pub fn delay(&self) -> Wait {
        self.delay_from(self.limiter.clock.now())
    }

    /// Indicate the reserved action will not happen and give the permits back,
    /// as far as later reservations allow.
    ///
    /// Fire-and-forget: the cancellation runs on a spawned task and failures
    /// are only logged.
    pub fn cancel(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                key = %self.limiter.key,
                reservation = %self.reservation.id,
                "No runtime available, reservation not cancelled"
            );
            return;
        };

        let backend = self.limiter.backend.clone();
        let key = self.limiter.key.clone();
        let reservation = self.reservation.clone();
        runtime.spawn(async move {
            if let Err(e) = backend.cancel_reservation(&key, &reservation).await {
                warn!(
                    key = %key,
                    reservation = %reservation.id,
                    error = %e,
                    "Failed to cancel reservation"
                );
            }
        });
    }
}

/// Cancels the held reservation unless disarmed before being dropped.
struct CancelOnDrop(Option<ReservationHandle>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cancel();
        }
    }
}

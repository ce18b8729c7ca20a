//! Limiter backend trait for abstracting local and remote implementations.

use async_trait::async_trait;

use super::bucket::{Limit, LimiterState, MaxWait, Reservation};
use crate::error::Result;

/// The operations exposed by a keyed limiter.
///
/// This trait abstracts over the in-process [`super::LimiterService`] and the
/// gRPC client so that [`super::Limiter`] and the gRPC server work with either.
#[async_trait]
pub trait LimiterBackend: Send + Sync {
    /// Persisted state of the limiter at `key`.
    async fn state(&self, key: &str) -> Result<LimiterState>;

    /// Tokens available now, without consuming any.
    async fn tokens(&self, key: &str) -> Result<f64>;

    /// Reserve `n` permits that become actionable within `max_wait`.
    ///
    /// A rejection is a normal return value with `ok == false`.
    async fn reserve_n(&self, key: &str, n: u32, max_wait: MaxWait) -> Result<Reservation>;

    /// Change the rate and/or burst going forward. `None` leaves a field unchanged.
    async fn set_rate(&self, key: &str, limit: Option<Limit>, burst: Option<u32>) -> Result<()>;

    /// Return the permits of a reservation that will not be acted upon.
    async fn cancel_reservation(&self, key: &str, reservation: &Reservation) -> Result<()>;
}

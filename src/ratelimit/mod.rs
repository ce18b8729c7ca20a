//! Token-bucket rate limiting: arithmetic, keyed service and client handle.

mod backend;
mod bucket;
mod client;
mod clock;
mod limiter;
mod rules;

pub use backend::LimiterBackend;
pub use bucket::{Limit, LimiterState, MaxWait, Reservation, Wait};
pub use client::{Limiter, ReservationHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::LimiterService;
pub use rules::{LimitRule, LimitRules, LimitSpec};

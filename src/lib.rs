//! Tollgate - Keyed Token-Bucket Rate Limiting Service
//!
//! Each limiter is identified by a key and owns a token bucket. Callers
//! reserve permits, wait for reservations to become actionable, cancel
//! reservations they will not use, and change rates at runtime. Operations on
//! one key are applied one at a time; different keys never contend.

pub mod config;
pub mod error;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod ratelimit;
pub mod store;

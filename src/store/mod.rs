//! Durable per-key storage of limiter state.
//!
//! The store only needs to provide atomic get/set of a whole
//! [`LimiterState`](crate::ratelimit::LimiterState) per key; read-modify-write
//! serialization is handled by the caller.

mod file;
mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::LimiterState;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persistence backend for limiter state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<LimiterState>>;

    /// Replace the state stored under `key`.
    async fn set(&self, key: &str, state: &LimiterState) -> Result<()>;
}

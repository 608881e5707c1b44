//! Persistence seams for sessions, devices, and signed-URL use counters.
//!
//! All playback state lives in shared storage so any instance can service any
//! heartbeat. The traits here abstract that storage: production uses the Redis
//! implementations, tests use the in-memory ones.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

use crate::device::Device;
use crate::session::{PlaybackSession, SessionStatus};

pub use self::memory::{MemoryDeviceStore, MemorySessionStore, MemorySignedUrlStore};
pub use self::redis::{RedisDeviceStore, RedisSessionStore, RedisSignedUrlStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of atomically consuming one use of a signed-URL token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Use consumed; remaining uses after the decrement.
    Consumed(u32),
    /// Counter already at zero.
    Exhausted,
    /// Unknown or expired token id.
    Missing,
}

/// Session rows. Terminal sessions are retained (status transition, not
/// deletion) so audit and violation forensics can still read them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a freshly minted session. The token is assumed unique.
    async fn insert(&self, session: &PlaybackSession) -> Result<(), StoreError>;

    async fn get(&self, token: &str) -> Result<Option<PlaybackSession>, StoreError>;

    /// Atomically replace the stored session only if its current status equals
    /// `expected`. Returns `false` when the guard fails (concurrent transition
    /// already won) or the row is gone. This is the linearization point for
    /// heartbeat-vs-reaper races.
    async fn compare_and_swap(
        &self,
        token: &str,
        expected: SessionStatus,
        updated: &PlaybackSession,
    ) -> Result<bool, StoreError>;

    /// Tokens indexed under the user, including ones whose rows may have
    /// become terminal; callers filter by status.
    async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// All tokens in the active index (reaper scan).
    async fn active_tokens(&self) -> Result<Vec<String>, StoreError>;

    /// Drop a token from the per-user and active indexes after a terminal
    /// transition. Idempotent.
    async fn deindex(&self, user_id: &str, token: &str) -> Result<(), StoreError>;

    /// Drop a token from the active index when its row is already gone
    /// (retention expiry). The per-user index self-heals on the next scan.
    async fn prune_active(&self, token: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, user_id: &str, fingerprint: &str) -> Result<Option<Device>, StoreError>;

    async fn upsert(&self, device: &Device) -> Result<(), StoreError>;

    /// Devices for a user, including soft-removed ones; callers filter.
    async fn devices_for_user(&self, user_id: &str) -> Result<Vec<Device>, StoreError>;
}

#[async_trait]
pub trait SignedUrlStore: Send + Sync {
    /// Register a token id with its use allowance and time-to-live.
    async fn insert(&self, token_id: &str, uses: u32, ttl_secs: u64) -> Result<(), StoreError>;

    /// Atomically decrement the remaining-use counter.
    async fn consume(&self, token_id: &str) -> Result<ConsumeOutcome, StoreError>;
}

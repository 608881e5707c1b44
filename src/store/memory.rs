//! In-memory store implementations for tests and single-process development.
//!
//! Semantics mirror the Redis implementations: compare-and-swap is atomic
//! under one lock, terminal sessions stay readable, and signed-URL counters
//! honor their TTL.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::device::Device;
use crate::session::{PlaybackSession, SessionStatus};
use crate::store::{ConsumeOutcome, DeviceStore, SessionStore, SignedUrlStore, StoreError};

#[derive(Default)]
struct SessionInner {
    rows: HashMap<String, PlaybackSession>,
    by_user: HashMap<String, HashSet<String>>,
    active: HashSet<String>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<SessionInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard a row while leaving the indexes in place, the way Redis
    /// retention expiry drops a `session:{token}` key.
    pub fn drop_row(&self, token: &str) {
        self.inner.lock().unwrap().rows.remove(token);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &PlaybackSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.token.clone());
        inner.active.insert(session.token.clone());
        inner.rows.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<PlaybackSession>, StoreError> {
        Ok(self.inner.lock().unwrap().rows.get(token).cloned())
    }

    async fn compare_and_swap(
        &self,
        token: &str,
        expected: SessionStatus,
        updated: &PlaybackSession,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.rows.get(token) {
            Some(current) if current.status == expected => {
                inner.rows.insert(token.to_string(), updated.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .by_user
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn active_tokens(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().unwrap().active.iter().cloned().collect())
    }

    async fn deindex(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.by_user.get_mut(user_id) {
            set.remove(token);
        }
        inner.active.remove(token);
        Ok(())
    }

    async fn prune_active(&self, token: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().active.remove(token);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    rows: Mutex<HashMap<(String, String), Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, user_id: &str, fingerprint: &str) -> Result<Option<Device>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), fingerprint.to_string()))
            .cloned())
    }

    async fn upsert(&self, device: &Device) -> Result<(), StoreError> {
        self.rows.lock().unwrap().insert(
            (device.user_id.clone(), device.fingerprint.clone()),
            device.clone(),
        );
        Ok(())
    }

    async fn devices_for_user(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemorySignedUrlStore {
    // token id -> (remaining uses, absolute expiry)
    counters: Mutex<HashMap<String, (u32, i64)>>,
}

impl MemorySignedUrlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignedUrlStore for MemorySignedUrlStore {
    async fn insert(&self, token_id: &str, uses: u32, ttl_secs: u64) -> Result<(), StoreError> {
        let expires_at = Utc::now().timestamp() + ttl_secs as i64;
        self.counters
            .lock()
            .unwrap()
            .insert(token_id.to_string(), (uses, expires_at));
        Ok(())
    }

    async fn consume(&self, token_id: &str) -> Result<ConsumeOutcome, StoreError> {
        let now = Utc::now().timestamp();
        let mut counters = self.counters.lock().unwrap();
        match counters.get_mut(token_id) {
            None => Ok(ConsumeOutcome::Missing),
            Some((_, expires_at)) if now >= *expires_at => {
                counters.remove(token_id);
                Ok(ConsumeOutcome::Missing)
            }
            Some((remaining, _)) if *remaining == 0 => Ok(ConsumeOutcome::Exhausted),
            Some((remaining, _)) => {
                *remaining -= 1;
                Ok(ConsumeOutcome::Consumed(*remaining))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TerminationReason;

    fn session(token: &str, user: &str, status: SessionStatus) -> PlaybackSession {
        let now = Utc::now().timestamp();
        PlaybackSession {
            token: token.to_string(),
            user_id: user.to_string(),
            lesson_id: "lesson-1".to_string(),
            device_fingerprint: "fp-1".to_string(),
            ip_address: "127.0.0.1".to_string(),
            status,
            started_at: now,
            last_heartbeat_at: now,
            expires_at: now + 3600,
            last_position: 0.0,
            termination_reason: None,
        }
    }

    #[tokio::test]
    async fn test_cas_guards_on_status() {
        let store = MemorySessionStore::new();
        store
            .insert(&session("tok-1", "user-1", SessionStatus::Active))
            .await
            .unwrap();

        let mut terminated = session("tok-1", "user-1", SessionStatus::Terminated);
        terminated.termination_reason = Some(TerminationReason::HeartbeatTimeout);
        assert!(store
            .compare_and_swap("tok-1", SessionStatus::Active, &terminated)
            .await
            .unwrap());

        // Second transition loses: status is no longer Active.
        let beat = session("tok-1", "user-1", SessionStatus::Active);
        assert!(!store
            .compare_and_swap("tok-1", SessionStatus::Active, &beat)
            .await
            .unwrap());

        let row = store.get("tok-1").await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Terminated);
        assert_eq!(
            row.termination_reason,
            Some(TerminationReason::HeartbeatTimeout)
        );
    }

    #[tokio::test]
    async fn test_cas_on_missing_row_fails() {
        let store = MemorySessionStore::new();
        let s = session("ghost", "user-1", SessionStatus::Active);
        assert!(!store
            .compare_and_swap("ghost", SessionStatus::Active, &s)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_deindex_is_idempotent() {
        let store = MemorySessionStore::new();
        store
            .insert(&session("tok-1", "user-1", SessionStatus::Active))
            .await
            .unwrap();
        store.deindex("user-1", "tok-1").await.unwrap();
        store.deindex("user-1", "tok-1").await.unwrap();
        assert!(store.active_tokens().await.unwrap().is_empty());
        // Row itself is retained for audit.
        assert!(store.get("tok-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_active_removes_only_the_active_entry() {
        let store = MemorySessionStore::new();
        store
            .insert(&session("tok-1", "user-1", SessionStatus::Active))
            .await
            .unwrap();
        store.drop_row("tok-1");

        store.prune_active("tok-1").await.unwrap();
        assert!(store.active_tokens().await.unwrap().is_empty());
        assert_eq!(store.tokens_for_user("user-1").await.unwrap(), ["tok-1"]);
    }

    #[tokio::test]
    async fn test_counter_consume_to_exhaustion() {
        let store = MemorySignedUrlStore::new();
        store.insert("jti-1", 2, 300).await.unwrap();
        assert_eq!(
            store.consume("jti-1").await.unwrap(),
            ConsumeOutcome::Consumed(1)
        );
        assert_eq!(
            store.consume("jti-1").await.unwrap(),
            ConsumeOutcome::Consumed(0)
        );
        assert_eq!(
            store.consume("jti-1").await.unwrap(),
            ConsumeOutcome::Exhausted
        );
        assert_eq!(
            store.consume("nope").await.unwrap(),
            ConsumeOutcome::Missing
        );
    }
}

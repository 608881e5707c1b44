//! Redis-backed stores.
//!
//! Key conventions: `session:{token}` (JSON row), `user:{id}:sessions` and
//! `sessions:active` (index sets), `device:{user}:{fp}` with `user:{id}:devices`,
//! and `surl:{jti}` use counters. Status transitions and counter consumption
//! are Lua scripts so they are atomic against concurrent instances.

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Client as RedisClient, Script};
use std::sync::Arc;

use crate::device::Device;
use crate::session::{PlaybackSession, SessionStatus};
use crate::store::{ConsumeOutcome, DeviceStore, SessionStore, SignedUrlStore, StoreError};

/// Terminal sessions are retained this long for audit before Redis drops
/// the row.
const SESSION_RETENTION_SECS: i64 = 24 * 3600;

/// Swap the session row only while its current status matches. Keeps the
/// heartbeat-vs-reaper race a single-winner transition.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return 0 end
local ok, obj = pcall(cjson.decode, cur)
if not ok then return 0 end
if obj['status'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return 1
"#;

/// Decrement a signed-URL use counter without going below zero.
/// Returns remaining uses, -1 when exhausted, -2 when missing.
const CONSUME_SCRIPT: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then return -2 end
local n = tonumber(v)
if n == nil or n <= 0 then return -1 end
redis.call('DECR', KEYS[1])
return n - 1
"#;

pub struct RedisSessionStore {
    client: Arc<RedisClient>,
    cas: Script,
}

impl RedisSessionStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self {
            client,
            cas: Script::new(CAS_SCRIPT),
        }
    }

    fn session_key(token: &str) -> String {
        format!("session:{}", token)
    }

    fn user_sessions_key(user_id: &str) -> String {
        format!("user:{}:sessions", user_id)
    }

    fn retention_ttl(session: &PlaybackSession) -> u64 {
        let now = Utc::now().timestamp();
        (session.expires_at - now).max(0) as u64 + SESSION_RETENTION_SECS as u64
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn insert(&self, session: &PlaybackSession) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(session)?;
        let _: () = conn
            .set_ex(
                Self::session_key(&session.token),
                json,
                Self::retention_ttl(session),
            )
            .await?;
        let _: () = conn
            .sadd(Self::user_sessions_key(&session.user_id), &session.token)
            .await?;
        let _: () = conn.sadd("sessions:active", &session.token).await?;
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<PlaybackSession>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json: Option<String> = conn.get(Self::session_key(token)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        token: &str,
        expected: SessionStatus,
        updated: &PlaybackSession,
    ) -> Result<bool, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(updated)?;
        let swapped: i64 = self
            .cas
            .key(Self::session_key(token))
            .arg(expected.as_str())
            .arg(json)
            .arg(Self::retention_ttl(updated))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.smembers(Self::user_sessions_key(user_id)).await?)
    }

    async fn active_tokens(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.smembers("sessions:active").await?)
    }

    async fn deindex(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .srem(Self::user_sessions_key(user_id), token)
            .await?;
        let _: () = conn.srem("sessions:active", token).await?;
        Ok(())
    }

    async fn prune_active(&self, token: &str) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.srem("sessions:active", token).await?;
        Ok(())
    }
}

pub struct RedisDeviceStore {
    client: Arc<RedisClient>,
}

impl RedisDeviceStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    fn device_key(user_id: &str, fingerprint: &str) -> String {
        format!("device:{}:{}", user_id, fingerprint)
    }

    fn user_devices_key(user_id: &str) -> String {
        format!("user:{}:devices", user_id)
    }
}

#[async_trait]
impl DeviceStore for RedisDeviceStore {
    async fn get(&self, user_id: &str, fingerprint: &str) -> Result<Option<Device>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json: Option<String> = conn.get(Self::device_key(user_id, fingerprint)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, device: &Device) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(device)?;
        let _: () = conn
            .set(Self::device_key(&device.user_id, &device.fingerprint), json)
            .await?;
        let _: () = conn
            .sadd(Self::user_devices_key(&device.user_id), &device.fingerprint)
            .await?;
        Ok(())
    }

    async fn devices_for_user(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fingerprints: Vec<String> = conn.smembers(Self::user_devices_key(user_id)).await?;
        let mut devices = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            let json: Option<String> = conn.get(Self::device_key(user_id, &fp)).await?;
            if let Some(json) = json {
                devices.push(serde_json::from_str(&json)?);
            }
        }
        Ok(devices)
    }
}

pub struct RedisSignedUrlStore {
    client: Arc<RedisClient>,
    consume: Script,
}

impl RedisSignedUrlStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self {
            client,
            consume: Script::new(CONSUME_SCRIPT),
        }
    }

    fn counter_key(token_id: &str) -> String {
        format!("surl:{}", token_id)
    }
}

#[async_trait]
impl SignedUrlStore for RedisSignedUrlStore {
    async fn insert(&self, token_id: &str, uses: u32, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .set_ex(Self::counter_key(token_id), uses, ttl_secs)
            .await?;
        Ok(())
    }

    async fn consume(&self, token_id: &str) -> Result<ConsumeOutcome, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: i64 = self
            .consume
            .key(Self::counter_key(token_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(match result {
            -2 => ConsumeOutcome::Missing,
            -1 => ConsumeOutcome::Exhausted,
            remaining => ConsumeOutcome::Consumed(remaining as u32),
        })
    }
}

//! Environment-driven server configuration.

use log::warn;
use sha2::{Digest, Sha256};
use std::env;

use crate::access::AccessConfig;
use crate::session::SessionConfig;

const DEV_SIGNING_SECRET: &str = "streamgate-dev-signing-secret";
const DEV_LICENSE_SECRET: &str = "streamgate-dev-license-secret";
const DEV_JWT_SECRET: &str = "streamgate-dev-jwt-secret";

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub redis_url: String,
    pub nats_url: String,
    pub nats_subject: String,
    pub jwt_secret: Vec<u8>,
    /// Keyed-hash secret for signed streaming URLs.
    pub signing_secret: [u8; 32],
    /// Root material for content key derivation.
    pub license_master_secret: [u8; 32],
    pub content_base_url: String,
    pub max_concurrent_sessions: u32,
    pub max_devices: u32,
    pub heartbeat_interval_secs: i64,
    pub max_session_duration_secs: i64,
    pub max_total_lifetime_secs: i64,
    pub signed_url_ttl_secs: i64,
    pub reaper_interval_secs: u64,
    pub geo_enforcement: bool,
}

impl ServerSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_concurrent_sessions: self.max_concurrent_sessions,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            max_session_duration_secs: self.max_session_duration_secs,
            max_total_lifetime_secs: self.max_total_lifetime_secs,
        }
    }

    pub fn access_config(&self) -> AccessConfig {
        AccessConfig {
            geo_enforcement: self.geo_enforcement,
            max_concurrent_sessions: self.max_concurrent_sessions,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
        }
    }
}

pub fn load_config() -> Result<ServerSettings, Box<dyn std::error::Error>> {
    Ok(ServerSettings {
        port: env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()?,
        redis_url: env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
        nats_subject: env::var("NATS_SUBJECT").unwrap_or_else(|_| "streamgate.events".to_string()),
        jwt_secret: env_secret_string("JWT_SECRET", DEV_JWT_SECRET).into_bytes(),
        signing_secret: env_secret_key("URL_SIGNING_SECRET", DEV_SIGNING_SECRET),
        license_master_secret: env_secret_key("LICENSE_MASTER_SECRET", DEV_LICENSE_SECRET),
        content_base_url: env::var("CONTENT_BASE_URL")
            .unwrap_or_else(|_| "https://cdn.example.com/content".to_string()),
        max_concurrent_sessions: env::var("MAX_CONCURRENT_SESSIONS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()?,
        max_devices: env::var("MAX_DEVICES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()?,
        heartbeat_interval_secs: env::var("HEARTBEAT_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()?,
        max_session_duration_secs: env::var("MAX_SESSION_DURATION_SECS")
            .unwrap_or_else(|_| (6 * 3600).to_string())
            .parse()?,
        max_total_lifetime_secs: env::var("MAX_TOTAL_LIFETIME_SECS")
            .unwrap_or_else(|_| (12 * 3600).to_string())
            .parse()?,
        signed_url_ttl_secs: env::var("SIGNED_URL_TTL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()?,
        reaper_interval_secs: env::var("REAPER_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()?,
        geo_enforcement: env::var("GEO_ENFORCEMENT")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true),
    })
}

fn env_secret_string(var: &str, dev_default: &str) -> String {
    env::var(var).unwrap_or_else(|_| {
        warn!("{} not set; using development default", var);
        dev_default.to_string()
    })
}

/// Secret as 32 key bytes: 64 hex characters decode directly, anything else
/// is hashed down to size.
fn env_secret_key(var: &str, dev_default: &str) -> [u8; 32] {
    let raw = env_secret_string(var, dev_default);
    if raw.len() == 64 {
        if let Ok(bytes) = hex::decode(&raw) {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return key;
        }
    }
    let digest = Sha256::digest(raw.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

//! Capability interfaces onto external collaborators.
//!
//! The access-control core never reaches into course management or payment
//! directly. It consumes exactly two things from them: an entitlement check
//! and a content descriptor. Geo resolution is a third, failure-prone
//! collaborator. Each is a trait injected at construction so tests can swap
//! in fixtures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("entitlement service unavailable: {0}")]
    EntitlementUnavailable(String),
    #[error("content catalog unavailable: {0}")]
    CatalogUnavailable(String),
}

#[derive(Debug, Error)]
pub enum GeoLookupError {
    #[error("geo lookup service unavailable: {0}")]
    Unavailable(String),
    #[error("unresolvable address: {0}")]
    Unresolvable(String),
}

/// DRM usage policy attached to a lesson's content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrmPolicy {
    /// Ceiling on license validity; the session expiry clamps it further.
    pub max_license_duration_secs: i64,
    pub require_output_protection: bool,
    /// Bind signed URLs to the requesting IP in addition to the device.
    pub bind_ip: bool,
    /// Use allowance per signed URL before it invalidates.
    pub max_signed_url_uses: u32,
}

impl Default for DrmPolicy {
    fn default() -> Self {
        Self {
            max_license_duration_secs: 4 * 3600,
            require_output_protection: false,
            bind_ip: false,
            max_signed_url_uses: 3,
        }
    }
}

/// Content descriptor for a protected lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonContent {
    pub lesson_id: String,
    /// Previewable lessons bypass entitlement for anonymous identities.
    pub previewable: bool,
    /// When present and non-empty, playback is restricted to these countries
    /// (ISO 3166-1 alpha-2).
    pub allowed_countries: Option<Vec<String>>,
    /// Always enforced, regardless of the allow list.
    pub blocked_countries: Vec<String>,
    pub qualities: Vec<String>,
    /// Key id for the content encryption key.
    pub key_id: String,
    /// Per-lesson seed mixed into content key derivation.
    pub key_seed: String,
    pub drm_policy: DrmPolicy,
}

impl LessonContent {
    /// Geo verdict for a resolved country, `None` meaning allowed.
    pub fn geo_blocks(&self, country: &str) -> bool {
        if self.blocked_countries.iter().any(|c| c == country) {
            return true;
        }
        match &self.allowed_countries {
            Some(allowed) if !allowed.is_empty() => !allowed.iter().any(|c| c == country),
            _ => false,
        }
    }
}

/// "Is principal P entitled to lesson L" — answered by enrollment/payment.
#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    async fn is_entitled(&self, user_id: &str, lesson_id: &str) -> Result<bool, ProviderError>;
}

/// Lookup of content descriptors by lesson id.
#[async_trait]
pub trait ContentCatalog: Send + Sync {
    async fn lesson_content(&self, lesson_id: &str)
        -> Result<Option<LessonContent>, ProviderError>;
}

/// IP to ISO country resolution. Expected to fail sometimes; the evaluator
/// fails open when it does.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve_country(&self, ip: &str) -> Result<String, GeoLookupError>;
}

/// In-memory entitlement fixture: a set of (user, lesson) grants that can be
/// revoked mid-test to exercise heartbeat re-validation.
#[derive(Default)]
pub struct StaticEntitlements {
    grants: Mutex<HashSet<(String, String)>>,
    available: Mutex<bool>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self {
            grants: Mutex::new(HashSet::new()),
            available: Mutex::new(true),
        }
    }

    pub fn grant(&self, user_id: &str, lesson_id: &str) {
        self.grants
            .lock()
            .unwrap()
            .insert((user_id.to_string(), lesson_id.to_string()));
    }

    pub fn revoke(&self, user_id: &str, lesson_id: &str) {
        self.grants
            .lock()
            .unwrap()
            .remove(&(user_id.to_string(), lesson_id.to_string()));
    }

    pub fn set_available(&self, available: bool) {
        *self.available.lock().unwrap() = available;
    }
}

#[async_trait]
impl EntitlementProvider for StaticEntitlements {
    async fn is_entitled(&self, user_id: &str, lesson_id: &str) -> Result<bool, ProviderError> {
        if !*self.available.lock().unwrap() {
            return Err(ProviderError::EntitlementUnavailable(
                "fixture offline".to_string(),
            ));
        }
        Ok(self
            .grants
            .lock()
            .unwrap()
            .contains(&(user_id.to_string(), lesson_id.to_string())))
    }
}

/// In-memory catalog fixture keyed by lesson id.
#[derive(Default)]
pub struct StaticCatalog {
    lessons: Mutex<HashMap<String, LessonContent>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, content: LessonContent) {
        self.lessons
            .lock()
            .unwrap()
            .insert(content.lesson_id.clone(), content);
    }
}

#[async_trait]
impl ContentCatalog for StaticCatalog {
    async fn lesson_content(
        &self,
        lesson_id: &str,
    ) -> Result<Option<LessonContent>, ProviderError> {
        Ok(self.lessons.lock().unwrap().get(lesson_id).cloned())
    }
}

/// Geo fixture mapping exact IPs to countries; unknown IPs resolve to `ZZ`.
/// Can be flipped unavailable to exercise fail-open.
pub struct StaticGeoResolver {
    by_ip: Mutex<HashMap<String, String>>,
    available: Mutex<bool>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self {
            by_ip: Mutex::new(HashMap::new()),
            available: Mutex::new(true),
        }
    }

    pub fn map(&self, ip: &str, country: &str) {
        self.by_ip
            .lock()
            .unwrap()
            .insert(ip.to_string(), country.to_string());
    }

    pub fn set_available(&self, available: bool) {
        *self.available.lock().unwrap() = available;
    }
}

impl Default for StaticGeoResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve_country(&self, ip: &str) -> Result<String, GeoLookupError> {
        if !*self.available.lock().unwrap() {
            return Err(GeoLookupError::Unavailable("fixture offline".to_string()));
        }
        Ok(self
            .by_ip
            .lock()
            .unwrap()
            .get(ip)
            .cloned()
            .unwrap_or_else(|| "ZZ".to_string()))
    }
}

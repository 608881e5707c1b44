//! Access evaluator: entitlement, geo restriction, device, and concurrency
//! checks combined into one structured allow/deny decision.
//!
//! Hard denials are authentication, entitlement, and (when enforcement is on)
//! geo. Device and session limits are surfaced as warnings here and enforced
//! authoritatively at session start. Geo lookup is fail-open: an unavailable
//! resolver is logged and skipped rather than blocking playback.

use log::{debug, warn};
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::content::{ContentCatalog, EntitlementProvider, GeoResolver, LessonContent};
use crate::device::{DeviceRegistry, RiskLevel};
use crate::error::{DenialCode, GateError};
use crate::session::{scan_active, ConflictingSession};
use crate::store::SessionStore;
use crate::{Principal, RequestContext};

/// Geo results change only when the client moves networks.
const GEO_CACHE_TTL: Duration = Duration::from_secs(60);

/// Entitlement cache lifetime: half the heartbeat interval, clamped to
/// [1, 15] seconds. Keeps a mid-session revocation visible on the next beat
/// even when the interval is configured short.
fn entitlement_cache_ttl(heartbeat_interval_secs: i64) -> Duration {
    Duration::from_secs((heartbeat_interval_secs / 2).clamp(1, 15) as u64)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    pub denial_reason: Option<String>,
    pub denial_code: Option<DenialCode>,
    pub is_enrolled: bool,
    pub is_geo_allowed: bool,
    pub is_device_allowed: bool,
    pub is_concurrent_session_allowed: bool,
    pub active_session_count: u32,
    pub max_allowed_sessions: u32,
    pub conflicting_sessions: Vec<ConflictingSession>,
    pub warnings: Vec<String>,
}

/// Cheap verdict for heartbeat-time re-validation.
#[derive(Debug, Clone)]
pub struct RevalidationVerdict {
    pub denial_code: Option<DenialCode>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub geo_enforcement: bool,
    pub max_concurrent_sessions: u32,
    pub heartbeat_interval_secs: i64,
}

pub struct AccessEvaluator {
    entitlements: Arc<dyn EntitlementProvider>,
    catalog: Arc<dyn ContentCatalog>,
    geo: Arc<dyn GeoResolver>,
    devices: Arc<DeviceRegistry>,
    sessions: Arc<dyn SessionStore>,
    config: AccessConfig,
    entitlement_cache: Cache<(String, String), bool>,
    geo_cache: Cache<String, String>,
}

impl AccessEvaluator {
    pub fn new(
        entitlements: Arc<dyn EntitlementProvider>,
        catalog: Arc<dyn ContentCatalog>,
        geo: Arc<dyn GeoResolver>,
        devices: Arc<DeviceRegistry>,
        sessions: Arc<dyn SessionStore>,
        config: AccessConfig,
    ) -> Self {
        let entitlement_ttl = entitlement_cache_ttl(config.heartbeat_interval_secs);
        Self {
            entitlements,
            catalog,
            geo,
            devices,
            sessions,
            config,
            entitlement_cache: Cache::builder()
                .max_capacity(50_000)
                .time_to_live(entitlement_ttl)
                .build(),
            geo_cache: Cache::builder()
                .max_capacity(50_000)
                .time_to_live(GEO_CACHE_TTL)
                .build(),
        }
    }

    /// Pre-flight access check. Evaluates every dimension and returns the
    /// full diagnostic set even when a hard denial short-circuits the verdict.
    pub async fn check_access(
        &self,
        principal: &Principal,
        lesson_id: &str,
        ctx: &RequestContext,
    ) -> Result<AccessDecision, GateError> {
        let mut warnings = Vec::new();
        let mut denial: Option<(DenialCode, String)> = None;

        let content = self.catalog.lesson_content(lesson_id).await?;
        let content = match content {
            Some(c) => c,
            None => {
                return Ok(self.denied_decision(
                    DenialCode::EntitlementDenied,
                    format!("unknown lesson {}", lesson_id),
                ));
            }
        };

        // 1. Identity / entitlement. Previewable lessons admit anonymous
        // identities without an entitlement lookup.
        let is_enrolled = if principal.is_anonymous() {
            if !content.previewable {
                denial = Some((
                    DenialCode::AuthenticationRequired,
                    "sign in required for this lesson".to_string(),
                ));
            }
            false
        } else {
            let entitled = self
                .entitlement_cached(principal.id(), lesson_id)
                .await?;
            if !entitled && denial.is_none() {
                denial = Some((
                    DenialCode::EntitlementDenied,
                    "not entitled to this lesson".to_string(),
                ));
            }
            entitled
        };

        // 2. Geo restriction, fail-open on resolver trouble.
        let is_geo_allowed = match self.resolve_country_cached(&ctx.ip).await {
            Some(country) => {
                if content.geo_blocks(&country) {
                    if self.config.geo_enforcement {
                        if denial.is_none() {
                            denial = Some((
                                DenialCode::GeoBlocked,
                                format!("content unavailable in {}", country),
                            ));
                        }
                        false
                    } else {
                        warnings.push(format!(
                            "geo restriction matched ({}) but enforcement is disabled",
                            country
                        ));
                        true
                    }
                } else {
                    true
                }
            }
            None => {
                warn!("Geo lookup unavailable for {}; skipping geo check", ctx.ip);
                warnings.push(DenialCode::UpstreamGeoLookupUnavailable.as_str().to_string());
                true
            }
        };

        // 3. Device check, advisory only at this stage.
        let is_device_allowed = self
            .evaluate_device(principal, &ctx.device_fingerprint, &mut warnings)
            .await?;

        // 4. Concurrency, read-only capacity query.
        let now = chrono::Utc::now().timestamp();
        let active = scan_active(&self.sessions, principal.id(), now)
            .await
            .map_err(GateError::Store)?;
        let is_concurrent_session_allowed =
            (active.len() as u32) < self.config.max_concurrent_sessions;
        if !is_concurrent_session_allowed {
            warnings.push(format!(
                "{} of {} concurrent sessions in use",
                active.len(),
                self.config.max_concurrent_sessions
            ));
        }

        let (denial_code, denial_reason) = match denial {
            Some((code, reason)) => (Some(code), Some(reason)),
            None => (None, None),
        };

        debug!(
            "Access check user={} lesson={} allowed={} code={:?}",
            principal.id(),
            lesson_id,
            denial_code.is_none(),
            denial_code
        );

        Ok(AccessDecision {
            allowed: denial_code.is_none(),
            denial_reason,
            denial_code,
            is_enrolled,
            is_geo_allowed,
            is_device_allowed,
            is_concurrent_session_allowed,
            active_session_count: active.len() as u32,
            max_allowed_sessions: self.config.max_concurrent_sessions,
            conflicting_sessions: active.iter().map(ConflictingSession::from).collect(),
            warnings,
        })
    }

    /// Heartbeat-time re-validation on the cached path: entitlement and geo
    /// only. Device and concurrency are start-time concerns. An unavailable
    /// entitlement service degrades to a warning rather than killing live
    /// playback.
    pub async fn revalidate(
        &self,
        user_id: &str,
        lesson_id: &str,
        ctx: &RequestContext,
    ) -> Result<RevalidationVerdict, GateError> {
        let mut warnings = Vec::new();

        let content = match self.catalog.lesson_content(lesson_id).await? {
            Some(c) => c,
            None => {
                return Ok(RevalidationVerdict {
                    denial_code: Some(DenialCode::EntitlementDenied),
                    warnings,
                })
            }
        };

        if !user_id.starts_with("anon:") {
            match self.entitlement_cached_soft(user_id, lesson_id).await {
                Some(false) => {
                    return Ok(RevalidationVerdict {
                        denial_code: Some(DenialCode::EntitlementDenied),
                        warnings,
                    })
                }
                Some(true) => {}
                None => warnings.push("entitlement check unavailable".to_string()),
            }
        } else if !content.previewable {
            return Ok(RevalidationVerdict {
                denial_code: Some(DenialCode::AuthenticationRequired),
                warnings,
            });
        }

        if self.config.geo_enforcement {
            if let Some(country) = self.resolve_country_cached(&ctx.ip).await {
                if content.geo_blocks(&country) {
                    return Ok(RevalidationVerdict {
                        denial_code: Some(DenialCode::GeoBlocked),
                        warnings,
                    });
                }
            } else {
                warnings.push(DenialCode::UpstreamGeoLookupUnavailable.as_str().to_string());
            }
        }

        Ok(RevalidationVerdict {
            denial_code: None,
            warnings,
        })
    }

    /// Content descriptor passthrough for the issuer and signer.
    pub async fn lesson_content(
        &self,
        lesson_id: &str,
    ) -> Result<Option<LessonContent>, GateError> {
        Ok(self.catalog.lesson_content(lesson_id).await?)
    }

    async fn evaluate_device(
        &self,
        principal: &Principal,
        fingerprint: &str,
        warnings: &mut Vec<String>,
    ) -> Result<bool, GateError> {
        if principal.is_anonymous() {
            // Ephemeral identities carry no device history.
            return Ok(true);
        }

        if self.devices.is_known(principal.id(), fingerprint).await? {
            if let Some(device) = self
                .devices
                .list(principal.id())
                .await?
                .into_iter()
                .find(|d| d.fingerprint == fingerprint)
            {
                if device.risk_level == RiskLevel::Elevated {
                    // Step-up verification hook; advisory only.
                    warnings.push("device risk elevated; step-up verification recommended".to_string());
                }
            }
            return Ok(true);
        }

        let count = self.devices.active_count(principal.id()).await?;
        if count >= self.devices.max_devices() {
            warnings.push(DenialCode::DeviceLimitExceeded.as_str().to_string());
            return Ok(false);
        }
        Ok(true)
    }

    async fn entitlement_cached(
        &self,
        user_id: &str,
        lesson_id: &str,
    ) -> Result<bool, GateError> {
        let key = (user_id.to_string(), lesson_id.to_string());
        if let Some(v) = self.entitlement_cache.get(&key).await {
            return Ok(v);
        }
        let v = self.entitlements.is_entitled(user_id, lesson_id).await?;
        self.entitlement_cache.insert(key, v).await;
        Ok(v)
    }

    /// Like `entitlement_cached` but degrades provider faults to `None`.
    async fn entitlement_cached_soft(&self, user_id: &str, lesson_id: &str) -> Option<bool> {
        let key = (user_id.to_string(), lesson_id.to_string());
        if let Some(v) = self.entitlement_cache.get(&key).await {
            return Some(v);
        }
        match self.entitlements.is_entitled(user_id, lesson_id).await {
            Ok(v) => {
                self.entitlement_cache.insert(key, v).await;
                Some(v)
            }
            Err(e) => {
                warn!("Entitlement provider unavailable during re-validation: {}", e);
                None
            }
        }
    }

    /// `None` means the lookup failed; failures are never cached.
    async fn resolve_country_cached(&self, ip: &str) -> Option<String> {
        if let Some(country) = self.geo_cache.get(ip).await {
            return Some(country);
        }
        match self.geo.resolve_country(ip).await {
            Ok(country) => {
                self.geo_cache.insert(ip.to_string(), country.clone()).await;
                Some(country)
            }
            Err(e) => {
                warn!("Geo lookup failed for {}: {}", ip, e);
                None
            }
        }
    }

    fn denied_decision(&self, code: DenialCode, reason: String) -> AccessDecision {
        AccessDecision {
            allowed: false,
            denial_reason: Some(reason),
            denial_code: Some(code),
            is_enrolled: false,
            is_geo_allowed: true,
            is_device_allowed: true,
            is_concurrent_session_allowed: true,
            active_session_count: 0,
            max_allowed_sessions: self.config.max_concurrent_sessions,
            conflicting_sessions: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

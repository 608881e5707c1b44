//! Structured denial codes and the fatal error path.
//!
//! Denial conditions (not entitled, geo blocked, session conflict, ...) are
//! returned as data inside operation outcomes, never as `Err`. Only faults in
//! shared infrastructure (Redis, upstream providers other than geo) propagate
//! as [`GateError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content::ProviderError;
use crate::store::StoreError;

/// Machine-readable code attached to every denial or warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    AuthenticationRequired,
    EntitlementDenied,
    GeoBlocked,
    DeviceLimitExceeded,
    ConcurrentSessionConflict,
    SessionInvalid,
    SessionExpired,
    LicenseRequestMalformed,
    SignatureInvalid,
    UpstreamGeoLookupUnavailable,
}

impl DenialCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "authentication_required",
            Self::EntitlementDenied => "entitlement_denied",
            Self::GeoBlocked => "geo_blocked",
            Self::DeviceLimitExceeded => "device_limit_exceeded",
            Self::ConcurrentSessionConflict => "concurrent_session_conflict",
            Self::SessionInvalid => "session_invalid",
            Self::SessionExpired => "session_expired",
            Self::LicenseRequestMalformed => "license_request_malformed",
            Self::SignatureInvalid => "signature_invalid",
            Self::UpstreamGeoLookupUnavailable => "upstream_geo_lookup_unavailable",
        }
    }
}

impl std::fmt::Display for DenialCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unexpected faults that surface as a generic server error.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("upstream provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("crypto failure: {0}")]
    Crypto(&'static str),
}

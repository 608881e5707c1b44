//! Time-boxed, session-bound DRM license issuance.
//!
//! Licenses are minted only against an active session for the same user and
//! lesson, and never outlive that session. Scheme differences (Widevine,
//! PlayReady, FairPlay, ClearKey) are a tagged enum dispatched to envelope
//! encoders; the key path is shared. Raw key material is returned to the
//! client and audited by key id only, never persisted.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use hkdf::Hkdf;
use log::{info, warn};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditSink, GateEvent};
use crate::content::{ContentCatalog, LessonContent};
use crate::error::{DenialCode, GateError};
use crate::session::SessionStatus;
use crate::store::SessionStore;

/// Maximum accepted raw license request (decoded), to bound parsing work.
const MAX_LICENSE_REQUEST_SIZE: usize = 64 * 1024;

/// Supported DRM schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrmType {
    Widevine,
    Playready,
    Fairplay,
    Clearkey,
}

impl DrmType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "widevine" => Some(Self::Widevine),
            "playready" => Some(Self::Playready),
            "fairplay" => Some(Self::Fairplay),
            "clearkey" => Some(Self::Clearkey),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Widevine => "widevine",
            Self::Playready => "playready",
            Self::Fairplay => "fairplay",
            Self::Clearkey => "clearkey",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePolicies {
    pub max_duration_seconds: i64,
    pub require_output_protection: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseOutcome {
    pub success: bool,
    /// Base64 scheme-specific license envelope.
    pub license: Option<String>,
    pub license_id: Option<String>,
    pub expires_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub policies: Option<LicensePolicies>,
    pub error_code: Option<DenialCode>,
}

impl LicenseOutcome {
    fn denied(code: DenialCode) -> Self {
        Self {
            success: false,
            license: None,
            license_id: None,
            expires_at: None,
            duration_seconds: None,
            policies: None,
            error_code: Some(code),
        }
    }
}

pub struct LicenseIssuer {
    sessions: Arc<dyn SessionStore>,
    catalog: Arc<dyn ContentCatalog>,
    audit: Arc<AuditSink>,
    /// Server master secret for content key derivation.
    master_secret: [u8; 32],
}

impl LicenseIssuer {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        catalog: Arc<dyn ContentCatalog>,
        audit: Arc<AuditSink>,
        master_secret: [u8; 32],
    ) -> Self {
        Self {
            sessions,
            catalog,
            audit,
            master_secret,
        }
    }

    /// Mint a license for `drm_type`, bound to the given session.
    pub async fn issue(
        &self,
        user_id: &str,
        lesson_id: &str,
        drm_type: &str,
        session_token: &str,
        raw_request_b64: &str,
    ) -> Result<LicenseOutcome, GateError> {
        let now = Utc::now().timestamp();

        // 1. Scheme and request validation first: a malformed request never
        // touches key material.
        let drm = match DrmType::parse(drm_type) {
            Some(d) => d,
            None => {
                warn!("Unsupported DRM type {:?}", drm_type);
                return Ok(LicenseOutcome::denied(DenialCode::LicenseRequestMalformed));
            }
        };
        // Bound the encoded size before decoding (base64 is ~4/3 the raw size).
        if raw_request_b64.is_empty() || raw_request_b64.len() > MAX_LICENSE_REQUEST_SIZE * 4 / 3 {
            return Ok(LicenseOutcome::denied(DenialCode::LicenseRequestMalformed));
        }
        let raw_request = match STANDARD.decode(raw_request_b64) {
            Ok(bytes) if !bytes.is_empty() && bytes.len() <= MAX_LICENSE_REQUEST_SIZE => bytes,
            _ => return Ok(LicenseOutcome::denied(DenialCode::LicenseRequestMalformed)),
        };

        // 2. Session binding: an active session for this exact user+lesson.
        let session = match self.sessions.get(session_token).await? {
            Some(s) => s,
            None => return Ok(LicenseOutcome::denied(DenialCode::SessionInvalid)),
        };
        if session.status != SessionStatus::Active
            || session.user_id != user_id
            || session.lesson_id != lesson_id
        {
            return Ok(LicenseOutcome::denied(DenialCode::SessionInvalid));
        }
        if now >= session.expires_at {
            return Ok(LicenseOutcome::denied(DenialCode::SessionExpired));
        }

        let content = match self.catalog.lesson_content(lesson_id).await? {
            Some(c) => c,
            None => return Ok(LicenseOutcome::denied(DenialCode::SessionInvalid)),
        };

        // 3. A license never outlives its session.
        let policy_expiry = now + content.drm_policy.max_license_duration_secs;
        let expires_at = policy_expiry.min(session.expires_at);
        let duration_seconds = expires_at - now;

        // 4. Derive and wrap the content key.
        let content_key = self.derive_content_key(&content)?;
        let wrapped = self.wrap_key(&content_key, session_token, drm)?;

        let license_id = Uuid::new_v4().to_string();
        let envelope = encode_envelope(
            drm,
            &content,
            &content_key,
            &wrapped,
            &license_id,
            expires_at,
            &raw_request,
        );

        info!(
            "Issued {} license {} for session {} (valid {}s)",
            drm.as_str(),
            license_id,
            session_token,
            duration_seconds
        );
        self.audit
            .publish(GateEvent::LicenseIssued {
                license_id: license_id.clone(),
                session_token: session_token.to_string(),
                lesson_id: lesson_id.to_string(),
                key_id: content.key_id.clone(),
                drm_type: drm.as_str().to_string(),
                device_fingerprint: session.device_fingerprint.clone(),
                timestamp: now,
            })
            .await;

        Ok(LicenseOutcome {
            success: true,
            license: Some(STANDARD.encode(envelope.to_string().as_bytes())),
            license_id: Some(license_id),
            expires_at: Some(expires_at),
            duration_seconds: Some(duration_seconds),
            policies: Some(LicensePolicies {
                max_duration_seconds: content.drm_policy.max_license_duration_secs,
                require_output_protection: content.drm_policy.require_output_protection,
            }),
            error_code: None,
        })
    }

    /// Content encryption key: HKDF-SHA256(master_secret) salted by the key
    /// id and expanded with the per-lesson seed. Deterministic so packaging
    /// and licensing agree without a key database.
    fn derive_content_key(&self, content: &LessonContent) -> Result<[u8; 32], GateError> {
        let salt = Sha256::digest(content.key_id.as_bytes());
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &self.master_secret);
        let mut key = [0u8; 32];
        hkdf.expand(content.key_seed.as_bytes(), &mut key)
            .map_err(|_| GateError::Crypto("hkdf content key expand"))?;
        Ok(key)
    }

    /// Wrap the content key under a session-bound wrapping key with
    /// AES-256-GCM. Output is nonce || ciphertext, base64.
    fn wrap_key(
        &self,
        content_key: &[u8; 32],
        session_token: &str,
        drm: DrmType,
    ) -> Result<String, GateError> {
        let salt = Sha256::digest(session_token.as_bytes());
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &self.master_secret);
        let mut wrapping_key = [0u8; 32];
        hkdf.expand(drm.as_str().as_bytes(), &mut wrapping_key)
            .map_err(|_| GateError::Crypto("hkdf wrapping key expand"))?;

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let nonce_ga = GenericArray::from_slice(&nonce);

        let key = Key::<Aes256Gcm>::from(wrapping_key);
        let cipher = Aes256Gcm::new(&key);
        let ciphertext = cipher
            .encrypt(nonce_ga, content_key.as_slice())
            .map_err(|_| GateError::Crypto("aes-gcm key wrap"))?;

        let mut combined = Vec::with_capacity(nonce.len() + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }
}

/// Scheme-specific license envelope. Each scheme has its own shape; the
/// request bytes are echoed into a challenge digest so clients can correlate.
fn encode_envelope(
    drm: DrmType,
    content: &LessonContent,
    content_key: &[u8; 32],
    wrapped_key: &str,
    license_id: &str,
    expires_at: i64,
    raw_request: &[u8],
) -> serde_json::Value {
    let challenge_digest = hex::encode(Sha256::digest(raw_request));
    match drm {
        DrmType::Widevine => serde_json::json!({
            "format": "widevine",
            "licenseId": license_id,
            "keyId": content.key_id,
            "wrappedKey": wrapped_key,
            "challengeDigest": challenge_digest,
            "expiresAt": expires_at,
            "policy": {
                "canPlay": true,
                "outputProtection": { "hdcp": content.drm_policy.require_output_protection },
            },
        }),
        DrmType::Playready => serde_json::json!({
            "format": "playready",
            "licenseId": license_id,
            "keyId": content.key_id,
            "wrappedKey": wrapped_key,
            "challengeDigest": challenge_digest,
            "licenseType": "nonpersistent",
            "expiresAt": expires_at,
            "minOutputProtectionLevel": if content.drm_policy.require_output_protection { 300 } else { 100 },
        }),
        DrmType::Fairplay => serde_json::json!({
            "format": "fairplay",
            "licenseId": license_id,
            "keyId": content.key_id,
            "ckc": wrapped_key,
            "challengeDigest": challenge_digest,
            "expiresAt": expires_at,
            "persistence": false,
        }),
        // ClearKey delivers the key itself (W3C EME JWK shape); transport
        // security is the only protection, which is what ClearKey is for.
        DrmType::Clearkey => serde_json::json!({
            "format": "clearkey",
            "licenseId": license_id,
            "expiresAt": expires_at,
            "keys": [{
                "kty": "oct",
                "kid": URL_SAFE_NO_PAD.encode(content.key_id.as_bytes()),
                "k": URL_SAFE_NO_PAD.encode(&content_key[..16]),
            }],
            "type": "temporary",
        }),
    }
}

//! Short-lived signed streaming URLs with device/IP binding and a bounded
//! use counter.
//!
//! The token is a url-safe base64 claims payload and the signature a keyed
//! SHA-256 tag over it, verified in constant time. Validation reports a
//! specific failure reason so logs can tell expiry apart from tampering, and
//! every success burns one use so replay is bounded even inside the expiry
//! window.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::content::LessonContent;
use crate::error::GateError;
use crate::store::{ConsumeOutcome, SignedUrlStore};
use crate::RequestContext;

#[derive(Debug, Serialize, Deserialize)]
struct UrlClaims {
    /// Claim id keying the use counter.
    jti: String,
    sub: String,
    lesson: String,
    /// Bound device fingerprint.
    fp: String,
    /// Bound IP, present only when the content policy demands it.
    ip: Option<String>,
    exp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrl {
    pub url: String,
    pub token: String,
    pub signature: String,
    pub expires_at: i64,
    pub remaining_access: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTokenReason {
    MalformedToken,
    SignatureMismatch,
    Expired,
    DeviceBindingMismatch,
    IpBindingMismatch,
    Exhausted,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub invalid_reason: Option<InvalidTokenReason>,
    pub remaining_access: Option<u32>,
    pub expires_at: Option<i64>,
}

impl ValidationOutcome {
    fn invalid(reason: InvalidTokenReason) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason),
            remaining_access: None,
            expires_at: None,
        }
    }
}

pub struct UrlSigner {
    store: Arc<dyn SignedUrlStore>,
    signing_key: [u8; 32],
    ttl_secs: i64,
    /// Base under which streamable content lives, e.g. a CDN origin.
    content_base: String,
}

impl UrlSigner {
    pub fn new(
        store: Arc<dyn SignedUrlStore>,
        signing_key: [u8; 32],
        ttl_secs: i64,
        content_base: String,
    ) -> Self {
        Self {
            store,
            signing_key,
            ttl_secs,
            content_base,
        }
    }

    /// Mint a signed URL for a lesson, bound to the requesting device and,
    /// per content policy, the requesting IP.
    pub async fn sign(
        &self,
        user_id: &str,
        content: &LessonContent,
        ctx: &RequestContext,
        quality: Option<&str>,
    ) -> Result<SignedUrl, GateError> {
        let now = Utc::now().timestamp();
        let claims = UrlClaims {
            jti: Uuid::new_v4().to_string(),
            sub: user_id.to_string(),
            lesson: content.lesson_id.clone(),
            fp: ctx.device_fingerprint.clone(),
            ip: content.drm_policy.bind_ip.then(|| ctx.ip.clone()),
            exp: now + self.ttl_secs,
        };

        let token = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).map_err(
            crate::store::StoreError::Serialization,
        )?);
        let signature = self.tag(&token);

        let uses = content.drm_policy.max_signed_url_uses;
        self.store
            .insert(&claims.jti, uses, self.ttl_secs as u64)
            .await?;

        let quality = quality.unwrap_or("auto");
        let url = format!(
            "{}/{}/{}/manifest.m3u8?token={}&sig={}",
            self.content_base, content.lesson_id, quality, token, signature
        );

        debug!(
            "Signed URL for user={} lesson={} uses={} ttl={}s",
            user_id, content.lesson_id, uses, self.ttl_secs
        );

        Ok(SignedUrl {
            url,
            token,
            signature,
            expires_at: claims.exp,
            remaining_access: uses,
        })
    }

    /// Validate a token+signature pair against the request context and burn
    /// one use on success.
    pub async fn validate(
        &self,
        token: &str,
        signature: &str,
        ctx: &RequestContext,
    ) -> Result<ValidationOutcome, GateError> {
        // Authenticity first: nothing in the payload is trusted until the
        // tag checks out.
        let expected = self.tag(token);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Ok(ValidationOutcome::invalid(
                InvalidTokenReason::SignatureMismatch,
            ));
        }

        let claims: UrlClaims = match URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(c) => c,
            None => {
                return Ok(ValidationOutcome::invalid(
                    InvalidTokenReason::MalformedToken,
                ))
            }
        };

        let now = Utc::now().timestamp();
        if now >= claims.exp {
            return Ok(ValidationOutcome::invalid(InvalidTokenReason::Expired));
        }

        if claims.fp != ctx.device_fingerprint {
            return Ok(ValidationOutcome::invalid(
                InvalidTokenReason::DeviceBindingMismatch,
            ));
        }
        if let Some(ref bound_ip) = claims.ip {
            if *bound_ip != ctx.ip {
                return Ok(ValidationOutcome::invalid(
                    InvalidTokenReason::IpBindingMismatch,
                ));
            }
        }

        match self.store.consume(&claims.jti).await? {
            ConsumeOutcome::Consumed(remaining) => Ok(ValidationOutcome {
                is_valid: true,
                invalid_reason: None,
                remaining_access: Some(remaining),
                expires_at: Some(claims.exp),
            }),
            ConsumeOutcome::Exhausted => {
                Ok(ValidationOutcome::invalid(InvalidTokenReason::Exhausted))
            }
            ConsumeOutcome::Missing => {
                Ok(ValidationOutcome::invalid(InvalidTokenReason::Unknown))
            }
        }
    }

    /// Keyed tag: hex SHA-256 over signing key || token bytes.
    fn tag(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key);
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

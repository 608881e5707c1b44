//! HTTP/JSON transport adapter.
//!
//! Thin layer over the core services: extracts identity and device context,
//! normalizes loose payloads at the boundary, and maps structured denial
//! codes to HTTP status codes. Denials the core reports as data (blocked
//! start, invalid heartbeat) ride inside 200 responses; transport-level
//! failures use [`ErrorResponse`].

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::access::{AccessDecision, AccessEvaluator};
use crate::audit::{AuditSink, GateEvent, Severity, ViolationRecord};
use crate::device::{Device, DeviceMetadata, DeviceRegistry, RegistrationOutcome};
use crate::error::{DenialCode, GateError};
use crate::license::{LicenseIssuer, LicenseOutcome};
use crate::session::{
    HeartbeatOutcome, PlaybackSession, SessionManager, StartOutcome, TerminationReason,
};
use crate::token::{UrlSigner, ValidationOutcome};
use crate::{Principal, RequestContext};

const DEVICE_FINGERPRINT_HEADER: &str = "x-device-fingerprint";

/// Shared state for all gate endpoints.
pub struct AppState {
    pub evaluator: Arc<AccessEvaluator>,
    pub sessions: Arc<SessionManager>,
    pub devices: Arc<DeviceRegistry>,
    pub licenses: Arc<LicenseIssuer>,
    pub signer: Arc<UrlSigner>,
    pub audit: Arc<AuditSink>,
    pub jwt_secret: Vec<u8>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/session/start", post(session_start))
        .route("/session/heartbeat", post(session_heartbeat))
        .route("/session/end", post(session_end))
        .route("/session/end-all", post(session_end_all))
        .route("/session/active", get(session_active))
        .route("/access-check/:lesson_id", get(access_check))
        .route("/stream/:lesson_id", get(stream_url))
        .route("/validate-token", post(validate_token))
        .route("/drm/license", post(drm_license))
        .route("/device/register", post(device_register))
        .route("/device/list", get(device_list))
        .route("/device/:fingerprint", delete(device_remove))
        .route("/report/suspicious", post(report_suspicious))
        .with_state(state)
}

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub lesson_id: String,
    pub device_fingerprint: Option<String>,
    pub resume_from_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_token: String,
    pub position: Option<f64>,
    #[allow(dead_code)]
    pub quality: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRequest {
    pub session_token: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndAllResponse {
    pub ended_count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_token: String,
    pub lesson_id: String,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub started_at: i64,
    pub last_position: f64,
}

impl From<&PlaybackSession> for SessionSummary {
    fn from(s: &PlaybackSession) -> Self {
        Self {
            session_token: s.token.clone(),
            lesson_id: s.lesson_id.clone(),
            device_fingerprint: s.device_fingerprint.clone(),
            ip_address: s.ip_address.clone(),
            started_at: s.started_at,
            last_position: s.last_position,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub url: String,
    pub token: String,
    pub signature: String,
    pub expires_at: i64,
    pub session_token: String,
    pub resume_from: f64,
    pub qualities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenRequest {
    pub token: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequest {
    pub lesson_id: String,
    pub drm_type: String,
    /// Base64 scheme-specific license challenge.
    pub license_request: String,
    pub session_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub metadata: DeviceMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListResponse {
    pub devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousReportRequest {
    pub session_token: Option<String>,
    pub activity_type: String,
    pub risk_score: i32,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }

    fn denial(code: DenialCode, message: impl Into<String>) -> Self {
        Self::new(code.as_str(), message)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.error.as_str() {
            "authentication_required" => StatusCode::UNAUTHORIZED,
            "entitlement_denied" | "geo_blocked" | "signature_invalid" => StatusCode::FORBIDDEN,
            "session_invalid" => StatusCode::NOT_FOUND,
            "session_expired" => StatusCode::GONE,
            "device_limit_exceeded" => StatusCode::CONFLICT,
            "concurrent_session_conflict" => StatusCode::TOO_MANY_REQUESTS,
            "license_request_malformed" | "invalid_request" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<GateError> for ErrorResponse {
    fn from(e: GateError) -> Self {
        error!("Internal error: {}", e);
        Self::new("internal_error", "internal server error")
    }
}

// ==================== Identity & Context Extraction ====================

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Bearer identity, if any. A missing header yields `None`; a present but
/// invalid token is an error, never silent anonymity.
fn bearer_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Principal>, ErrorResponse> {
    let header = match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(h) => h,
        None => return Ok(None),
    };
    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        ErrorResponse::new("invalid_request", "malformed Authorization header")
    })?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(&state.jwt_secret),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        warn!("Rejected bearer token: {}", e);
        ErrorResponse::denial(DenialCode::AuthenticationRequired, "invalid bearer token")
    })?;
    Ok(Some(Principal::User(data.claims.sub)))
}

/// Identity for endpoints that admit anonymous preview access: bearer user
/// or a fresh ephemeral principal.
fn principal_or_ephemeral(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Principal, ErrorResponse> {
    Ok(bearer_principal(state, headers)?.unwrap_or_else(Principal::ephemeral))
}

/// Identity for endpoints that require a signed-in user.
fn require_user(state: &AppState, headers: &HeaderMap) -> Result<Principal, ErrorResponse> {
    bearer_principal(state, headers)?.ok_or_else(|| {
        ErrorResponse::denial(DenialCode::AuthenticationRequired, "sign in required")
    })
}

fn fingerprint_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DEVICE_FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn request_context(
    headers: &HeaderMap,
    addr: SocketAddr,
    fingerprint: Option<String>,
) -> Result<RequestContext, ErrorResponse> {
    let fingerprint = fingerprint.or_else(|| fingerprint_header(headers)).ok_or_else(|| {
        ErrorResponse::new(
            "invalid_request",
            "missing X-Device-Fingerprint header or deviceFingerprint field",
        )
    })?;
    Ok(RequestContext {
        ip: addr.ip().to_string(),
        device_fingerprint: fingerprint,
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    })
}

/// Context for endpoints that never key on the device: the fingerprint rides
/// along when the header happens to be present.
fn request_context_lenient(headers: &HeaderMap, addr: SocketAddr) -> RequestContext {
    RequestContext {
        ip: addr.ip().to_string(),
        device_fingerprint: fingerprint_header(headers).unwrap_or_default(),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    }
}

fn parse_end_reason(reason: Option<&str>) -> TerminationReason {
    match reason {
        Some("policy_violation") => TerminationReason::PolicyViolation,
        _ => TerminationReason::UserEnded,
    }
}

// ==================== Session Handlers ====================

/// POST /session/start
async fn session_start(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<StartOutcome>, ErrorResponse> {
    let principal = principal_or_ephemeral(&state, &headers)?;
    let ctx = request_context(&headers, addr, payload.device_fingerprint.clone())?;
    let outcome = state
        .sessions
        .start(
            &principal,
            &payload.lesson_id,
            &ctx,
            payload.resume_from_seconds,
        )
        .await?;
    Ok(Json(outcome))
}

/// POST /session/heartbeat
async fn session_heartbeat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatOutcome>, ErrorResponse> {
    // Liveness only needs the caller's network identity; re-validation does
    // not key on the device.
    let ctx = request_context_lenient(&headers, addr);
    let outcome = state
        .sessions
        .heartbeat(&payload.session_token, payload.position, &ctx)
        .await?;
    Ok(Json(outcome))
}

/// POST /session/end
async fn session_end(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EndSessionRequest>,
) -> Result<Json<SuccessResponse>, ErrorResponse> {
    let reason = parse_end_reason(payload.reason.as_deref());
    let success = state.sessions.end(&payload.session_token, reason).await?;
    Ok(Json(SuccessResponse { success }))
}

/// POST /session/end-all
async fn session_end_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<EndAllResponse>, ErrorResponse> {
    let principal = require_user(&state, &headers)?;
    let ended_count = state
        .sessions
        .end_all(principal.id(), TerminationReason::SignedOutAllDevices)
        .await?;
    Ok(Json(EndAllResponse { ended_count }))
}

/// GET /session/active
async fn session_active(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ActiveSessionsResponse>, ErrorResponse> {
    let principal = require_user(&state, &headers)?;
    let sessions = state.sessions.active_sessions(principal.id()).await?;
    Ok(Json(ActiveSessionsResponse {
        sessions: sessions.iter().map(SessionSummary::from).collect(),
    }))
}

// ==================== Access / Streaming Handlers ====================

/// GET /access-check/{lesson_id}
async fn access_check(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(lesson_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AccessDecision>, ErrorResponse> {
    let principal = principal_or_ephemeral(&state, &headers)?;
    let ctx = request_context(&headers, addr, None)?;
    let decision = state
        .evaluator
        .check_access(&principal, &lesson_id, &ctx)
        .await?;
    Ok(Json(decision))
}

/// GET /stream/{lesson_id}?quality=
///
/// Reuses the caller's active session for the lesson on the same device, or
/// starts one; then mints a signed streaming URL bound to the session.
async fn stream_url(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(lesson_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<StreamResponse>, ErrorResponse> {
    let principal = principal_or_ephemeral(&state, &headers)?;
    let ctx = request_context(&headers, addr, None)?;

    let decision = state
        .evaluator
        .check_access(&principal, &lesson_id, &ctx)
        .await?;
    if !decision.allowed {
        let code = decision.denial_code.unwrap_or(DenialCode::EntitlementDenied);
        return Err(ErrorResponse::denial(
            code,
            decision
                .denial_reason
                .unwrap_or_else(|| code.as_str().to_string()),
        ));
    }

    let existing = state
        .sessions
        .active_sessions(principal.id())
        .await?
        .into_iter()
        .find(|s| s.lesson_id == lesson_id && s.device_fingerprint == ctx.device_fingerprint);

    let (session_token, resume_from) = match existing {
        Some(session) => (session.token, session.last_position),
        None => {
            let outcome = state.sessions.start(&principal, &lesson_id, &ctx, None).await?;
            if !outcome.is_allowed {
                let code = outcome
                    .block_code
                    .unwrap_or(DenialCode::ConcurrentSessionConflict);
                return Err(ErrorResponse::denial(
                    code,
                    outcome
                        .block_reason
                        .unwrap_or_else(|| code.as_str().to_string()),
                ));
            }
            (outcome.session_token.unwrap_or_default(), 0.0)
        }
    };

    let content = state
        .evaluator
        .lesson_content(&lesson_id)
        .await?
        .ok_or_else(|| {
            ErrorResponse::denial(DenialCode::EntitlementDenied, "unknown lesson")
        })?;

    let signed = state
        .signer
        .sign(
            principal.id(),
            &content,
            &ctx,
            params.get("quality").map(String::as_str),
        )
        .await?;

    Ok(Json(StreamResponse {
        url: signed.url,
        token: signed.token,
        signature: signed.signature,
        expires_at: signed.expires_at,
        session_token,
        resume_from,
        qualities: content.qualities,
    }))
}

/// POST /validate-token
async fn validate_token(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ValidateTokenRequest>,
) -> Result<Json<ValidationOutcome>, ErrorResponse> {
    let ctx = request_context(&headers, addr, None)?;
    let outcome = state
        .signer
        .validate(&payload.token, &payload.signature, &ctx)
        .await?;
    Ok(Json(outcome))
}

/// POST /drm/license
async fn drm_license(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<LicenseRequest>,
) -> Result<Json<LicenseOutcome>, ErrorResponse> {
    // Bearer identity when present; otherwise possession of the unguessable
    // session token stands in for it (anonymous preview playback).
    let user_id = match bearer_principal(&state, &headers)? {
        Some(principal) => principal.id().to_string(),
        None => match state.sessions.get(&payload.session_token).await? {
            Some(session) => session.user_id,
            None => {
                return Err(ErrorResponse::denial(
                    DenialCode::SessionInvalid,
                    "unknown session",
                ))
            }
        },
    };

    let outcome = state
        .licenses
        .issue(
            &user_id,
            &payload.lesson_id,
            &payload.drm_type,
            &payload.session_token,
            &payload.license_request,
        )
        .await?;
    Ok(Json(outcome))
}

// ==================== Device Handlers ====================

/// POST /device/register
async fn device_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<RegisterDeviceRequest>,
) -> Result<Json<RegistrationOutcome>, ErrorResponse> {
    let principal = require_user(&state, &headers)?;
    let fingerprint = payload
        .fingerprint
        .or_else(|| fingerprint_header(&headers))
        .ok_or_else(|| ErrorResponse::new("invalid_request", "missing device fingerprint"))?;
    let outcome = state
        .devices
        .register(principal.id(), &fingerprint, payload.metadata)
        .await?;
    Ok(Json(outcome))
}

/// GET /device/list
async fn device_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DeviceListResponse>, ErrorResponse> {
    let principal = require_user(&state, &headers)?;
    let devices = state.devices.list(principal.id()).await?;
    Ok(Json(DeviceListResponse { devices }))
}

/// DELETE /device/{fingerprint}
async fn device_remove(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, ErrorResponse> {
    let principal = require_user(&state, &headers)?;
    state.devices.remove(principal.id(), &fingerprint).await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ==================== Violation Reporting ====================

/// POST /report/suspicious
async fn report_suspicious(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SuspiciousReportRequest>,
) -> Result<Json<SuccessResponse>, ErrorResponse> {
    let principal = bearer_principal(&state, &headers)?;

    let severity = match payload.risk_score {
        s if s >= 75 => Severity::Critical,
        s if s >= 50 => Severity::High,
        s if s >= 25 => Severity::Medium,
        _ => Severity::Low,
    };
    let record = ViolationRecord::new(
        payload.session_token.clone(),
        payload.activity_type.clone(),
        severity,
        payload
            .description
            .unwrap_or_else(|| payload.activity_type.clone()),
        payload.risk_score,
    );
    state
        .audit
        .publish(GateEvent::SuspiciousActivity { record })
        .await;

    // High-risk reports feed the device risk heuristic.
    if severity >= Severity::High {
        if let (Some(principal), Some(fingerprint)) = (principal, fingerprint_header(&headers)) {
            if !principal.is_anonymous() {
                state
                    .devices
                    .elevate_risk(principal.id(), &fingerprint)
                    .await?;
            }
        }
    }

    Ok(Json(SuccessResponse { success: true }))
}

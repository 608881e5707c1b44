//! Audit and violation reporting.
//!
//! Session lifecycle events, policy denials, license issuances, and
//! suspicious-activity reports are published to NATS for downstream
//! analytics/notification and mirrored as structured one-line logs. NATS is
//! optional; when it is not configured events are log-only.

use async_nats::Client as NatsClient;
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Append-only record of suspicious activity tied to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub id: String,
    pub session_token: Option<String>,
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    pub risk_score_delta: i32,
    pub occurred_at: i64,
}

impl ViolationRecord {
    pub fn new(
        session_token: Option<String>,
        violation_type: String,
        severity: Severity,
        description: String,
        risk_score_delta: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_token,
            violation_type,
            severity,
            description,
            risk_score_delta,
            occurred_at: Utc::now().timestamp(),
        }
    }
}

/// Events emitted by the access-control core for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateEvent {
    SessionStart {
        session_token: String,
        user_id: String,
        lesson_id: String,
        client_ip: String,
        device_fingerprint: String,
        timestamp: i64,
    },
    SessionEnd {
        session_token: String,
        user_id: String,
        lesson_id: String,
        duration_seconds: i64,
        reason: String,
        timestamp: i64,
    },
    PolicyDenial {
        user_id: String,
        lesson_id: String,
        denial_code: String,
        denial_reason: String,
        timestamp: i64,
    },
    ConcurrencyLimit {
        user_id: String,
        current_sessions: u32,
        max_sessions: u32,
        timestamp: i64,
    },
    LicenseIssued {
        license_id: String,
        session_token: String,
        lesson_id: String,
        key_id: String,
        drm_type: String,
        device_fingerprint: String,
        timestamp: i64,
    },
    SuspiciousActivity {
        record: ViolationRecord,
    },
}

impl GateEvent {
    fn event_type(&self) -> &str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd { .. } => "session_end",
            Self::PolicyDenial { .. } => "policy_denial",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::LicenseIssued { .. } => "license_issued",
            Self::SuspiciousActivity { .. } => "suspicious_activity",
        }
    }
}

/// Publishes gate events to NATS and mirrors them to the log.
pub struct AuditSink {
    nats_client: Option<Arc<NatsClient>>,
    subject: String,
}

impl AuditSink {
    pub fn new(nats_client: Option<Arc<NatsClient>>, subject: String) -> Self {
        if nats_client.is_none() {
            warn!("NATS not configured; gate events will be log-only");
        }
        Self {
            nats_client,
            subject,
        }
    }

    /// Publish an event. Failures are logged, never propagated; audit must
    /// not take down playback.
    pub async fn publish(&self, event: GateEvent) {
        self.log_event(&event);

        if let Some(ref client) = self.nats_client {
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    let subject = format!("{}.{}", self.subject, event.event_type());
                    if let Err(e) = client.publish(subject, payload.into()).await {
                        error!("Failed to publish gate event: {}", e);
                    }
                }
                Err(e) => error!("Failed to serialize gate event: {}", e),
            }
        }
    }

    fn log_event(&self, event: &GateEvent) {
        match event {
            GateEvent::SessionStart {
                session_token,
                user_id,
                lesson_id,
                client_ip,
                ..
            } => {
                info!(
                    "SESSION_START session={} user={} lesson={} ip={}",
                    session_token, user_id, lesson_id, client_ip
                );
            }
            GateEvent::SessionEnd {
                session_token,
                user_id,
                duration_seconds,
                reason,
                ..
            } => {
                info!(
                    "SESSION_END session={} user={} duration={}s reason={}",
                    session_token, user_id, duration_seconds, reason
                );
            }
            GateEvent::PolicyDenial {
                user_id,
                lesson_id,
                denial_code,
                ..
            } => {
                info!(
                    "POLICY_DENIAL user={} lesson={} code={}",
                    user_id, lesson_id, denial_code
                );
            }
            GateEvent::ConcurrencyLimit {
                user_id,
                current_sessions,
                max_sessions,
                ..
            } => {
                info!(
                    "CONCURRENCY_LIMIT user={} current={} max={}",
                    user_id, current_sessions, max_sessions
                );
            }
            GateEvent::LicenseIssued {
                license_id,
                session_token,
                lesson_id,
                drm_type,
                ..
            } => {
                info!(
                    "LICENSE_ISSUED license={} session={} lesson={} drm={}",
                    license_id, session_token, lesson_id, drm_type
                );
            }
            GateEvent::SuspiciousActivity { record } => {
                warn!(
                    "SUSPICIOUS_ACTIVITY id={} session={:?} type={} severity={:?} delta={}",
                    record.id,
                    record.session_token,
                    record.violation_type,
                    record.severity,
                    record.risk_score_delta
                );
            }
        }
    }
}

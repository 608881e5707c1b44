//! Playback session lifecycle: start, heartbeat liveness, termination, and
//! the background reaper.
//!
//! State machine: `Starting -> Active -> {Ended | Terminated}`. Terminal
//! states are final and no session is reused. Every mutation of a live
//! session goes through the store's compare-and-swap so a heartbeat arriving
//! the instant the reaper times the session out cannot resurrect it.

use chrono::Utc;
use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::access::AccessEvaluator;
use crate::audit::{AuditSink, GateEvent};
use crate::error::{DenialCode, GateError};
use crate::store::{SessionStore, StoreError};
use crate::{Principal, RequestContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Ended,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Terminated)
    }

    /// Wire value, matching the serde representation. The Redis
    /// compare-and-swap script compares against this string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserEnded,
    HeartbeatTimeout,
    SessionExpired,
    EntitlementRevoked,
    GeoBlocked,
    SignedOutAllDevices,
    PolicyViolation,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserEnded => "user_ended",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SessionExpired => "session_expired",
            Self::EntitlementRevoked => "entitlement_revoked",
            Self::GeoBlocked => "geo_blocked",
            Self::SignedOutAllDevices => "signed_out_all_devices",
            Self::PolicyViolation => "policy_violation",
        }
    }
}

/// A playback session row. Owned exclusively by the session manager; mutated
/// only through its operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSession {
    pub token: String,
    pub user_id: String,
    pub lesson_id: String,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub status: SessionStatus,
    pub started_at: i64,
    pub last_heartbeat_at: i64,
    pub expires_at: i64,
    /// Playback offset in seconds, for resume.
    pub last_position: f64,
    pub termination_reason: Option<TerminationReason>,
}

impl PlaybackSession {
    pub fn is_stale(&self, now: i64, heartbeat_interval_secs: i64) -> bool {
        now - self.last_heartbeat_at > 2 * heartbeat_interval_secs
    }
}

/// Summary of a session conflicting with a blocked start, enough for the
/// client to offer "end other session and retry".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingSession {
    pub session_token: String,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub started_at: i64,
}

impl From<&PlaybackSession> for ConflictingSession {
    fn from(s: &PlaybackSession) -> Self {
        Self {
            session_token: s.token.clone(),
            device_fingerprint: s.device_fingerprint.clone(),
            ip_address: s.ip_address.clone(),
            started_at: s.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub is_allowed: bool,
    pub session_token: Option<String>,
    pub session_expires_at: Option<i64>,
    pub heartbeat_interval_seconds: i64,
    pub active_sessions: u32,
    pub max_allowed_sessions: u32,
    pub block_reason: Option<String>,
    pub block_code: Option<DenialCode>,
    pub conflicting_sessions: Vec<ConflictingSession>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatOutcome {
    pub is_valid: bool,
    pub should_continue: bool,
    pub termination_reason: Option<TerminationReason>,
    pub next_heartbeat_seconds: i64,
    /// Set when the session is about to hit its total-lifetime cap; the
    /// client should start a fresh session to keep playing.
    pub force_refresh_token: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_concurrent_sessions: u32,
    pub heartbeat_interval_secs: i64,
    /// Rolling expiry granted at start and on each heartbeat.
    pub max_session_duration_secs: i64,
    /// Hard ceiling on total session lifetime; heartbeats cannot extend past
    /// `started_at + max_total_lifetime_secs`.
    pub max_total_lifetime_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 2,
            heartbeat_interval_secs: 30,
            max_session_duration_secs: 6 * 3600,
            max_total_lifetime_secs: 12 * 3600,
        }
    }
}

/// Sessions with status `Active` that have not passed their expiry. Stale
/// heartbeats do not exclude a session here; only the reaper's terminal
/// transition does. Read-only: capacity queries must not mutate state.
pub(crate) async fn scan_active(
    store: &Arc<dyn SessionStore>,
    user_id: &str,
    now: i64,
) -> Result<Vec<PlaybackSession>, StoreError> {
    let tokens = store.tokens_for_user(user_id).await?;
    let mut sessions = Vec::new();
    for token in tokens {
        if let Some(session) = store.get(&token).await? {
            if session.status == SessionStatus::Active && now < session.expires_at {
                sessions.push(session);
            }
        }
    }
    sessions.sort_by_key(|s| s.started_at);
    Ok(sessions)
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    evaluator: Arc<AccessEvaluator>,
    audit: Arc<AuditSink>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        evaluator: Arc<AccessEvaluator>,
        audit: Arc<AuditSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a playback session.
    ///
    /// Re-runs the full access evaluation (a stale pre-flight result is never
    /// trusted) and counts active sessions from an authoritative row scan.
    /// A blocked start lists the conflicting sessions and never terminates
    /// another session as a side effect.
    pub async fn start(
        &self,
        principal: &Principal,
        lesson_id: &str,
        ctx: &RequestContext,
        resume_from: Option<f64>,
    ) -> Result<StartOutcome, GateError> {
        let now = Utc::now().timestamp();

        let decision = self.evaluator.check_access(principal, lesson_id, ctx).await?;
        if !decision.allowed {
            let code = decision.denial_code.unwrap_or(DenialCode::EntitlementDenied);
            self.audit
                .publish(GateEvent::PolicyDenial {
                    user_id: principal.id().to_string(),
                    lesson_id: lesson_id.to_string(),
                    denial_code: code.as_str().to_string(),
                    denial_reason: decision
                        .denial_reason
                        .clone()
                        .unwrap_or_else(|| code.as_str().to_string()),
                    timestamp: now,
                })
                .await;
            return Ok(StartOutcome {
                is_allowed: false,
                session_token: None,
                session_expires_at: None,
                heartbeat_interval_seconds: self.config.heartbeat_interval_secs,
                active_sessions: decision.active_session_count,
                max_allowed_sessions: self.config.max_concurrent_sessions,
                block_reason: decision.denial_reason,
                block_code: Some(code),
                conflicting_sessions: Vec::new(),
            });
        }

        let active = scan_active(&self.store, principal.id(), now).await?;
        if active.len() as u32 >= self.config.max_concurrent_sessions {
            self.audit
                .publish(GateEvent::ConcurrencyLimit {
                    user_id: principal.id().to_string(),
                    current_sessions: active.len() as u32,
                    max_sessions: self.config.max_concurrent_sessions,
                    timestamp: now,
                })
                .await;
            return Ok(StartOutcome {
                is_allowed: false,
                session_token: None,
                session_expires_at: None,
                heartbeat_interval_seconds: self.config.heartbeat_interval_secs,
                active_sessions: active.len() as u32,
                max_allowed_sessions: self.config.max_concurrent_sessions,
                block_reason: Some(format!(
                    "maximum concurrent sessions ({}) reached",
                    self.config.max_concurrent_sessions
                )),
                block_code: Some(DenialCode::ConcurrentSessionConflict),
                conflicting_sessions: active.iter().map(ConflictingSession::from).collect(),
            });
        }

        let token = mint_session_token();
        let session = PlaybackSession {
            token: token.clone(),
            user_id: principal.id().to_string(),
            lesson_id: lesson_id.to_string(),
            device_fingerprint: ctx.device_fingerprint.clone(),
            ip_address: ctx.ip.clone(),
            status: SessionStatus::Active,
            started_at: now,
            last_heartbeat_at: now,
            expires_at: now + self.config.max_session_duration_secs,
            last_position: resume_from.unwrap_or(0.0),
            termination_reason: None,
        };
        self.store.insert(&session).await?;

        self.audit
            .publish(GateEvent::SessionStart {
                session_token: token.clone(),
                user_id: session.user_id.clone(),
                lesson_id: session.lesson_id.clone(),
                client_ip: session.ip_address.clone(),
                device_fingerprint: session.device_fingerprint.clone(),
                timestamp: now,
            })
            .await;

        Ok(StartOutcome {
            is_allowed: true,
            session_token: Some(token),
            session_expires_at: Some(session.expires_at),
            heartbeat_interval_seconds: self.config.heartbeat_interval_secs,
            active_sessions: active.len() as u32 + 1,
            max_allowed_sessions: self.config.max_concurrent_sessions,
            block_reason: None,
            block_code: None,
            conflicting_sessions: Vec::new(),
        })
    }

    /// Process a liveness heartbeat.
    ///
    /// Re-validates policy through the evaluator's cached path so a
    /// mid-session revocation ends the session within one heartbeat interval.
    /// The expiry extension is clamped to the total-lifetime cap.
    pub async fn heartbeat(
        &self,
        token: &str,
        position: Option<f64>,
        ctx: &RequestContext,
    ) -> Result<HeartbeatOutcome, GateError> {
        let now = Utc::now().timestamp();

        let session = match self.store.get(token).await? {
            Some(s) => s,
            None => return Ok(self.invalid_heartbeat(None)),
        };

        if session.status.is_terminal() {
            return Ok(self.invalid_heartbeat(session.termination_reason));
        }

        if now >= session.expires_at {
            self.terminate(&session, TerminationReason::SessionExpired, now)
                .await?;
            return Ok(self.invalid_heartbeat(Some(TerminationReason::SessionExpired)));
        }

        // Policy re-validation on the cached path. Revocation must win even
        // against a live, well-behaved client.
        let verdict = self
            .evaluator
            .revalidate(&session.user_id, &session.lesson_id, ctx)
            .await?;
        if let Some(code) = verdict.denial_code {
            let reason = match code {
                DenialCode::GeoBlocked => TerminationReason::GeoBlocked,
                _ => TerminationReason::EntitlementRevoked,
            };
            self.terminate(&session, reason, now).await?;
            return Ok(HeartbeatOutcome {
                is_valid: true,
                should_continue: false,
                termination_reason: Some(reason),
                next_heartbeat_seconds: self.config.heartbeat_interval_secs,
                force_refresh_token: false,
                warnings: verdict.warnings,
            });
        }

        let lifetime_cap = session.started_at + self.config.max_total_lifetime_secs;
        let extended = (now + self.config.max_session_duration_secs).min(lifetime_cap);

        let mut updated = session.clone();
        updated.last_heartbeat_at = now;
        updated.expires_at = extended;
        if let Some(p) = position {
            updated.last_position = p;
        }

        let swapped = self
            .store
            .compare_and_swap(token, SessionStatus::Active, &updated)
            .await?;
        if !swapped {
            // The reaper (or a concurrent end) won the race; report the
            // terminal state rather than resurrecting the session.
            let reason = self
                .store
                .get(token)
                .await?
                .and_then(|s| s.termination_reason);
            debug!("Heartbeat lost transition race for session {}", token);
            return Ok(self.invalid_heartbeat(reason));
        }

        Ok(HeartbeatOutcome {
            is_valid: true,
            should_continue: true,
            termination_reason: None,
            next_heartbeat_seconds: self.config.heartbeat_interval_secs,
            force_refresh_token: extended >= lifetime_cap,
            warnings: verdict.warnings,
        })
    }

    fn invalid_heartbeat(&self, reason: Option<TerminationReason>) -> HeartbeatOutcome {
        HeartbeatOutcome {
            is_valid: false,
            should_continue: false,
            termination_reason: reason,
            next_heartbeat_seconds: self.config.heartbeat_interval_secs,
            force_refresh_token: false,
            warnings: Vec::new(),
        }
    }

    /// End a session. Idempotent: unknown tokens and already-terminal
    /// sessions report success so client retries never error destructively.
    pub async fn end(&self, token: &str, reason: TerminationReason) -> Result<bool, GateError> {
        let session = match self.store.get(token).await? {
            Some(s) => s,
            None => return Ok(true),
        };
        if session.status.is_terminal() {
            return Ok(true);
        }

        let now = Utc::now().timestamp();
        let mut updated = session.clone();
        updated.status = SessionStatus::Ended;
        updated.termination_reason = Some(reason);
        let swapped = self
            .store
            .compare_and_swap(token, session.status, &updated)
            .await?;
        if swapped {
            self.store.deindex(&session.user_id, token).await?;
            self.audit
                .publish(GateEvent::SessionEnd {
                    session_token: token.to_string(),
                    user_id: session.user_id.clone(),
                    lesson_id: session.lesson_id.clone(),
                    duration_seconds: now - session.started_at,
                    reason: reason.as_str().to_string(),
                    timestamp: now,
                })
                .await;
        }
        Ok(true)
    }

    /// Bulk-end every active session for a user ("sign out everywhere" or
    /// forced security revocation). Returns the number of sessions ended.
    pub async fn end_all(
        &self,
        user_id: &str,
        reason: TerminationReason,
    ) -> Result<u32, GateError> {
        let now = Utc::now().timestamp();
        let active = scan_active(&self.store, user_id, now).await?;
        let mut ended = 0;
        for session in &active {
            if self.end(&session.token, reason).await? {
                ended += 1;
            }
        }
        info!("Ended {} sessions for user {} ({})", ended, user_id, reason.as_str());
        Ok(ended)
    }

    pub async fn get(&self, token: &str) -> Result<Option<PlaybackSession>, GateError> {
        Ok(self.store.get(token).await?)
    }

    /// Active sessions for a user.
    pub async fn active_sessions(&self, user_id: &str) -> Result<Vec<PlaybackSession>, GateError> {
        let now = Utc::now().timestamp();
        Ok(scan_active(&self.store, user_id, now).await?)
    }

    /// One reaper pass: terminate active sessions whose liveness lapsed
    /// (no heartbeat for twice the interval) or whose expiry passed. The
    /// compare-and-swap makes a concurrent pass on another instance a no-op.
    pub async fn reap_stale(&self) -> Result<u32, GateError> {
        let now = Utc::now().timestamp();
        let mut reaped = 0;

        for token in self.store.active_tokens().await? {
            let session = match self.store.get(&token).await? {
                Some(s) => s,
                None => {
                    // Row aged out of retention while still indexed.
                    self.store.prune_active(&token).await?;
                    continue;
                }
            };
            if session.status != SessionStatus::Active {
                // Terminal row still indexed (crash between swap and
                // deindex); finish the cleanup.
                self.store.deindex(&session.user_id, &token).await?;
                continue;
            }

            let reason = if now >= session.expires_at {
                Some(TerminationReason::SessionExpired)
            } else if session.is_stale(now, self.config.heartbeat_interval_secs) {
                Some(TerminationReason::HeartbeatTimeout)
            } else {
                None
            };

            if let Some(reason) = reason {
                if self.terminate(&session, reason, now).await? {
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            info!("Reaper terminated {} stale sessions", reaped);
        }
        Ok(reaped)
    }

    async fn terminate(
        &self,
        session: &PlaybackSession,
        reason: TerminationReason,
        now: i64,
    ) -> Result<bool, GateError> {
        let mut updated = session.clone();
        updated.status = SessionStatus::Terminated;
        updated.termination_reason = Some(reason);
        let swapped = self
            .store
            .compare_and_swap(&session.token, SessionStatus::Active, &updated)
            .await?;
        if swapped {
            self.store.deindex(&session.user_id, &session.token).await?;
            self.audit
                .publish(GateEvent::SessionEnd {
                    session_token: session.token.clone(),
                    user_id: session.user_id.clone(),
                    lesson_id: session.lesson_id.clone(),
                    duration_seconds: now - session.started_at,
                    reason: reason.as_str().to_string(),
                    timestamp: now,
                })
                .await;
        }
        Ok(swapped)
    }
}

/// Mint an unguessable session token (256 bits from the OS RNG).
fn mint_session_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Background reaper loop. Runs until the shutdown channel flips; safe to run
/// on multiple instances concurrently because every stale transition is a
/// conditional update.
pub async fn run_reaper(
    manager: Arc<SessionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Session reaper running every {:?}", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = manager.reap_stale().await {
                    warn!("Reaper pass failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Session reaper shutting down");
                    break;
                }
            }
        }
    }
}

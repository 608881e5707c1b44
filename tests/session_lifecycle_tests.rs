//! Session lifecycle scenarios: concurrency ceilings, idempotent teardown,
//! lifetime caps, and the background reaper.

use chrono::Utc;
use std::sync::Arc;

use streamgate::access::{AccessConfig, AccessEvaluator};
use streamgate::audit::AuditSink;
use streamgate::content::{
    DrmPolicy, LessonContent, StaticCatalog, StaticEntitlements, StaticGeoResolver,
};
use streamgate::device::DeviceRegistry;
use streamgate::error::DenialCode;
use streamgate::session::{
    PlaybackSession, SessionConfig, SessionManager, SessionStatus, TerminationReason,
};
use streamgate::store::{MemoryDeviceStore, MemorySessionStore, SessionStore};
use streamgate::{Principal, RequestContext};

struct Gate {
    manager: Arc<SessionManager>,
    store: Arc<MemorySessionStore>,
    entitlements: Arc<StaticEntitlements>,
    catalog: Arc<StaticCatalog>,
}

fn build_gate(config: SessionConfig) -> Gate {
    let store = Arc::new(MemorySessionStore::new());
    let entitlements = Arc::new(StaticEntitlements::new());
    let catalog = Arc::new(StaticCatalog::new());
    let geo = Arc::new(StaticGeoResolver::new());
    let devices = Arc::new(DeviceRegistry::new(Arc::new(MemoryDeviceStore::new()), 3));
    let audit = Arc::new(AuditSink::new(None, "test.events".to_string()));
    let evaluator = Arc::new(AccessEvaluator::new(
        entitlements.clone(),
        catalog.clone(),
        geo,
        devices,
        store.clone(),
        AccessConfig {
            geo_enforcement: true,
            max_concurrent_sessions: config.max_concurrent_sessions,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
        },
    ));
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        evaluator,
        audit,
        config,
    ));
    Gate {
        manager,
        store,
        entitlements,
        catalog,
    }
}

fn lesson(id: &str) -> LessonContent {
    LessonContent {
        lesson_id: id.to_string(),
        previewable: false,
        allowed_countries: None,
        blocked_countries: Vec::new(),
        qualities: vec!["720p".to_string(), "1080p".to_string()],
        key_id: format!("key-{}", id),
        key_seed: format!("seed-{}", id),
        drm_policy: DrmPolicy::default(),
    }
}

fn seed_entitled(gate: &Gate, user: &str, lesson_id: &str) {
    gate.catalog.put(lesson(lesson_id));
    gate.entitlements.grant(user, lesson_id);
}

fn ctx(fp: &str) -> RequestContext {
    RequestContext::new("10.0.0.1", fp)
}

#[tokio::test]
async fn test_start_creates_active_session() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    assert!(outcome.is_allowed);
    assert_eq!(outcome.active_sessions, 1);

    let token = outcome.session_token.unwrap();
    let session = gate.manager.get(&token).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.lesson_id, "lesson-1");
    assert_eq!(session.device_fingerprint, "fp-1");
}

#[tokio::test]
async fn test_third_session_blocked_then_allowed_after_end() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    seed_entitled(&gate, "user-1", "lesson-2");
    let user = Principal::User("user-1".to_string());

    let first = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let second = gate
        .manager
        .start(&user, "lesson-2", &ctx("fp-2"), None)
        .await
        .unwrap();
    assert!(first.is_allowed && second.is_allowed);

    let third = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-3"), None)
        .await
        .unwrap();
    assert!(!third.is_allowed);
    assert_eq!(third.block_code, Some(DenialCode::ConcurrentSessionConflict));
    assert_eq!(third.conflicting_sessions.len(), 2);
    assert!(third.session_token.is_none());

    // Ending one of the conflicting sessions frees a slot.
    let ended = gate
        .manager
        .end(
            &first.session_token.unwrap(),
            TerminationReason::UserEnded,
        )
        .await
        .unwrap();
    assert!(ended);

    let retry = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-3"), None)
        .await
        .unwrap();
    assert!(retry.is_allowed);
}

#[tokio::test]
async fn test_blocked_start_never_ends_other_sessions() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let a = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let b = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-2"), None)
        .await
        .unwrap();

    let blocked = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-3"), None)
        .await
        .unwrap();
    assert!(!blocked.is_allowed);

    for token in [a.session_token.unwrap(), b.session_token.unwrap()] {
        let session = gate.manager.get(&token).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();

    assert!(gate
        .manager
        .end(&token, TerminationReason::UserEnded)
        .await
        .unwrap());
    assert!(gate
        .manager
        .end(&token, TerminationReason::UserEnded)
        .await
        .unwrap());
    // Unknown tokens also succeed; retries never error destructively.
    assert!(gate
        .manager
        .end("no-such-token", TerminationReason::UserEnded)
        .await
        .unwrap());

    let session = gate.manager.get(&token).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Ended);
    assert_eq!(
        session.termination_reason,
        Some(TerminationReason::UserEnded)
    );
}

#[tokio::test]
async fn test_heartbeat_after_end_reports_terminal_reason() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();
    gate.manager
        .end(&token, TerminationReason::UserEnded)
        .await
        .unwrap();

    let hb = gate
        .manager
        .heartbeat(&token, Some(33.0), &ctx("fp-1"))
        .await
        .unwrap();
    assert!(!hb.is_valid);
    assert!(!hb.should_continue);
    assert_eq!(hb.termination_reason, Some(TerminationReason::UserEnded));
}

#[tokio::test]
async fn test_heartbeat_updates_position_and_extends_expiry() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), Some(120.5))
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();

    let hb = gate
        .manager
        .heartbeat(&token, Some(150.0), &ctx("fp-1"))
        .await
        .unwrap();
    assert!(hb.is_valid && hb.should_continue);
    assert!(!hb.force_refresh_token);

    let session = gate.manager.get(&token).await.unwrap().unwrap();
    assert_eq!(session.last_position, 150.0);
    assert!(session.expires_at >= outcome.session_expires_at.unwrap());
}

#[tokio::test]
async fn test_lifetime_cap_forces_token_refresh() {
    let config = SessionConfig {
        max_session_duration_secs: 100,
        max_total_lifetime_secs: 100,
        ..SessionConfig::default()
    };
    let gate = build_gate(config);
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();

    // The extension (now + 100) reaches started_at + 100, so the heartbeat
    // clamps to the cap and flags the refresh.
    let hb = gate
        .manager
        .heartbeat(&token, None, &ctx("fp-1"))
        .await
        .unwrap();
    assert!(hb.is_valid);
    assert!(hb.force_refresh_token);

    let session = gate.manager.get(&token).await.unwrap().unwrap();
    assert_eq!(session.expires_at, session.started_at + 100);
}

fn expired_session(token: &str, user: &str, lesson: &str, now: i64) -> PlaybackSession {
    PlaybackSession {
        token: token.to_string(),
        user_id: user.to_string(),
        lesson_id: lesson.to_string(),
        device_fingerprint: "fp-1".to_string(),
        ip_address: "10.0.0.1".to_string(),
        status: SessionStatus::Active,
        started_at: now - 7200,
        last_heartbeat_at: now - 10,
        expires_at: now - 60,
        last_position: 0.0,
        termination_reason: None,
    }
}

#[tokio::test]
async fn test_heartbeat_on_expired_session_terminates_it() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let now = Utc::now().timestamp();
    gate.store
        .insert(&expired_session("tok-expired", "user-1", "lesson-1", now))
        .await
        .unwrap();

    let hb = gate
        .manager
        .heartbeat("tok-expired", None, &ctx("fp-1"))
        .await
        .unwrap();
    assert!(!hb.is_valid);
    assert_eq!(hb.termination_reason, Some(TerminationReason::SessionExpired));

    let session = gate.manager.get("tok-expired").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
}

#[tokio::test]
async fn test_reaper_terminates_stale_and_expired_sessions() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());
    let now = Utc::now().timestamp();

    // A healthy session started through the front door.
    let healthy = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let healthy_token = healthy.session_token.unwrap();

    // One session past expiry, one silent past the staleness window.
    gate.store
        .insert(&expired_session("tok-expired", "user-2", "lesson-1", now))
        .await
        .unwrap();
    let mut silent = expired_session("tok-silent", "user-3", "lesson-1", now);
    silent.expires_at = now + 3600;
    silent.last_heartbeat_at = now - 500;
    gate.store.insert(&silent).await.unwrap();

    let reaped = gate.manager.reap_stale().await.unwrap();
    assert_eq!(reaped, 2);

    let expired = gate.manager.get("tok-expired").await.unwrap().unwrap();
    assert_eq!(expired.status, SessionStatus::Terminated);
    assert_eq!(
        expired.termination_reason,
        Some(TerminationReason::SessionExpired)
    );

    let silent = gate.manager.get("tok-silent").await.unwrap().unwrap();
    assert_eq!(
        silent.termination_reason,
        Some(TerminationReason::HeartbeatTimeout)
    );

    let healthy = gate.manager.get(&healthy_token).await.unwrap().unwrap();
    assert_eq!(healthy.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_reaped_session_rejects_late_heartbeat() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let now = Utc::now().timestamp();

    let mut silent = expired_session("tok-silent", "user-1", "lesson-1", now);
    silent.expires_at = now + 3600;
    silent.last_heartbeat_at = now - 500;
    gate.store.insert(&silent).await.unwrap();

    assert_eq!(gate.manager.reap_stale().await.unwrap(), 1);

    // The client wakes up and retries; the terminal state holds.
    let hb = gate
        .manager
        .heartbeat("tok-silent", Some(10.0), &ctx("fp-1"))
        .await
        .unwrap();
    assert!(!hb.is_valid);
    assert_eq!(
        hb.termination_reason,
        Some(TerminationReason::HeartbeatTimeout)
    );
}

#[tokio::test]
async fn test_concurrent_heartbeat_and_reaper_agree_on_one_outcome() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");

    for i in 0..32 {
        let now = Utc::now().timestamp();
        let token = format!("tok-race-{}", i);
        let mut silent = expired_session(&token, "user-1", "lesson-1", now);
        silent.expires_at = now + 3600;
        silent.last_heartbeat_at = now - 500;
        gate.store.insert(&silent).await.unwrap();

        let beat = {
            let manager = gate.manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.heartbeat(&token, Some(42.0), &ctx("fp-1")).await })
        };
        let reap = {
            let manager = gate.manager.clone();
            tokio::spawn(async move { manager.reap_stale().await })
        };
        let hb = beat.await.unwrap().unwrap();
        reap.await.unwrap().unwrap();

        // Exactly one transition wins the compare-and-swap; the row is
        // either a refreshed live session or cleanly timed out, never torn.
        let row = gate.manager.get(&token).await.unwrap().unwrap();
        match row.status {
            SessionStatus::Active => {
                assert!(hb.is_valid);
                assert!(row.last_heartbeat_at >= now);
                assert_eq!(row.termination_reason, None);
                gate.manager
                    .end(&token, TerminationReason::UserEnded)
                    .await
                    .unwrap();
            }
            SessionStatus::Terminated => {
                assert_eq!(
                    row.termination_reason,
                    Some(TerminationReason::HeartbeatTimeout)
                );
                assert!(!gate.store.active_tokens().await.unwrap().contains(&token));
            }
            other => panic!("inconsistent post-race status: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_reaper_prunes_tokens_whose_rows_aged_out() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();

    // Retention dropped the row during a long outage; the index survived.
    gate.store.drop_row(&token);

    assert_eq!(gate.manager.reap_stale().await.unwrap(), 0);
    assert!(gate.store.active_tokens().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_end_all_terminates_every_active_session() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    seed_entitled(&gate, "user-1", "lesson-2");
    let user = Principal::User("user-1".to_string());

    gate.manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    gate.manager
        .start(&user, "lesson-2", &ctx("fp-2"), None)
        .await
        .unwrap();

    let ended = gate
        .manager
        .end_all("user-1", TerminationReason::SignedOutAllDevices)
        .await
        .unwrap();
    assert_eq!(ended, 2);
    assert!(gate
        .manager
        .active_sessions("user-1")
        .await
        .unwrap()
        .is_empty());

    // A fresh start works immediately afterwards.
    let retry = gate
        .manager
        .start(&user, "lesson-1", &ctx("fp-1"), None)
        .await
        .unwrap();
    assert!(retry.is_allowed);
}

#[tokio::test]
async fn test_quotas_are_per_user() {
    let gate = build_gate(SessionConfig::default());
    seed_entitled(&gate, "user-1", "lesson-1");
    seed_entitled(&gate, "user-2", "lesson-1");
    let alice = Principal::User("user-1".to_string());
    let bob = Principal::User("user-2".to_string());

    for fp in ["fp-1", "fp-2"] {
        let outcome = gate
            .manager
            .start(&alice, "lesson-1", &ctx(fp), None)
            .await
            .unwrap();
        assert!(outcome.is_allowed);
    }

    // Alice being at her limit does not affect Bob.
    let outcome = gate
        .manager
        .start(&bob, "lesson-1", &ctx("fp-9"), None)
        .await
        .unwrap();
    assert!(outcome.is_allowed);
}

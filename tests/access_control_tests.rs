//! Access evaluation scenarios: entitlement, geo (enforced, disabled, and
//! fail-open), anonymous preview, device advisories, and mid-session
//! revocation observed at heartbeat time.

use std::sync::Arc;

use streamgate::access::{AccessConfig, AccessEvaluator};
use streamgate::audit::AuditSink;
use streamgate::content::{
    DrmPolicy, LessonContent, StaticCatalog, StaticEntitlements, StaticGeoResolver,
};
use streamgate::device::{DeviceMetadata, DeviceRegistry};
use streamgate::error::DenialCode;
use streamgate::session::{SessionConfig, SessionManager, SessionStatus, TerminationReason};
use streamgate::store::{MemoryDeviceStore, MemorySessionStore};
use streamgate::{Principal, RequestContext};

struct Gate {
    manager: Arc<SessionManager>,
    evaluator: Arc<AccessEvaluator>,
    store: Arc<MemorySessionStore>,
    entitlements: Arc<StaticEntitlements>,
    catalog: Arc<StaticCatalog>,
    geo: Arc<StaticGeoResolver>,
    devices: Arc<DeviceRegistry>,
}

fn build_gate(geo_enforcement: bool) -> Gate {
    let store = Arc::new(MemorySessionStore::new());
    let entitlements = Arc::new(StaticEntitlements::new());
    let catalog = Arc::new(StaticCatalog::new());
    let geo = Arc::new(StaticGeoResolver::new());
    let devices = Arc::new(DeviceRegistry::new(Arc::new(MemoryDeviceStore::new()), 3));
    let audit = Arc::new(AuditSink::new(None, "test.events".to_string()));
    let evaluator = Arc::new(AccessEvaluator::new(
        entitlements.clone(),
        catalog.clone(),
        geo.clone(),
        devices.clone(),
        store.clone(),
        AccessConfig {
            geo_enforcement,
            max_concurrent_sessions: 2,
            heartbeat_interval_secs: 30,
        },
    ));
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        evaluator.clone(),
        audit,
        SessionConfig::default(),
    ));
    Gate {
        manager,
        evaluator,
        store,
        entitlements,
        catalog,
        geo,
        devices,
    }
}

/// A second service instance sharing the same stores but with cold caches,
/// the way a load-balanced heartbeat would land elsewhere.
fn sibling_instance(gate: &Gate) -> Arc<SessionManager> {
    let audit = Arc::new(AuditSink::new(None, "test.events".to_string()));
    let evaluator = Arc::new(AccessEvaluator::new(
        gate.entitlements.clone(),
        gate.catalog.clone(),
        gate.geo.clone(),
        gate.devices.clone(),
        gate.store.clone(),
        AccessConfig {
            geo_enforcement: true,
            max_concurrent_sessions: 2,
            heartbeat_interval_secs: 30,
        },
    ));
    Arc::new(SessionManager::new(
        gate.store.clone(),
        evaluator,
        audit,
        SessionConfig::default(),
    ))
}

fn lesson(id: &str, previewable: bool, blocked: Vec<&str>) -> LessonContent {
    LessonContent {
        lesson_id: id.to_string(),
        previewable,
        allowed_countries: None,
        blocked_countries: blocked.iter().map(|s| s.to_string()).collect(),
        qualities: vec!["720p".to_string()],
        key_id: format!("key-{}", id),
        key_seed: format!("seed-{}", id),
        drm_policy: DrmPolicy::default(),
    }
}

fn ctx(ip: &str, fp: &str) -> RequestContext {
    RequestContext::new(ip, fp)
}

#[tokio::test]
async fn test_unknown_lesson_denied() {
    let gate = build_gate(true);
    let user = Principal::User("user-1".to_string());
    let decision = gate
        .evaluator
        .check_access(&user, "no-such-lesson", &ctx("10.0.0.1", "fp-1"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.denial_code, Some(DenialCode::EntitlementDenied));
}

#[tokio::test]
async fn test_unentitled_user_denied() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec![]));
    gate.entitlements.grant("someone-else", "lesson-1");

    let user = Principal::User("user-1".to_string());
    let decision = gate
        .evaluator
        .check_access(&user, "lesson-1", &ctx("10.0.0.1", "fp-1"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert!(!decision.is_enrolled);
    assert_eq!(decision.denial_code, Some(DenialCode::EntitlementDenied));
}

#[tokio::test]
async fn test_geo_blocked_when_enforced() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec!["DE"]));
    gate.entitlements.grant("user-1", "lesson-1");
    gate.geo.map("203.0.113.7", "DE");

    let user = Principal::User("user-1".to_string());
    let decision = gate
        .evaluator
        .check_access(&user, "lesson-1", &ctx("203.0.113.7", "fp-1"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert!(!decision.is_geo_allowed);
    assert_eq!(decision.denial_code, Some(DenialCode::GeoBlocked));
}

#[tokio::test]
async fn test_geo_match_only_warns_when_enforcement_disabled() {
    let gate = build_gate(false);
    gate.catalog.put(lesson("lesson-1", false, vec!["DE"]));
    gate.entitlements.grant("user-1", "lesson-1");
    gate.geo.map("203.0.113.7", "DE");

    let user = Principal::User("user-1".to_string());
    let decision = gate
        .evaluator
        .check_access(&user, "lesson-1", &ctx("203.0.113.7", "fp-1"))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(decision.warnings.iter().any(|w| w.contains("enforcement")));
}

#[tokio::test]
async fn test_geo_lookup_failure_fails_open() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec!["DE"]));
    gate.entitlements.grant("user-1", "lesson-1");
    gate.geo.set_available(false);

    let user = Principal::User("user-1".to_string());
    let decision = gate
        .evaluator
        .check_access(&user, "lesson-1", &ctx("203.0.113.7", "fp-1"))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(decision.is_geo_allowed);
    assert!(decision
        .warnings
        .iter()
        .any(|w| w == "upstream_geo_lookup_unavailable"));
}

#[tokio::test]
async fn test_anonymous_preview_allowed() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-free", true, vec![]));

    let anon = Principal::ephemeral();
    let decision = gate
        .evaluator
        .check_access(&anon, "lesson-free", &ctx("10.0.0.1", "fp-1"))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(!decision.is_enrolled);
}

#[tokio::test]
async fn test_anonymous_blocked_from_protected_lesson() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec![]));

    let anon = Principal::ephemeral();
    let decision = gate
        .evaluator
        .check_access(&anon, "lesson-1", &ctx("10.0.0.1", "fp-1"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(
        decision.denial_code,
        Some(DenialCode::AuthenticationRequired)
    );
}

#[tokio::test]
async fn test_device_ceiling_is_advisory_at_access_check() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec![]));
    gate.entitlements.grant("user-1", "lesson-1");

    for fp in ["fp-1", "fp-2", "fp-3"] {
        let outcome = gate
            .devices
            .register("user-1", fp, DeviceMetadata::default())
            .await
            .unwrap();
        assert!(outcome.allowed);
    }

    // Checking from a fourth, unregistered device: the decision stays
    // allowed, with the device dimension flagged.
    let user = Principal::User("user-1".to_string());
    let decision = gate
        .evaluator
        .check_access(&user, "lesson-1", &ctx("10.0.0.1", "fp-4"))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!(!decision.is_device_allowed);
    assert!(decision
        .warnings
        .iter()
        .any(|w| w == "device_limit_exceeded"));

    // Registration itself is the hard gate.
    let blocked = gate
        .devices
        .register("user-1", "fp-4", DeviceMetadata::default())
        .await
        .unwrap();
    assert!(!blocked.allowed);
    assert_eq!(blocked.block_reason, Some(DenialCode::DeviceLimitExceeded));
}

#[tokio::test]
async fn test_revocation_terminates_session_on_next_heartbeat() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec![]));
    gate.entitlements.grant("user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("10.0.0.1", "fp-1"), None)
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();

    gate.entitlements.revoke("user-1", "lesson-1");

    // The next heartbeat lands on a sibling instance whose entitlement cache
    // is cold, so the revocation is observed immediately.
    let sibling = sibling_instance(&gate);
    let hb = sibling
        .heartbeat(&token, None, &ctx("10.0.0.1", "fp-1"))
        .await
        .unwrap();
    assert!(hb.is_valid);
    assert!(!hb.should_continue);
    assert_eq!(
        hb.termination_reason,
        Some(TerminationReason::EntitlementRevoked)
    );

    let session = gate.manager.get(&token).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
}

#[tokio::test]
async fn test_network_move_into_blocked_region_terminates_session() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec!["DE"]));
    gate.entitlements.grant("user-1", "lesson-1");
    gate.geo.map("10.0.0.1", "US");
    gate.geo.map("203.0.113.7", "DE");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("10.0.0.1", "fp-1"), None)
        .await
        .unwrap();
    assert!(outcome.is_allowed);
    let token = outcome.session_token.unwrap();

    // The client resumes from a blocked network.
    let hb = gate
        .manager
        .heartbeat(&token, None, &ctx("203.0.113.7", "fp-1"))
        .await
        .unwrap();
    assert!(!hb.should_continue);
    assert_eq!(hb.termination_reason, Some(TerminationReason::GeoBlocked));

    let session = gate.manager.get(&token).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Terminated);
    assert_eq!(
        session.termination_reason,
        Some(TerminationReason::GeoBlocked)
    );
}

#[tokio::test]
async fn test_entitlement_outage_does_not_kill_live_session() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec![]));
    gate.entitlements.grant("user-1", "lesson-1");
    let user = Principal::User("user-1".to_string());

    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("10.0.0.1", "fp-1"), None)
        .await
        .unwrap();
    let token = outcome.session_token.unwrap();

    gate.entitlements.set_available(false);

    // A cold-cache instance cannot reach the entitlement service; the
    // heartbeat degrades to a warning instead of terminating playback.
    let sibling = sibling_instance(&gate);
    let hb = sibling
        .heartbeat(&token, None, &ctx("10.0.0.1", "fp-1"))
        .await
        .unwrap();
    assert!(hb.is_valid);
    assert!(hb.should_continue);
    assert!(hb
        .warnings
        .iter()
        .any(|w| w.contains("entitlement check unavailable")));
}

#[tokio::test]
async fn test_denied_start_records_no_session() {
    let gate = build_gate(true);
    gate.catalog.put(lesson("lesson-1", false, vec![]));

    let user = Principal::User("user-1".to_string());
    let outcome = gate
        .manager
        .start(&user, "lesson-1", &ctx("10.0.0.1", "fp-1"), None)
        .await
        .unwrap();
    assert!(!outcome.is_allowed);
    assert_eq!(outcome.block_code, Some(DenialCode::EntitlementDenied));
    assert!(gate
        .manager
        .active_sessions("user-1")
        .await
        .unwrap()
        .is_empty());
}

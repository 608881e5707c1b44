use log::{error, info, warn};
use redis::Client as RedisClient;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use streamgate::access::AccessEvaluator;
use streamgate::api::{router, AppState};
use streamgate::audit::AuditSink;
use streamgate::config::load_config;
use streamgate::content::{
    LessonContent, StaticCatalog, StaticEntitlements, StaticGeoResolver,
};
use streamgate::device::DeviceRegistry;
use streamgate::license::LicenseIssuer;
use streamgate::session::{run_reaper, SessionManager};
use streamgate::store::{
    RedisDeviceStore, RedisSessionStore, RedisSignedUrlStore,
};
use streamgate::token::UrlSigner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = load_config()?;
    info!("Starting streamgate on port {}", settings.port);

    // Backing stores
    let redis_client = Arc::new(RedisClient::open(settings.redis_url.clone())?);
    let session_store = Arc::new(RedisSessionStore::new(redis_client.clone()));
    let device_store = Arc::new(RedisDeviceStore::new(redis_client.clone()));
    let url_store = Arc::new(RedisSignedUrlStore::new(redis_client));

    // Event sink; the service runs log-only when NATS is unreachable.
    let nats_client = match async_nats::connect(&settings.nats_url).await {
        Ok(client) => {
            info!("Connected to NATS at {}", settings.nats_url);
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("NATS unavailable ({}); continuing log-only", e);
            None
        }
    };
    let audit = Arc::new(AuditSink::new(nats_client, settings.nats_subject.clone()));

    // Upstream collaborators, seeded from local JSON files until the real
    // course-management and geo services are wired in.
    let catalog = Arc::new(load_catalog()?);
    let entitlements = Arc::new(load_entitlements()?);
    let geo = Arc::new(load_geo_map()?);

    let devices = Arc::new(DeviceRegistry::new(device_store, settings.max_devices));
    let evaluator = Arc::new(AccessEvaluator::new(
        entitlements,
        catalog.clone(),
        geo,
        devices.clone(),
        session_store.clone(),
        settings.access_config(),
    ));
    let sessions = Arc::new(SessionManager::new(
        session_store.clone(),
        evaluator.clone(),
        audit.clone(),
        settings.session_config(),
    ));
    let licenses = Arc::new(LicenseIssuer::new(
        session_store,
        catalog,
        audit.clone(),
        settings.license_master_secret,
    ));
    let signer = Arc::new(UrlSigner::new(
        url_store,
        settings.signing_secret,
        settings.signed_url_ttl_secs,
        settings.content_base_url.clone(),
    ));

    let state = Arc::new(AppState {
        evaluator,
        sessions: sessions.clone(),
        devices,
        licenses,
        signer,
        audit,
        jwt_secret: settings.jwt_secret.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(run_reaper(
        sessions,
        Duration::from_secs(settings.reaper_interval_secs),
        shutdown_rx.clone(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    let app = router(state);
    let mut serve_shutdown = shutdown_rx;
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;
    let _ = reaper.await;
    info!("Shut down cleanly");
    Ok(())
}

/// Lesson descriptors from `CATALOG_PATH` (JSON array of lessons). An empty
/// catalog denies everything, so a missing file is worth a loud warning.
fn load_catalog() -> Result<StaticCatalog, Box<dyn std::error::Error>> {
    let catalog = StaticCatalog::new();
    let path = env::var("CATALOG_PATH").unwrap_or_else(|_| "catalog.json".to_string());
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let lessons: Vec<LessonContent> = serde_json::from_str(&raw)?;
            info!("Loaded {} lessons from {}", lessons.len(), path);
            for lesson in lessons {
                catalog.put(lesson);
            }
        }
        Err(e) => warn!("No catalog at {} ({}); all lookups will miss", path, e),
    }
    Ok(catalog)
}

/// Grants from `ENTITLEMENTS_PATH` (JSON object of user id to lesson ids).
fn load_entitlements() -> Result<StaticEntitlements, Box<dyn std::error::Error>> {
    let entitlements = StaticEntitlements::new();
    let path = env::var("ENTITLEMENTS_PATH").unwrap_or_else(|_| "entitlements.json".to_string());
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let grants: HashMap<String, Vec<String>> = serde_json::from_str(&raw)?;
            let mut count = 0;
            for (user_id, lessons) in &grants {
                for lesson_id in lessons {
                    entitlements.grant(user_id, lesson_id);
                    count += 1;
                }
            }
            info!("Loaded {} entitlement grants from {}", count, path);
        }
        Err(e) => warn!("No entitlements at {} ({})", path, e),
    }
    Ok(entitlements)
}

/// IP-to-country overrides from `GEO_MAP_PATH` (JSON object). Unmapped IPs
/// resolve to `ZZ`, which geo policies treat as unrestricted.
fn load_geo_map() -> Result<StaticGeoResolver, Box<dyn std::error::Error>> {
    let geo = StaticGeoResolver::new();
    let path = env::var("GEO_MAP_PATH").unwrap_or_else(|_| "geo_map.json".to_string());
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let map: HashMap<String, String> = serde_json::from_str(&raw)?;
            info!("Loaded {} geo mappings from {}", map.len(), path);
            for (ip, country) in &map {
                geo.map(ip, country);
            }
        }
        Err(e) => warn!("No geo map at {} ({}); lookups resolve to ZZ", path, e),
    }
    Ok(geo)
}

//! Device registry: fingerprints per user, device-count ceilings, risk levels.
//!
//! Hitting the ceiling never evicts another device. The caller must remove one
//! explicitly and retry registration.

use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{DenialCode, GateError};
use crate::store::DeviceStore;

/// Window in which rapid device turnover elevates risk.
const TURNOVER_WINDOW_SECS: i64 = 24 * 3600;
/// New devices first seen inside the window, beyond which risk is elevated.
const TURNOVER_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Normal,
    Elevated,
}

/// Descriptive metadata normalized at the API boundary. Loosely-typed client
/// payloads never travel deeper than this struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub device_type: Option<String>,
    pub os: Option<String>,
    pub browser: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub fingerprint: String,
    pub user_id: String,
    pub metadata: DeviceMetadata,
    pub risk_level: RiskLevel,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    /// Soft-removal marker; removed devices stay on record but stop counting
    /// toward the ceiling.
    pub removed_at: Option<i64>,
}

impl Device {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub is_new_device: bool,
    pub allowed: bool,
    pub block_reason: Option<DenialCode>,
    pub total_devices: u32,
    pub max_devices: u32,
    pub risk_level: RiskLevel,
}

pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    max_devices: u32,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>, max_devices: u32) -> Self {
        Self { store, max_devices }
    }

    /// Register a sighting of `fingerprint` for `user_id`.
    ///
    /// Known devices are touched and always allowed. New devices are admitted
    /// only under the ceiling; at the ceiling the outcome is a
    /// `device_limit_exceeded` block with no eviction side effect.
    pub async fn register(
        &self,
        user_id: &str,
        fingerprint: &str,
        metadata: DeviceMetadata,
    ) -> Result<RegistrationOutcome, GateError> {
        let now = Utc::now().timestamp();
        let active: Vec<Device> = self
            .store
            .devices_for_user(user_id)
            .await?
            .into_iter()
            .filter(|d| !d.is_removed())
            .collect();

        if let Some(existing) = self.store.get(user_id, fingerprint).await? {
            if !existing.is_removed() {
                let mut device = existing;
                device.last_seen_at = now;
                device.metadata = metadata;
                self.store.upsert(&device).await?;
                return Ok(RegistrationOutcome {
                    is_new_device: false,
                    allowed: true,
                    block_reason: None,
                    total_devices: active.len() as u32,
                    max_devices: self.max_devices,
                    risk_level: device.risk_level,
                });
            }
            // A previously removed fingerprint re-registers as new below.
        }

        if active.len() as u32 >= self.max_devices {
            info!(
                "Device registration blocked for user {}: {}/{} devices",
                user_id,
                active.len(),
                self.max_devices
            );
            return Ok(RegistrationOutcome {
                is_new_device: true,
                allowed: false,
                block_reason: Some(DenialCode::DeviceLimitExceeded),
                total_devices: active.len() as u32,
                max_devices: self.max_devices,
                risk_level: RiskLevel::Normal,
            });
        }

        let risk_level = Self::assess_risk(&active, now);
        let device = Device {
            fingerprint: fingerprint.to_string(),
            user_id: user_id.to_string(),
            metadata,
            risk_level,
            first_seen_at: now,
            last_seen_at: now,
            removed_at: None,
        };
        self.store.upsert(&device).await?;

        info!(
            "Registered device {} for user {} ({}/{}, risk {:?})",
            fingerprint,
            user_id,
            active.len() + 1,
            self.max_devices,
            risk_level
        );

        Ok(RegistrationOutcome {
            is_new_device: true,
            allowed: true,
            block_reason: None,
            total_devices: active.len() as u32 + 1,
            max_devices: self.max_devices,
            risk_level,
        })
    }

    /// Idempotent soft-removal; removing an unknown fingerprint succeeds.
    pub async fn remove(&self, user_id: &str, fingerprint: &str) -> Result<(), GateError> {
        if let Some(mut device) = self.store.get(user_id, fingerprint).await? {
            if !device.is_removed() {
                device.removed_at = Some(Utc::now().timestamp());
                self.store.upsert(&device).await?;
                info!("Removed device {} for user {}", fingerprint, user_id);
            }
        }
        Ok(())
    }

    /// Active (non-removed) devices for a user.
    pub async fn list(&self, user_id: &str) -> Result<Vec<Device>, GateError> {
        Ok(self
            .store
            .devices_for_user(user_id)
            .await?
            .into_iter()
            .filter(|d| !d.is_removed())
            .collect())
    }

    pub async fn active_count(&self, user_id: &str) -> Result<u32, GateError> {
        Ok(self.list(user_id).await?.len() as u32)
    }

    pub fn max_devices(&self) -> u32 {
        self.max_devices
    }

    /// Known-and-active check used by the access evaluator.
    pub async fn is_known(&self, user_id: &str, fingerprint: &str) -> Result<bool, GateError> {
        Ok(self
            .store
            .get(user_id, fingerprint)
            .await?
            .map(|d| !d.is_removed())
            .unwrap_or(false))
    }

    /// Escalate a device after a high-risk violation report.
    pub async fn elevate_risk(&self, user_id: &str, fingerprint: &str) -> Result<(), GateError> {
        if let Some(mut device) = self.store.get(user_id, fingerprint).await? {
            if device.risk_level != RiskLevel::Elevated {
                device.risk_level = RiskLevel::Elevated;
                self.store.upsert(&device).await?;
                info!(
                    "Elevated risk for device {} of user {}",
                    fingerprint, user_id
                );
            }
        }
        Ok(())
    }

    /// Coarse heuristic: rapid device turnover (several new devices inside
    /// the window) marks the next new device as elevated. Consumed by the
    /// access evaluator as a step-up hook, not a block.
    fn assess_risk(active: &[Device], now: i64) -> RiskLevel {
        let recent = active
            .iter()
            .filter(|d| now - d.first_seen_at < TURNOVER_WINDOW_SECS)
            .count();
        if recent >= TURNOVER_THRESHOLD {
            RiskLevel::Elevated
        } else {
            RiskLevel::Normal
        }
    }
}

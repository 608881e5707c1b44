//! Streamgate: playback-session and content-access-control core.
//!
//! Decides whether and how a client may obtain a protected lesson stream and
//! for how long a granted stream stays valid. The building blocks, leaves
//! first: device registry, access evaluator, session manager (with reaper),
//! DRM license issuer, and signed-URL validator, with an audit sink for
//! everything downstream.

pub mod access;
pub mod api;
pub mod audit;
pub mod config;
pub mod content;
pub mod device;
pub mod error;
pub mod license;
pub mod session;
pub mod store;
pub mod token;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated or ephemeral identity behind a request.
///
/// Anonymous principals exist only for previewable lessons and are scoped to
/// a single request chain; their ids are never persisted as users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(String),
    Anonymous(String),
}

impl Principal {
    pub fn ephemeral() -> Self {
        Self::Anonymous(format!("anon:{}", Uuid::new_v4()))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Anonymous(id) => id,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }
}

/// Client context attached to every gated operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub ip: String,
    pub device_fingerprint: String,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(ip: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            device_fingerprint: fingerprint.into(),
            user_agent: None,
        }
    }
}

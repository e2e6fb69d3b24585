use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Registry key for a launched worker.
///
/// Derived from the profile name and port, so relaunching the same profile on
/// the same port after a stop reuses the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn for_profile(name: &str, port: u16) -> Self {
        Self(format!("{name}-{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    /// Stored-state half of the "active" check. The registry additionally
    /// confirms OS liveness when a process handle exists.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub profile: String,
    pub port: u16,
    /// Base URL that answered the health check; the loopback hostname form
    /// until the instance becomes ready.
    pub url: String,
    pub headless: bool,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// Tab entry as reported by a worker's `/screencast/tabs` listing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteTab {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTab {
    pub instance_id: InstanceId,
    pub tab_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProfileInfo {
    pub id: String,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProfileInstanceStatus {
    pub name: String,
    pub running: bool,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<InstanceId>,
}

/// `{prefix}_{first 8 hex chars of sha256(data)}`
pub fn hash_id(prefix: &str, data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let hex = hex::encode(digest);
    format!("{prefix}_{}", &hex[..8])
}

pub fn profile_id(name: &str) -> String {
    hash_id("prof", name)
}

/// Normalized tab id for a raw browser target id. Workers may report either
/// form, so ownership lookups compare against both.
pub fn tab_id_from_target(target_id: &str) -> String {
    hash_id("tab", target_id)
}

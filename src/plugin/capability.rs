//! Capability contracts between the host and plugin processes
//!
//! Every capability kind has one fixed request and one fixed response shape.
//! On the wire the typed value travels as a JSON payload inside the generic
//! `ExecuteRequest`/`ExecuteResponse` envelope, so the host only ever routes on
//! the kind and never looks inside the payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Integration category a plugin can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vcs,
    Notification,
    PackageManager,
    ProjectManagement,
    Container,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Vcs => "vcs",
            Capability::Notification => "notification",
            Capability::PackageManager => "package_manager",
            Capability::ProjectManagement => "project_management",
            Capability::Container => "container",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "vcs" => Ok(Capability::Vcs),
            "notification" => Ok(Capability::Notification),
            "package_manager" => Ok(Capability::PackageManager),
            "project_management" => Ok(Capability::ProjectManagement),
            "container" => Ok(Capability::Container),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsAction {
    CreateRelease,
    Tag,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsRequest {
    pub action: VcsAction,
    pub repository: String,
    pub tag: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsResponse {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: String,
    pub message: String,
    #[serde(default)]
    pub release_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub delivered: bool,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManagerRequest {
    pub package: String,
    pub version: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManagerResponse {
    pub published: bool,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManagementRequest {
    pub project: String,
    pub version: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManagementResponse {
    pub updated: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub image: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResponse {
    pub pushed: bool,
    #[serde(default)]
    pub digest: Option<String>,
}

/// A request for exactly one capability kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityRequest {
    Vcs(VcsRequest),
    Notification(NotificationRequest),
    PackageManager(PackageManagerRequest),
    ProjectManagement(ProjectManagementRequest),
    Container(ContainerRequest),
}

/// The response matching a [`CapabilityRequest`] of the same kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityResponse {
    Vcs(VcsResponse),
    Notification(NotificationResponse),
    PackageManager(PackageManagerResponse),
    ProjectManagement(ProjectManagementResponse),
    Container(ContainerResponse),
}

impl CapabilityRequest {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityRequest::Vcs(_) => Capability::Vcs,
            CapabilityRequest::Notification(_) => Capability::Notification,
            CapabilityRequest::PackageManager(_) => Capability::PackageManager,
            CapabilityRequest::ProjectManagement(_) => Capability::ProjectManagement,
            CapabilityRequest::Container(_) => Capability::Container,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            CapabilityRequest::Vcs(req) => serde_json::to_vec(req),
            CapabilityRequest::Notification(req) => serde_json::to_vec(req),
            CapabilityRequest::PackageManager(req) => serde_json::to_vec(req),
            CapabilityRequest::ProjectManagement(req) => serde_json::to_vec(req),
            CapabilityRequest::Container(req) => serde_json::to_vec(req),
        }
    }

    /// Decode a payload for the given kind (plugin side)
    pub fn from_payload(capability: Capability, payload: &[u8]) -> serde_json::Result<Self> {
        Ok(match capability {
            Capability::Vcs => CapabilityRequest::Vcs(serde_json::from_slice(payload)?),
            Capability::Notification => {
                CapabilityRequest::Notification(serde_json::from_slice(payload)?)
            }
            Capability::PackageManager => {
                CapabilityRequest::PackageManager(serde_json::from_slice(payload)?)
            }
            Capability::ProjectManagement => {
                CapabilityRequest::ProjectManagement(serde_json::from_slice(payload)?)
            }
            Capability::Container => CapabilityRequest::Container(serde_json::from_slice(payload)?),
        })
    }
}

impl CapabilityResponse {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityResponse::Vcs(_) => Capability::Vcs,
            CapabilityResponse::Notification(_) => Capability::Notification,
            CapabilityResponse::PackageManager(_) => Capability::PackageManager,
            CapabilityResponse::ProjectManagement(_) => Capability::ProjectManagement,
            CapabilityResponse::Container(_) => Capability::Container,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            CapabilityResponse::Vcs(resp) => serde_json::to_vec(resp),
            CapabilityResponse::Notification(resp) => serde_json::to_vec(resp),
            CapabilityResponse::PackageManager(resp) => serde_json::to_vec(resp),
            CapabilityResponse::ProjectManagement(resp) => serde_json::to_vec(resp),
            CapabilityResponse::Container(resp) => serde_json::to_vec(resp),
        }
    }

    /// Decode a payload for the given kind (host side)
    pub fn from_payload(capability: Capability, payload: &[u8]) -> serde_json::Result<Self> {
        Ok(match capability {
            Capability::Vcs => CapabilityResponse::Vcs(serde_json::from_slice(payload)?),
            Capability::Notification => {
                CapabilityResponse::Notification(serde_json::from_slice(payload)?)
            }
            Capability::PackageManager => {
                CapabilityResponse::PackageManager(serde_json::from_slice(payload)?)
            }
            Capability::ProjectManagement => {
                CapabilityResponse::ProjectManagement(serde_json::from_slice(payload)?)
            }
            Capability::Container => {
                CapabilityResponse::Container(serde_json::from_slice(payload)?)
            }
        })
    }
}

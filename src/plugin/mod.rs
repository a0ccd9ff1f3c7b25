//! Plugin subsystem for release-pilot
//!
//! Integrations (VCS hosting, notifications, package managers, project
//! trackers, container registries) ship as separate executables. This module
//! discovers them through a remote registry, installs and tracks them locally,
//! and talks to them over a small gRPC protocol.

pub mod capability;
pub mod error;
pub mod handshake;
pub mod host;
pub mod installer;
pub mod manager;
mod net;
pub mod protocol;
pub mod registry;
pub mod sdk;
pub mod state;
pub mod types;

pub use capability::{Capability, CapabilityRequest, CapabilityResponse};
pub use error::{PluginError, Result};
pub use host::{InvocationState, PluginHost};
pub use installer::InstallOutcome;
pub use manager::{AvailableList, InstalledList, PluginManager};
pub use types::{
    Category, InstalledPlugin, PluginInfo, PluginListEntry, PluginState, validate_name,
};

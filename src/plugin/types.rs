//! Plugin data model shared by the registry, installer, state store and host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use super::capability::Capability;
use super::error::{PluginError, Result};

const MAX_NAME_LEN: usize = 64;

/// Check that `name` can be used as a single path component under the plugin root
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_NAME_LEN
        && chars
            .next()
            .is_some_and(|first| first.is_ascii_lowercase() || first.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(PluginError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Registry category of a plugin
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Vcs,
    Notification,
    PackageManager,
    ProjectManagement,
    Container,
    #[default]
    #[serde(other)]
    Other,
}

impl Category {
    /// Display order used when listing plugins by category
    pub const ALL: [Category; 6] = [
        Category::Vcs,
        Category::Notification,
        Category::PackageManager,
        Category::ProjectManagement,
        Category::Container,
        Category::Other,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Category::Vcs => "Version Control",
            Category::Notification => "Notifications",
            Category::PackageManager => "Package Managers",
            Category::ProjectManagement => "Project Management",
            Category::Container => "Containers",
            Category::Other => "Other",
        }
    }

    /// Capability a plugin of this category serves, if any
    pub fn capability(self) -> Option<Capability> {
        match self {
            Category::Vcs => Some(Capability::Vcs),
            Category::Notification => Some(Capability::Notification),
            Category::PackageManager => Some(Capability::PackageManager),
            Category::ProjectManagement => Some(Capability::ProjectManagement),
            Category::Container => Some(Capability::Container),
            Category::Other => None,
        }
    }
}

/// One downloadable build of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformArtifact {
    pub os: String,
    pub arch: String,
    pub url: String,
    pub checksum: String,
}

impl PlatformArtifact {
    pub fn matches(&self, platform: &Platform) -> bool {
        normalize_os(&self.os) == normalize_os(&platform.os)
            && normalize_arch(&self.arch) == normalize_arch(&platform.arch)
    }
}

/// A catalog entry as published by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(rename = "latest_version", alias = "version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub platforms: Vec<PlatformArtifact>,
}

impl PluginInfo {
    pub fn artifact_for(&self, platform: &Platform) -> Option<&PlatformArtifact> {
        self.platforms.iter().find(|artifact| artifact.matches(platform))
    }
}

/// A plugin present on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPlugin {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub enabled: bool,
    pub description: String,
    pub category: Category,
}

/// Derived lifecycle status of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    NotInstalled,
    Installed,
    Enabled,
    UpdateAvailable,
}

impl PluginState {
    pub fn derive(installed: Option<&InstalledPlugin>, latest: Option<&str>) -> Self {
        let Some(installed) = installed else {
            return PluginState::NotInstalled;
        };

        if let Some(latest) = latest
            && compare_versions(&installed.version, latest) == Ordering::Less
        {
            return PluginState::UpdateAvailable;
        }

        if installed.enabled {
            PluginState::Enabled
        } else {
            PluginState::Installed
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PluginState::NotInstalled => "not installed",
            PluginState::Installed => "disabled",
            PluginState::Enabled => "enabled",
            PluginState::UpdateAvailable => "update available",
        };
        f.write_str(text)
    }
}

/// Registry info merged with local state, built for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginListEntry {
    pub info: Option<PluginInfo>,
    pub installed: Option<InstalledPlugin>,
    pub state: PluginState,
}

impl PluginListEntry {
    pub fn new(info: Option<PluginInfo>, installed: Option<InstalledPlugin>) -> Self {
        let latest = info.as_ref().map(|info| info.version.as_str());
        let state = PluginState::derive(installed.as_ref(), latest);
        Self {
            info,
            installed,
            state,
        }
    }

    pub fn name(&self) -> &str {
        match (&self.info, &self.installed) {
            (Some(info), _) => &info.name,
            (None, Some(installed)) => &installed.name,
            (None, None) => "",
        }
    }

    /// Installed version when present, registry version otherwise
    pub fn version(&self) -> &str {
        match (&self.installed, &self.info) {
            (Some(installed), _) => &installed.version,
            (None, Some(info)) => &info.version,
            (None, None) => "",
        }
    }

    pub fn latest_version(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.version.as_str())
    }

    /// Registry description, or the copy cached at install time
    pub fn description(&self) -> &str {
        match (&self.info, &self.installed) {
            (Some(info), _) if !info.description.is_empty() => &info.description,
            (_, Some(installed)) => &installed.description,
            (Some(info), None) => &info.description,
            (None, None) => "",
        }
    }

    pub fn category(&self) -> Category {
        match (&self.info, &self.installed) {
            (Some(info), _) => info.category,
            (None, Some(installed)) => installed.category,
            (None, None) => Category::Other,
        }
    }
}

/// Operating system and CPU architecture of a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }
}

fn normalize_os(os: &str) -> String {
    match os.to_ascii_lowercase().as_str() {
        "darwin" | "macos" | "osx" => "macos".to_string(),
        "win" | "win32" | "windows" => "windows".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "amd64" | "x86_64" | "x64" => "x86_64".to_string(),
        "arm64" | "aarch64" => "aarch64".to_string(),
        "386" | "i386" | "i686" | "x86" => "x86".to_string(),
        other => other.to_string(),
    }
}

/// Compare two plugin versions
///
/// Dot-separated numeric components are compared numerically, a leading `v`
/// is ignored and a pre-release (`1.2.0-rc.1`) sorts before its release.
/// Versions that do not parse fall back to plain string ordering.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    match (parse_version(left), parse_version(right)) {
        (Some((left_core, left_pre)), Some((right_core, right_pre))) => {
            let width = left_core.len().max(right_core.len());
            for idx in 0..width {
                let l = left_core.get(idx).copied().unwrap_or(0);
                let r = right_core.get(idx).copied().unwrap_or(0);
                match l.cmp(&r) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }

            match (left_pre, right_pre) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(l), Some(r)) => compare_prerelease(l, r),
            }
        }
        _ => left.cmp(right),
    }
}

/// Dot-separated identifiers, numeric ones compared as numbers and ranked
/// below alphanumeric ones
fn compare_prerelease(left: &str, right: &str) -> Ordering {
    let mut left_ids = left.split('.');
    let mut right_ids = right.split('.');

    loop {
        let ordering = match (left_ids.next(), right_ids.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match (l.parse::<u64>(), r.parse::<u64>()) {
                (Ok(l), Ok(r)) => l.cmp(&r),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => l.cmp(r),
            },
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

fn parse_version(version: &str) -> Option<(Vec<u64>, Option<&str>)> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let trimmed = trimmed.split('+').next().unwrap_or(trimmed);
    let (core, pre) = match trimmed.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (trimmed, None),
    };

    let parts = core
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    if parts.is_empty() {
        return None;
    }

    Some((parts, pre))
}

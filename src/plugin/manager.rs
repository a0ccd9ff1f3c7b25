//! Manager facade over the registry client, installer and state store
//!
//! Each operation returns exactly one outcome. Lifecycle operations go through
//! here; capability execution goes through [`PluginHost`], reachable via
//! [`PluginManager::host`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::error::{PluginError, Result};
use super::host::PluginHost;
use super::installer::{InstallOutcome, Installer};
use super::registry::{RegistryClient, RegistrySnapshot, SnapshotOrigin};
use super::state::{StateStore, run_blocking};
use super::types::{InstalledPlugin, PluginInfo, PluginListEntry};
use crate::config::Settings;

/// Registry catalog merged with local install state
#[derive(Debug, Clone)]
pub struct AvailableList {
    pub entries: Vec<PluginListEntry>,
    /// Served from an outdated cache because the registry was unreachable
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Installed plugins with update information where the registry allowed it
#[derive(Debug, Clone)]
pub struct InstalledList {
    pub entries: Vec<PluginListEntry>,
    /// Update status may be outdated (stale cache or no registry at all)
    pub stale: bool,
}

pub struct PluginManager {
    registry: Arc<RegistryClient>,
    installer: Installer,
    state: StateStore,
    host: PluginHost,
}

impl PluginManager {
    pub fn new(settings: Settings) -> Result<Self> {
        let registry = Arc::new(RegistryClient::new(settings.clone())?);
        let state = StateStore::new(settings.clone());
        let installer = Installer::new(settings.clone(), Arc::clone(&registry), state.clone())?;
        let host = PluginHost::new(settings, state.clone());

        Ok(Self {
            registry,
            installer,
            state,
            host,
        })
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Every registry plugin, grouped by category then name
    pub async fn list_available(
        &self,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<AvailableList> {
        let catalog = self.registry.list_available(refresh, cancel).await?;
        let mut installed = self.installed_by_name().await?;

        let entries = catalog
            .plugins
            .into_iter()
            .map(|info| {
                let local = installed.remove(&info.name);
                PluginListEntry::new(Some(info), local)
            })
            .collect();

        Ok(AvailableList {
            entries,
            stale: catalog.stale,
            fetched_at: catalog.fetched_at,
        })
    }

    /// Installed plugins, sorted by name
    ///
    /// An unreachable registry degrades to the locally cached descriptions.
    pub async fn list_installed(&self, cancel: &CancellationToken) -> Result<InstalledList> {
        let installed = self.installed_by_name().await?;
        if installed.is_empty() {
            return Ok(InstalledList {
                entries: Vec::new(),
                stale: false,
            });
        }

        let (snapshot, stale) = match self.registry.current(false, cancel).await {
            Ok(current) => (
                Some(current.snapshot),
                current.origin == SnapshotOrigin::Stale,
            ),
            Err(PluginError::RegistryUnavailable { reason }) => {
                tracing::warn!("Plugin registry unavailable ({reason}); update status unknown");
                (None, true)
            }
            Err(err) => return Err(err),
        };

        Ok(InstalledList {
            entries: merge_installed(installed, snapshot.as_deref()),
            stale,
        })
    }

    pub async fn install(&self, name: &str, cancel: &CancellationToken) -> Result<InstallOutcome> {
        self.installer.install(name, cancel).await
    }

    /// Install the newest registry version of an installed plugin
    pub async fn update(&self, name: &str, cancel: &CancellationToken) -> Result<InstallOutcome> {
        if self.installed(name).await?.is_none() {
            return Err(PluginError::NotInstalled {
                name: name.to_string(),
            });
        }

        match self.registry.refresh(cancel).await {
            Ok(_) => {}
            Err(PluginError::Cancelled) => return Err(PluginError::Cancelled),
            Err(err) => tracing::warn!("Registry refresh failed ({err}); using cached catalog"),
        }

        self.installer.install(name, cancel).await
    }

    pub async fn uninstall(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.installer.uninstall(name, cancel).await
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        let state = self.state.clone();
        let name = name.to_string();
        run_blocking(move || {
            state.enable(&name)?;
            tracing::info!("Enabled plugin {name}");
            Ok(())
        })
        .await
    }

    pub async fn disable(&self, name: &str) -> Result<()> {
        let state = self.state.clone();
        let name = name.to_string();
        run_blocking(move || {
            state.disable(&name)?;
            tracing::info!("Disabled plugin {name}");
            Ok(())
        })
        .await
    }

    /// Everything known about one plugin
    ///
    /// An installed plugin is still described when the registry is unreachable.
    pub async fn info(&self, name: &str, cancel: &CancellationToken) -> Result<PluginListEntry> {
        let installed = self.installed(name).await?;

        let info = match self.registry.lookup(name, cancel).await {
            Ok(info) => Some(info),
            Err(PluginError::NotFound { .. }) if installed.is_some() => None,
            Err(PluginError::RegistryUnavailable { reason }) if installed.is_some() => {
                tracing::warn!("Plugin registry unavailable ({reason}); showing local details");
                None
            }
            Err(err) => return Err(err),
        };

        Ok(PluginListEntry::new(info, installed))
    }

    async fn installed(&self, name: &str) -> Result<Option<InstalledPlugin>> {
        let state = self.state.clone();
        let name = name.to_string();
        run_blocking(move || state.get(&name)).await
    }

    async fn installed_by_name(&self) -> Result<BTreeMap<String, InstalledPlugin>> {
        let state = self.state.clone();
        let installed = run_blocking(move || state.installed()).await?;
        Ok(installed
            .into_iter()
            .map(|plugin| (plugin.name.clone(), plugin))
            .collect())
    }
}

fn merge_installed(
    installed: BTreeMap<String, InstalledPlugin>,
    snapshot: Option<&RegistrySnapshot>,
) -> Vec<PluginListEntry> {
    installed
        .into_values()
        .map(|plugin| {
            let info: Option<PluginInfo> =
                snapshot.and_then(|snapshot| snapshot.get(&plugin.name).cloned());
            PluginListEntry::new(info, Some(plugin))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::registry::RegistryDocument;
    use crate::plugin::types::{Category, PluginState};

    fn installed(name: &str, version: &str, enabled: bool) -> InstalledPlugin {
        InstalledPlugin {
            name: name.to_string(),
            version: version.to_string(),
            path: format!("/plugins/{name}/{version}").into(),
            installed_at: Utc::now(),
            enabled,
            description: format!("cached {name} description"),
            category: Category::Notification,
        }
    }

    fn info(name: &str, version: &str) -> PluginInfo {
        PluginInfo {
            name: name.to_string(),
            version: version.to_string(),
            description: format!("{name} from registry"),
            category: Category::Notification,
            platforms: Vec::new(),
        }
    }

    #[test]
    fn test_merge_marks_updates_and_keeps_unknown_plugins() {
        let local: BTreeMap<_, _> = [
            ("slack", installed("slack", "1.0.0", true)),
            ("teams", installed("teams", "2.0.0", false)),
            ("retired", installed("retired", "0.1.0", false)),
        ]
        .into_iter()
        .map(|(name, plugin)| (name.to_string(), plugin))
        .collect();

        let snapshot = RegistrySnapshot::from_document(
            RegistryDocument {
                plugins: vec![info("slack", "1.1.0"), info("teams", "2.0.0")],
            },
            None,
        );

        let entries = merge_installed(local, Some(&snapshot));
        let names: Vec<&str> = entries.iter().map(|entry| entry.name()).collect();
        assert_eq!(names, vec!["retired", "slack", "teams"]);

        assert_eq!(entries[0].state, PluginState::Installed);
        assert_eq!(entries[0].description(), "cached retired description");
        assert_eq!(entries[1].state, PluginState::UpdateAvailable);
        assert_eq!(entries[2].state, PluginState::Installed);
        assert_eq!(entries[2].description(), "teams from registry");
    }

    #[test]
    fn test_merge_without_registry_uses_local_details() {
        let local: BTreeMap<_, _> = [("slack".to_string(), installed("slack", "1.0.0", true))]
            .into_iter()
            .collect();

        let entries = merge_installed(local, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, PluginState::Enabled);
        assert_eq!(entries[0].latest_version(), None);
        assert_eq!(entries[0].category(), Category::Notification);
    }
}

//! Durable record of installed plugins and their enabled flags
//!
//! The document lives at `<plugin-root>/state.json`. Every access goes through
//! the sidecar `state.lock`: readers hold a shared lock, writers an exclusive
//! one for the whole read-modify-write cycle. The document itself is replaced
//! with a rename so a crash mid-write leaves the previous version intact.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use super::error::{IoContext, PluginError, Result};
use super::types::{Category, InstalledPlugin, validate_name};
use crate::config::Settings;

/// Serialized form of the state document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub plugins: BTreeMap<String, StateEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub version: String,
    #[serde(default)]
    pub enabled: bool,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Category,
}

/// Registry details captured when a plugin is installed
#[derive(Debug, Clone)]
pub struct InstallRecord {
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: Category,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    settings: Settings,
}

enum LockMode {
    Shared,
    Exclusive,
}

impl StateStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn path(&self) -> PathBuf {
        self.settings.state_path()
    }

    /// Read the whole document under a shared lock
    pub fn load(&self) -> Result<StateDocument> {
        let _lock = self.lock(LockMode::Shared)?;
        self.read_document()
    }

    /// Read-modify-write the document under an exclusive lock
    ///
    /// The document is only written back when `apply` succeeds.
    pub fn update<T>(&self, apply: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut document = self.read_document()?;
        let value = apply(&mut document)?;
        self.write_document(&document)?;
        Ok(value)
    }

    pub fn installed(&self) -> Result<Vec<InstalledPlugin>> {
        let document = self.load()?;
        Ok(document
            .plugins
            .iter()
            .filter(|(name, _)| match validate_name(name) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("Ignoring state entry: {err}");
                    false
                }
            })
            .map(|(name, entry)| self.to_installed(name, entry))
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<InstalledPlugin>> {
        validate_name(name)?;
        let document = self.load()?;
        Ok(document
            .plugins
            .get(name)
            .map(|entry| self.to_installed(name, entry)))
    }

    /// Record a successful install, returning the version it replaced
    ///
    /// The enabled flag survives an upgrade.
    pub fn record_install(&self, record: &InstallRecord) -> Result<Option<String>> {
        validate_name(&record.name)?;
        self.update(|document| {
            let previous = document.plugins.get(&record.name).cloned();
            let enabled = previous.as_ref().is_some_and(|entry| entry.enabled);
            document.plugins.insert(
                record.name.clone(),
                StateEntry {
                    version: record.version.clone(),
                    enabled,
                    installed_at: Utc::now(),
                    description: record.description.clone(),
                    category: record.category,
                },
            );
            Ok(previous.map(|entry| entry.version))
        })
    }

    /// Delete a plugin's entry, returning whether it existed
    pub fn remove(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        self.update(|document| Ok(document.plugins.remove(name).is_some()))
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.update(|document| {
            let entry = document
                .plugins
                .get_mut(name)
                .ok_or_else(|| PluginError::NotInstalled {
                    name: name.to_string(),
                })?;
            entry.enabled = true;
            Ok(())
        })
    }

    /// Clear the enabled flag; a no-op when the plugin is not installed
    pub fn disable(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.update(|document| {
            if let Some(entry) = document.plugins.get_mut(name) {
                entry.enabled = false;
            }
            Ok(())
        })
    }

    fn to_installed(&self, name: &str, entry: &StateEntry) -> InstalledPlugin {
        InstalledPlugin {
            name: name.to_string(),
            version: entry.version.clone(),
            path: self.settings.binary_path(name, &entry.version),
            installed_at: entry.installed_at,
            enabled: entry.enabled,
            description: entry.description.clone(),
            category: entry.category,
        }
    }

    fn lock(&self, mode: LockMode) -> Result<File> {
        let root = &self.settings.plugin_root;
        fs::create_dir_all(root)
            .io_context(|| format!("Failed to create plugin directory {}", root.display()))?;

        let lock_path = self.settings.state_lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .io_context(|| format!("Failed to open state lock {}", lock_path.display()))?;

        match mode {
            LockMode::Shared => file.lock_shared(),
            LockMode::Exclusive => file.lock_exclusive(),
        }
        .io_context(|| format!("Failed to lock {}", lock_path.display()))?;

        Ok(file)
    }

    fn read_document(&self) -> Result<StateDocument> {
        let path = self.path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateDocument::default());
            }
            Err(err) => {
                return Err(PluginError::io(
                    format!("Failed to read state document {}", path.display()),
                    err,
                ));
            }
        };

        if contents.trim().is_empty() {
            return Ok(StateDocument::default());
        }

        serde_json::from_str(&contents).map_err(|source| PluginError::StateCorrupted {
            path: path.clone(),
            source,
        })
    }

    fn write_document(&self, document: &StateDocument) -> Result<()> {
        let path = self.path();
        let root = &self.settings.plugin_root;

        let mut temp = tempfile::NamedTempFile::new_in(root)
            .io_context(|| format!("Failed to create temporary file in {}", root.display()))?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, document)
                .map_err(std::io::Error::from)
                .and_then(|_| writer.flush())
                .io_context(|| format!("Failed to write state document {}", path.display()))?;
        }
        temp.as_file()
            .sync_all()
            .io_context(|| format!("Failed to sync state document {}", path.display()))?;
        temp.persist(&path)
            .map_err(|err| err.error)
            .io_context(|| format!("Failed to replace state document {}", path.display()))?;

        tracing::debug!("Wrote plugin state to {}", path.display());
        Ok(())
    }
}

/// Run blocking state or filesystem work off the async executor
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| PluginError::io("Blocking task failed", std::io::Error::other(err)))?
}

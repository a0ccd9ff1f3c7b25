//! Registry client: fetches and caches the remote plugin catalog
//!
//! The catalog is cached on disk as a snapshot with a fetch timestamp and the
//! server's ETag. Fresh snapshots are served without touching the network;
//! failed fetches fall back to the last good snapshot, flagged as stale.
//! Concurrent refreshes within one process share a single in-flight fetch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::error::{IoContext, PluginError, Result};
use super::net::{self, FetchError, Fetched};
use super::types::{PluginInfo, validate_name};
use crate::config::Settings;

/// Catalog document served by the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}

/// A catalog as fetched at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub plugins: BTreeMap<String, PluginInfo>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl RegistrySnapshot {
    pub fn from_document(document: RegistryDocument, etag: Option<String>) -> Self {
        let plugins = document
            .plugins
            .into_iter()
            .filter(|info| match validate_name(&info.name) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("Skipping registry entry: {err}");
                    false
                }
            })
            .map(|info| (info.name.clone(), info))
            .collect();
        Self {
            plugins,
            fetched_at: Utc::now(),
            etag,
        }
    }

    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.get(name)
    }

    /// Plugins grouped by category display order, then by name
    pub fn sorted(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self.plugins.values().cloned().collect();
        plugins.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        plugins
    }
}

/// Where the snapshot handed to a caller came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// Fresh local snapshot, no network call made
    Cache,
    /// Fetched (or revalidated) during this call
    Live,
    /// The fetch failed and an outdated snapshot was used instead
    Stale,
}

#[derive(Debug, Clone)]
pub struct CurrentSnapshot {
    pub snapshot: Arc<RegistrySnapshot>,
    pub origin: SnapshotOrigin,
}

/// Result of listing the registry
#[derive(Debug, Clone)]
pub struct Catalog {
    pub plugins: Vec<PluginInfo>,
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of the last completed fetch, shared with callers that waited on it
#[derive(Default)]
struct Flight {
    generation: u64,
    outcome: Option<std::result::Result<Arc<RegistrySnapshot>, String>>,
}

pub struct RegistryClient {
    settings: Settings,
    http: reqwest::Client,
    snapshot: RwLock<Option<Arc<RegistrySnapshot>>>,
    flight: Mutex<Flight>,
    generation: AtomicU64,
}

impl RegistryClient {
    pub fn new(settings: Settings) -> Result<Self> {
        let http = net::http_client(&settings)?;
        Ok(Self {
            settings,
            http,
            snapshot: RwLock::new(None),
            flight: Mutex::new(Flight::default()),
            generation: AtomicU64::new(0),
        })
    }

    /// List every plugin in the catalog, grouped by category then name
    pub async fn list_available(&self, refresh: bool, cancel: &CancellationToken) -> Result<Catalog> {
        let current = self.current(refresh, cancel).await?;
        Ok(Catalog {
            plugins: current.snapshot.sorted(),
            stale: current.origin == SnapshotOrigin::Stale,
            fetched_at: current.snapshot.fetched_at,
        })
    }

    /// The freshest snapshot available
    ///
    /// Serves the cached snapshot while it is fresh (unless `refresh`),
    /// otherwise fetches. A failed fetch falls back to any cached snapshot.
    pub async fn current(&self, refresh: bool, cancel: &CancellationToken) -> Result<CurrentSnapshot> {
        let cached = self.cached();

        if !refresh
            && let Some(snapshot) = cached.as_ref()
            && snapshot.is_fresh(self.settings.cache_ttl)
        {
            tracing::debug!("Using cached plugin registry from {}", snapshot.fetched_at);
            return Ok(CurrentSnapshot {
                snapshot: Arc::clone(snapshot),
                origin: SnapshotOrigin::Cache,
            });
        }

        match self.refresh(cancel).await {
            Ok(snapshot) => Ok(CurrentSnapshot {
                snapshot,
                origin: SnapshotOrigin::Live,
            }),
            Err(PluginError::Cancelled) => Err(PluginError::Cancelled),
            Err(err) => match self.cached() {
                Some(snapshot) => {
                    tracing::warn!(
                        "Plugin registry unreachable ({err}); using cached catalog from {}",
                        snapshot.fetched_at
                    );
                    Ok(CurrentSnapshot {
                        snapshot,
                        origin: SnapshotOrigin::Stale,
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Resolve a plugin by name, refreshing once if the cache does not know it
    pub async fn lookup(&self, name: &str, cancel: &CancellationToken) -> Result<PluginInfo> {
        let current = self.current(false, cancel).await?;
        if let Some(info) = current.snapshot.get(name) {
            return Ok(info.clone());
        }

        if current.origin == SnapshotOrigin::Cache {
            tracing::debug!("Plugin {name} not in cached registry, refreshing");
            let snapshot = self.refresh(cancel).await?;
            if let Some(info) = snapshot.get(name) {
                return Ok(info.clone());
            }
        }

        Err(PluginError::NotFound {
            name: name.to_string(),
        })
    }

    /// Fetch the catalog, sharing the result with concurrent callers
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Arc<RegistrySnapshot>> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut flight = net::cancellable(cancel, self.flight.lock())
            .await
            .ok_or(PluginError::Cancelled)?;

        if flight.generation != observed
            && let Some(outcome) = flight.outcome.as_ref()
        {
            tracing::debug!("Joining registry fetch completed by another caller");
            return outcome
                .clone()
                .map_err(|reason| PluginError::RegistryUnavailable { reason });
        }

        let result = self.fetch(cancel).await;
        if matches!(result, Err(PluginError::Cancelled)) {
            return result;
        }

        flight.generation += 1;
        flight.outcome = Some(match &result {
            Ok(snapshot) => Ok(Arc::clone(snapshot)),
            Err(err) => Err(err.to_string()),
        });
        self.generation.store(flight.generation, Ordering::Release);

        result
    }

    /// In-memory snapshot, loading the disk cache on first use
    pub fn cached(&self) -> Option<Arc<RegistrySnapshot>> {
        if let Ok(guard) = self.snapshot.read()
            && let Some(snapshot) = guard.as_ref()
        {
            return Some(Arc::clone(snapshot));
        }

        let loaded = Arc::new(self.read_cache_file()?);
        if let Ok(mut guard) = self.snapshot.write() {
            return Some(Arc::clone(guard.get_or_insert(loaded)));
        }
        Some(loaded)
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Arc<RegistrySnapshot>> {
        let cached = self.cached();
        let etag = cached.as_ref().and_then(|snapshot| snapshot.etag.clone());
        let location = self.settings.registry_url.as_str();

        tracing::info!("Fetching plugin registry from {location}");
        let fetched = net::with_retries(
            self.settings.fetch_attempts,
            self.settings.retry_backoff,
            cancel,
            "Registry fetch",
            || net::fetch(&self.http, location, etag.as_deref(), cancel),
        )
        .await
        .map_err(|err| match err {
            FetchError::Cancelled => PluginError::Cancelled,
            other => PluginError::RegistryUnavailable {
                reason: other.reason(),
            },
        })?;

        let snapshot = match (fetched, cached) {
            (Fetched::NotModified, Some(cached)) => {
                tracing::debug!("Plugin registry not modified, renewing cached snapshot");
                RegistrySnapshot {
                    fetched_at: Utc::now(),
                    ..(*cached).clone()
                }
            }
            (Fetched::NotModified, None) => {
                return Err(PluginError::RegistryUnavailable {
                    reason: "registry answered 304 Not Modified without a cached catalog"
                        .to_string(),
                });
            }
            (Fetched::Body { bytes, etag }, _) => {
                let document: RegistryDocument =
                    serde_json::from_slice(&bytes).map_err(|err| {
                        PluginError::RegistryUnavailable {
                            reason: format!("invalid registry document: {err}"),
                        }
                    })?;
                RegistrySnapshot::from_document(document, etag)
            }
        };

        let snapshot = Arc::new(snapshot);
        if let Err(err) = self.write_cache_file(&snapshot) {
            tracing::warn!("Failed to persist plugin registry cache: {err}");
        }
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Some(Arc::clone(&snapshot));
        }

        tracing::debug!("Plugin registry lists {} plugins", snapshot.plugins.len());
        Ok(snapshot)
    }

    fn read_cache_file(&self) -> Option<RegistrySnapshot> {
        let path = self.settings.registry_cache_path();
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!("Ignoring unreadable registry cache {}: {err}", path.display());
                None
            }
        }
    }

    fn write_cache_file(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let path = self.settings.registry_cache_path();
        let root = &self.settings.plugin_root;
        fs::create_dir_all(root)
            .io_context(|| format!("Failed to create plugin directory {}", root.display()))?;

        let json = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::from);
        let mut temp = tempfile::NamedTempFile::new_in(root)
            .io_context(|| format!("Failed to create temporary file in {}", root.display()))?;
        json.and_then(|json| temp.write_all(&json))
            .io_context(|| format!("Failed to write registry cache {}", path.display()))?;
        temp.persist(&path)
            .map_err(|err| err.error)
            .io_context(|| format!("Failed to replace registry cache {}", path.display()))?;
        Ok(())
    }
}

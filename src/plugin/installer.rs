//! Installation manager: downloads, verifies and lays out plugin binaries
//!
//! Artifacts are downloaded into `<plugin-root>/.staging/`, checked against the
//! registry's SHA-256 checksum and only then renamed into
//! `<plugin-root>/<name>/<version>/`. Work on one plugin name is serialized by
//! an in-process mutex plus a cross-process lock file under `.locks/`;
//! different names never contend.

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use super::error::{IoContext, PluginError, Result};
use super::net::{self, FetchError, Fetched};
use super::registry::RegistryClient;
use super::state::{InstallRecord, StateStore, run_blocking};
use super::types::{PlatformArtifact, Platform, PluginInfo, validate_name};
use crate::config::{Settings, binary_name};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STAGING_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// What an install actually did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { version: String },
    Upgraded { from: String, to: String },
    /// The requested version was already installed; nothing changed
    AlreadyAtVersion { version: String },
}

impl InstallOutcome {
    pub fn version(&self) -> &str {
        match self {
            InstallOutcome::Installed { version } => version,
            InstallOutcome::Upgraded { to, .. } => to,
            InstallOutcome::AlreadyAtVersion { version } => version,
        }
    }
}

/// Held while a plugin's files and state entry are being changed
struct InstallGuard {
    _process: OwnedMutexGuard<()>,
    _file: File,
}

pub struct Installer {
    settings: Settings,
    registry: Arc<RegistryClient>,
    state: StateStore,
    http: reqwest::Client,
    platform: Platform,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Installer {
    pub fn new(settings: Settings, registry: Arc<RegistryClient>, state: StateStore) -> Result<Self> {
        let http = net::http_client(&settings)?;
        Ok(Self {
            settings,
            registry,
            state,
            http,
            platform: Platform::current(),
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Install the registry's latest version of `name`
    pub async fn install(&self, name: &str, cancel: &CancellationToken) -> Result<InstallOutcome> {
        validate_name(name)?;
        let info = self.registry.lookup(name, cancel).await?;
        let artifact = info
            .artifact_for(&self.platform)
            .cloned()
            .ok_or_else(|| PluginError::UnsupportedPlatform {
                name: name.to_string(),
                os: self.platform.os.clone(),
                arch: self.platform.arch.clone(),
            })?;

        let _guard = self.acquire(name, cancel).await?;

        let state = self.state.clone();
        let lookup_name = name.to_string();
        let existing = run_blocking(move || state.get(&lookup_name)).await?;

        if let Some(existing) = existing.as_ref()
            && existing.version == info.version
            && existing.path.exists()
        {
            tracing::info!("Plugin {name} {} is already installed", info.version);
            return Ok(InstallOutcome::AlreadyAtVersion {
                version: info.version,
            });
        }

        let bytes = self.download_verified(&info, &artifact, cancel).await?;

        let settings = self.settings.clone();
        let state = self.state.clone();
        let record = InstallRecord {
            name: info.name.clone(),
            version: info.version.clone(),
            description: info.description.clone(),
            category: info.category,
        };
        let previous = run_blocking(move || commit(&settings, &state, &record, &bytes)).await?;

        let outcome = match previous {
            Some(from) if from != info.version => {
                tracing::info!("Upgraded plugin {name} from {from} to {}", info.version);
                InstallOutcome::Upgraded {
                    from,
                    to: info.version,
                }
            }
            _ => {
                tracing::info!("Installed plugin {name} {}", info.version);
                InstallOutcome::Installed {
                    version: info.version,
                }
            }
        };
        Ok(outcome)
    }

    /// Remove an installed plugin, disabling it first
    pub async fn uninstall(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        validate_name(name)?;
        let _guard = self.acquire(name, cancel).await?;

        let settings = self.settings.clone();
        let state = self.state.clone();
        let name = name.to_string();
        run_blocking(move || {
            let installed = state
                .get(&name)?
                .ok_or_else(|| PluginError::NotInstalled { name: name.clone() })?;

            if installed.enabled {
                tracing::info!("Disabling plugin {name} before removal");
                state.disable(&name)?;
            }

            let dir = settings.plugin_dir(&name);
            remove_dir_if_exists(&dir)?;
            state.remove(&name)?;

            tracing::info!("Uninstalled plugin {name} {}", installed.version);
            Ok(())
        })
        .await
    }

    async fn download_verified(
        &self,
        info: &PluginInfo,
        artifact: &PlatformArtifact,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let attempts = self.settings.integrity_attempts.max(1);
        let mut attempt = 1;

        loop {
            tracing::info!("Downloading {} {} from {}", info.name, info.version, artifact.url);
            let fetched = net::with_retries(
                self.settings.download_attempts,
                self.settings.retry_backoff,
                cancel,
                "Plugin download",
                || net::fetch(&self.http, &artifact.url, None, cancel),
            )
            .await
            .map_err(|err| match err {
                FetchError::Cancelled => PluginError::Cancelled,
                other => PluginError::RegistryUnavailable {
                    reason: format!("download of {} failed: {}", info.name, other.reason()),
                },
            })?;

            let Fetched::Body { bytes, .. } = fetched else {
                return Err(PluginError::RegistryUnavailable {
                    reason: format!("download of {} returned no content", info.name),
                });
            };

            let actual = sha256_hex(&bytes);
            if checksum_matches(&artifact.checksum, &actual) {
                return Ok(bytes);
            }

            if attempt >= attempts {
                return Err(PluginError::IntegrityError {
                    name: info.name.clone(),
                    expected: normalize_checksum(&artifact.checksum),
                    actual,
                });
            }
            tracing::warn!(
                "Checksum mismatch for {} (attempt {attempt}/{attempts}), downloading again",
                info.name
            );
            attempt += 1;
        }
    }

    async fn acquire(&self, name: &str, cancel: &CancellationToken) -> Result<InstallGuard> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };

        let process = net::cancellable(cancel, mutex.lock_owned())
            .await
            .ok_or(PluginError::Cancelled)?;

        let lock_dir = self.settings.lock_dir();
        let lock_path = self.settings.install_lock_path(name);
        let file = {
            let lock_path = lock_path.clone();
            run_blocking(move || {
                fs::create_dir_all(&lock_dir).io_context(|| {
                    format!("Failed to create lock directory {}", lock_dir.display())
                })?;
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&lock_path)
                    .io_context(|| format!("Failed to open install lock {}", lock_path.display()))
            })
            .await?
        };

        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if !announced {
                        tracing::info!("Waiting for another process installing {name}");
                        announced = true;
                    }
                    net::cancellable(cancel, tokio::time::sleep(LOCK_POLL_INTERVAL))
                        .await
                        .ok_or(PluginError::Cancelled)?;
                }
                Err(err) => {
                    return Err(PluginError::io(
                        format!("Failed to lock {}", lock_path.display()),
                        err,
                    ));
                }
            }
        }

        Ok(InstallGuard {
            _process: process,
            _file: file,
        })
    }
}

/// Publish verified bytes and record the install
///
/// The new version directory appears atomically. The previous version's
/// directory is only removed once the state entry points at the new one.
fn commit(
    settings: &Settings,
    state: &StateStore,
    record: &InstallRecord,
    bytes: &[u8],
) -> Result<Option<String>> {
    let target = settings.version_dir(&record.name, &record.version);
    let staged = stage(settings, &record.name, bytes)?;
    publish(&staged, &target)?;

    let previous = match state.record_install(record) {
        Ok(previous) => previous,
        Err(err) => {
            if let Err(cleanup) = remove_dir_if_exists(&target) {
                tracing::warn!("Failed to clean up {}: {cleanup}", target.display());
            }
            return Err(err);
        }
    };

    if let Some(previous) = previous.as_ref()
        && previous != &record.version
    {
        let old_dir = settings.version_dir(&record.name, previous);
        if let Err(err) = remove_dir_if_exists(&old_dir) {
            tracing::warn!("Failed to remove previous version {}: {err}", old_dir.display());
        }
    }

    Ok(previous)
}

/// Write the binary into a fresh staging directory and return its path
fn stage(settings: &Settings, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let staging_root = settings.staging_dir();
    fs::create_dir_all(&staging_root)
        .io_context(|| format!("Failed to create staging directory {}", staging_root.display()))?;
    sweep_staging(&staging_root, STAGING_MAX_AGE);

    let staging = tempfile::Builder::new()
        .prefix(&format!("{name}-"))
        .tempdir_in(&staging_root)
        .io_context(|| format!("Failed to create staging directory in {}", staging_root.display()))?;

    let binary = staging.path().join(binary_name(name));
    let mut file = File::create(&binary)
        .io_context(|| format!("Failed to create {}", binary.display()))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .io_context(|| format!("Failed to write {}", binary.display()))?;
    drop(file);
    make_executable(&binary)?;

    // Past this point the directory is cleaned up by `publish`
    Ok(staging.keep())
}

fn publish(staged: &Path, target: &Path) -> Result<()> {
    let result = move_into_place(staged, target);
    if result.is_err()
        && let Err(err) = remove_dir_if_exists(staged)
    {
        tracing::warn!("Failed to clean up {}: {err}", staged.display());
    }
    result
}

/// Remove staging directories left behind by processes killed mid-install
fn sweep_staging(staging_root: &Path, max_age: Duration) {
    let Ok(entries) = fs::read_dir(staging_root) else {
        return;
    };

    for entry in entries.flatten() {
        let expired = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age >= max_age);
        if !expired {
            continue;
        }

        let path = entry.path();
        tracing::debug!("Removing stale staging directory {}", path.display());
        if let Err(err) = remove_dir_if_exists(&path) {
            tracing::warn!("Failed to remove stale staging directory {}: {err}", path.display());
        }
    }
}

fn move_into_place(staged: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).io_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // Leftover from an install interrupted before its state commit
    remove_dir_if_exists(target)?;
    fs::rename(staged, target)
        .io_context(|| format!("Failed to move {} to {}", staged.display(), target.display()))
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PluginError::io(
            format!("Failed to remove {}", dir.display()),
            err,
        )),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .io_context(|| format!("Failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    trimmed
        .strip_prefix("sha256:")
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

fn checksum_matches(expected: &str, actual: &str) -> bool {
    normalize_checksum(expected) == actual
}

//! Runtime settings for the plugin subsystem
//!
//! Settings are layered: built-in defaults, then the optional YAML config file,
//! then environment variables. CLI flags are applied last by the binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the plugin catalog
pub const DEFAULT_REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/felixgeelhaar/release-pilot/main/plugins/registry.json";

pub const ENV_PLUGIN_DIR: &str = "RELEASE_PILOT_PLUGIN_DIR";
pub const ENV_REGISTRY_URL: &str = "RELEASE_PILOT_REGISTRY_URL";
pub const ENV_CONFIG: &str = "RELEASE_PILOT_CONFIG";

/// Set to `1` in every plugin subprocess the host spawns
pub const ENV_PLUGIN: &str = "RELEASE_PILOT_PLUGIN";
pub const ENV_PROTOCOL_VERSION: &str = "RELEASE_PILOT_PROTOCOL_VERSION";

/// Settings shared by every plugin component
///
/// Constructed once per invocation and handed to each component; nothing in
/// the plugin subsystem reads process-wide state on its own.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory holding plugin binaries, the state document and caches
    pub plugin_root: PathBuf,
    /// Registry catalog location (`http(s)://`, `file://` or a plain path)
    pub registry_url: String,
    /// How long a registry snapshot is considered fresh
    pub cache_ttl: Duration,
    /// Timeout for a single registry or artifact HTTP request
    pub request_timeout: Duration,
    /// Attempts for a registry fetch before falling back to the cache
    pub fetch_attempts: u32,
    /// Attempts for an artifact download on transient network failures
    pub download_attempts: u32,
    /// Attempts for an artifact download whose checksum does not match
    pub integrity_attempts: u32,
    /// Base delay of the exponential retry backoff
    pub retry_backoff: Duration,
    /// Bound on reading the plugin handshake line
    pub handshake_timeout: Duration,
    /// Bound on a single capability RPC
    pub execution_timeout: Duration,
    /// Grace period between the termination signal and a forced kill
    pub shutdown_grace: Duration,
}

impl Settings {
    /// Settings rooted at an explicit plugin directory, everything else default
    pub fn with_root(plugin_root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_root: plugin_root.into(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            request_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            download_attempts: 3,
            integrity_attempts: 2,
            retry_backoff: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// Load settings from defaults, the config file and the environment
    pub fn load() -> Result<Self> {
        let mut settings = Self::with_root(default_plugin_root());

        let config_path = std::env::var_os(ENV_CONFIG)
            .map(PathBuf::from)
            .or_else(default_config_file);

        if let Some(path) = config_path.filter(|path| path.exists()) {
            let file = SettingsFile::read(&path)?;
            settings.apply_file(file);
            tracing::debug!("Loaded plugin settings from {}", path.display());
        }

        if let Some(dir) = std::env::var_os(ENV_PLUGIN_DIR) {
            settings.plugin_root = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var(ENV_REGISTRY_URL)
            && !url.trim().is_empty()
        {
            settings.registry_url = url;
        }

        Ok(settings)
    }

    fn apply_file(&mut self, file: SettingsFile) {
        let Some(plugins) = file.plugins else {
            return;
        };

        if let Some(dir) = plugins.dir {
            self.plugin_root = expand_tilde(&dir);
        }
        if let Some(url) = plugins.registry {
            self.registry_url = url;
        }
        if let Some(hours) = plugins.cache_ttl_hours {
            self.cache_ttl = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(secs) = plugins.handshake_timeout_secs {
            self.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = plugins.execution_timeout_secs {
            self.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = plugins.shutdown_grace_secs {
            self.shutdown_grace = Duration::from_secs(secs);
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.plugin_root.join("state.json")
    }

    pub fn state_lock_path(&self) -> PathBuf {
        self.plugin_root.join("state.lock")
    }

    pub fn registry_cache_path(&self) -> PathBuf {
        self.plugin_root.join("registry-cache.json")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.plugin_root.join(".staging")
    }

    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        self.plugin_root.join(name)
    }

    /// Per-plugin install locks, kept apart from `state.lock`
    pub fn lock_dir(&self) -> PathBuf {
        self.plugin_root.join(".locks")
    }

    pub fn install_lock_path(&self, name: &str) -> PathBuf {
        self.lock_dir().join(format!("{name}.lock"))
    }

    pub fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.plugin_dir(name).join(version)
    }

    /// Executable of an installed plugin version
    pub fn binary_path(&self, name: &str, version: &str) -> PathBuf {
        self.version_dir(name, version).join(binary_name(name))
    }
}

/// File name a plugin binary is installed under
pub fn binary_name(name: &str) -> String {
    format!("release-pilot-{name}{}", std::env::consts::EXE_SUFFIX)
}

/// On-disk config file, `plugins:` section only
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    plugins: Option<PluginSettingsFile>,
}

#[derive(Debug, Default, Deserialize)]
struct PluginSettingsFile {
    dir: Option<PathBuf>,
    registry: Option<String>,
    cache_ttl_hours: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    execution_timeout_secs: Option<u64>,
    shutdown_grace_secs: Option<u64>,
}

impl SettingsFile {
    fn read(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

fn default_plugin_root() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("release-pilot").join("plugins");
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".release-pilot").join("plugins");
    }

    PathBuf::from(".release-pilot/plugins")
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("release-pilot").join("config.yml"))
}

fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if !text.starts_with('~') {
        return path.to_path_buf();
    }

    if let Some(home) = dirs::home_dir() {
        return PathBuf::from(text.replacen('~', &home.to_string_lossy(), 1));
    }

    path.to_path_buf()
}

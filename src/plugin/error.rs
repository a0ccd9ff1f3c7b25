//! Plugin subsystem error types with miette integration

use miette::Diagnostic;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginError>;

/// Phase of a plugin invocation that ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Handshake,
    Execution,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Handshake => write!(f, "handshake"),
            TimeoutPhase::Execution => write!(f, "execution"),
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum PluginError {
    #[error("plugin registry unavailable: {reason}")]
    #[diagnostic(
        code(plugin::registry_unavailable),
        help("Check your network connection or set RELEASE_PILOT_REGISTRY_URL")
    )]
    RegistryUnavailable { reason: String },

    #[error("plugin {name:?} not found in registry")]
    #[diagnostic(
        code(plugin::not_found),
        help("Run `release-pilot plugin list --available --refresh` to see available plugins")
    )]
    NotFound { name: String },

    #[error("checksum mismatch for plugin {name:?}: expected {expected}, got {actual}")]
    #[diagnostic(code(plugin::integrity))]
    IntegrityError {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("plugin {name:?} has no build for {os}/{arch}")]
    #[diagnostic(code(plugin::unsupported_platform))]
    UnsupportedPlatform {
        name: String,
        os: String,
        arch: String,
    },

    #[error("plugin {name:?} is not installed")]
    #[diagnostic(
        code(plugin::not_installed),
        help("Install it first with `release-pilot plugin install <name>`")
    )]
    NotInstalled { name: String },

    #[error(
        "plugin {plugin:?} speaks protocol version {advertised}, host supports {min}..={max}"
    )]
    #[diagnostic(
        code(plugin::protocol_incompatible),
        help("Update the plugin or release-pilot so both speak a common protocol version")
    )]
    ProtocolIncompatible {
        plugin: String,
        advertised: u32,
        min: u32,
        max: u32,
    },

    #[error("plugin {plugin:?} crashed: {reason}")]
    #[diagnostic(code(plugin::crashed))]
    PluginCrashed { plugin: String, reason: String },

    #[error("plugin {plugin:?} timed out during {phase} after {}s", timeout.as_secs_f64())]
    #[diagnostic(code(plugin::timeout))]
    PluginTimeout {
        plugin: String,
        phase: TimeoutPhase,
        timeout: Duration,
    },

    #[error("plugin {plugin:?} failed: {message}")]
    #[diagnostic(code(plugin::failed))]
    PluginFailed { plugin: String, message: String },

    #[error("no enabled plugin provides the {capability} capability")]
    #[diagnostic(
        code(plugin::no_provider),
        help("Install and enable a plugin for this capability")
    )]
    NoProvider { capability: String },

    #[error("plugin {plugin:?} does not provide the {capability} capability")]
    #[diagnostic(code(plugin::capability_mismatch))]
    CapabilityMismatch { plugin: String, capability: String },

    #[error("plugin state document {} is corrupted", path.display())]
    #[diagnostic(
        code(plugin::state_corrupted),
        help("Repair or delete the file; installed plugins will need to be reinstalled")
    )]
    StateCorrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid plugin name {name:?}")]
    #[diagnostic(
        code(plugin::invalid_name),
        help("Plugin names use lowercase letters, digits, '-' and '_', and start with a letter or digit")
    )]
    InvalidName { name: String },

    #[error("operation cancelled")]
    #[diagnostic(code(plugin::cancelled))]
    Cancelled,

    #[error("{context}")]
    #[diagnostic(code(plugin::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PluginError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PluginError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error blocks every state-dependent operation
    pub fn is_fatal(&self) -> bool {
        matches!(self, PluginError::StateCorrupted { .. })
    }
}

/// Attach a context message to `std::io::Error` results
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| PluginError::io(context(), source))
    }
}

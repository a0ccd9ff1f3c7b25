//! Plugin Host: runs one capability request against one plugin subprocess
//!
//! Every invocation spawns a fresh subprocess, reads its handshake line,
//! checks the advertised protocol version, makes a single `Execute` gRPC call
//! over the advertised transport and then shuts the subprocess down.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::transport::{Channel, Endpoint};

use super::capability::{Capability, CapabilityRequest, CapabilityResponse};
use super::error::{PluginError, Result, TimeoutPhase};
use super::handshake::{
    Handshake, MAX_HANDSHAKE_LEN, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, TransportKind,
};
use super::net::cancellable;
use super::protocol::ExecuteRequest;
use super::protocol::plugin_client::PluginClient;
use super::state::{StateStore, run_blocking};
use super::types::InstalledPlugin;
use crate::config::{ENV_PLUGIN, ENV_PROTOCOL_VERSION, Settings};

/// Lifecycle of a single invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Spawned,
    Handshaking,
    Ready,
    Executing,
    Completed,
    Failed,
    Crashed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: InvocationState,
    pub to: InvocationState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invocation transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Completed
                | InvocationState::Failed
                | InvocationState::Crashed
                | InvocationState::TimedOut
        )
    }

    /// Move to `next` if the lifecycle allows it
    pub fn advance(self, next: InvocationState) -> std::result::Result<Self, InvalidTransition> {
        use InvocationState::*;

        let allowed = match self {
            Spawned => matches!(next, Handshaking | Crashed | Failed),
            Handshaking => matches!(next, Ready | Crashed | TimedOut | Failed),
            Ready => matches!(next, Executing | Crashed | TimedOut | Failed),
            Executing => matches!(next, Completed | Failed | Crashed | TimedOut),
            Completed | Failed | Crashed | TimedOut => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationState::Spawned => "spawned",
            InvocationState::Handshaking => "handshaking",
            InvocationState::Ready => "ready",
            InvocationState::Executing => "executing",
            InvocationState::Completed => "completed",
            InvocationState::Failed => "failed",
            InvocationState::Crashed => "crashed",
            InvocationState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Dispatches capability requests to enabled plugins
#[derive(Debug, Clone)]
pub struct PluginHost {
    settings: Settings,
    state: StateStore,
}

impl PluginHost {
    pub fn new(settings: Settings, state: StateStore) -> Self {
        Self { settings, state }
    }

    /// Run `request` on the enabled plugin that provides its capability
    pub async fn execute(
        &self,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
    ) -> Result<CapabilityResponse> {
        let plugin = self.resolve_provider(request.capability()).await?;
        self.dispatch(&plugin, request, cancel).await
    }

    /// Run `request` on a specific plugin
    ///
    /// The plugin must be installed, enabled and declare the capability.
    pub async fn execute_with(
        &self,
        name: &str,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
    ) -> Result<CapabilityResponse> {
        let capability = request.capability();
        let state = self.state.clone();
        let lookup = name.to_string();
        let plugin = run_blocking(move || state.get(&lookup))
            .await?
            .ok_or_else(|| PluginError::NotInstalled {
                name: name.to_string(),
            })?;

        if plugin.category.capability() != Some(capability) {
            return Err(PluginError::CapabilityMismatch {
                plugin: name.to_string(),
                capability: capability.to_string(),
            });
        }
        if !plugin.enabled {
            tracing::warn!("Plugin {name} is installed but disabled");
            return Err(PluginError::NoProvider {
                capability: capability.to_string(),
            });
        }

        self.dispatch(&plugin, request, cancel).await
    }

    /// Find the enabled plugin serving `capability`
    ///
    /// When several are enabled the first by name wins.
    pub async fn resolve_provider(&self, capability: Capability) -> Result<InstalledPlugin> {
        let state = self.state.clone();
        let installed = run_blocking(move || state.installed()).await?;

        let mut providers: Vec<InstalledPlugin> = installed
            .into_iter()
            .filter(|plugin| plugin.enabled && plugin.category.capability() == Some(capability))
            .collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));

        if providers.len() > 1 {
            let names: Vec<&str> = providers.iter().map(|p| p.name.as_str()).collect();
            tracing::warn!(
                "Several enabled plugins provide {capability} ({}); using {}",
                names.join(", "),
                names[0]
            );
        }

        providers
            .into_iter()
            .next()
            .ok_or_else(|| PluginError::NoProvider {
                capability: capability.to_string(),
            })
    }

    async fn dispatch(
        &self,
        plugin: &InstalledPlugin,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
    ) -> Result<CapabilityResponse> {
        let capability = request.capability();
        let payload = request
            .to_payload()
            .map_err(|err| PluginError::PluginFailed {
                plugin: plugin.name.clone(),
                message: format!("failed to encode {capability} request: {err}"),
            })?;

        let response = self
            .invoke(&plugin.name, &plugin.path, capability, payload, cancel)
            .await?;

        CapabilityResponse::from_payload(capability, &response).map_err(|err| {
            PluginError::PluginFailed {
                plugin: plugin.name.clone(),
                message: format!("invalid {capability} response: {err}"),
            }
        })
    }

    /// Spawn `binary`, hand it one opaque payload and return its reply
    pub async fn invoke(
        &self,
        plugin: &str,
        binary: &Path,
        capability: Capability,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let mut invocation = Invocation::spawn(plugin, binary, self.settings.shutdown_grace)?;
        let result = self
            .run(&mut invocation, capability, payload, cancel)
            .await;

        let graceful = matches!(result, Ok(_) | Err(PluginError::PluginFailed { .. }));
        if graceful {
            invocation.shutdown().await;
        } else {
            invocation.kill().await;
        }

        result
    }

    async fn run(
        &self,
        invocation: &mut Invocation,
        capability: Capability,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let stdout = invocation
            .child
            .stdout
            .take()
            .ok_or_else(|| invocation.crashed("stdout was not captured"))?;

        invocation.transition(InvocationState::Handshaking);
        let mut reader = BufReader::new(stdout);
        let handshake = self.read_handshake(invocation, &mut reader, cancel).await?;

        if !handshake.is_compatible() {
            invocation.transition(InvocationState::Failed);
            return Err(PluginError::ProtocolIncompatible {
                plugin: invocation.plugin.clone(),
                advertised: handshake.protocol_version,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            });
        }
        invocation.transition(InvocationState::Ready);
        forward_stdout(invocation.plugin.clone(), reader);

        let timeout = self.settings.handshake_timeout;
        let channel = match cancellable(cancel, tokio::time::timeout(timeout, connect(&handshake)))
            .await
        {
            None => return Err(invocation.cancelled()),
            Some(Err(_)) => return Err(invocation.timed_out(TimeoutPhase::Handshake, timeout)),
            Some(Ok(Err(reason))) => {
                return Err(invocation.crashed(format!(
                    "failed to connect to {}: {reason}",
                    handshake.address
                )));
            }
            Some(Ok(Ok(channel))) => channel,
        };

        invocation.transition(InvocationState::Executing);
        let mut client = PluginClient::new(channel);
        let request = ExecuteRequest {
            capability: capability.as_str().to_string(),
            payload,
        };

        let timeout = self.settings.execution_timeout;
        match cancellable(cancel, tokio::time::timeout(timeout, client.execute(request))).await {
            None => Err(invocation.cancelled()),
            Some(Err(_)) => Err(invocation.timed_out(TimeoutPhase::Execution, timeout)),
            Some(Ok(Err(status))) => Err(invocation.rpc_error(status).await),
            Some(Ok(Ok(response))) => {
                invocation.transition(InvocationState::Completed);
                Ok(response.into_inner().payload)
            }
        }
    }

    async fn read_handshake(
        &self,
        invocation: &mut Invocation,
        reader: &mut BufReader<ChildStdout>,
        cancel: &CancellationToken,
    ) -> Result<Handshake> {
        let timeout = self.settings.handshake_timeout;
        let mut line = String::new();
        let read = {
            let mut limited = (&mut *reader).take(MAX_HANDSHAKE_LEN);
            cancellable(cancel, tokio::time::timeout(timeout, limited.read_line(&mut line))).await
        };

        match read {
            None => return Err(invocation.cancelled()),
            Some(Err(_)) => return Err(invocation.timed_out(TimeoutPhase::Handshake, timeout)),
            Some(Ok(Err(err))) => {
                return Err(invocation.crashed(format!("unreadable handshake: {err}")));
            }
            Some(Ok(Ok(0))) => {
                let exit = invocation.exit_description().await;
                return Err(invocation.crashed(format!("exited before handshake ({exit})")));
            }
            Some(Ok(Ok(_))) => {}
        }

        if !line.ends_with('\n') && line.len() as u64 >= MAX_HANDSHAKE_LEN {
            return Err(invocation.crashed(format!(
                "handshake line exceeds {MAX_HANDSHAKE_LEN} bytes"
            )));
        }

        let handshake = line
            .parse::<Handshake>()
            .map_err(|err| invocation.crashed(err.to_string()))?;
        tracing::debug!("Plugin {} handshake: {handshake}", invocation.plugin);
        Ok(handshake)
    }
}

/// A spawned plugin subprocess and where it is in its lifecycle
struct Invocation {
    plugin: String,
    state: InvocationState,
    child: Child,
    grace: Duration,
}

impl Invocation {
    fn spawn(plugin: &str, binary: &Path, grace: Duration) -> Result<Self> {
        tracing::debug!("Spawning plugin {plugin} from {}", binary.display());

        let child = Command::new(binary)
            .env(ENV_PLUGIN, "1")
            .env(ENV_PROTOCOL_VERSION, PROTOCOL_VERSION.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PluginError::PluginCrashed {
                plugin: plugin.to_string(),
                reason: format!("failed to start {}: {err}", binary.display()),
            })?;

        Ok(Self {
            plugin: plugin.to_string(),
            state: InvocationState::Spawned,
            child,
            grace,
        })
    }

    fn transition(&mut self, next: InvocationState) {
        match self.state.advance(next) {
            Ok(state) => {
                tracing::debug!("Plugin {}: {} -> {}", self.plugin, self.state, state);
                self.state = state;
            }
            Err(err) => tracing::error!("Plugin {}: {err}", self.plugin),
        }
    }

    fn crashed(&mut self, reason: impl Into<String>) -> PluginError {
        self.transition(InvocationState::Crashed);
        PluginError::PluginCrashed {
            plugin: self.plugin.clone(),
            reason: reason.into(),
        }
    }

    fn timed_out(&mut self, phase: TimeoutPhase, timeout: Duration) -> PluginError {
        self.transition(InvocationState::TimedOut);
        PluginError::PluginTimeout {
            plugin: self.plugin.clone(),
            phase,
            timeout,
        }
    }

    fn cancelled(&mut self) -> PluginError {
        self.transition(InvocationState::Failed);
        PluginError::Cancelled
    }

    /// Classify a gRPC status: a dead or unreachable plugin crashed, a live one failed
    async fn rpc_error(&mut self, status: tonic::Status) -> PluginError {
        let transport_level = matches!(status.code(), Code::Unavailable | Code::Unknown);
        let exited = if transport_level {
            tokio::time::timeout(Duration::from_millis(200), self.child.wait())
                .await
                .ok()
                .and_then(|wait| wait.ok())
        } else {
            self.child.try_wait().ok().flatten()
        };

        if let Some(exit) = exited {
            return self.crashed(format!("{exit} before responding: {}", status.message()));
        }
        if status.code() == Code::Unavailable {
            return self.crashed(format!("connection lost: {}", status.message()));
        }

        self.transition(InvocationState::Failed);
        let message = if status.message().is_empty() {
            format!("{:?}", status.code())
        } else {
            status.message().to_string()
        };
        PluginError::PluginFailed {
            plugin: self.plugin.clone(),
            message,
        }
    }

    async fn exit_description(&mut self) -> String {
        match tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(err)) => format!("exit status unknown: {err}"),
            Err(_) => "stdout closed".to_string(),
        }
    }

    /// SIGTERM, wait out the grace period, then force-kill
    async fn shutdown(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.report_exit(status);
            return;
        }

        self.terminate();
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => self.report_exit(status),
            Ok(Err(err)) => tracing::debug!("Failed to wait for plugin {}: {err}", self.plugin),
            Err(_) => {
                tracing::warn!(
                    "Plugin {} did not exit within {}s; killing it",
                    self.plugin,
                    self.grace.as_secs_f64()
                );
                self.kill().await;
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!("Failed to kill plugin {}: {err}", self.plugin);
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        let Some(pid) = self.child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return;
        };
        // SAFETY: `pid` belongs to a child we have not reaped yet
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    fn report_exit(&self, status: ExitStatus) {
        if self.state == InvocationState::Completed && status.code().is_some_and(|code| code != 0)
        {
            tracing::warn!(
                "Plugin {} exited with {status} after responding",
                self.plugin
            );
        } else {
            tracing::debug!("Plugin {} exited with {status}", self.plugin);
        }
    }
}

/// Keep draining the plugin's stdout so it never blocks on a full pipe
fn forward_stdout(plugin: String, reader: BufReader<ChildStdout>) {
    tokio::spawn(async move {
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("[{plugin}] {line}");
        }
    });
}

async fn connect(handshake: &Handshake) -> std::result::Result<Channel, String> {
    match handshake.transport {
        TransportKind::Tcp => {
            let endpoint = Endpoint::from_shared(format!("http://{}", handshake.address))
                .map_err(|err| err.to_string())?;
            endpoint.connect().await.map_err(|err| err.to_string())
        }
        TransportKind::Unix => connect_unix(PathBuf::from(&handshake.address)).await,
    }
}

#[cfg(unix)]
async fn connect_unix(path: PathBuf) -> std::result::Result<Channel, String> {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tonic::transport::Uri;
    use tower::service_fn;

    // The URI is never dialled; the connector opens the socket instead
    Endpoint::from_static("http://plugin.local")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .map_err(|err| err.to_string())
}

#[cfg(not(unix))]
async fn connect_unix(path: PathBuf) -> std::result::Result<Channel, String> {
    Err(format!(
        "unix socket {} is not supported on this platform",
        path.display()
    ))
}

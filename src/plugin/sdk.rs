//! Plugin-side runtime
//!
//! A plugin binary implements [`CapabilityHandler`] and calls [`serve`], which
//! binds a loopback port, prints the handshake line on stdout and answers
//! `Execute` calls until the host sends SIGTERM.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use super::capability::{Capability, CapabilityRequest, CapabilityResponse};
use super::handshake::Handshake;
use super::protocol::plugin_server::{Plugin, PluginServer};
use super::protocol::{ExecuteRequest, ExecuteResponse};
use crate::config::ENV_PLUGIN;

pub use tonic::async_trait;

/// Business logic of a plugin
#[tonic::async_trait]
pub trait CapabilityHandler: Send + Sync + 'static {
    async fn handle(&self, request: CapabilityRequest) -> Result<CapabilityResponse>;
}

/// Whether this process was spawned by the release-pilot host
pub fn launched_by_host() -> bool {
    std::env::var(ENV_PLUGIN).is_ok_and(|value| value == "1")
}

/// Serve `handler` on an ephemeral loopback port until SIGTERM or Ctrl-C
pub async fn serve<H: CapabilityHandler>(handler: H) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("Failed to bind plugin listener")?;
    let addr = listener
        .local_addr()
        .context("Failed to read plugin listener address")?;

    announce(&Handshake::tcp(addr))?;
    tracing::debug!("Serving plugin protocol on {addr}");

    serve_on(listener, handler, shutdown_signal()).await
}

/// Serve `handler` on an existing listener until `shutdown` resolves
pub async fn serve_on<H, F>(listener: TcpListener, handler: H, shutdown: F) -> Result<()>
where
    H: CapabilityHandler,
    F: Future<Output = ()>,
{
    Server::builder()
        .add_service(PluginServer::new(PluginService::new(handler)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("Plugin server failed")
}

/// Serve `handler` on a unix socket listener until `shutdown` resolves
#[cfg(unix)]
pub async fn serve_on_unix<H, F>(
    listener: tokio::net::UnixListener,
    handler: H,
    shutdown: F,
) -> Result<()>
where
    H: CapabilityHandler,
    F: Future<Output = ()>,
{
    use tokio_stream::wrappers::UnixListenerStream;

    Server::builder()
        .add_service(PluginServer::new(PluginService::new(handler)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .context("Plugin server failed")
}

fn announce(handshake: &Handshake) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{handshake}").context("Failed to write handshake")?;
    stdout.flush().context("Failed to flush handshake")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::debug!("Shutdown requested");
}

struct PluginService<H> {
    handler: Arc<H>,
}

impl<H> PluginService<H> {
    fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[tonic::async_trait]
impl<H: CapabilityHandler> Plugin for PluginService<H> {
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> std::result::Result<Response<ExecuteResponse>, Status> {
        let ExecuteRequest {
            capability,
            payload,
        } = request.into_inner();

        let capability: Capability = capability.parse().map_err(Status::invalid_argument)?;
        let request = CapabilityRequest::from_payload(capability, &payload).map_err(|err| {
            Status::invalid_argument(format!("invalid {capability} payload: {err}"))
        })?;

        let response = self
            .handler
            .handle(request)
            .await
            .map_err(|err| Status::internal(format!("{err:#}")))?;

        if response.capability() != capability {
            return Err(Status::internal(format!(
                "handler answered a {capability} request with a {} response",
                response.capability()
            )));
        }

        let payload = response
            .to_payload()
            .map_err(|err| Status::internal(format!("failed to encode response: {err}")))?;
        Ok(Response::new(ExecuteResponse { payload }))
    }
}

use anyhow::Result;
use release_pilot::plugin::capability::{
    ContainerResponse, NotificationResponse, PackageManagerResponse, ProjectManagementResponse,
    VcsAction, VcsResponse,
};
use release_pilot::plugin::sdk::{self, CapabilityHandler};
use release_pilot::plugin::{CapabilityRequest, CapabilityResponse};

const PLUGIN_NAME: &str = "echo";
const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Acknowledges every request without side effects
struct Echo;

#[sdk::async_trait]
impl CapabilityHandler for Echo {
    async fn handle(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
        tracing::info!("Handling {} request", request.capability());

        let response = match request {
            CapabilityRequest::Vcs(req) => {
                let action = match req.action {
                    VcsAction::CreateRelease => "release",
                    VcsAction::Tag => "tag",
                    VcsAction::Comment => "comment",
                };
                CapabilityResponse::Vcs(VcsResponse {
                    url: None,
                    id: Some(format!("{}#{action}:{}", req.repository, req.tag)),
                })
            }
            CapabilityRequest::Notification(req) => {
                tracing::info!("[{}] {}", req.channel, req.message);
                CapabilityResponse::Notification(NotificationResponse {
                    delivered: true,
                    message_id: req.release_version,
                })
            }
            CapabilityRequest::PackageManager(req) => {
                CapabilityResponse::PackageManager(PackageManagerResponse {
                    published: !req.dry_run,
                    location: Some(format!("{}@{}", req.package, req.version)),
                })
            }
            CapabilityRequest::ProjectManagement(req) => {
                CapabilityResponse::ProjectManagement(ProjectManagementResponse {
                    updated: req.issues,
                })
            }
            CapabilityRequest::Container(req) => CapabilityResponse::Container(ContainerResponse {
                pushed: !req.dry_run,
                digest: None,
            }),
        };

        Ok(response)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("release_pilot_echo=info".parse()?),
        )
        .with_target(false)
        .without_time()
        .init();

    if !sdk::launched_by_host() {
        eprintln!("{PLUGIN_NAME} is a release-pilot plugin and is started by release-pilot itself.");
        eprintln!("Install it with `release-pilot plugin install {PLUGIN_NAME}`.");
        std::process::exit(1);
    }

    tracing::info!("Starting {PLUGIN_NAME} v{PLUGIN_VERSION}");
    sdk::serve(Echo).await
}

/// Integration tests for the plugin lifecycle
///
/// A wiremock server plays the registry and the artifact host; every test gets
/// its own plugin root in a temporary directory.
use release_pilot::config::Settings;
use release_pilot::plugin::installer::sha256_hex;
use release_pilot::plugin::types::Platform;
use release_pilot::plugin::{InstallOutcome, PluginError, PluginManager, PluginState};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ARTIFACT: &[u8] = b"#!/bin/sh\necho release-pilot test plugin\n";

fn settings(root: &Path, server: &MockServer) -> Settings {
    let mut settings = Settings::with_root(root);
    settings.registry_url = format!("{}/registry.json", server.uri());
    settings.retry_backoff = Duration::from_millis(10);
    settings
}

fn manager(root: &Path, server: &MockServer) -> PluginManager {
    PluginManager::new(settings(root, server)).unwrap()
}

fn entry(server: &MockServer, name: &str, version: &str, category: &str) -> Value {
    let platform = Platform::current();
    json!({
        "name": name,
        "latest_version": version,
        "description": format!("{name} integration"),
        "category": category,
        "platforms": [{
            "os": platform.os,
            "arch": platform.arch,
            "url": format!("{}/artifacts/{name}-{version}", server.uri()),
            "checksum": format!("sha256:{}", sha256_hex(ARTIFACT)),
        }],
    })
}

async fn mount_registry(server: &MockServer, plugins: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "plugins": plugins })))
        .mount(server)
        .await;
}

async fn mount_artifact(server: &MockServer, name: &str, version: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/artifacts/{name}-{version}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .mount(server)
        .await;
}

fn version_dirs(root: &Path, name: &str) -> Vec<String> {
    let mut dirs: Vec<String> = fs::read_dir(root.join(name))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

fn staging_is_empty(root: &Path) -> bool {
    fs::read_dir(root.join(".staging"))
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[tokio::test]
async fn test_install_unknown_plugin_is_not_found() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let err = manager.install("nope", &cancel).await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound { ref name } if name == "nope"));

    let installed = manager.list_installed(&cancel).await.unwrap();
    assert!(installed.entries.is_empty());
    assert!(!root.path().join("state.json").exists());
}

#[tokio::test]
async fn test_install_without_platform_build_is_unsupported() {
    let server = MockServer::start().await;
    let mut docker = entry(&server, "docker", "1.2.0", "container");
    docker["platforms"] = json!([{
        "os": "plan9",
        "arch": "mips",
        "url": format!("{}/artifacts/docker-1.2.0", server.uri()),
        "checksum": sha256_hex(ARTIFACT),
    }]);
    mount_registry(&server, vec![docker]).await;
    Mock::given(method("GET"))
        .and(path("/artifacts/docker-1.2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .expect(0)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let err = manager.install("docker", &cancel).await.unwrap_err();
    assert!(matches!(err, PluginError::UnsupportedPlatform { ref name, .. } if name == "docker"));
    assert!(manager.list_installed(&cancel).await.unwrap().entries.is_empty());
    assert!(!root.path().join("docker").exists());
}

#[tokio::test]
async fn test_update_available_after_registry_refresh() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let outcome = manager.install("docker", &cancel).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::Installed {
            version: "1.2.0".to_string()
        }
    );

    let installed = manager.list_installed(&cancel).await.unwrap();
    assert_eq!(installed.entries.len(), 1);
    assert_eq!(installed.entries[0].state, PluginState::Installed);

    server.reset().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.3.0", "container")]).await;
    manager.list_available(true, &cancel).await.unwrap();

    let installed = manager.list_installed(&cancel).await.unwrap();
    let docker = &installed.entries[0];
    assert_eq!(docker.name(), "docker");
    assert_eq!(docker.version(), "1.2.0");
    assert_eq!(docker.latest_version(), Some("1.3.0"));
    assert_eq!(docker.state, PluginState::UpdateAvailable);
}

#[tokio::test]
async fn test_enable_requires_install() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let err = manager.enable("docker").await.unwrap_err();
    assert!(matches!(err, PluginError::NotInstalled { ref name } if name == "docker"));

    manager.install("docker", &cancel).await.unwrap();
    manager.enable("docker").await.unwrap();

    let installed = manager.list_installed(&cancel).await.unwrap();
    assert_eq!(installed.entries[0].state, PluginState::Enabled);
}

#[tokio::test]
async fn test_disable_then_enable_restores_flag() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "slack", "0.4.0", "notification")]).await;
    Mock::given(method("GET"))
        .and(path("/artifacts/slack-0.4.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .expect(1)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    manager.install("slack", &cancel).await.unwrap();
    manager.enable("slack").await.unwrap();
    manager.disable("slack").await.unwrap();
    assert_eq!(
        manager.list_installed(&cancel).await.unwrap().entries[0].state,
        PluginState::Installed
    );

    manager.enable("slack").await.unwrap();
    assert_eq!(
        manager.list_installed(&cancel).await.unwrap().entries[0].state,
        PluginState::Enabled
    );
}

#[tokio::test]
async fn test_disable_unknown_plugin_is_noop() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);

    manager.disable("never-installed").await.unwrap();
    manager.disable("never-installed").await.unwrap();
}

#[tokio::test]
async fn test_install_is_idempotent_per_version() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    Mock::given(method("GET"))
        .and(path("/artifacts/docker-1.2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .expect(1)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    manager.install("docker", &cancel).await.unwrap();
    let binary = root
        .path()
        .join("docker/1.2.0")
        .join(release_pilot::config::binary_name("docker"));
    let first = fs::read(&binary).unwrap();

    let outcome = manager.install("docker", &cancel).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::AlreadyAtVersion {
            version: "1.2.0".to_string()
        }
    );

    assert_eq!(fs::read(&binary).unwrap(), first);
    assert_eq!(version_dirs(root.path(), "docker"), vec!["1.2.0"]);

    let state: Value =
        serde_json::from_str(&fs::read_to_string(root.path().join("state.json")).unwrap()).unwrap();
    assert_eq!(state["plugins"].as_object().unwrap().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_installed_binary_is_executable() {
    use std::os::unix::fs::PermissionsExt;

    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);

    manager
        .install("docker", &CancellationToken::new())
        .await
        .unwrap();

    let binary = root
        .path()
        .join("docker/1.2.0")
        .join(release_pilot::config::binary_name("docker"));
    let mode = fs::metadata(binary).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
    assert!(staging_is_empty(root.path()));
}

#[tokio::test]
async fn test_upgrade_keeps_enabled_flag_and_replaces_version() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    manager.install("docker", &cancel).await.unwrap();
    manager.enable("docker").await.unwrap();

    server.reset().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.3.0", "container")]).await;
    mount_artifact(&server, "docker", "1.3.0").await;

    let outcome = manager.update("docker", &cancel).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::Upgraded {
            from: "1.2.0".to_string(),
            to: "1.3.0".to_string()
        }
    );

    assert_eq!(version_dirs(root.path(), "docker"), vec!["1.3.0"]);
    let installed = manager.list_installed(&cancel).await.unwrap();
    assert_eq!(installed.entries[0].version(), "1.3.0");
    assert_eq!(installed.entries[0].state, PluginState::Enabled);
}

#[tokio::test]
async fn test_update_requires_install() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);

    let err = manager
        .update("docker", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::NotInstalled { .. }));
}

#[tokio::test]
async fn test_uninstall_removes_directory_and_entry() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let err = manager.uninstall("docker", &cancel).await.unwrap_err();
    assert!(matches!(err, PluginError::NotInstalled { .. }));

    manager.install("docker", &cancel).await.unwrap();
    manager.enable("docker").await.unwrap();
    manager.uninstall("docker", &cancel).await.unwrap();

    assert!(!root.path().join("docker").exists());
    assert!(manager.list_installed(&cancel).await.unwrap().entries.is_empty());

    // Reinstalling starts from a clean, disabled entry
    manager.install("docker", &cancel).await.unwrap();
    assert_eq!(
        manager.list_installed(&cancel).await.unwrap().entries[0].state,
        PluginState::Installed
    );
}

#[tokio::test]
async fn test_fresh_cache_makes_no_network_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "plugins": [
                entry(&server, "github", "2.0.0", "vcs"),
                entry(&server, "docker", "1.2.0", "container"),
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let first = manager(root.path(), &server)
        .list_available(false, &cancel)
        .await
        .unwrap();

    // A new manager over the same root stands in for a later CLI run
    let second = manager(root.path(), &server)
        .list_available(false, &cancel)
        .await
        .unwrap();

    assert!(!second.stale);
    assert_eq!(first.entries, second.entries);
    let names: Vec<&str> = second.entries.iter().map(|entry| entry.name()).collect();
    assert_eq!(names, vec!["github", "docker"]);
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "plugins": [entry(&server, "docker", "1.2.0", "container")] }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let (a, b, c) = tokio::join!(
        manager.list_available(true, &cancel),
        manager.list_available(true, &cancel),
        manager.list_available(true, &cancel),
    );
    for list in [a, b, c] {
        assert_eq!(list.unwrap().entries.len(), 1);
    }
}

#[tokio::test]
async fn test_unchanged_registry_is_revalidated_with_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(json!({ "plugins": [entry(&server, "docker", "1.2.0", "container")] })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let first = manager.list_available(true, &cancel).await.unwrap();
    let second = manager.list_available(true, &cancel).await.unwrap();

    assert_eq!(first.entries, second.entries);
    assert!(second.fetched_at >= first.fetched_at);
    assert!(!second.stale);
}

#[tokio::test]
async fn test_unreachable_registry_falls_back_to_stale_cache() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    manager(root.path(), &server)
        .list_available(true, &cancel)
        .await
        .unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let mut expired = settings(root.path(), &server);
    expired.cache_ttl = Duration::ZERO;
    let list = PluginManager::new(expired)
        .unwrap()
        .list_available(false, &cancel)
        .await
        .unwrap();

    assert!(list.stale);
    assert_eq!(list.entries.len(), 1);
    assert_eq!(list.entries[0].name(), "docker");
}

#[tokio::test]
async fn test_unreachable_registry_without_cache_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();

    let err = manager(root.path(), &server)
        .list_available(false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::RegistryUnavailable { .. }));
}

#[tokio::test]
async fn test_missing_registry_document_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();

    let err = manager(root.path(), &server)
        .list_available(true, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::RegistryUnavailable { .. }));
}

#[tokio::test]
async fn test_checksum_mismatch_is_integrity_error() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    Mock::given(method("GET"))
        .and(path("/artifacts/docker-1.2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .expect(2)
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let err = manager.install("docker", &cancel).await.unwrap_err();
    match err {
        PluginError::IntegrityError {
            name,
            expected,
            actual,
        } => {
            assert_eq!(name, "docker");
            assert_eq!(expected, sha256_hex(ARTIFACT));
            assert_eq!(actual, sha256_hex(b"tampered"));
        }
        other => panic!("expected IntegrityError, got {other:?}"),
    }

    assert!(!root.path().join("docker").exists());
    assert!(staging_is_empty(root.path()));
    assert!(manager.list_installed(&cancel).await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_transient_download_failures_are_retried() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    Mock::given(method("GET"))
        .and(path("/artifacts/docker-1.2.0"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();

    let outcome = manager(root.path(), &server)
        .install("docker", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.version(), "1.2.0");
}

#[tokio::test]
async fn test_concurrent_installs_of_distinct_plugins() {
    let server = MockServer::start().await;
    mount_registry(
        &server,
        vec![
            entry(&server, "docker", "1.2.0", "container"),
            entry(&server, "slack", "0.4.0", "notification"),
        ],
    )
    .await;
    mount_artifact(&server, "docker", "1.2.0").await;
    mount_artifact(&server, "slack", "0.4.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let (docker, slack) = tokio::join!(
        manager.install("docker", &cancel),
        manager.install("slack", &cancel)
    );
    docker.unwrap();
    slack.unwrap();

    let installed = manager.list_installed(&cancel).await.unwrap();
    let names: Vec<&str> = installed.entries.iter().map(|entry| entry.name()).collect();
    assert_eq!(names, vec!["docker", "slack"]);
}

#[tokio::test]
async fn test_concurrent_installs_of_same_plugin_leave_one_version() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    Mock::given(method("GET"))
        .and(path("/artifacts/docker-1.2.0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(ARTIFACT)
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&server)
        .await;
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    // Separate managers share only the filesystem, like two CLI processes
    let first = manager(root.path(), &server);
    let second = manager(root.path(), &server);
    let (a, b) = tokio::join!(
        first.install("docker", &cancel),
        second.install("docker", &cancel)
    );

    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, InstallOutcome::Installed { .. }))
            .count(),
        1
    );

    assert_eq!(version_dirs(root.path(), "docker"), vec!["1.2.0"]);
    let binary = root
        .path()
        .join("docker/1.2.0")
        .join(release_pilot::config::binary_name("docker"));
    assert_eq!(fs::read(binary).unwrap(), ARTIFACT);

    let installed = first.list_installed(&cancel).await.unwrap();
    assert_eq!(installed.entries.len(), 1);
    assert_eq!(installed.entries[0].version(), "1.2.0");
    assert!(staging_is_empty(root.path()));
}

#[tokio::test]
async fn test_installed_list_survives_unreachable_registry() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    manager(root.path(), &server)
        .install("docker", &cancel)
        .await
        .unwrap();
    fs::remove_file(root.path().join("registry-cache.json")).unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/registry.json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let manager = manager(root.path(), &server);
    let installed = manager.list_installed(&cancel).await.unwrap();
    assert!(installed.stale);
    assert_eq!(installed.entries[0].description(), "docker integration");
    assert_eq!(installed.entries[0].latest_version(), None);

    let info = manager.info("docker", &cancel).await.unwrap();
    assert_eq!(info.version(), "1.2.0");
    assert!(info.info.is_none());
}

#[tokio::test]
async fn test_cancelled_install_changes_nothing() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    mount_artifact(&server, "docker", "1.2.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager.install("docker", &cancel).await.unwrap_err();
    assert!(matches!(err, PluginError::Cancelled));
    assert!(!root.path().join("docker").exists());
}

#[tokio::test]
async fn test_plugin_named_state_installs_without_deadlock() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "state", "1.0.0", "other")]).await;
    mount_artifact(&server, "state", "1.0.0").await;
    let root = TempDir::new().unwrap();
    let manager = manager(root.path(), &server);
    let cancel = CancellationToken::new();

    let outcome = tokio::time::timeout(Duration::from_secs(10), manager.install("state", &cancel))
        .await
        .expect("install of a plugin named state hung")
        .unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::Installed {
            version: "1.0.0".to_string()
        }
    );

    tokio::time::timeout(Duration::from_secs(10), manager.enable("state"))
        .await
        .expect("enable hung")
        .unwrap();
    let installed = manager.list_installed(&cancel).await.unwrap();
    assert_eq!(installed.entries.len(), 1);
    assert_eq!(installed.entries[0].state, PluginState::Enabled);
    assert!(root.path().join(".locks/state.lock").exists());
    assert!(root.path().join("state.json").is_file());
}

#[tokio::test]
async fn test_registry_names_outside_plugin_root_are_ignored() {
    let server = MockServer::start().await;
    mount_registry(
        &server,
        vec![
            entry(&server, "..", "1.0.0", "other"),
            entry(&server, "a/b", "1.0.0", "other"),
            entry(&server, "docker", "1.2.0", "container"),
        ],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/artifacts/..-1.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/artifacts/a/b-1.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ARTIFACT))
        .expect(0)
        .mount(&server)
        .await;

    let parent = TempDir::new().unwrap();
    let root = parent.path().join("plugins");
    let manager = manager(&root, &server);
    let cancel = CancellationToken::new();

    let available = manager.list_available(false, &cancel).await.unwrap();
    let names: Vec<_> = available.entries.iter().map(|entry| entry.name().to_string()).collect();
    assert_eq!(names, ["docker"]);

    for name in ["..", "a/b"] {
        let err = manager.install(name, &cancel).await.unwrap_err();
        assert!(
            matches!(err, PluginError::InvalidName { name: ref rejected } if rejected == name),
            "unexpected error for {name:?}: {err}"
        );
    }

    assert!(!parent.path().join("1.0.0").exists());
    assert!(!root.join("a").exists());
    assert!(staging_is_empty(&root));
    assert!(manager.list_installed(&cancel).await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_names_outside_plugin_root_never_touch_the_filesystem() {
    let server = MockServer::start().await;
    mount_registry(&server, vec![entry(&server, "docker", "1.2.0", "container")]).await;
    let parent = TempDir::new().unwrap();
    let precious = parent.path().join("precious.txt");
    fs::write(&precious, "keep me").unwrap();
    let root = parent.path().join("plugins");
    let manager = manager(&root, &server);
    let cancel = CancellationToken::new();

    for name in ["..", "a/b", ".locks", ""] {
        assert!(matches!(
            manager.uninstall(name, &cancel).await,
            Err(PluginError::InvalidName { .. })
        ));
        assert!(matches!(manager.enable(name).await, Err(PluginError::InvalidName { .. })));
        assert!(matches!(manager.disable(name).await, Err(PluginError::InvalidName { .. })));
        assert!(matches!(
            manager.info(name, &cancel).await,
            Err(PluginError::InvalidName { .. })
        ));
        assert!(matches!(
            manager.update(name, &cancel).await,
            Err(PluginError::InvalidName { .. })
        ));
    }

    assert_eq!(fs::read_to_string(&precious).unwrap(), "keep me");
    assert!(!root.join(".locks").exists());
}

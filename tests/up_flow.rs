//! End-to-end `up` through the client, host agent and container agent.

mod common;

use common::{free_port, Harness, HarnessOptions};
use kled::orchestrator::UpOptions;
use kled::provider::MachineState;
use kled::runtime::ContainerState;
use kled_agent::credentials::HelperClient;
use kled_protocol::ForwardingFeatures;
use std::sync::atomic::Ordering;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn devcontainer(harness: &Harness, required: bool) -> String {
    let log = harness.hook_log().display().to_string();
    let required = if required {
        r#""customizations": { "kled": { "requiredHooks": ["postCreateCommand"] } },"#
    } else {
        ""
    };
    format!(
        r#"{{
            // comments are allowed
            "build": {{ "dockerfile": "Dockerfile" }},
            {required}
            "onCreateCommand": "echo created >> {log}",
            "postCreateCommand": "exit 3",
            "postStartCommand": "echo started >> {log}"
        }}"#
    )
}

fn options(source: &std::path::Path) -> UpOptions {
    UpOptions {
        source: Some(source.display().to_string()),
        name: Some("demo".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_up_creates_machine_builds_and_serves_ssh() {
    let harness = Harness::new();
    let source = harness.source(&devcontainer(&harness, false));

    let stages = parking_lot::Mutex::new(Vec::new());
    let session = tokio::time::timeout(
        WAIT,
        harness.orchestrator.up(options(&source), |stage, _| {
            stages.lock().push(stage.to_string())
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(harness.provider.state(), MachineState::Running);
    assert_eq!(harness.provider.creates.load(Ordering::SeqCst), 1);
    assert_eq!(harness.provider.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runtime.builds.load(Ordering::SeqCst), 1);
    assert!(stages.lock().iter().any(|s| s == "build"));

    // the failing optional hook is reported, not fatal
    assert_eq!(harness.hook_lines(), vec!["created", "started"]);
    assert!(session
        .warnings()
        .iter()
        .any(|w| w.contains("postCreateCommand")));

    let workspace = session.workspace().clone();
    assert_eq!(workspace.machine_id.as_deref(), Some(workspace.id.as_str()));
    let container = harness.runtime.container(&workspace.id).unwrap();
    assert_eq!(workspace.container_id.as_deref(), Some(container.id.as_str()));

    let mut ssh = session.open_ssh().await.unwrap();
    ssh.write(b"SSH-2.0-kled\r\n").await.unwrap();
    let echoed = tokio::time::timeout(WAIT, ssh.read()).await.unwrap().unwrap();
    assert_eq!(echoed, b"SSH-2.0-kled\r\n");
    ssh.close().await;

    session.close().await.unwrap();

    let stored = harness.orchestrator.store().workspace("demo").unwrap();
    assert_eq!(stored.container_id, workspace.container_id);
    assert_eq!(stored.machine_id, workspace.machine_id);
}

#[tokio::test]
async fn test_second_up_reuses_machine_and_container() {
    let harness = Harness::new();
    let source = harness.source(&devcontainer(&harness, false));

    let first = harness
        .orchestrator
        .up(options(&source), |_, _| {})
        .await
        .unwrap();
    let container = first.workspace().container_id.clone();
    first.close().await.unwrap();

    let mut second = harness
        .orchestrator
        .up(options(&source), |_, _| {})
        .await
        .unwrap();
    assert_eq!(second.workspace().container_id, container);
    assert!(second.ping().await.unwrap() > 0);
    second.close().await.unwrap();

    assert_eq!(harness.provider.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runtime.builds.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runtime.creates.load(Ordering::SeqCst), 1);
    // onCreate runs once per container, postStart on every start
    assert_eq!(harness.hook_lines(), vec!["created", "started", "started"]);
}

#[tokio::test]
async fn test_required_hook_failure_is_bootstrap_error() {
    let harness = Harness::new();
    let source = harness.source(&devcontainer(&harness, true));

    let err = match harness
        .orchestrator
        .up(options(&source), |_, _| {})
        .await
    {
        Ok(_) => panic!("up should fail"),
        Err(e) => e,
    };
    assert!(err.is_bootstrap(), "unexpected error: {}", err);
    assert!(err.to_string().contains("postCreateCommand"));
    // the later phase never ran
    assert_eq!(harness.hook_lines(), vec!["created"]);
}

#[tokio::test]
async fn test_transient_start_failures_are_retried() {
    let harness = Harness::with_options(HarnessOptions {
        flaky_starts: 2,
        ..Default::default()
    });
    let source = harness.source(&devcontainer(&harness, false));

    let session = harness
        .orchestrator
        .up(options(&source), |_, _| {})
        .await
        .unwrap();
    session.close().await.unwrap();

    assert_eq!(harness.provider.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.provider.state(), MachineState::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_credentials_forward_only_enabled_types() {
    let port = free_port();
    let harness = Harness::with_options(HarnessOptions {
        credentials_port: Some(port),
        ..Default::default()
    });
    let source = harness.source(&devcontainer(&harness, false));

    let mut up = options(&source);
    up.features = ForwardingFeatures {
        git_credentials: true,
        ..Default::default()
    };
    let session = harness.orchestrator.up(up, |_, _| {}).await.unwrap();

    let (git, docker) = tokio::task::spawn_blocking(move || {
        let client = HelperClient::new(port).unwrap();
        let mut git = None;
        for _ in 0..100 {
            git = client.git("get", "protocol=https\nhost=github.com\n\n");
            if git.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let docker = client.docker("get", "ghcr.io\n");
        (git, docker)
    })
    .await
    .unwrap();

    let git = git.expect("git credentials");
    assert!(git.contains("password=token"));
    assert!(git.contains("host=github.com"));
    assert_eq!(docker, None);
    assert_eq!(harness.credentials.git.load(Ordering::SeqCst), 1);
    assert_eq!(harness.credentials.docker.load(Ordering::SeqCst), 0);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_and_delete() {
    let harness = Harness::new();
    let source = harness.source(&devcontainer(&harness, false));
    let session = harness
        .orchestrator
        .up(options(&source), |_, _| {})
        .await
        .unwrap();
    let id = session.workspace().id.clone();
    session.close().await.unwrap();

    harness.orchestrator.stop("demo").await.unwrap();
    assert_eq!(harness.provider.state(), MachineState::Stopped);
    assert_eq!(
        harness.orchestrator.status("demo").await.unwrap(),
        MachineState::Stopped
    );
    // stopping again is a no-op
    harness.orchestrator.stop("demo").await.unwrap();
    assert_eq!(harness.provider.stops.load(Ordering::SeqCst), 1);

    harness.orchestrator.delete("demo").await.unwrap();
    assert_eq!(harness.provider.state(), MachineState::NotExist);
    assert!(harness.orchestrator.list().unwrap().is_empty());
    assert!(harness.orchestrator.store().load_machine(&id).unwrap().is_none());
}

#[tokio::test]
async fn test_stop_with_keep_running_leaves_container_up() {
    let harness = Harness::with_options(HarnessOptions {
        keep_running: true,
        ..Default::default()
    });
    let source = harness.source(&devcontainer(&harness, false));
    let session = harness
        .orchestrator
        .up(options(&source), |_, _| {})
        .await
        .unwrap();
    let id = session.workspace().id.clone();
    session.close().await.unwrap();

    harness.orchestrator.stop("demo").await.unwrap();

    let container = harness.runtime.container(&id).unwrap();
    assert_eq!(container.state, ContainerState::Running);
    assert_eq!(harness.provider.state(), MachineState::Running);
    assert_eq!(harness.provider.stops.load(Ordering::SeqCst), 0);
}

mod common;

use std::time::Duration;

use common::{Harness, harness_with, pid_alive, wait_until, write_script};
use gamewarden_agent::{ServerError, StopOutcome};
use gamewarden_process::ServerState;

const LONG_IDLE: Duration = Duration::from_secs(600);

fn sleeper(idle: Duration) -> Harness {
    let root = tempfile::tempdir().unwrap();
    write_script(root.path(), "generic.sh", "echo \"Server started\"\nexec sleep 60");
    harness_with(
        root,
        r#"
[[games]]
name = "terraria"
description = "2D sandbox."

[[games.instances]]
name = "World One"
script = "{root}/generic.sh"

[[games.instances]]
name = "World Two"
script = "{root}/generic.sh"
"#,
        idle,
    )
}

#[tokio::test]
async fn start_then_stop_leaves_no_record_or_process() {
    let mut h = sleeper(LONG_IDLE);
    let status = h.manager.start("terraria", None, "general").await.unwrap();
    assert_eq!(status.state, ServerState::Running);
    assert_eq!(status.active_instance.as_deref(), Some("World One"));
    let pid = status.pid.unwrap();

    let record = std::fs::read_to_string(h.pid_file("terraria_world_one")).unwrap();
    assert!(record.contains(&format!("pid={pid}")));

    h.wait_for_message("is live!").await;

    match h.manager.stop("terraria", None).await.unwrap() {
        StopOutcome::Stopped { instance, termination } => {
            assert_eq!(instance, "World One");
            assert!(!termination.already_gone);
            assert!(termination.forced.is_empty());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(!h.pid_file("terraria_world_one").exists());
    let status = h.manager.get("terraria").unwrap().status().await;
    assert_eq!(status.state, ServerState::Idle);
    assert!(!status.running);
    wait_until(|| !pid_alive(pid), "server process to exit").await;
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let h = sleeper(LONG_IDLE);
    h.manager.start("terraria", Some("world one"), "general").await.unwrap();

    let err = h
        .manager
        .start("terraria", Some("World Two"), "general")
        .await
        .unwrap_err();
    match err {
        ServerError::AlreadyRunning { game, instance } => {
            assert_eq!(game, "terraria");
            assert_eq!(instance, "World One");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Stopping a different instance than the active one is a no-op.
    assert_eq!(
        h.manager.stop("terraria", Some("World Two")).await.unwrap(),
        StopOutcome::NotRunning
    );
    assert!(h.manager.get("terraria").unwrap().is_running().await);

    h.manager.stop_all().await;
    assert!(!h.manager.get("terraria").unwrap().is_running().await);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = sleeper(LONG_IDLE);
    assert_eq!(
        h.manager.stop("terraria", None).await.unwrap(),
        StopOutcome::NotRunning
    );

    h.manager.start("terraria", None, "general").await.unwrap();
    assert!(matches!(
        h.manager.stop("terraria", None).await.unwrap(),
        StopOutcome::Stopped { .. }
    ));
    assert_eq!(
        h.manager.stop("terraria", None).await.unwrap(),
        StopOutcome::NotRunning
    );
}

#[tokio::test]
async fn unknown_names_are_errors() {
    let h = sleeper(LONG_IDLE);
    assert!(matches!(
        h.manager.start("factorio", None, "general").await,
        Err(ServerError::UnknownGame { .. })
    ));
    assert!(matches!(
        h.manager.start("terraria", Some("World Three"), "general").await,
        Err(ServerError::UnknownInstance { .. })
    ));
    assert!(matches!(
        h.manager.stop("terraria", Some("World Three")).await,
        Err(ServerError::UnknownInstance { .. })
    ));
    assert!(!h.manager.get("terraria").unwrap().is_running().await);
}

#[tokio::test]
async fn bad_working_directory_fails_before_spawning() {
    let root = tempfile::tempdir().unwrap();
    let h = harness_with(
        root,
        r#"
[[games]]
name = "terraria"
[[games.instances]]
name = "main"
command = "/bin/sh"
cwd = "{root}/missing"
"#,
        LONG_IDLE,
    );

    let err = h.manager.start("terraria", None, "general").await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidWorkingDir { .. }));
    let status = h.manager.get("terraria").unwrap().status().await;
    assert_eq!(status.state, ServerState::Idle);
    assert!(!h.pid_file("terraria_main").exists());
}

#[tokio::test]
async fn startup_is_announced_once_and_arms_the_idle_timer() {
    let root = tempfile::tempdir().unwrap();
    write_script(
        root.path(),
        "chatty.sh",
        "echo \"Server started\"\necho \"Server started\"\necho \"Listening on 0.0.0.0:7777\"\nexec sleep 60",
    );
    let mut h = harness_with(
        root,
        r#"
[[games]]
name = "terraria"
[[games.instances]]
name = "main"
script = "{root}/chatty.sh"
port = 7777
address = "10.0.0.2"
"#,
        LONG_IDLE,
    );

    h.manager.start("terraria", None, "ops").await.unwrap();
    let live = h.next_message().await;
    assert_eq!(live, "terraria `main` is live!\nIP: 10.0.0.2:7777");
    let armed = h.next_message().await;
    assert_eq!(armed, "Server will shut down in 600 seconds due to: no players joined");

    let server = h.manager.get("terraria").unwrap().clone();
    let idle = server.status().await.idle_shutdown.unwrap();
    assert_eq!(idle.reason, "no players joined");

    // Give the repeated markers time to be dispatched.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.drain().iter().all(|m| !m.contains("is live")));

    let log_path = server.status().await.log_path.unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("Listening on 0.0.0.0:7777"));

    h.manager.stop_all().await;
}

#[tokio::test]
async fn idle_expiry_stops_the_server() {
    let mut h = sleeper(Duration::from_secs(1));
    let pid = h
        .manager
        .start("terraria", None, "general")
        .await
        .unwrap()
        .pid
        .unwrap();

    h.wait_for_message("Server shutting down due to inactivity.").await;
    let server = h.manager.get("terraria").unwrap().clone();
    for _ in 0..200 {
        if !server.is_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!server.is_running().await);
    assert!(!h.pid_file("terraria_world_one").exists());
    wait_until(|| !pid_alive(pid), "idle server to exit").await;
}

#[tokio::test]
async fn info_and_status_cover_every_game() {
    let h = sleeper(LONG_IDLE);
    let info = h.manager.info("Terraria").unwrap();
    assert_eq!(info, "terraria: 2D sandbox.\nInstances: World One, World Two");

    let all = h.manager.status("all").await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].uptime(), "Not running");
}

#[tokio::test]
async fn stop_reaches_servers_left_behind_by_the_launch_script() {
    let root = tempfile::tempdir().unwrap();
    write_script(
        root.path(),
        "detach.sh",
        "sleep 60 &\necho $! > child.pid\necho started\nexit 0",
    );
    let h = harness_with(
        root,
        r#"
[[games]]
name = "terraria"
[[games.instances]]
name = "main"
script = "{root}/detach.sh"
"#,
        LONG_IDLE,
    );

    let leader = h
        .manager
        .start("terraria", None, "general")
        .await
        .unwrap()
        .pid
        .unwrap();
    let child_pid_file = h.root.path().join("child.pid");
    wait_until(|| child_pid_file.exists() && !pid_alive(leader), "launch script to exit").await;
    let child: u32 = std::fs::read_to_string(&child_pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(pid_alive(child));

    match h.manager.stop("terraria", None).await.unwrap() {
        StopOutcome::Stopped { termination, .. } => {
            assert!(!termination.already_gone, "{termination:?}");
            assert!(termination.signalled.contains(&child), "{termination:?}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    wait_until(|| !pid_alive(child), "detached server process to exit").await;
    assert!(!h.pid_file("terraria_main").exists());
}

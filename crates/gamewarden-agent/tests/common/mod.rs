#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use gamewarden_agent::{
    ServerManager, config,
    config::Settings,
    notify::{ChannelNotifier, Notification},
};
use tokio::sync::mpsc;

pub struct Harness {
    pub root: tempfile::TempDir,
    pub manager: ServerManager,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

pub fn settings(root: &Path, idle_shutdown: Duration) -> Settings {
    Settings {
        config_path: root.join("gamewarden.toml"),
        data_root: root.to_path_buf(),
        shell: "/bin/sh".to_string(),
        idle_shutdown,
        term_grace: Duration::from_secs(2),
    }
}

/// Writes `body` as a `/bin/sh` script under `root`.
pub fn write_script(root: &Path, name: &str, body: &str) -> PathBuf {
    let path = root.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

/// `config_toml` may reference `{root}`, replaced with the temp dir path.
pub fn harness_with(
    root: tempfile::TempDir,
    config_toml: &str,
    idle_shutdown: Duration,
) -> Harness {
    let raw = config_toml.replace("{root}", &root.path().display().to_string());
    let games = config::parse(&raw, "/bin/sh").unwrap();
    let (notifier, notifications) = ChannelNotifier::new();
    let manager = ServerManager::new(
        games,
        &settings(root.path(), idle_shutdown),
        Arc::new(notifier),
    );
    Harness {
        root,
        manager,
        notifications,
    }
}

impl Harness {
    pub fn pid_file(&self, key: &str) -> PathBuf {
        self.root.path().join("pids").join(format!("{key}.pid"))
    }

    pub async fn next_message(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(10), self.notifications.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("notifier closed")
            .message
    }

    /// Skips notifications until one contains `needle`.
    pub async fn wait_for_message(&mut self, needle: &str) -> String {
        loop {
            let msg = self.next_message().await;
            if msg.contains(needle) {
                return msg;
            }
        }
    }

    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n.message);
        }
        out
    }
}

pub fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc != 0 {
        return false;
    }
    // Zombies still answer kill(0).
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| {
            let after = s.rsplit_once(')')?.1.trim_start().chars().next()?;
            Some(!matches!(after, 'Z' | 'X' | 'x'))
        })
        .unwrap_or(true)
}

pub async fn wait_until<F>(mut cond: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

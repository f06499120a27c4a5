use rand::{Rng, distributions::Alphanumeric};

use super::{ConnectionInfo, OutputLineHandler, PlayerActivity, ServerEvent, count_after_now};
use crate::config::InstanceConfig;

const PASSWORD_LEN: usize = 10;

const JOIN_CODE_MARKER: &str = "join code ";
const PLAYER_JOINED_MARKER: &str = "Player joined server";
const CONNECTION_LOST_MARKER: &str = "connection lost";

// Crash signatures and what they mean for whoever launched the server.
const FATAL_MARKERS: &[(&str, &str)] = &[
    (
        "PlayFab create lobby failed",
        "lobby creation failed (too many servers running)",
    ),
    (
        "NullReferenceException: The WorldGenerator instance was null",
        "world generator failed to start (is Steam running?)",
    ),
];

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Valheim dedicated server. Launch scripts receive the session password as their last argument.
#[derive(Debug)]
pub struct ValheimHandler {
    password: String,
    join_code: Option<String>,
}

impl Default for ValheimHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ValheimHandler {
    pub fn new() -> Self {
        Self::with_password(generate_password())
    }

    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            join_code: None,
        }
    }
}

fn parse_join_code(line: &str) -> Option<String> {
    let idx = line.find(JOIN_CODE_MARKER)?;
    let rest = &line[idx + JOIN_CODE_MARKER.len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    (end > 0).then(|| rest[..end].to_string())
}

impl OutputLineHandler for ValheimHandler {
    fn handle_line(&mut self, line: &str) -> Option<ServerEvent> {
        if let Some(idx) = line.find(PLAYER_JOINED_MARKER) {
            let online = count_after_now(line, idx)?;
            return Some(ServerEvent::PlayerCountChanged {
                activity: PlayerActivity::Joined,
                online: Some(online),
            });
        }

        if let Some(idx) = line.find(CONNECTION_LOST_MARKER) {
            let online = count_after_now(line, idx)?;
            return Some(ServerEvent::PlayerCountChanged {
                activity: PlayerActivity::Left,
                online: Some(online),
            });
        }

        if let Some((_, reason)) = FATAL_MARKERS.iter().find(|(m, _)| line.contains(m)) {
            return Some(ServerEvent::Crashed(reason.to_string()));
        }

        // The first join code is the live signal; later lines repeat it.
        if self.join_code.is_some() {
            return None;
        }
        let code = parse_join_code(line)?;
        self.join_code = Some(code.clone());
        Some(ServerEvent::StartupComplete(ConnectionInfo::JoinCode {
            code,
            password: self.password.clone(),
        }))
    }

    fn launch_args(&self, instance: &InstanceConfig) -> Vec<String> {
        let mut args = instance.args.clone();
        args.push(self.password.clone());
        args
    }

    fn startup_idle_reason(&self) -> &'static str {
        "no players joining in time"
    }

    fn empty_idle_reason(&self) -> &'static str {
        "all players disconnected"
    }
}

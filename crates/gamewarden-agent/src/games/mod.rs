//! Per-game output parsing.
//!
//! Each game turns raw server output into [`ServerEvent`]s; the state machine in
//! [`crate::server`] reacts to those events the same way for every game.

use std::fmt;

use crate::config::{GameKind, InstanceConfig};

pub mod generic;
pub mod minecraft;
pub mod valheim;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInfo {
    JoinCode { code: String, password: String },
    Address { host: String, port: u16 },
    None,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionInfo::JoinCode { code, password } => {
                write!(f, "Join Code: {code}\nPassword: {password}")
            }
            ConnectionInfo::Address { host, port } => write!(f, "IP: {host}:{port}"),
            ConnectionInfo::None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerActivity {
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    StartupComplete(ConnectionInfo),
    /// `online` is the absolute count when the line reports one; otherwise the
    /// activity is applied as +1/-1.
    PlayerCountChanged {
        activity: PlayerActivity,
        online: Option<u32>,
    },
    Crashed(String),
    /// The server announced its own shutdown.
    Exited,
}

pub trait OutputLineHandler: Send {
    /// Inspect one line of output. Called for every line, in order.
    fn handle_line(&mut self, line: &str) -> Option<ServerEvent>;

    fn launch_args(&self, instance: &InstanceConfig) -> Vec<String> {
        instance.args.clone()
    }

    fn startup_idle_reason(&self) -> &'static str {
        "no players joined"
    }

    fn empty_idle_reason(&self) -> &'static str {
        "all players left"
    }
}

/// Fresh handler for one run of `instance`. May shell out to find the host address.
pub async fn handler_for(kind: GameKind, instance: &InstanceConfig) -> Box<dyn OutputLineHandler> {
    match kind {
        GameKind::Valheim => Box::new(match &instance.password {
            Some(password) => valheim::ValheimHandler::with_password(password.clone()),
            None => valheim::ValheimHandler::new(),
        }),
        GameKind::Minecraft => {
            let host = match &instance.address {
                Some(address) => address.clone(),
                None => minecraft::discover_host().await,
            };
            Box::new(minecraft::MinecraftHandler::new(
                host,
                instance.port.unwrap_or(minecraft::DEFAULT_PORT),
            ))
        }
        GameKind::Generic => {
            let info = match (instance.port, &instance.address) {
                (None, _) => ConnectionInfo::None,
                (Some(port), Some(address)) => ConnectionInfo::Address {
                    host: address.clone(),
                    port,
                },
                (Some(port), None) => ConnectionInfo::Address {
                    host: minecraft::discover_host().await,
                    port,
                },
            };
            Box::new(generic::GenericHandler::new(info))
        }
    }
}

/// The `N` in `... now N player(s)`, searching from `from`.
pub(crate) fn count_after_now(line: &str, from: usize) -> Option<u32> {
    let mut rest = line.get(from..)?;
    while let Some(idx) = rest.find("now ") {
        let after = &rest[idx + 4..];
        let digits_end = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());
        if digits_end > 0 && after[digits_end..].starts_with(" player") {
            return after[..digits_end].parse().ok();
        }
        rest = after;
    }
    None
}

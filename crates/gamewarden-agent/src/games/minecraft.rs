use std::{
    net::{Ipv4Addr, UdpSocket},
    process::Stdio,
    time::Duration,
};

use super::{ConnectionInfo, OutputLineHandler, PlayerActivity, ServerEvent};

pub const DEFAULT_PORT: u16 = 25565;

const STARTUP_MARKER: &str = "Done";
const JOINED_MARKER: &str = "joined the game";
const LEFT_MARKER: &str = "left the game";
const SHUTDOWN_MARKER: &str = "Shutting down";
const CRASH_TAG: &str = "[main/ERROR]";

#[derive(Debug)]
pub struct MinecraftHandler {
    host: String,
    port: u16,
}

impl MinecraftHandler {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl OutputLineHandler for MinecraftHandler {
    fn handle_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.contains(SHUTDOWN_MARKER) {
            if line.contains(CRASH_TAG) {
                return Some(ServerEvent::Crashed("server crashed".to_string()));
            }
            return Some(ServerEvent::Exited);
        }
        if line.contains(JOINED_MARKER) {
            return Some(ServerEvent::PlayerCountChanged {
                activity: PlayerActivity::Joined,
                online: None,
            });
        }
        if line.contains(LEFT_MARKER) {
            return Some(ServerEvent::PlayerCountChanged {
                activity: PlayerActivity::Left,
                online: None,
            });
        }
        if line.contains(STARTUP_MARKER) {
            return Some(ServerEvent::StartupComplete(ConnectionInfo::Address {
                host: self.host.clone(),
                port: self.port,
            }));
        }
        None
    }
}

const ZEROTIER_CLI: &str = "zerotier-cli";
const ZEROTIER_TIMEOUT: Duration = Duration::from_secs(3);

/// First IPv4 address of a joined ZeroTier network, else the primary outbound address.
pub async fn discover_host() -> String {
    match zerotier_address(ZEROTIER_CLI, ZEROTIER_TIMEOUT).await {
        Some(host) => host,
        None => outbound_address().unwrap_or_else(|| "Unknown".to_string()),
    }
}

async fn zerotier_address(program: &str, limit: Duration) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .arg("listnetworks")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let out = match tokio::time::timeout(limit, output).await {
        Ok(Ok(out)) => out,
        Ok(Err(_)) => return None,
        Err(_) => {
            tracing::warn!(program, timeout_secs = limit.as_secs(), "zerotier lookup timed out");
            return None;
        }
    };
    if !out.status.success() {
        return None;
    }
    parse_zerotier_networks(&String::from_utf8_lossy(&out.stdout))
}

fn parse_zerotier_networks(text: &str) -> Option<String> {
    // Assigned addresses appear as `a.b.c.d/nn`, possibly comma separated.
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter_map(|tok| tok.split_once('/'))
        .filter(|(_, prefix)| !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()))
        .find_map(|(addr, _)| addr.parse::<Ipv4Addr>().ok())
        .map(|ip| ip.to_string())
}

fn outbound_address() -> Option<String> {
    // No packets are sent; connecting a UDP socket only selects a route.
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

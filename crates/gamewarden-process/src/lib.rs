use std::time::Duration;

/// Lifecycle of one game server definition.
///
/// `Running -> Idle` is also reachable directly when the process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdleShutdownStatus {
    pub reason: String,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub game: String,
    pub state: ServerState,
    pub running: bool,
    pub active_instance: Option<String>,
    pub player_count: u32,
    pub uptime_secs: Option<u64>,
    pub pid: Option<u32>,
    pub log_path: Option<String>,
    pub idle_shutdown: Option<IdleShutdownStatus>,
}

impl ServerStatus {
    pub fn idle(game: impl Into<String>) -> Self {
        Self {
            game: game.into(),
            state: ServerState::Idle,
            running: false,
            active_instance: None,
            player_count: 0,
            uptime_secs: None,
            pid: None,
            log_path: None,
            idle_shutdown: None,
        }
    }

    pub fn uptime(&self) -> String {
        match self.uptime_secs {
            Some(secs) => format_uptime(Duration::from_secs(secs)),
            None => "Not running".to_string(),
        }
    }
}

/// `HH:MM:SS`; hours keep growing past 99.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (mins, secs) = (secs / 60, secs % 60);
    let (hours, mins) = (mins / 60, mins % 60);
    format!("{hours:02}:{mins:02}:{secs:02}")
}

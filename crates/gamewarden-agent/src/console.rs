//! Line-oriented operator console: `start`, `stop`, `status`, `info`.

use gamewarden_process::ServerStatus;

use crate::manager::ServerManager;
use crate::server::StopOutcome;

pub const CONSOLE_CHANNEL: &str = "console";

pub const HELP: &str = "\
commands:
  start <game> [instance]   launch a server
  stop <game> [instance]    stop a running server
  status [game|all]         show server state
  info <game>               describe a game
  help                      show this help
  quit                      stop every server and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { game: String, instance: Option<String> },
    Stop { game: String, instance: Option<String> },
    Status { game: Option<String> },
    Info { game: String },
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for a blank line. Instance names may contain spaces.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let game = words.next().map(str::to_string);
        let rest = words.collect::<Vec<_>>().join(" ");
        let instance = (!rest.is_empty()).then_some(rest);

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "start" => Command::Start {
                game: game.ok_or("usage: start <game> [instance]")?,
                instance,
            },
            "stop" => Command::Stop {
                game: game.ok_or("usage: stop <game> [instance]")?,
                instance,
            },
            "status" => Command::Status { game },
            "info" => Command::Info {
                game: game.ok_or("usage: info <game>")?,
            },
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command: {other} (try `help`)")),
        };
        Ok(Some(cmd))
    }
}

pub fn render_status(status: &ServerStatus) -> String {
    if !status.running {
        return format!("{}: not running", status.game);
    }
    let mut out = format!(
        "{}: {:?} `{}` (pid {})\n  players: {}\n  uptime: {}",
        status.game,
        status.state,
        status.active_instance.as_deref().unwrap_or("?"),
        status.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
        status.player_count,
        status.uptime(),
    );
    if let Some(idle) = &status.idle_shutdown {
        out.push_str(&format!(
            "\n  idle shutdown in {}s: {}",
            idle.remaining_secs, idle.reason
        ));
    }
    if let Some(log) = &status.log_path {
        out.push_str(&format!("\n  log: {log}"));
    }
    out
}

/// Runs one command and returns the text to show the operator.
pub async fn execute(manager: &ServerManager, cmd: Command) -> String {
    match cmd {
        Command::Start { game, instance } => {
            match manager.start(&game, instance.as_deref(), CONSOLE_CHANNEL).await {
                Ok(status) => format!(
                    "starting {} `{}`",
                    status.game,
                    status.active_instance.unwrap_or_default()
                ),
                Err(e) => format!("error: {e}"),
            }
        }
        Command::Stop { game, instance } => match manager.stop(&game, instance.as_deref()).await {
            Ok(StopOutcome::Stopped { instance, termination }) if termination.forced.is_empty() => {
                format!("stopped {game} `{instance}`")
            }
            Ok(StopOutcome::Stopped { instance, termination }) => format!(
                "stopped {game} `{instance}` (killed {} unresponsive processes)",
                termination.forced.len()
            ),
            Ok(StopOutcome::AlreadyStopping { instance }) => {
                format!("{game} `{instance}` is already stopping")
            }
            Ok(StopOutcome::NotRunning) => format!("{game} is not running"),
            Err(e) => format!("error: {e}"),
        },
        Command::Status { game } => {
            match manager.status(game.as_deref().unwrap_or("all")).await {
                Ok(list) if list.is_empty() => "no games configured".to_string(),
                Ok(list) => list.iter().map(render_status).collect::<Vec<_>>().join("\n"),
                Err(e) => format!("error: {e}"),
            }
        }
        Command::Info { game } => manager.info(&game).unwrap_or_else(|e| format!("error: {e}")),
        Command::Help => HELP.to_string(),
        Command::Quit => "shutting down".to_string(),
    }
}

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("unknown game: {game}")]
    UnknownGame { game: String },

    #[error("{game} has no instance named {instance:?}")]
    UnknownInstance { game: String, instance: String },

    #[error("{game} is already running ({instance})")]
    AlreadyRunning { game: String, instance: String },

    #[error("working directory {} does not exist or is not a directory", path.display())]
    InvalidWorkingDir { path: PathBuf },

    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to record server state: {0:#}")]
    Persist(anyhow::Error),
}

impl ServerError {
    pub fn unknown_game(game: &str) -> Self {
        ServerError::UnknownGame {
            game: game.to_string(),
        }
    }
}

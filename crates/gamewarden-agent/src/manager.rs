use std::{collections::BTreeMap, sync::Arc};

use gamewarden_process::ServerStatus;

use crate::config::{GameDefinition, Settings};
use crate::error::ServerError;
use crate::notify::Notifier;
use crate::pid_store::PidStore;
use crate::server::{GameServer, RecoveredOrphan, StopOutcome};
use crate::supervisor::Supervisor;

/// Owns one [`GameServer`] per configured game. Cheap to clone.
#[derive(Clone)]
pub struct ServerManager {
    servers: Arc<BTreeMap<String, GameServer>>,
}

impl ServerManager {
    pub fn new(games: Vec<GameDefinition>, settings: &Settings, notifier: Arc<dyn Notifier>) -> Self {
        let supervisor = Supervisor::new(settings.term_grace);
        let pid_store = PidStore::new(settings.pid_dir());
        let logs_dir = settings.logs_dir();

        let servers = games
            .into_iter()
            .map(|def| {
                let key = def.name.to_ascii_lowercase();
                let server = GameServer::new(
                    def,
                    supervisor.clone(),
                    pid_store.clone(),
                    logs_dir.clone(),
                    settings.idle_shutdown,
                    notifier.clone(),
                );
                (key, server)
            })
            .collect();

        Self {
            servers: Arc::new(servers),
        }
    }

    pub fn get(&self, game: &str) -> Result<&GameServer, ServerError> {
        self.servers
            .get(&game.trim().to_ascii_lowercase())
            .ok_or_else(|| ServerError::unknown_game(game))
    }

    pub fn games(&self) -> impl Iterator<Item = &GameServer> {
        self.servers.values()
    }

    pub async fn start(
        &self,
        game: &str,
        instance: Option<&str>,
        channel: &str,
    ) -> Result<ServerStatus, ServerError> {
        self.get(game)?.start(instance, channel).await
    }

    pub async fn stop(&self, game: &str, instance: Option<&str>) -> Result<StopOutcome, ServerError> {
        self.get(game)?.stop(instance).await
    }

    /// `"all"` (or an empty name) reports every game.
    pub async fn status(&self, game: &str) -> Result<Vec<ServerStatus>, ServerError> {
        let game = game.trim();
        if game.is_empty() || game.eq_ignore_ascii_case("all") {
            let mut out = Vec::with_capacity(self.servers.len());
            for server in self.servers.values() {
                out.push(server.status().await);
            }
            return Ok(out);
        }
        Ok(vec![self.get(game)?.status().await])
    }

    pub fn info(&self, game: &str) -> Result<String, ServerError> {
        let def = self.get(game)?.definition();
        let instances = def
            .instances
            .iter()
            .map(|i| i.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut out = match &def.description {
            Some(d) => format!("{}: {d}", def.name),
            None => def.name.clone(),
        };
        out.push_str(&format!("\nInstances: {instances}"));
        Ok(out)
    }

    /// Boot-time cleanup of processes left behind by a previous run.
    pub async fn recover_orphans(&self) -> Vec<(String, RecoveredOrphan)> {
        let mut out = Vec::new();
        for server in self.servers.values() {
            for orphan in server.recover_orphans().await {
                out.push((server.name().to_string(), orphan));
            }
        }
        if !out.is_empty() {
            tracing::info!(count = out.len(), "orphan recovery finished");
        }
        out
    }

    pub async fn stop_all(&self) {
        for server in self.servers.values() {
            match server.stop(None).await {
                Ok(StopOutcome::Stopped { instance, .. }) => {
                    tracing::info!(game = %server.name(), %instance, "stopped on shutdown");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(game = %server.name(), error = %e, "stop on shutdown failed"),
            }
        }
    }
}

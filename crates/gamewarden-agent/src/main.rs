use std::sync::Arc;

use anyhow::Context;
use gamewarden_agent::{
    ServerManager, config,
    config::Settings,
    console::{self, Command},
    notify::StdoutNotifier,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(settings: &Settings) -> anyhow::Result<WorkerGuard> {
    let logs_dir = settings.logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("create {}", logs_dir.display()))?;

    let appender = rolling::RollingFileAppender::builder()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("gamewarden.log")
        .build(&logs_dir)
        .context("open supervisor log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

async fn run_console(manager: &ServerManager) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", console::HELP);

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return Ok(());
            }
            _ = terminate => {
                tracing::info!("SIGTERM received");
                return Ok(());
            }
        };

        // stdin closed
        let Some(line) = line else {
            return Ok(());
        };

        match Command::parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => return Ok(()),
            Ok(Some(cmd)) => println!("{}", console::execute(manager, cmd).await),
            Err(msg) => println!("{msg}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    let _log_guard = init_tracing(&settings)?;

    let games = config::load(&settings.config_path, &settings.shell)?;
    tracing::info!(
        config = %settings.config_path.display(),
        data_root = %settings.data_root.display(),
        games = games.len(),
        idle_shutdown_secs = settings.idle_shutdown.as_secs(),
        "gamewarden starting"
    );

    let manager = ServerManager::new(games, &settings, Arc::new(StdoutNotifier));
    manager.recover_orphans().await;

    let result = run_console(&manager).await;
    manager.stop_all().await;
    tracing::info!("gamewarden stopped");
    result
}

//! Supervision of dedicated game-server processes: launch, log-driven
//! lifecycle tracking, idle shutdown and orphan recovery.

pub mod config;
pub mod console;
pub mod error;
pub mod games;
pub mod idle_timer;
pub mod log_tailer;
pub mod manager;
pub mod notify;
pub mod pid_store;
mod procfs;
pub mod server;
pub mod supervisor;

pub use error::ServerError;
pub use manager::ServerManager;
pub use notify::Notifier;
pub use server::{GameServer, StopOutcome};

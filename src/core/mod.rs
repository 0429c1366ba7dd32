//! Core daemon logic: config, protocol, launch pipeline, registry, control
//! server, and subcommand glue.

pub mod attach;
pub mod cgroup;
pub mod cmd;
pub mod commands;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod server;

use std::path::PathBuf;

/// Control socket path (§4.6), overridable with `PHIOCKER_SOCKET`.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/phiocker.sock";

/// Root of the on-disk layout (§2), overridable with `PHIOCKER_BASE`.
pub const DEFAULT_BASE_PATH: &str = "/var/lib/phiocker";

pub fn socket_path() -> PathBuf {
    std::env::var("PHIOCKER_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH))
}

pub fn base_path() -> PathBuf {
    std::env::var("PHIOCKER_BASE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_BASE_PATH))
}

/// Runs the control daemon in the foreground until it errors out.
pub async fn run_daemon() -> error::Result<()> {
    let base = base_path();
    std::fs::create_dir_all(base.join("containers")).map_err(error::PhiockerError::Io)?;
    std::fs::create_dir_all(base.join("images")).map_err(error::PhiockerError::Io)?;

    let daemon = server::Daemon::new(socket_path(), base);
    daemon.run().await
}

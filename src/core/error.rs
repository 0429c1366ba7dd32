use thiserror::Error;

/// Error taxonomy surfaced by the daemon. Every public operation returns one
/// of these so the control server can map it to a response envelope without
/// guessing at intent.
#[derive(Error, Debug)]
pub enum PhiockerError {
    /// Bad arguments, missing spec file, unknown image name, duplicate name, ...
    #[error("{0}")]
    User(String),

    /// Daemon already running, attach collision, rejected stop/delete of a live container.
    #[error("{0}")]
    State(String),

    /// mount, chroot, clone, socket bind.
    #[error("system error: {0}")]
    System(#[from] nix::Error),

    /// cgroup placement/build failures and other system-level faults that
    /// don't originate from a `nix::Error` (§7 classifies cgroup writes here,
    /// not under `User`).
    #[error("system error: {0}")]
    SystemMessage(String),

    /// Archive extraction, registry pull, rootfs copy.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for library errors that don't fit the above (image pull HTTP
    /// failures, JSON decode failures, ...).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhiockerError {
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn system(msg: impl Into<String>) -> Self {
        Self::SystemMessage(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PhiockerError>;

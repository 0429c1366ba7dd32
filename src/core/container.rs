//! Live container process handle (§4.3).

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use cgroups_rs::Cgroup;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio::time::timeout;

use super::cgroup;
use super::error::Result;
use super::launcher;

/// Grace period between SIGTERM and SIGKILL during `stop` (§4.3).
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// A running container's first process plus the resources it owns.
pub struct Container {
    name: String,
    pid: Pid,
    master: StdMutex<Option<OwnedFd>>,
    cgroup: StdMutex<Option<Cgroup>>,
    started_at: std::time::Instant,
    /// Flipped by the registry's reaper once `wait_blocking` reaps the pid.
    /// `stop` watches this instead of calling `waitpid` itself, since only
    /// one caller may ever reap a given pid.
    exited_tx: watch::Sender<bool>,
}

impl Container {
    pub fn new(name: String, pid: Pid, master: OwnedFd, cgroup: Cgroup) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            name,
            pid,
            master: StdMutex::new(Some(master)),
            cgroup: StdMutex::new(Some(cgroup)),
            started_at: std::time::Instant::now(),
            exited_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn master_fd(&self) -> Option<i32> {
        self.master.lock().unwrap().as_ref().map(|m| m.as_raw_fd())
    }

    /// Closes the daemon's own handle on the PTY master. Idempotent — a
    /// second call simply finds nothing left to close.
    pub fn close_master(&self) {
        self.master.lock().unwrap().take();
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Blocking wait for the child to exit, then tears down the cgroup.
    /// This is the *only* caller allowed to `waitpid` on this pid — `stop`
    /// watches `exited_tx` instead of reaping independently, since a second
    /// concurrent `waitpid` on the same pid would race this one for ECHILD.
    pub fn wait_blocking(&self) -> Result<WaitStatus> {
        let status = launcher::wait(self.pid)?;
        let cg = self.cgroup.lock().unwrap().take();
        if let Some(cg) = cg {
            cgroup::teardown(cg);
        }
        self.exited_tx.send_replace(true);
        Ok(status)
    }

    /// Graceful stop: close the PTY master (forces SIGHUP to the foreground
    /// process group through the controlling terminal), then SIGTERM, then —
    /// if the child outlives the grace period — SIGKILL. Idempotent: sending
    /// a signal to an already-exited pid is reported as `ESRCH` and ignored.
    pub async fn stop(&self) {
        self.close_master();

        if let Err(e) = kill(self.pid, Signal::SIGTERM) {
            if e != nix::Error::ESRCH {
                warn!("SIGTERM to container '{}' ({}) failed: {e}", self.name, self.pid);
            }
            return;
        }

        let mut exited_rx = self.exited_tx.subscribe();
        let waited = timeout(STOP_GRACE, exited_rx.wait_for(|exited| *exited)).await;

        if waited.is_err() {
            debug!(
                "container '{}' ({}) did not exit within grace period, sending SIGKILL",
                self.name, self.pid
            );
            if let Err(e) = kill(self.pid, Signal::SIGKILL) {
                if e != nix::Error::ESRCH {
                    warn!("SIGKILL to container '{}' ({}) failed: {e}", self.name, self.pid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_grace_is_within_spec_bounds() {
        assert!(STOP_GRACE.as_secs() >= 2 && STOP_GRACE.as_secs() <= 10);
    }
}

//! Container launch pipeline (§4.2): clone into fresh namespaces, re-exec the
//! same binary with a sentinel argument, then — inside that re-exec'd process —
//! chroot, mount `/proc`, and exec the user's command.
//!
//! Splitting the work this way is a concession to the kernel: namespace
//! membership is fixed at `clone()`, but the rootfs switch and `/proc` mount
//! must happen after the child exists and before it execs the workload. A
//! plain Rust closure run inside the cloned child would work too, but a
//! re-exec gives the in-namespace setup code a blank, panic-free process image
//! instead of carrying over whatever state the daemon had accumulated (§9).

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use cgroups_rs::Cgroup;
use log::{debug, info};
use nix::libc::{ioctl, SIGCHLD, TIOCSCTTY, TIOCSWINSZ};
use nix::mount::{mount, MsFlags};
use nix::pty::openpty;
use nix::sched::{clone, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, dup2, execvp, setsid, Pid};

use super::cgroup;
use super::config::{ContainerSpec, Limits};
use super::error::{PhiockerError, Result};

/// argv[1] a re-exec'd child process checks for before running stage two.
/// Rejected by the normal CLI parser so it can never be typed by a user.
pub const SENTINEL: &str = "__phiocker_child__";

const STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Everything the daemon keeps after a successful launch.
pub struct Launch {
    pub pid: Pid,
    pub master: OwnedFd,
    pub cgroup: Cgroup,
}

/// Stage 1: open a PTY, clone into new namespaces, and hand off to stage 2
/// via a self re-exec. Returns once the child has been placed in its cgroup
/// and the window size has been set; does not wait for the user command to
/// start running inside the rootfs.
pub fn spawn(base_path: &Path, spec: &ContainerSpec, limits: &Limits) -> Result<Launch> {
    let pty = openpty(None, None).map_err(|e| PhiockerError::System(e))?;

    let exe = std::env::current_exe()
        .map_err(|e| PhiockerError::user(format!("cannot resolve current executable: {e}")))?;
    let exe = CString::new(exe.to_string_lossy().into_owned())
        .map_err(|e| PhiockerError::user(format!("invalid executable path: {e}")))?;
    let sentinel = CString::new(SENTINEL).unwrap();
    let name = CString::new(spec.name.clone())
        .map_err(|e| PhiockerError::user(format!("invalid container name: {e}")))?;
    let base = CString::new(base_path.to_string_lossy().into_owned())
        .map_err(|e| PhiockerError::user(format!("invalid base path: {e}")))?;

    let slave_fd = pty
        .slave
        .try_clone()
        .map_err(|e| PhiockerError::System(e.into()))?;

    let flags =
        CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS;
    let mut stack = vec![0u8; STACK_SIZE];

    let child_func = move || -> isize {
        if let Err(e) = prepare_child_stdio(slave_fd.as_raw_fd()) {
            eprintln!("phiocker: failed to prepare child terminal: {e}");
            return 1;
        }

        let args = [exe.clone(), sentinel.clone(), base.clone(), name.clone()];
        match execvp(&exe, &args) {
            Ok(_) => unreachable!("execvp replaces the process image on success"),
            Err(e) => {
                eprintln!("phiocker: re-exec into child stage failed: {e}");
                1
            }
        }
    };

    let pid = unsafe { clone(Box::new(child_func), &mut stack, flags, Some(SIGCHLD)) }
        .map_err(|e| PhiockerError::System(e))?;

    // Our copy of the slave is no longer needed once the child has it open;
    // dropping it here (rather than carrying it around) matches §4.2's "the
    // parent closes its copy of the slave" after spawn.
    drop(pty.slave);

    debug!("cloned container '{}' as pid {}", spec.name, pid);

    let cg = match cgroup::setup(&spec.name, pid.as_raw(), limits) {
        Ok(cg) => cg,
        Err(e) => {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Err(e);
        }
    };

    set_window_size(pty.master.as_raw_fd(), DEFAULT_ROWS, DEFAULT_COLS);

    info!("launched container '{}' (pid {})", spec.name, pid);
    Ok(Launch {
        pid,
        master: pty.master,
        cgroup: cg,
    })
}

fn prepare_child_stdio(slave_fd: i32) -> std::io::Result<()> {
    setsid().map_err(std::io::Error::from)?;

    unsafe {
        if ioctl(slave_fd, TIOCSCTTY as _, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    dup2(slave_fd, nix::libc::STDIN_FILENO).map_err(std::io::Error::from)?;
    dup2(slave_fd, nix::libc::STDOUT_FILENO).map_err(std::io::Error::from)?;
    dup2(slave_fd, nix::libc::STDERR_FILENO).map_err(std::io::Error::from)?;
    Ok(())
}

fn set_window_size(master_fd: i32, rows: u16, cols: u16) {
    #[repr(C)]
    struct Winsize {
        ws_row: u16,
        ws_col: u16,
        ws_xpixel: u16,
        ws_ypixel: u16,
    }
    let ws = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        let _ = ioctl(master_fd, TIOCSWINSZ as _, &ws as *const Winsize);
    }
}

/// Stage 2: runs inside the re-exec'd process, already living in its own
/// UTS/PID/mount namespaces. Never returns on success — `execvp` replaces it.
pub fn run_child(base_path: &Path, name: &str) -> ! {
    match run_child_inner(base_path, name) {
        Ok(()) => unreachable!("execvp replaces the process image on success"),
        Err(e) => {
            eprintln!("phiocker: container '{name}' failed to start: {e}");
            std::process::exit(1);
        }
    }
}

fn run_child_inner(base_path: &Path, name: &str) -> Result<()> {
    let container_dir = base_path.join("containers").join(name);
    let config_path = container_dir.join("config.json");
    let spec = ContainerSpec::load(&config_path)?;
    let rootfs = container_dir.join("rootfs");

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(PhiockerError::System)?;

    chroot(&rootfs).map_err(PhiockerError::System)?;
    chdir(Path::new(&spec.workdir)).map_err(PhiockerError::System)?;

    if !Path::new("/proc").exists() {
        fs::create_dir("/proc").map_err(PhiockerError::Io)?;
    }
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(PhiockerError::System)?;

    let prog = CString::new(spec.cmd[0].as_str())
        .map_err(|e| PhiockerError::user(format!("invalid argv[0]: {e}")))?;
    let args: Vec<CString> = spec
        .cmd
        .iter()
        .map(|a| CString::new(a.as_str()).map_err(|e| PhiockerError::user(e.to_string())))
        .collect::<Result<_>>()?;

    execvp(&prog, &args).map_err(PhiockerError::System)?;
    Ok(())
}

/// Wait (blocking) for the child to exit, returning its status. Intended to
/// run on a blocking thread — callers in async contexts should wrap this in
/// `tokio::task::spawn_blocking`.
pub fn wait(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::StillAlive) => continue,
            Ok(status) => return Ok(status),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(PhiockerError::System(e)),
        }
    }
}

pub fn try_wait_nohang(pid: Pid) -> Result<WaitStatus> {
    waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(PhiockerError::System)
}

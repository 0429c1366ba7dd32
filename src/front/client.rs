//! Client relay (C8, §4.7): sends one request, and for `attach`, switches the
//! connection into a raw bidirectional byte stream with in-band detach.

use std::os::fd::{AsRawFd, BorrowedFd};

use log::debug;
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::core::cmd::{Cli, Commands};
use crate::core::error::{PhiockerError, Result};
use crate::core::protocol::{read_envelope, write_envelope, Request, Response};
use crate::core::socket_path;

const CTRL_P: u8 = 0x10;
const CTRL_Q: u8 = 0x11;

/// Runs one client invocation end to end: connect, send request, print or
/// relay the response, and map the outcome to a process exit code.
pub async fn run_client(cli: Cli) -> Result<i32> {
    if let Commands::Delete(args) = &cli.command {
        if !args.yes && is_bulk_delete(&args.target) && !confirm_bulk_delete(&args.target)? {
            println!("Aborted");
            return Ok(0);
        }
    }

    let socket = socket_path();
    let stream = UnixStream::connect(&socket).await.map_err(|e| {
        PhiockerError::state(format!("cannot connect to daemon at {}: {e}", socket.display()))
    })?;

    let is_attach = matches!(cli.command, Commands::Attach(_));
    let request_type = cli.command.request_type().to_string();
    let mut args = cli.command.request_args();

    if is_attach {
        if let Some((rows, cols)) = terminal_size() {
            args.push(rows.to_string());
            args.push(cols.to_string());
        }
    }

    let request = Request::new(request_type, args);
    let mut reader = BufReader::new(stream);
    write_envelope(reader.get_mut(), &request)
        .await
        .map_err(PhiockerError::Io)?;

    let response: Response = read_envelope(&mut reader)
        .await
        .map_err(PhiockerError::Io)?
        .ok_or_else(|| PhiockerError::state("daemon closed the connection unexpectedly"))?;

    if !is_attach {
        if !response.output.is_empty() {
            print!("{}", response.output);
        }
        if !response.message.is_empty() {
            println!("{}", response.message);
        }
        return Ok(if response.is_error() { 1 } else { 0 });
    }

    if response.is_error() {
        eprintln!("{}", response.message);
        return Ok(1);
    }

    attach_relay(reader).await
}

/// Runs the raw-mode byte pumps until detach or connection close, restoring
/// the terminal on every exit path (§4.7 steps 1-5).
async fn attach_relay(reader: BufReader<UnixStream>) -> Result<i32> {
    let stdin_fd = std::io::stdin().as_raw_fd();
    let saved = raw_mode_guard(stdin_fd)?;

    let (mut sock_read, mut sock_write) = tokio::io::split(reader);

    let to_stdout = async {
        let mut stdout = tokio::io::stdout();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
            }
        }
    };

    let detached = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let detached_writer = detached.clone();
    let from_stdin = async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        let mut pending_ctrl_p = false;
        loop {
            let n = match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let mut out = Vec::with_capacity(n);
            for &byte in &buf[..n] {
                if pending_ctrl_p {
                    pending_ctrl_p = false;
                    if byte == CTRL_Q {
                        detached_writer.store(true, std::sync::atomic::Ordering::SeqCst);
                        if !out.is_empty() && sock_write.write_all(&out).await.is_err() {
                            return;
                        }
                        return;
                    }
                    out.push(CTRL_P);
                }
                if byte == CTRL_P {
                    pending_ctrl_p = true;
                    continue;
                }
                out.push(byte);
            }

            if !out.is_empty() && sock_write.write_all(&out).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = to_stdout => {},
        _ = from_stdin => {},
    }

    restore_terminal(stdin_fd, &saved);

    if detached.load(std::sync::atomic::Ordering::SeqCst) {
        println!("Detached");
    } else {
        println!("Connection closed");
    }
    Ok(0)
}

fn raw_mode_guard(fd: i32) -> Result<Termios> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let original = termios::tcgetattr(borrowed).map_err(PhiockerError::System)?;

    let mut raw = original.clone();
    raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
    raw.input_flags.remove(
        nix::sys::termios::InputFlags::IXON
            | nix::sys::termios::InputFlags::ICRNL
            | nix::sys::termios::InputFlags::BRKINT
            | nix::sys::termios::InputFlags::INPCK
            | nix::sys::termios::InputFlags::ISTRIP,
    );
    raw.output_flags.remove(nix::sys::termios::OutputFlags::OPOST);
    raw.control_flags.insert(nix::sys::termios::ControlFlags::CS8);
    raw.control_chars[nix::libc::VMIN] = 1;
    raw.control_chars[nix::libc::VTIME] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &raw).map_err(PhiockerError::System)?;
    debug!("stdin switched to raw mode for attach");
    Ok(original)
}

fn restore_terminal(fd: i32, saved: &Termios) {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(e) = termios::tcsetattr(borrowed, SetArg::TCSANOW, saved) {
        eprintln!("phiocker: failed to restore terminal settings: {e}");
    }
}

/// `delete all` and `delete image all` are the two destructive bulk forms
/// that warrant a confirmation prompt (§ supplemented features).
fn is_bulk_delete(target: &[String]) -> bool {
    matches!(target, [t] if t == "all") || matches!(target, [a, b] if a == "image" && b == "all")
}

/// Prompts on stdin/stdout before a bulk delete, matching the original's
/// `PromptForConfirmation`: `"<message> (y/N): "`, accepts `y`/`yes`.
fn confirm_bulk_delete(target: &[String]) -> Result<bool> {
    use std::io::Write;
    let message = if target.len() == 2 {
        "Delete all images?".to_string()
    } else {
        "Delete all containers?".to_string()
    };
    print!("{message} (y/N): ");
    std::io::stdout().flush().map_err(PhiockerError::Io)?;

    let mut response = String::new();
    std::io::stdin()
        .read_line(&mut response)
        .map_err(PhiockerError::Io)?;
    let response = response.trim().to_lowercase();
    Ok(response == "y" || response == "yes")
}

fn terminal_size() -> Option<(u16, u16)> {
    #[repr(C)]
    struct Winsize {
        ws_row: u16,
        ws_col: u16,
        ws_xpixel: u16,
        ws_ypixel: u16,
    }
    let mut ws = Winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
    let rc = unsafe {
        nix::libc::ioctl(
            std::io::stdout().as_raw_fd(),
            nix::libc::TIOCGWINSZ as _,
            &mut ws as *mut Winsize,
        )
    };
    if rc != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        None
    } else {
        Some((ws.ws_row, ws.ws_col))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Mirrors the detach state machine in `attach_relay` against the exact
    /// byte sequences from spec scenario 4: `a`, `^P`, `^Q` detaches cleanly,
    /// and a lone `^P` followed by something else is flushed through intact.
    fn run_state_machine(input: &[u8]) -> (Vec<u8>, bool) {
        let detached = Arc::new(AtomicBool::new(false));
        let mut out = Vec::new();
        let mut pending_ctrl_p = false;
        for &byte in input {
            if pending_ctrl_p {
                pending_ctrl_p = false;
                if byte == super::CTRL_Q {
                    detached.store(true, Ordering::SeqCst);
                    break;
                }
                out.push(super::CTRL_P);
            }
            if byte == super::CTRL_P {
                pending_ctrl_p = true;
                continue;
            }
            out.push(byte);
        }
        (out, detached.load(Ordering::SeqCst))
    }

    #[test]
    fn detach_escape_is_swallowed() {
        let (out, detached) = run_state_machine(b"a\x10\x11");
        assert_eq!(out, b"a");
        assert!(detached);
    }

    #[test]
    fn lone_ctrl_p_is_flushed() {
        let (out, detached) = run_state_machine(b"\x10x");
        assert_eq!(out, b"\x10x");
        assert!(!detached);
    }
}

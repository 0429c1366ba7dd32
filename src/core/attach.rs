//! Attach multiplexer (§4.4): decouples container PTY I/O from whether an
//! interactive client is currently attached.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, warn};
use nix::unistd::{read as nix_read, write as nix_write};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use super::error::{PhiockerError, Result};

const DRAIN_CHUNK: usize = 32 * 1024;

type AttachedWriter = Box<dyn AsyncWrite + Unpin + Send>;
type MasterFd = Arc<AsyncFd<OwnedFd>>;

/// Owns a container's PTY master. One instance per live container.
pub struct AttachMux {
    master: StdMutex<Option<MasterFd>>,
    attached: Arc<Mutex<Option<AttachedWriter>>>,
    exited: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl AttachMux {
    /// Takes ownership of the PTY master fd and starts the background drain.
    pub fn spawn(master_fd: OwnedFd) -> Result<Self> {
        let master: MasterFd = Arc::new(AsyncFd::new(master_fd).map_err(PhiockerError::Io)?);
        let attached: Arc<Mutex<Option<AttachedWriter>>> = Arc::new(Mutex::new(None));
        let exited = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let drain_master = master.clone();
        let drain_attached = attached.clone();
        let drain_exited = exited.clone();
        let drain_close_notify = close_notify.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DRAIN_CHUNK];
            loop {
                tokio::select! {
                    ready = drain_master.readable() => {
                        let mut guard = match ready {
                            Ok(g) => g,
                            Err(_) => break,
                        };
                        let outcome = guard.try_io(|fd| {
                            nix_read(fd.as_raw_fd(), &mut buf)
                                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                        });
                        let n = match outcome {
                            Ok(Ok(0)) => break,
                            Ok(Ok(n)) => n,
                            Ok(Err(_)) => break,
                            Err(_would_block) => continue,
                        };

                        let mut slot = drain_attached.lock().await;
                        if let Some(writer) = slot.as_mut() {
                            if let Err(e) = writer.write_all(&buf[..n]).await {
                                debug!("attached client write failed, detaching: {e}");
                                *slot = None;
                            }
                        }
                        // No attached client: discard. The drain never blocks on a client.
                    }
                    _ = drain_close_notify.notified() => break,
                }
            }

            drain_exited.store(true, Ordering::SeqCst);
            drain_attached.lock().await.take();
            drop(drain_master);
            debug!("pty drain stopped");
        });

        Ok(Self {
            master: StdMutex::new(Some(master)),
            attached,
            exited,
            close_notify,
        })
    }

    fn master_handle(&self) -> Option<MasterFd> {
        self.master.lock().unwrap().clone()
    }

    /// Raw master fd, used to set the initial/subsequent window size. `None`
    /// once the master has already been closed.
    pub fn master_fd(&self) -> Option<i32> {
        self.master_handle().map(|m| m.as_raw_fd())
    }

    /// Closes the daemon's copy of the PTY master, used by `stop` to force a
    /// hang-up before signaling the child (§4.3). Drops this struct's own
    /// reference and wakes the background drain so it drops its reference
    /// too — the PTY master only actually closes once every daemon-held copy
    /// (this one and `Container`'s) is gone. Idempotent.
    pub async fn close_master(&self) {
        self.close_notify.notify_one();
        self.master.lock().unwrap().take();
    }

    /// Synchronous (from the caller's perspective) attach: installs `conn` as
    /// the attached connection, pumps `conn → master` in the caller's task
    /// until EOF/error, then clears itself. Returns once detached.
    pub async fn attach<S>(&self, conn: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PhiockerError::state("container has already exited"));
        }
        let master = self
            .master_handle()
            .ok_or_else(|| PhiockerError::state("container has already exited"))?;

        let (mut read_half, write_half) = tokio::io::split(conn);

        {
            let mut slot = self.attached.lock().await;
            if slot.is_some() {
                return Err(PhiockerError::state("another client is already attached"));
            }
            *slot = Some(Box::new(write_half));
        }

        let mut buf = vec![0u8; DRAIN_CHUNK];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };

            let mut guard = match master.writable().await {
                Ok(g) => g,
                Err(_) => break,
            };
            let wrote = guard.try_io(|fd| {
                nix_write(fd.as_raw_fd(), &buf[..n])
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
            if matches!(wrote, Ok(Err(_))) {
                break;
            }
        }

        let mut slot = self.attached.lock().await;
        slot.take();
        Ok(())
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Called by the reaper once the container's wait() resolves, so any
    /// attached client observes connection-closed immediately rather than
    /// waiting on the drain loop to notice the same exit independently.
    pub fn mark_exited(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let attached = self.attached.clone();
        tokio::spawn(async move {
            attached.lock().await.take();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_attach_is_rejected_while_first_holds_the_session() {
        let (master_fd, _slave_fd) = match nix::pty::openpty(None, None) {
            Ok(r) => (r.master, r.slave),
            Err(_) => return, // no PTY support in this sandbox; skip
        };
        let mux = AttachMux::spawn(master_fd).unwrap();

        let (a_client, a_server) = tokio::io::duplex(1024);
        let (_b_client, b_server) = tokio::io::duplex(1024);

        let mux_ref = &mux;
        let attach_a = async move {
            let _ = mux_ref.attach(a_server).await;
        };
        tokio::pin!(attach_a);

        // Give the first attach a moment to install itself.
        tokio::select! {
            _ = &mut attach_a => {},
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {},
        }

        let second = mux.attach(b_server).await;
        assert!(second.is_err());
        drop(a_client);
    }
}

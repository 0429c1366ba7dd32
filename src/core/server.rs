//! Control server (C7, §4.6): filesystem-socket listener, per-connection
//! request/response framing, and the `attach` mode switch to a raw byte
//! stream.

use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::commands;
use super::config::ContainerSpec;
use super::container::Container;
use super::error::{PhiockerError, Result};
use super::launcher;
use super::protocol::{read_envelope, write_envelope, Request, Response};
use super::registry::Registry;

pub struct Daemon {
    socket_path: PathBuf,
    base_path: PathBuf,
    registry: Registry,
}

impl Daemon {
    pub fn new(socket_path: PathBuf, base_path: PathBuf) -> Self {
        Self {
            socket_path,
            base_path,
            registry: Registry::new(),
        }
    }

    /// Binds the control socket, rejecting a live daemon and clearing a stale
    /// socket file left behind by a crashed one (§4.6/§8 boundary cases).
    pub async fn run(self) -> Result<()> {
        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(PhiockerError::state(format!(
                        "daemon is already running on {}",
                        self.socket_path.display()
                    )))
                }
                Err(_) => {
                    debug!(
                        "removing stale socket file at {}",
                        self.socket_path.display()
                    );
                    std::fs::remove_file(&self.socket_path).map_err(PhiockerError::Io)?;
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(PhiockerError::Io)?;
        info!("daemon listening on {}", self.socket_path.display());

        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let base_path = self.base_path.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, base_path, registry).await {
                    debug!("connection ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    base_path: PathBuf,
    registry: Registry,
) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let request: Request = match read_envelope(&mut reader).await.map_err(PhiockerError::Io)? {
        Some(r) => r,
        None => return Ok(()), // peer disconnected before sending anything
    };
    debug!("dispatching request: {:?}", request);

    if request.kind == "attach" {
        return handle_attach(reader, &request, &registry).await;
    }

    let response = dispatch(&request, &base_path, &registry).await;
    let mut inner = reader.into_inner();
    write_envelope(&mut inner, &response)
        .await
        .map_err(PhiockerError::Io)?;
    let _ = inner.shutdown().await;
    Ok(())
}

async fn dispatch(request: &Request, base_path: &Path, registry: &Registry) -> Response {
    let result = match request.kind.as_str() {
        "run" => run(&request.args, base_path, registry).await,
        "ps" => commands::ps(registry),
        "stop" => commands::stop(&request.args, registry).await,
        "list" => commands::list(&request.args, base_path),
        "create" => commands::create(&request.args, base_path).await,
        "delete" => commands::delete(&request.args, base_path, registry),
        "update" => commands::update(&request.args, base_path).await,
        "download" => commands::download(&request.args, base_path).await,
        "search" => commands::search(&request.args).await,
        other => Err(PhiockerError::user(format!("unknown request type '{other}'"))),
    };

    match result {
        Ok(output) => Response::ok(output),
        Err(e) => Response::err(e.to_string()),
    }
}

async fn run(args: &[String], base_path: &Path, registry: &Registry) -> Result<String> {
    let name = args
        .first()
        .ok_or_else(|| PhiockerError::user("run requires a container name"))?;

    if registry.contains(name) {
        return Err(PhiockerError::user(format!(
            "container '{name}' is already running"
        )));
    }

    let config_path = base_path.join("containers").join(name).join("config.json");
    let spec = ContainerSpec::load(&config_path)?;
    spec.validate(true)?;

    let launch = launcher::spawn(base_path, &spec, &spec.limits)?;
    let pid = launch.pid;
    let mux_fd = launch.master.try_clone().map_err(PhiockerError::Io)?;
    let mux = super::attach::AttachMux::spawn(mux_fd)?;
    let container = Container::new(name.clone(), pid, launch.master, launch.cgroup);
    registry.insert(name.clone(), container, mux)?;

    Ok(format!("container '{name}' started (pid {})\n", pid))
}

/// `attach` never returns a framed response after the handoff: the response
/// envelope is the last framed message, then the connection becomes a raw
/// byte stream. Any bytes the `BufReader` already buffered past the envelope
/// are replayed automatically because we keep reading through the same
/// reader rather than dropping it.
async fn handle_attach(
    mut reader: BufReader<UnixStream>,
    request: &Request,
    registry: &Registry,
) -> Result<()> {
    let name = match request.args.first() {
        Some(n) => n.clone(),
        None => {
            let resp = Response::err("attach requires a container name");
            write_envelope(reader.get_mut(), &resp)
                .await
                .map_err(PhiockerError::Io)?;
            return Ok(());
        }
    };

    let (container, mux) = match (registry.get(&name), registry.mux(&name)) {
        (Some(c), Some(m)) => (c, m),
        _ => {
            let resp = Response::err(format!("container '{name}' is not running"));
            write_envelope(reader.get_mut(), &resp)
                .await
                .map_err(PhiockerError::Io)?;
            return Ok(());
        }
    };

    if let (Some(rows), Some(cols)) = (request.args.get(1), request.args.get(2)) {
        if let (Ok(rows), Ok(cols)) = (rows.parse::<u16>(), cols.parse::<u16>()) {
            if let Some(fd) = mux.master_fd() {
                set_window_size(fd, rows, cols);
            }
        }
    }

    let resp = Response::ok(container.pid().as_raw().to_string());
    write_envelope(reader.get_mut(), &resp)
        .await
        .map_err(PhiockerError::Io)?;

    // Keep using the same `BufReader` rather than unwrapping it: any bytes
    // the client already pipelined past the response envelope are sitting in
    // its internal buffer, and `into_inner()` would silently drop them.
    if let Err(e) = mux.attach(reader).await {
        error!("attach session for '{name}' ended: {e}");
    }
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
        let _ = nix::libc::ioctl(master_fd, nix::libc::TIOCSWINSZ as _, &ws as *const Winsize);
    }
}

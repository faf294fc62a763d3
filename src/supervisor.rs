//! Session supervisor: forks the application, mints connection
//! tokens, accepts app connections, and spawns a worker per connection.
//!
//! Two modes, grounded directly on
//! `examples/original_source/src/server.c`'s `run_single_server` and
//! `run_multi_server`: oneshot hands the application one end of a
//! pre-created socketpair and runs as the sole worker itself; multi binds
//! a listening socket at a display path and forks one worker process per
//! accepted connection, keeping only `{token, child_pid, link_fd}` for
//! each.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, mkfifo, unlink, ForkResult, Pid};

use crate::channel;
use crate::config::{SessionConfig, SessionMode};
use crate::constants::{DISPLAY_SOCKET_BACKLOG, MAX_SHELL_LEN, SOCKADDR_PATH_MAX};
use crate::env as wayland_env;
use crate::error::SessionError;
use crate::reconnect;
use crate::shadow::Side;
use crate::token::ConnectionToken;
use crate::worker::WorkerSession;

/// One live app connection the supervisor tracks in multi mode.
pub struct ConnectionRecord {
    pub token: ConnectionToken,
    pub child_pid: i32,
    pub link_fd: UnixStream,
}

/// Connection table for multi mode; a plain `Vec` is sufficient at the
/// scale this proxy operates at (spec doesn't call for more than linear
/// scans per reconnection event, which is itself a rare operation).
pub type ConnMap = Vec<ConnectionRecord>;

/// Runs a complete session per `config`: forks the application, then
/// dispatches to oneshot or multi mode, and finally waits for the
/// application to exit, propagating its status.
pub fn run_server(config: SessionConfig, shutdown: &AtomicBool) -> Result<i32> {
    let display_path = match &config.mode {
        SessionMode::Display { name } => Some(resolve_display_socket_path(name)?),
        SessionMode::Oneshot => None,
    };

    let (wayland_socket, server_link, listener) = match &config.mode {
        SessionMode::Oneshot => {
            let (a, b) = socketpair(
                AddressFamily::Unix,
                SockType::Stream,
                None,
                SockFlag::empty(),
            )
            .map_err(|e| SessionError::fatal("failed to create app socketpair", e))?;
            (Some(a), Some(UnixStream::from(b)), None)
        }
        SessionMode::Display { .. } => {
            let path = display_path.as_ref().expect("display mode sets display_path");
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(|e| {
                SessionError::fatal(&format!("failed to bind display socket at {}", path.display()), e)
            })?;
            listener
                .set_nonblocking(true)
                .context("failed to set display socket non-blocking")?;
            // `UnixListener` doesn't expose backlog directly; std binds with
            // a platform default backlog already close to
            // DISPLAY_SOCKET_BACKLOG. Kept as a named constant
            // for documentation and for a future raw-socket bind if a
            // caller needs the exact number.
            let _ = DISPLAY_SOCKET_BACKLOG;
            (None, None, Some(listener))
        }
    };

    let app_pid = spawn_application(&config, wayland_socket)?;

    let control_fifo = match &config.control_fifo {
        Some(path) => match open_control_fifo(path) {
            Ok(fd) => Some(fd),
            Err(e) => {
                log::error!("failed to set up control FIFO at {}: {e:#}", path.display());
                None
            }
        },
        None => None,
    };

    let retcode = match &config.mode {
        SessionMode::Oneshot => {
            run_oneshot_server(control_fifo, server_link.expect("oneshot sets server_link"), &config, shutdown)
        }
        SessionMode::Display { .. } => run_multi_server(
            control_fifo,
            listener.expect("display mode sets listener"),
            app_pid,
            &config,
            shutdown,
        ),
    };

    if let Some(path) = &config.control_fifo {
        let _ = unlink(path);
    }
    if let Some(path) = &display_path {
        let _ = unlink(path.as_path());
    }

    let retcode = retcode?;

    let wait_flag = if shutdown.load(Ordering::Relaxed) {
        WaitPidFlag::WNOHANG
    } else {
        WaitPidFlag::empty()
    };
    match waitpid(Pid::from_raw(app_pid), Some(wait_flag)) {
        Ok(WaitStatus::Exited(_, code)) => Ok(code),
        Ok(_) | Err(_) => Ok(retcode),
    }
}

/// Resolves `WAYLAND_DISPLAY`'s socket path: absolute paths are used
/// as-is, relative names are resolved under `$XDG_RUNTIME_DIR`,
/// both checked against [`SOCKADDR_PATH_MAX`].
fn resolve_display_socket_path(display: &str) -> Result<PathBuf> {
    if let Some(stripped) = display.strip_prefix('/') {
        let _ = stripped;
        if display.len() >= SOCKADDR_PATH_MAX {
            bail!(
                "absolute path '{display}' for WAYLAND_DISPLAY is too long ({} bytes >= {})",
                display.len(),
                SOCKADDR_PATH_MAX
            );
        }
        return Ok(PathBuf::from(display));
    }
    let xdg = std::env::var("XDG_RUNTIME_DIR")
        .context("XDG_RUNTIME_DIR not set, cannot place display socket for a relative WAYLAND_DISPLAY name")?;
    if xdg.len() + 1 + display.len() >= SOCKADDR_PATH_MAX {
        bail!(
            "path '{xdg}/{display}' for WAYLAND_DISPLAY is too long ({} bytes >= {})",
            xdg.len() + 1 + display.len(),
            SOCKADDR_PATH_MAX
        );
    }
    Ok(PathBuf::from(xdg).join(display))
}

/// Forks the application process. The child applies the mode-appropriate
/// environment then execs either the configured argv or a shell
/// fallback; the parent returns the child's pid.
fn spawn_application(config: &SessionConfig, wayland_socket: Option<OwnedFd>) -> Result<i32> {
    // Safety: forking before any additional threads exist in this process;
    // the child immediately execs or exits without returning through Rust
    // call frames that assume a single-threaded invariant beyond this
    // point.
    match unsafe { fork() }.map_err(|e| SessionError::fatal("fork failed for application process", e))? {
        ForkResult::Child => {
            match &config.mode {
                SessionMode::Oneshot => {
                    let fd = wayland_socket.expect("oneshot sets wayland_socket");
                    wayland_env::apply_oneshot_env(fd.as_raw_fd());
                    std::mem::forget(fd); // survives across execvp
                }
                SessionMode::Display { name } => {
                    // The resolved XDG_RUNTIME_DIR path is only used to bind
                    // the listening socket; WAYLAND_DISPLAY always gets the
                    // literal configured name, matching server.c's
                    // `setenv("WAYLAND_DISPLAY", wayland_display, 1)`.
                    wayland_env::apply_display_env(name);
                }
            }

            let (program, argv0) = if config.app_argv.is_empty() {
                resolve_shell_fallback(config.login_shell)
            } else {
                (config.app_argv[0].clone(), config.app_argv[0].clone())
            };
            let extra_args = if config.app_argv.is_empty() {
                Vec::new()
            } else {
                config.app_argv[1..].to_vec()
            };

            let program_c = CString::new(program.clone()).unwrap_or_default();
            let mut argv_c = vec![CString::new(argv0).unwrap_or_default()];
            argv_c.extend(extra_args.into_iter().filter_map(|a| CString::new(a).ok()));

            let err = nix::unistd::execvp(&program_c, &argv_c);
            log::error!("failed to execvp '{program}': {err:?}");
            std::process::exit(libc::EXIT_FAILURE);
        }
        ForkResult::Parent { child } => {
            // The supervisor no longer needs its copy of the app's end of
            // the socketpair once the child has inherited it.
            drop(wayland_socket);
            Ok(child.as_raw())
        }
    }
}

/// Shell fallback when no app argv is given: `$SHELL`, falling
/// back to `/bin/sh` when unset or `>= MAX_SHELL_LEN` bytes; `argv[0]` gets
/// a leading `-` (login shell convention) when requested.
fn resolve_shell_fallback(login_shell: bool) -> (String, String) {
    let default_shell = "/bin/sh".to_string();
    let shell = match std::env::var("SHELL") {
        Ok(s) if s.len() < MAX_SHELL_LEN => s,
        Ok(s) => {
            log::error!(
                "$SHELL is too long at {} bytes, falling back to {default_shell}",
                s.len()
            );
            default_shell.clone()
        }
        Err(_) => default_shell.clone(),
    };
    let basename = shell.rsplit('/').next().unwrap_or(&shell).to_string();
    let argv0 = if login_shell {
        format!("-{basename}")
    } else {
        shell.clone()
    };
    (shell, argv0)
}

fn open_control_fifo(path: &Path) -> Result<OwnedFd> {
    let created = match mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o644)) {
        Ok(()) => true,
        Err(nix::errno::Errno::EEXIST) => false,
        Err(e) => return Err(e).context("mkfifo failed"),
    };
    // If we created the node ourselves, remove it on any failure below so a
    // bad `--control` path doesn't leave an orphaned fifo behind; a
    // pre-existing node (created=false) is left for its owner to manage.
    let cleanup = scopeguard::guard(created, |created| {
        if created {
            let _ = unlink(path);
        }
    });

    // Opened read-write in this process (both ends) to avoid spurious
    // POLLHUP once the first external writer closes their end.
    let fd = nix::fcntl::open(
        path,
        nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_NONBLOCK,
        nix::sys::stat::Mode::empty(),
    )
    .context("failed to open control FIFO")?;

    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Oneshot mode: a single channel connection and, if
/// reconnection is configured, a forked reconnector subprocess (spec
/// §4.G); this process itself becomes the sole worker.
fn run_oneshot_server(
    control_fifo: Option<OwnedFd>,
    server_link: UnixStream,
    config: &SessionConfig,
    shutdown: &AtomicBool,
) -> Result<i32> {
    let mut chanfd = match channel::connect_to_socket(&config.channel_socket) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}", SessionError::Fatal(format!("failed to connect channel: {e:#}")));
            return Ok(libc::EXIT_FAILURE);
        }
    };

    let reconnectable = control_fifo.is_some();
    let token = ConnectionToken::mint(reconnectable, [0, 0, 0]);
    if let Err(e) = channel::write_token(&mut chanfd, token) {
        log::error!("{}", SessionError::Fatal(format!("failed to write connection token: {e:#}")));
        return Ok(libc::EXIT_FAILURE);
    }

    let link = if let Some(control_fifo) = control_fifo {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| SessionError::fatal("failed to create link socketpair", e))?;
        match unsafe { fork() }.map_err(|e| SessionError::fatal("fork failed for reconnector", e))? {
            ForkResult::Child => {
                drop(chanfd);
                drop(server_link);
                drop(a);
                let flagged = token.as_update();
                let code = reconnect::run_reconnector(control_fifo, UnixStream::from(b), flagged);
                std::process::exit(code);
            }
            ForkResult::Parent { .. } => {
                drop(control_fifo);
                drop(b);
                Some(UnixStream::from(a))
            }
        }
    } else {
        None
    };

    let session = WorkerSession::new(
        server_link,
        chanfd,
        link,
        Side::Source,
        config.codec,
        config.source_threads,
    )?;
    session.run(shutdown)
}

/// Multi (display-socket) mode: accepts app connections off a
/// listening socket, forking one worker per connection, and folds the
/// reconnection controller directly into this loop.
fn run_multi_server(
    control_fifo: Option<OwnedFd>,
    listener: UnixListener,
    app_pid: i32,
    config: &SessionConfig,
    shutdown: &AtomicBool,
) -> Result<i32> {
    let mut connections: ConnMap = Vec::new();
    let mut current_channel = config.channel_socket.clone();
    let reconnectable = control_fifo.is_some();

    let retcode = loop {
        if shutdown.load(Ordering::Relaxed) {
            break 0;
        }

        match waitpid(Pid::from_raw(app_pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(..)) => break libc::EXIT_FAILURE,
            _ => {}
        }

        sweep_connections(&mut connections);

        let mut fds = vec![PollFd::new(
            std::os::fd::AsFd::as_fd(&listener),
            PollFlags::POLLIN,
        )];
        if let Some(fifo) = &control_fifo {
            fds.push(PollFd::new(fifo.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::try_from(250u16).unwrap_or(PollTimeout::NONE)) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                log::error!("poll failed in supervisor loop: {e}");
                break libc::EXIT_FAILURE;
            }
        }

        if fds.len() > 1 && fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            if let Some(fifo) = &control_fifo {
                match reconnect::read_control_path(fifo.as_raw_fd()) {
                    Ok(Some(new_path)) => {
                        let outcomes = reconnect::migrate_connections(&connections, &new_path);
                        let migrated = outcomes.iter().filter(|o| o.migrated).count();
                        if migrated < outcomes.len() {
                            log::warn!(
                                "partial migration: {migrated}/{} connections moved to {}",
                                outcomes.len(),
                                new_path.display()
                            );
                        }
                        // New connections adopt the new endpoint regardless
                        // of how many existing ones migrated cleanly (spec
                        // §9 best-effort resolution).
                        current_channel = new_path;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("failed to read control FIFO: {e:#}"),
                }
            }
        }

        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            match listener.accept() {
                Ok((appfd, _)) => {
                    let token = ConnectionToken::mint(reconnectable, [0, 0, 0]);
                    if let Err(e) = accept_new_connection(
                        &current_channel,
                        appfd,
                        token,
                        reconnectable,
                        &mut connections,
                        config,
                        shutdown,
                    ) {
                        log::error!("failed to handle new connection: {e:#}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break libc::EXIT_FAILURE;
                }
            }
        }
    };

    // Reap every worker still in the table: WNOHANG if shutdown was
    // flagged (avoid hanging on a wedged worker during a shutdown-driven
    // exit), blocking otherwise, matching the reap discipline `sweep_connections`
    // uses on each poll iteration.
    let wait_flag = if shutdown.load(Ordering::Relaxed) {
        WaitPidFlag::WNOHANG
    } else {
        WaitPidFlag::empty()
    };
    for record in connections {
        channel::checked_close(record.link_fd.into());
        let _ = waitpid(Pid::from_raw(record.child_pid), Some(wait_flag));
    }

    Ok(retcode)
}

/// Connects a new channel for one accepted app connection, writes its
/// token, and forks a worker to run it.
#[allow(clippy::too_many_arguments)]
fn accept_new_connection(
    current_channel: &Path,
    appfd: UnixStream,
    token: ConnectionToken,
    reconnectable: bool,
    connections: &mut ConnMap,
    config: &SessionConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut chanfd = channel::connect_to_socket(current_channel)
        .map_err(|e| SessionError::fatal("failed to connect channel for new connection", e))?;
    channel::write_token(&mut chanfd, token)
        .map_err(|e| SessionError::fatal("failed to write token for new connection", e))?;

    let link = if reconnectable {
        Some(
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).map_err(|e| {
                SessionError::fatal("failed to create per-connection link socketpair", e)
            })?,
        )
    } else {
        None
    };

    match unsafe { fork() }.map_err(|e| SessionError::fatal("fork failed for connection worker", e))? {
        ForkResult::Child => {
            drop_all_other_links(connections);
            let worker_link = link.map(|(_, b)| UnixStream::from(b));
            let side = Side::Source;
            match WorkerSession::new(appfd, chanfd, worker_link, side, config.codec, config.sink_threads) {
                Ok(session) => {
                    let code = session.run(shutdown).unwrap_or(libc::EXIT_FAILURE);
                    std::process::exit(code);
                }
                Err(e) => {
                    log::error!("failed to start worker session: {e:#}");
                    std::process::exit(libc::EXIT_FAILURE);
                }
            }
        }
        ForkResult::Parent { child } => {
            drop(chanfd);
            drop(appfd);
            if let Some((a, _)) = link {
                connections.push(ConnectionRecord {
                    token,
                    child_pid: child.as_raw(),
                    link_fd: UnixStream::from(a),
                });
            }
            Ok(())
        }
    }
}

/// In the forked child, every other connection's link fd belongs to the
/// supervisor process only; a worker that kept them open would prevent
/// the supervisor from ever observing hangup on those links.
fn drop_all_other_links(connections: &ConnMap) {
    for record in connections {
        let raw = record.link_fd.as_raw_fd();
        let _ = nix::unistd::close(raw);
    }
}

/// Non-blocking reap sweep: drops connection-table entries
/// whose worker has already exited.
fn sweep_connections(connections: &mut ConnMap) {
    connections.retain(|record| {
        match waitpid(Pid::from_raw(record.child_pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => false,
            Err(_) => false,
        }
    });
}

//! Reconnection controller.
//!
//! Two code paths share the write-token-then-send-fd routine, per
//! `examples/original_source/src/server.c`'s
//! `run_single_server_reconnector` / `update_connections` duplication:
//! oneshot mode runs this as a forked subprocess with its own poll loop;
//! multi (display-socket) mode folds the same logic directly into the
//! supervisor's own poll loop via [`migrate_connections`].

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::channel;
use crate::constants::{MAX_CONTROL_READ, SOCKADDR_PATH_MAX};
use crate::error::SessionError;
use crate::supervisor::ConnMap;
use crate::token::ConnectionToken;

/// Reads one socket path from a control FIFO: up to
/// [`MAX_CONTROL_READ`] bytes, the first embedded NUL or newline
/// terminating the path. Multiple writes concatenated in the FIFO's buffer
/// are handled naturally since each call only consumes what's currently
/// queued. Returns `Ok(None)` on a zero-byte read (nothing queued, e.g. a
/// spurious wakeup), `Err` on a read failure or an over-length path (spec
/// §7 "length-limit violations... logged and the offending input is
/// ignored").
pub fn read_control_path(fifo_fd: std::os::fd::RawFd) -> Result<Option<PathBuf>> {
    let mut buf = [0u8; MAX_CONTROL_READ];
    let n = nix::unistd::read(fifo_fd, &mut buf).context("failed to read control FIFO")?;
    if n == 0 {
        return Ok(None);
    }
    let end = buf[..n]
        .iter()
        .position(|&b| b == 0 || b == b'\n')
        .unwrap_or(n);
    let path = std::str::from_utf8(&buf[..end]).context("control FIFO path is not valid UTF-8")?;
    if path.len() >= SOCKADDR_PATH_MAX {
        anyhow::bail!(
            "socket path read from control FIFO is too long ({} bytes, expected < {})",
            path.len(),
            SOCKADDR_PATH_MAX
        );
    }
    Ok(Some(PathBuf::from(path)))
}

/// Connects to `endpoint`, writes `flagged_token` (already `UPDATE`-set),
/// and sends the resulting fd to `link` — the one routine both
/// reconnection code paths share.
fn write_token_and_send_fd(
    endpoint: &Path,
    flagged_token: ConnectionToken,
    link: &UnixStream,
) -> Result<()> {
    let mut new_conn = channel::connect_to_socket(endpoint)
        .map_err(|e| SessionError::transient("failed to connect replacement channel", e))?;
    channel::write_token(&mut new_conn, flagged_token)
        .map_err(|e| SessionError::transient("failed to write token to replacement channel", e))?;
    channel::send_one_fd(link, new_conn.as_raw_fd()).map_err(|e| {
        SessionError::transient("failed to send replacement channel fd over link socket", e)
    })?;
    Ok(())
}

/// Labels an error from [`write_token_and_send_fd`] by its [`SessionError`]
/// kind for logging; these are always transient by construction but the
/// downcast keeps the log line honest if that ever changes.
fn describe_kind(e: &anyhow::Error) -> &'static str {
    match e.downcast_ref::<SessionError>() {
        Some(se) if se.is_session_fatal() => "fatal",
        Some(_) => "transient",
        None => "error",
    }
}

/// Oneshot-mode reconnector subprocess loop, run after `fork`
/// in a process that shares no other state with the supervisor. Returns
/// the process exit code.
pub fn run_reconnector(control_fifo: OwnedFd, link: UnixStream, flagged_token: ConnectionToken) -> i32 {
    loop {
        let mut fds = [
            PollFd::new(control_fifo.as_fd(), PollFlags::POLLIN),
            PollFd::new(link.as_fd(), PollFlags::empty()),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return libc::EXIT_FAILURE,
        }

        if fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLHUP)) {
            // The worker closed its end of the link: it's gone, nothing
            // left to reconnect for.
            break;
        }

        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            let path = match read_control_path(control_fifo.as_raw_fd()) {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("failed to read control FIFO: {e:#}");
                    continue;
                }
            };
            if let Err(e) = write_token_and_send_fd(&path, flagged_token, &link) {
                log::warn!(
                    "reconnection attempt to {} failed ({}): {e:#}",
                    path.display(),
                    describe_kind(&e)
                );
                continue;
            }
        }
    }
    libc::EXIT_SUCCESS
}

/// Outcome of one connection's attempted migration to a new channel
/// endpoint, for the caller to inspect after a [`migrate_connections`] call
///.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub connection_index: usize,
    pub child_pid: i32,
    pub migrated: bool,
    pub error: Option<String>,
}

/// Multi-mode fold-in of the reconnection controller: for each
/// live connection, opens a new channel to `new_endpoint`, writes that
/// connection's token with `UPDATE` set, and sends the fd over its link
/// socket. Best-effort: a failure partway through leaves already-migrated
/// connections on the new endpoint and the rest on the old one.
pub fn migrate_connections(connections: &ConnMap, new_endpoint: &Path) -> Vec<MigrationOutcome> {
    connections
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let flagged = record.token.as_update();
            match write_token_and_send_fd(new_endpoint, flagged, &record.link_fd) {
                Ok(()) => MigrationOutcome {
                    connection_index: index,
                    child_pid: record.child_pid,
                    migrated: true,
                    error: None,
                },
                Err(e) => {
                    log::warn!(
                        "failed to migrate connection (pid {}) to {} ({}): {e:#}",
                        record.child_pid,
                        new_endpoint.display(),
                        describe_kind(&e)
                    );
                    MigrationOutcome {
                        connection_index: index,
                        child_pid: record.child_pid,
                        migrated: false,
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .collect()
}

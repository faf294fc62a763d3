//! Channel socket I/O.
//!
//! A channel is the single byte-oriented transport between the two proxy
//! endpoints — in this codebase, always a Unix-domain stream socket at a
//! filesystem path. Two operations matter: connecting to that endpoint, and
//! passing exactly one file descriptor across a stream socket pair via
//! `SCM_RIGHTS` ancillary data.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Context, Result};
use sendfd::{RecvWithFd, SendWithFd};

use crate::constants::TOKEN_WIRE_SIZE;
use crate::token::ConnectionToken;

/// Connects to a Unix-domain channel endpoint at `path`.
///
/// Errors propagate as a single `anyhow::Error`; the caller is responsible
/// for closing any other fds it opened on this failure path.
pub fn connect_to_socket(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).with_context(|| format!("failed to connect to {}", path.display()))
}

/// Writes a token as the first 16 bytes on a freshly-connected (or
/// freshly-replaced) channel. Spec §5: "Token write on a new channel always
/// precedes any payload traffic on that channel."
pub fn write_token(stream: &mut UnixStream, token: ConnectionToken) -> Result<()> {
    use std::io::Write;
    let bytes = token.to_wire();
    stream
        .write_all(&bytes)
        .context("failed to write connection token")?;
    Ok(())
}

/// Reads the 16-byte token that must be the first thing on a freshly
/// accepted channel.
pub fn read_token(stream: &mut UnixStream) -> Result<ConnectionToken> {
    use std::io::Read;
    let mut buf = [0u8; TOKEN_WIRE_SIZE];
    stream
        .read_exact(&mut buf)
        .context("failed to read connection token")?;
    Ok(ConnectionToken::from_wire(buf))
}

/// Sends a single fd across a connected stream socket (typically a
/// link-fd socketpair) using `SCM_RIGHTS` ancillary data.
pub fn send_one_fd(link: &UnixStream, fd: RawFd) -> Result<()> {
    let n = link
        .send_with_fd(&[0u8], &[fd])
        .context("failed to send fd over link socket")?;
    if n != 1 {
        bail!("short write sending fd over link socket");
    }
    Ok(())
}

/// Receives a single fd sent with [`send_one_fd`].
pub fn recv_one_fd(link: &UnixStream) -> Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut fds = [0 as RawFd; 1];
    let (_, nfds) = link
        .recv_with_fd(&mut byte, &mut fds)
        .context("failed to receive fd over link socket")?;
    if nfds != 1 {
        bail!("expected exactly one fd, got {nfds}");
    }
    // Safety: recv_with_fd reports this fd as freshly received and owned by
    // us; nothing else in the process holds it yet.
    Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) })
}

/// A checked-close wrapper: every fd must be closed exactly once through a
/// single path, with double-close treated as a programming error. Taking
/// `OwnedFd` by value makes a second call a compile error rather than a
/// runtime one.
pub fn checked_close(fd: OwnedFd) {
    drop(fd);
}

/// Returns the raw fd for passing to syscalls that don't yet take `OwnedFd`.
#[must_use]
pub fn raw(stream: &UnixStream) -> RawFd {
    stream.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ConnectionToken;

    #[test]
    fn token_roundtrips_over_a_real_socketpair() {
        let (mut a, mut b) = UnixStream::pair().expect("socketpair");
        let token = ConnectionToken::mint(true, [1, 2, 3]);
        write_token(&mut a, token).expect("write");
        let got = read_token(&mut b).expect("read");
        assert_eq!(got, token);
    }

    #[test]
    fn fd_passing_roundtrips_over_a_real_socketpair() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let tmp = tempfile::tempfile().expect("tempfile");
        let owned: OwnedFd = tmp.into();
        send_one_fd(&a, owned.as_raw_fd()).expect("send");
        // keep `owned` alive until after the send completes on this side
        drop(owned);
        let received = recv_one_fd(&b).expect("recv");
        assert!(received.as_raw_fd() >= 0);
    }
}

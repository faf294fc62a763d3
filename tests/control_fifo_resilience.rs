//! Oversized control-FIFO input is rejected without bringing the reader
//! down, and a subsequent valid write is still honored.

use std::io::Write;
use std::os::fd::AsRawFd;

use shadowlink::constants::SOCKADDR_PATH_MAX;
use shadowlink::reconnect::read_control_path;

#[test]
fn s6_oversized_input_rejected_then_valid_input_honored() {
    let (r, w) = nix::unistd::pipe().expect("pipe");
    let mut w = std::fs::File::from(w);

    let oversized = "/".to_string() + &"x".repeat(SOCKADDR_PATH_MAX);
    w.write_all(oversized.as_bytes()).expect("write oversized");

    let result = read_control_path(r.as_raw_fd());
    assert!(result.is_err(), "an over-length path must be rejected");

    w.write_all(b"/tmp/a-valid-endpoint.sock\0").expect("write valid");
    let path = read_control_path(r.as_raw_fd())
        .expect("a subsequent valid write must still be readable")
        .expect("non-empty read");
    assert_eq!(path, std::path::PathBuf::from("/tmp/a-valid-endpoint.sock"));
}

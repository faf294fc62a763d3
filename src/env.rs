//! Environment presented to the forked application.
//!
//! Exactly one of `WAYLAND_SOCKET` / `WAYLAND_DISPLAY` is set in the
//! application's environment depending on session mode, mirroring the
//! upstream `wl_display_connect` convention: a raw fd number takes priority
//! over a socket name when both could apply, so the other variable must be
//! unset rather than left stale from the parent's own environment.
//!
//! Called only in the forked child, immediately before `execvp` (spec
//! §4.F); never in the supervisor process itself.

use std::os::fd::RawFd;

/// Oneshot mode: the application is handed one end of a socket pair
/// directly by fd number, so `WAYLAND_SOCKET` is set and `WAYLAND_DISPLAY`
/// is cleared in case it leaked in from the parent's environment.
pub fn apply_oneshot_env(wayland_socket_fd: RawFd) {
    std::env::remove_var("WAYLAND_DISPLAY");
    std::env::set_var("WAYLAND_SOCKET", wayland_socket_fd.to_string());
}

/// Display (multi) mode: the application connects by name, so
/// `WAYLAND_DISPLAY` is set to whatever name or absolute path the
/// supervisor resolved the listening socket at, and `WAYLAND_SOCKET` is
/// cleared.
pub fn apply_display_env(wayland_display: &str) {
    std::env::remove_var("WAYLAND_SOCKET");
    std::env::set_var("WAYLAND_DISPLAY", wayland_display);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // std::env mutation is process-global; serialize these tests so they
    // don't race each other under a parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn oneshot_sets_socket_and_clears_display() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("WAYLAND_DISPLAY", "stale-value");
        apply_oneshot_env(17);
        assert_eq!(std::env::var("WAYLAND_SOCKET").as_deref(), Ok("17"));
        assert!(std::env::var("WAYLAND_DISPLAY").is_err());
    }

    #[test]
    fn display_sets_display_and_clears_socket() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("WAYLAND_SOCKET", "3");
        apply_display_env("wayland-1");
        assert_eq!(std::env::var("WAYLAND_DISPLAY").as_deref(), Ok("wayland-1"));
        assert!(std::env::var("WAYLAND_SOCKET").is_err());
    }
}

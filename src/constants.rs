//! Application-wide constants for shadowlink.
//!
//! Centralizes the magic numbers scattered through the protocol: token bit
//! layout, listen backlog, and the various length cutoffs the supervisor
//! enforces on untrusted inputs (control-FIFO paths, `$SHELL`).

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol version placed in the high 16 bits of the token header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Discriminant bit that every valid token header carries. Used to reject
/// garbage on a freshly-accepted connection before anything else is parsed.
pub const CONN_FIXED_BIT: u32 = 0x1;

/// Set when the token's channel is allowed to be replaced later in the
/// session (a control FIFO is configured).
pub const CONN_RECONNECTABLE_BIT: u32 = 0x2;

/// Set on every token after the first one for a given session: the key
/// words are identical to the original, only this bit differs.
pub const CONN_UPDATE_BIT: u32 = 0x4;

/// Wire size of a connection token: one `u32` header plus three `u32` key
/// words, little-endian.
pub const TOKEN_WIRE_SIZE: usize = 16;

/// Every update block is padded to a multiple of this many bytes.
pub const BLOCK_ALIGNMENT: usize = 16;

// ============================================================================
// Supervisor
// ============================================================================

/// Listen backlog for the display-socket listener in multi mode.
pub const DISPLAY_SOCKET_BACKLOG: usize = 128;

/// `$SHELL` values at or beyond this length fall back to the default shell,
/// mirroring the original C implementation's 254-byte buffer cutoff.
pub const MAX_SHELL_LEN: usize = 254;

/// Maximum control-FIFO read per call. Multiple writes may be concatenated;
/// the first embedded NUL or newline in the buffer terminates the path.
pub const MAX_CONTROL_READ: usize = 4095;

/// Longest path `sockaddr_un.sun_path` can hold on Linux, including the
/// terminating NUL. Control-FIFO paths and resolved `WAYLAND_DISPLAY`
/// socket paths are rejected at `SOCKADDR_PATH_MAX - 1` bytes.
pub const SOCKADDR_PATH_MAX: usize = 108;

// ============================================================================
// Compression defaults
// ============================================================================

/// Default LZ4 compression level.
pub const DEFAULT_LZ4_LEVEL: i32 = 1;

/// Default Zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 5;

//! Connection tokens — the 16-byte handshake prefix on every channel.
//!
//! The first 16 bytes written to (and read from) a freshly-connected channel
//! are always a [`ConnectionToken`]: a header encoding protocol version and
//! flags, plus a 96-bit session key. A fresh session's first token has
//! `UPDATE` unset; every replacement channel opened later for the same
//! session (see [`crate::reconnect`]) carries the identical key with
//! `UPDATE` set.

use rand::TryRngCore;

use crate::constants::{
    CONN_FIXED_BIT, CONN_RECONNECTABLE_BIT, CONN_UPDATE_BIT, PROTOCOL_VERSION, TOKEN_WIRE_SIZE,
};

/// The 16-byte handshake token written at the start of every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionToken {
    /// `(version << 16) | flags | FIXED`.
    pub header: u32,
    /// 96 bits of session key, as three `u32` words.
    pub key: [u32; 3],
}

/// Builds the header word for a token with the given flags.
#[must_use]
pub fn conntoken_header(reconnectable: bool, update: bool) -> u32 {
    (PROTOCOL_VERSION << 16)
        | if update { CONN_UPDATE_BIT } else { 0 }
        | if reconnectable {
            CONN_RECONNECTABLE_BIT
        } else {
            0
        }
        | CONN_FIXED_BIT
}

impl ConnectionToken {
    /// Mints a fresh token: `key` is seeded from whatever was previously
    /// there (all-zero for a brand-new session), mixed with a
    /// low-probability-of-collision combination of the mixed-in previous
    /// key, pid, and wall-clock time, then overwritten with CSPRNG bytes
    /// when available. A CSPRNG failure is not fatal — the mixed fallback
    /// is still usable.
    #[must_use]
    pub fn mint(reconnectable: bool, previous_key: [u32; 3]) -> Self {
        let key = fill_random_key(previous_key);
        Self {
            header: conntoken_header(reconnectable, false),
            key,
        }
    }

    /// Returns a copy of this token with `UPDATE` set and the same key,
    /// used for every channel opened after the first.
    #[must_use]
    pub fn as_update(&self) -> Self {
        Self {
            header: self.header | CONN_UPDATE_BIT,
            key: self.key,
        }
    }

    #[must_use]
    pub fn is_update(&self) -> bool {
        self.header & CONN_UPDATE_BIT != 0
    }

    #[must_use]
    pub fn is_reconnectable(&self) -> bool {
        self.header & CONN_RECONNECTABLE_BIT != 0
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.header & CONN_FIXED_BIT != 0
    }

    /// Encodes the token as 16 little-endian bytes, ready to write to a
    /// channel.
    #[must_use]
    pub fn to_wire(self) -> [u8; TOKEN_WIRE_SIZE] {
        let mut buf = [0u8; TOKEN_WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.header.to_le_bytes());
        buf[4..8].copy_from_slice(&self.key[0].to_le_bytes());
        buf[8..12].copy_from_slice(&self.key[1].to_le_bytes());
        buf[12..16].copy_from_slice(&self.key[2].to_le_bytes());
        buf
    }

    /// Decodes 16 bytes read from a channel. Does not itself validate
    /// `FIXED` or the version field — callers check those explicitly so
    /// they can produce a precise desync error.
    #[must_use]
    pub fn from_wire(buf: [u8; TOKEN_WIRE_SIZE]) -> Self {
        let header = u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default());
        let key = [
            u32::from_le_bytes(buf[4..8].try_into().unwrap_or_default()),
            u32::from_le_bytes(buf[8..12].try_into().unwrap_or_default()),
            u32::from_le_bytes(buf[12..16].try_into().unwrap_or_default()),
        ];
        Self { header, key }
    }
}

/// Mixes `previous` (multiplied by small distinct primes to preserve
/// entropy across re-seeds) with pid and wall-clock time, then overwrites
/// with `/dev/urandom`-quality bytes when the OS CSPRNG is available.
fn fill_random_key(previous: [u32; 3]) -> [u32; 3] {
    let mut key = previous;
    key[0] = key[0].wrapping_mul(13);
    key[1] = key[1].wrapping_mul(17);
    key[2] = key[2].wrapping_mul(29);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    key[0] = key[0].wrapping_add(std::process::id());
    key[1] = key[1].wrapping_add(1 + now.as_secs() as u32);
    key[2] = key[2].wrapping_add(1 + now.subsec_nanos());

    // Overwrite with CSPRNG output if it's available; failure here is not
    // fatal, the mixed fallback above is still a usable key.
    let mut rand_bytes = [0u8; 12];
    if let Ok(()) = rand::rngs::OsRng.try_fill_bytes(&mut rand_bytes) {
        key[0] = u32::from_ne_bytes(rand_bytes[0..4].try_into().unwrap_or_default());
        key[1] = u32::from_ne_bytes(rand_bytes[4..8].try_into().unwrap_or_default());
        key[2] = u32::from_ne_bytes(rand_bytes[8..12].try_into().unwrap_or_default());
    }
    key
}

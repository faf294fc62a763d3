//! Compression codec abstraction.
//!
//! Each session picks one compression mode for the life of the connection
//! (negotiated out of band, by CLI flag — there is no in-band renegotiation).
//! Block payloads are compressed independently, never across blocks, so a
//! single corrupt block can be skipped without losing the rest of a transfer.

use anyhow::{Context, Result};

use crate::constants::{DEFAULT_LZ4_LEVEL, DEFAULT_ZSTD_LEVEL};

/// The negotiated compression mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    Lz4 { level: i32 },
    Zstd { level: i32 },
}

impl CompressionMode {
    #[must_use]
    pub fn lz4_default() -> Self {
        Self::Lz4 {
            level: DEFAULT_LZ4_LEVEL,
        }
    }

    #[must_use]
    pub fn zstd_default() -> Self {
        Self::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }

    /// Parses the `--codec` CLI flag value, pairing it with an optional
    /// `--codec-level` override.
    pub fn parse(name: &str, level: Option<i32>) -> Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4 {
                level: level.unwrap_or(DEFAULT_LZ4_LEVEL),
            }),
            "zstd" => Ok(Self::Zstd {
                level: level.unwrap_or(DEFAULT_ZSTD_LEVEL),
            }),
            other => anyhow::bail!("unknown codec {other:?}, expected none|lz4|zstd"),
        }
    }

    /// Compresses `data`, returning the wire payload to place after a block
    /// header. `None` mode returns the input unchanged (no copy beyond what
    /// the caller already owns would be ideal, but the uniform `Vec<u8>`
    /// return keeps callers simple).
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 { .. } => Ok(lz4_flex::block::compress_prepend_size(data)),
            Self::Zstd { level } => {
                zstd::bulk::compress(data, level).context("zstd compression failed")
            }
        }
    }

    /// Decompresses a payload produced by [`Self::compress`] under the same
    /// mode. `expected_size` bounds the output allocation for `Zstd`, whose
    /// format doesn't self-describe a size the way `lz4_flex`'s
    /// `compress_prepend_size` does.
    pub fn decompress(self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 { .. } => lz4_flex::block::decompress_size_prepended(data)
                .context("lz4 decompression failed"),
            Self::Zstd { .. } => zstd::bulk::decompress(data, expected_size)
                .context("zstd decompression failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_mode_roundtrips_unchanged() {
        let data = b"hello shadowlink".to_vec();
        let mode = CompressionMode::None;
        let packed = mode.compress(&data).unwrap();
        assert_eq!(packed, data);
        let unpacked = mode.decompress(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn lz4_roundtrips() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mode = CompressionMode::lz4_default();
        let packed = mode.compress(&data).unwrap();
        let unpacked = mode.decompress(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn zstd_roundtrips() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 97) as u8).collect();
        let mode = CompressionMode::zstd_default();
        let packed = mode.compress(&data).unwrap();
        let unpacked = mode.decompress(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn parse_accepts_known_names_and_level_override() {
        assert_eq!(CompressionMode::parse("none", None).unwrap(), CompressionMode::None);
        assert_eq!(
            CompressionMode::parse("lz4", Some(9)).unwrap(),
            CompressionMode::Lz4 { level: 9 }
        );
        assert!(CompressionMode::parse("gzip", None).is_err());
    }
}

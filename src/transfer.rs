//! Transfer blocks: the wire format carrying shadow-fd content and the
//! collect/apply pipeline that produces and consumes it.
//!
//! Every update is a sequence of blocks, each padded to a
//! [`crate::constants::BLOCK_ALIGNMENT`]-byte boundary so a reader can skip
//! an unrecognized or malformed block without parsing its payload. A block's
//! header is exactly two 32-bit words on the wire: a packed `header` word
//! (type in the high 8 bits, the block's unpadded size in the low 24) and an
//! `xid` word, matching the original's `hb`/`xid` two-word read. A single
//! wire message is the concatenation of one or more blocks, built by
//! [`combine_transfer_blocks`] and walked back apart on the receiving side by
//! [`split_transfer_blocks`].

use std::convert::TryInto;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use memmap2::MmapOptions;

use crate::codec::CompressionMode;
use crate::constants::BLOCK_ALIGNMENT;
use crate::error::SessionError;
use crate::shadow::{DamageSet, ShadowFd};

/// The kind of block, determining how its payload is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Full replacement of the shadow's content.
    WholeObject = 0,
    /// `[offset: u64 LE][data]` payload; `data` replaces
    /// `[offset, offset + data.len())` of the shadow.
    PartialRegion = 1,
    /// `[new_size: u64 LE]` payload, no content.
    SizeExtension = 2,
    /// A chunk of bytes read from a pipe-backed shadow, appended in order.
    PipeChunk = 3,
    /// The write end of a pipe-backed shadow has closed.
    Hangup = 4,
    /// Reserved for a future acknowledgement/retransmission scheme (spec
    /// §9 open question); never produced by this implementation, but a
    /// conformant reader must be able to skip one without erroring.
    Ack = 5,
}

impl TransferType {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => Self::WholeObject,
            1 => Self::PartialRegion,
            2 => Self::SizeExtension,
            3 => Self::PipeChunk,
            4 => Self::Hangup,
            5 => Self::Ack,
            other => return Err(SessionError::desync(format!("unknown transfer block type {other}"))),
        })
    }
}

/// The fixed two-word wire header: 4 bytes of packed type+size, then a
/// 4-byte `xid`. Per-transfer-type fields that used to live in a wider
/// header (a region offset, a new size) are carried as a payload prefix
/// instead — see [`TransferType`].
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub remote_id: i32,
    pub transfer_type: TransferType,
}

/// One framed block: a header plus whatever bytes `transfer_type` says to
/// put in front of or instead of compressed content.
#[derive(Debug, Clone)]
pub struct TransferBlock {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

const HEADER_SIZE: usize = 8;
/// Type occupies the high 8 bits of the header word, size the low 24.
const TYPE_SHIFT: u32 = 24;
/// Largest unpadded `header + payload` size a single block can declare.
const SIZE_MASK: u32 = (1 << TYPE_SHIFT) - 1;

fn padded_len(n: usize) -> usize {
    (n + BLOCK_ALIGNMENT - 1) / BLOCK_ALIGNMENT * BLOCK_ALIGNMENT
}

/// Serializes a sequence of blocks into one wire message, padding each
/// block's header+payload to [`BLOCK_ALIGNMENT`] bytes. The header's size
/// field records the unpadded `header + payload` length, matching the
/// original's `transfer_size`/`alignu` split: a reader pads the declared
/// size up to learn how many bytes to skip, but slices the payload using
/// the unpadded length.
pub fn combine_transfer_blocks(blocks: &[TransferBlock]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for block in blocks {
        let logical_size = HEADER_SIZE + block.payload.len();
        if logical_size as u64 > u64::from(SIZE_MASK) {
            bail!("block of {logical_size} bytes exceeds the wire format's {SIZE_MASK}-byte size field");
        }
        let header_word = ((block.header.transfer_type as u32) << TYPE_SHIFT) | (logical_size as u32);
        out.extend_from_slice(&header_word.to_le_bytes());
        out.extend_from_slice(&block.header.remote_id.to_le_bytes());
        out.extend_from_slice(&block.payload);
        let padded = padded_len(logical_size);
        out.resize(out.len() + (padded - logical_size), 0);
    }
    Ok(out)
}

/// The inverse of [`combine_transfer_blocks`]: walks a wire message back
/// into individual blocks. A block whose declared size would run past the
/// end of `data`, or that declares a size smaller than the header itself,
/// is a desync, not silently truncated.
pub fn split_transfer_blocks(data: &[u8]) -> Result<Vec<TransferBlock>> {
    let mut blocks = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < HEADER_SIZE {
            return Err(SessionError::desync("truncated block header"));
        }
        let header_word =
            u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4 bytes"));
        let remote_id =
            i32::from_le_bytes(data[offset + 4..offset + 8].try_into().expect("4 bytes"));
        let transfer_type = TransferType::from_u32(header_word >> TYPE_SHIFT)?;
        let logical_size = (header_word & SIZE_MASK) as usize;
        if logical_size < HEADER_SIZE {
            return Err(SessionError::desync(format!(
                "block declares size {logical_size} smaller than the {HEADER_SIZE}-byte header"
            )));
        }
        let payload_len = logical_size - HEADER_SIZE;
        let payload_start = offset + HEADER_SIZE;
        let payload_end = payload_start
            .checked_add(payload_len)
            .ok_or_else(|| SessionError::desync("block payload length overflow"))?;
        if payload_end > data.len() {
            return Err(SessionError::desync("block payload extends past end of message"));
        }
        let payload = data[payload_start..payload_end].to_vec();
        let consumed = padded_len(logical_size);
        blocks.push(TransferBlock {
            header: BlockHeader {
                remote_id,
                transfer_type,
            },
            payload,
        });
        offset = offset
            .checked_add(consumed)
            .ok_or_else(|| SessionError::desync("block frame length overflow"))?;
    }
    Ok(blocks)
}

/// Ordered, thread-safe staging buffer for blocks produced by pool workers
/// before they're combined into one outgoing message. Workers append
/// out of order (whichever shadow's compression finishes first); a
/// `message_sequence` counter on each entry lets the writer thread restore
/// submission order when that matters for pipe-backed shadows.
#[derive(Default)]
pub struct TransferData {
    inner: Mutex<Vec<(u64, TransferBlock)>>,
}

impl TransferData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message_sequence: u64, block: TransferBlock) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.push((message_sequence, block));
    }

    /// Drains all staged blocks in ascending `message_sequence` order,
    /// stable on ties (so blocks for the same shadow submitted in the same
    /// round keep their relative push order).
    pub fn drain_ordered(&self) -> Vec<TransferBlock> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<_> = inner.drain(..).collect();
        items.sort_by_key(|(seq, _)| *seq);
        items.into_iter().map(|(_, block)| block).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

/// Builds the outgoing blocks for one shadow's accumulated damage, and
/// compresses each one under `codec`. Does not clear the shadow's damage —
/// callers clear it via [`finish_update`] only once the blocks have been
/// handed off successfully, so a mid-send failure leaves damage intact for
/// retry on the replacement channel.
pub fn collect_update(shadow: &ShadowFd, codec: CompressionMode) -> Result<Vec<TransferBlock>> {
    let mut blocks = Vec::new();

    if shadow.damage.is_whole_object() {
        let data = read_shadow_range(shadow, 0, shadow.size)?;
        let payload = codec
            .compress(&data)
            .context("compressing whole-object update")?;
        blocks.push(TransferBlock {
            header: BlockHeader {
                remote_id: shadow.remote_id,
                transfer_type: TransferType::WholeObject,
            },
            payload,
        });
        return Ok(blocks);
    }

    for interval in shadow.damage.intervals() {
        let data = read_shadow_range(shadow, interval.start, interval.end)?;
        let compressed = codec
            .compress(&data)
            .context("compressing partial-region update")?;
        let mut payload = Vec::with_capacity(8 + compressed.len());
        payload.extend_from_slice(&interval.start.to_le_bytes());
        payload.extend_from_slice(&compressed);
        blocks.push(TransferBlock {
            header: BlockHeader {
                remote_id: shadow.remote_id,
                transfer_type: TransferType::PartialRegion,
            },
            payload,
        });
    }
    Ok(blocks)
}

/// Clears a shadow's damage set after its blocks from [`collect_update`]
/// have been durably handed to the channel writer.
pub fn finish_update(shadow: &mut ShadowFd) {
    shadow.damage = DamageSet::new();
    shadow.dirty = false;
}

/// Applies one received block to the local mirror of `shadow`, writing
/// through its `mmap` for file-backed shadows. Unknown-type blocks and
/// malformed payload prefixes are a desync (the peer's protocol version
/// disagrees with ours), surfaced as [`crate::error::SessionError::Desync`].
pub fn apply_update(shadow: &mut ShadowFd, codec: CompressionMode, block: &TransferBlock) -> Result<()> {
    match block.header.transfer_type {
        TransferType::WholeObject => {
            let data = codec
                .decompress(&block.payload, shadow.size as usize)
                .context("decompressing whole-object update")?;
            write_shadow_range(shadow, 0, &data)?;
        }
        TransferType::PartialRegion => {
            if block.payload.len() < 8 {
                return Err(SessionError::desync("partial-region block missing offset prefix"));
            }
            let offset = u64::from_le_bytes(block.payload[0..8].try_into().expect("8 bytes"));
            let expected = shadow.size.saturating_sub(offset) as usize;
            let data = codec
                .decompress(&block.payload[8..], expected)
                .context("decompressing partial-region update")?;
            write_shadow_range(shadow, offset, &data)?;
        }
        TransferType::SizeExtension => {
            if block.payload.len() < 8 {
                return Err(SessionError::desync("size-extension block missing size prefix"));
            }
            shadow.size = u64::from_le_bytes(block.payload[0..8].try_into().expect("8 bytes"));
        }
        TransferType::PipeChunk => {
            let data = codec
                .decompress(&block.payload, block.payload.len())
                .context("decompressing pipe chunk")?;
            append_pipe_chunk(shadow, &data)?;
        }
        TransferType::Hangup => {
            shadow.dirty = false;
        }
        TransferType::Ack => {
            // Not produced by this implementation; a conformant peer skips
            // it silently.
        }
    }
    Ok(())
}

fn read_shadow_range(shadow: &ShadowFd, start: u64, end: u64) -> Result<Vec<u8>> {
    if start > end {
        bail!("invalid range {start}..{end}");
    }
    let map = unsafe { MmapOptions::new().map(&shadow.local_fd) }
        .context("failed to map shadow fd for read")?;
    let start = start as usize;
    let end = (end as usize).min(map.len());
    if start > map.len() {
        bail!("range start past end of mapped region");
    }
    Ok(map[start..end].to_vec())
}

fn write_shadow_range(shadow: &ShadowFd, start: u64, data: &[u8]) -> Result<()> {
    let mut map = unsafe { MmapOptions::new().map_mut(&shadow.local_fd) }
        .context("failed to map shadow fd for write")?;
    let start = start as usize;
    let end = start
        .checked_add(data.len())
        .context("write range overflow")?;
    if end > map.len() {
        bail!("write range extends past mapped region");
    }
    map[start..end].copy_from_slice(data);
    map.flush().context("failed to flush shadow mmap")?;
    Ok(())
}

fn append_pipe_chunk(shadow: &mut ShadowFd, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    // Pipe-backed shadows aren't mmap-able; write directly through the fd.
    let raw = shadow.local_fd.as_raw_fd();
    let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(raw) };
    let result = file.write_all(data);
    // Don't let File's Drop close an fd the registry still owns.
    std::mem::forget(file);
    result.context("failed to write pipe chunk")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::{FdKind, Side};
    use std::os::fd::OwnedFd;

    fn shadow_over_tempfile(size: u64) -> ShadowFd {
        let file = tempfile::tempfile().expect("tempfile");
        file.set_len(size).expect("set_len");
        let fd: OwnedFd = file.into();
        ShadowFd {
            remote_id: 1,
            local_fd: fd,
            kind: FdKind::File,
            size,
            dirty: false,
            damage: DamageSet::new(),
            dmabuf: None,
            content_hash: None,
            owner_side: Side::Source,
        }
    }

    #[test]
    fn combine_then_split_roundtrips() {
        let blocks = vec![
            TransferBlock {
                header: BlockHeader {
                    remote_id: 1,
                    transfer_type: TransferType::PartialRegion,
                },
                payload: {
                    let mut p = 16u64.to_le_bytes().to_vec();
                    p.extend_from_slice(&[1, 2, 3, 4, 5]);
                    p
                },
            },
            TransferBlock {
                header: BlockHeader {
                    remote_id: 2,
                    transfer_type: TransferType::WholeObject,
                },
                payload: vec![9; 40],
            },
        ];
        let wire = combine_transfer_blocks(&blocks).expect("combine");
        assert_eq!(wire.len() % BLOCK_ALIGNMENT, 0);
        let parsed = split_transfer_blocks(&wire).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].payload, blocks[0].payload);
        assert_eq!(parsed[1].payload, blocks[1].payload);
        assert_eq!(parsed[0].header.remote_id, 1);
        assert_eq!(parsed[1].header.remote_id, 2);
    }

    #[test]
    fn truncated_message_is_rejected() {
        let wire = vec![0u8; 10];
        assert!(split_transfer_blocks(&wire).is_err());
    }

    #[test]
    fn collect_whole_object_then_apply_roundtrips_content() {
        let mut source = shadow_over_tempfile(64);
        write_shadow_range(&source, 0, &[7u8; 64]).unwrap();
        source.damage.damage_everything();

        let blocks = collect_update(&source, CompressionMode::None).unwrap();
        finish_update(&mut source);
        assert!(source.damage.is_empty());

        let mut sink = shadow_over_tempfile(64);
        for block in &blocks {
            apply_update(&mut sink, CompressionMode::None, block).unwrap();
        }
        let got = read_shadow_range(&sink, 0, 64).unwrap();
        assert_eq!(got, vec![7u8; 64]);
    }

    #[test]
    fn partial_region_update_only_touches_its_range() {
        let mut source = shadow_over_tempfile(32);
        write_shadow_range(&source, 0, &[0u8; 32]).unwrap();
        write_shadow_range(&source, 8, &[0xFF; 8]).unwrap();
        source.damage.add(8, 16);

        let blocks = collect_update(&source, CompressionMode::lz4_default()).unwrap();
        finish_update(&mut source);

        let mut sink = shadow_over_tempfile(32);
        for block in &blocks {
            apply_update(&mut sink, CompressionMode::lz4_default(), block).unwrap();
        }
        let got = read_shadow_range(&sink, 0, 32).unwrap();
        let mut expected = vec![0u8; 32];
        expected[8..16].copy_from_slice(&[0xFF; 8]);
        assert_eq!(got, expected);
    }

    #[test]
    fn transfer_data_drains_in_sequence_order() {
        let data = TransferData::new();
        data.push(
            2,
            TransferBlock {
                header: BlockHeader {
                    remote_id: 1,
                    transfer_type: TransferType::PipeChunk,
                },
                payload: vec![b'b'],
            },
        );
        data.push(
            1,
            TransferBlock {
                header: BlockHeader {
                    remote_id: 1,
                    transfer_type: TransferType::PipeChunk,
                },
                payload: vec![b'a'],
            },
        );
        let drained = data.drain_ordered();
        assert_eq!(drained[0].payload, vec![b'a']);
        assert_eq!(drained[1].payload, vec![b'b']);
        assert!(data.is_empty());
    }
}

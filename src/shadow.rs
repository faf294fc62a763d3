//! Shadow-fd registry and damage tracking.
//!
//! A shadow fd is the proxy-side record of one application-visible resource
//! (a file-backed shared-memory region, a hardware buffer, or a pipe end)
//! and its remote mirror. The registry maps between local fds (this side's
//! concrete resources) and remote ids (`xid`s, stable identifiers the peer
//! uses to address the same resource).

use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Result};

/// Which side of a session a registry belongs to. The source side assigns
/// fresh remote ids; the sink side only ever learns ids from incoming
/// `apply_update` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Sink,
}

/// The kind of resource a shadow fd mirrors, detected once at creation and
/// immutable afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// A regular file, typically backing POSIX shared memory.
    File,
    /// A hardware buffer (GPU/DRM-backed), described by the metadata in
    /// [`DmabufMeta`].
    Dmabuf,
    /// The read end of a pipe.
    PipeRead,
    /// The write end of a pipe.
    PipeWrite,
    /// Either end of a pipe when direction hasn't yet been determined.
    PipeReadWrite,
}

/// Backing metadata captured for a hardware-buffer-backed shadow, immutable
/// after creation just like [`FdKind`] and `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufMeta {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub modifier: u64,
    pub num_planes: u32,
    pub strides: [u32; 4],
    pub offsets: [u32; 4],
}

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

/// The set of byte ranges of a shadow known to differ from the peer's copy,
/// plus a whole-object sentinel. Inserts are coalesced so the set
/// never grows past the number of genuinely-disjoint ranges touched since
/// the last `finish_update`.
#[derive(Debug, Clone, Default)]
pub struct DamageSet {
    whole_object: bool,
    intervals: BTreeMap<u64, u64>, // start -> end, pairwise disjoint and non-adjacent
}

impl DamageSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the entire resource dirty, subsuming any partial ranges.
    pub fn damage_everything(&mut self) {
        self.whole_object = true;
        self.intervals.clear();
    }

    /// Adds `[start, end)` to the damage set, merging with any
    /// overlapping or adjacent existing interval.
    pub fn add(&mut self, start: u64, end: u64) {
        if self.whole_object || start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        // Find overlapping/adjacent ranges to merge. BTreeMap is small in
        // practice (one pass per shadow per collection round) so a linear
        // scan over candidate keys is fine.
        let mut to_remove = Vec::new();
        for (&s, &e) in &self.intervals {
            if e < new_start || s > new_end {
                continue;
            }
            to_remove.push(s);
            new_start = new_start.min(s);
            new_end = new_end.max(e);
        }
        for s in to_remove {
            self.intervals.remove(&s);
        }
        self.intervals.insert(new_start, new_end);
    }

    #[must_use]
    pub fn is_whole_object(&self) -> bool {
        self.whole_object
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.whole_object && self.intervals.is_empty()
    }

    /// Iterates the coalesced disjoint intervals in ascending order. Empty
    /// if [`Self::is_whole_object`] is true — callers check that first.
    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals
            .iter()
            .map(|(&start, &end)| Interval { start, end })
    }

    /// Clears the set back to empty, called by `finish_update` once all
    /// in-flight tasks for the shadow have completed.
    pub fn clear(&mut self) {
        self.whole_object = false;
        self.intervals.clear();
    }
}

/// One tracked fd-backed resource and its mirror state.
pub struct ShadowFd {
    pub remote_id: i32,
    pub local_fd: OwnedFd,
    pub kind: FdKind,
    pub size: u64,
    pub dirty: bool,
    pub damage: DamageSet,
    pub dmabuf: Option<DmabufMeta>,
    pub content_hash: Option<u64>,
    pub owner_side: Side,
}

impl ShadowFd {
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.local_fd.as_raw_fd()
    }
}

/// Bidirectional map between local fds and remote ids for one session
///. Worker-local and unshared — never accessed from more than
/// one thread at a time in this codebase (the transfer engine and pool
/// workers touch shadow *contents* concurrently, but registry mutation
/// itself happens only on the worker's main thread).
pub struct FdTranslationMap {
    side: Side,
    by_local: HashMap<RawFd, i32>,
    by_remote: HashMap<i32, ShadowFd>,
    next_remote_id: AtomicI32,
}

impl FdTranslationMap {
    #[must_use]
    pub fn new(side: Side) -> Self {
        Self {
            side,
            by_local: HashMap::new(),
            by_remote: HashMap::new(),
            next_remote_id: AtomicI32::new(1),
        }
    }

    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    /// Idempotent lookup-or-create for a local fd observed on this side
    ///. Only meaningful on the source side — the
    /// sink side creates shadows lazily from `apply_update`, never from a
    /// local fd it happens to hold.
    pub fn translate_fd(
        &mut self,
        local_fd: OwnedFd,
        kind: FdKind,
        size: u64,
        dmabuf: Option<DmabufMeta>,
    ) -> Result<&mut ShadowFd> {
        let raw = local_fd.as_raw_fd();
        if let Some(&rid) = self.by_local.get(&raw) {
            // Idempotent: drop the duplicate fd we were just handed, keep
            // the fd already owned by the existing shadow.
            drop(local_fd);
            return Ok(self
                .by_remote
                .get_mut(&rid)
                .expect("by_local and by_remote must stay in sync"));
        }

        let rid = self.next_remote_id.fetch_add(1, Ordering::Relaxed);
        let shadow = ShadowFd {
            remote_id: rid,
            local_fd,
            kind,
            size,
            dirty: false,
            damage: DamageSet::new(),
            dmabuf,
            content_hash: None,
            owner_side: self.side,
        };
        self.by_local.insert(raw, rid);
        self.by_remote.insert(rid, shadow);
        Ok(self.by_remote.get_mut(&rid).expect("just inserted"))
    }

    /// O(1) lookup of a shadow by remote id. Returns `None` if absent; callers on the sink
    /// side create on first observed apply.
    pub fn get(&self, rid: i32) -> Option<&ShadowFd> {
        self.by_remote.get(&rid)
    }

    pub fn get_mut(&mut self, rid: i32) -> Option<&mut ShadowFd> {
        self.by_remote.get_mut(&rid)
    }

    /// Registers a shadow created lazily on the sink side for an
    /// previously-unseen remote id, or returns an error if one already
    /// exists (the caller should have checked `get` first).
    pub fn insert_sink_shadow(&mut self, shadow: ShadowFd) -> Result<&mut ShadowFd> {
        if self.by_remote.contains_key(&shadow.remote_id) {
            bail!("shadow for rid {} already exists", shadow.remote_id);
        }
        let rid = shadow.remote_id;
        self.by_local.insert(shadow.local_fd.as_raw_fd(), rid);
        self.by_remote.insert(rid, shadow);
        Ok(self.by_remote.get_mut(&rid).expect("just inserted"))
    }

    /// Destroys a shadow, called when the protocol observer signals the
    /// resource is no longer referenced.
    pub fn destroy(&mut self, rid: i32) -> Option<ShadowFd> {
        if let Some(shadow) = self.by_remote.remove(&rid) {
            self.by_local.remove(&shadow.raw_fd());
            Some(shadow)
        } else {
            None
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_remote.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_remote.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_fd() -> OwnedFd {
        tempfile::tempfile().expect("tempfile").into()
    }

    #[test]
    fn damage_set_coalesces_overlapping_ranges() {
        let mut d = DamageSet::new();
        d.add(0, 10);
        d.add(5, 20);
        let got: Vec<_> = d.intervals().collect();
        assert_eq!(got, vec![Interval { start: 0, end: 20 }]);
    }

    #[test]
    fn damage_set_keeps_disjoint_ranges_separate() {
        let mut d = DamageSet::new();
        d.add(0, 5);
        d.add(10, 15);
        let got: Vec<_> = d.intervals().collect();
        assert_eq!(
            got,
            vec![
                Interval { start: 0, end: 5 },
                Interval { start: 10, end: 15 }
            ]
        );
    }

    #[test]
    fn damage_everything_subsumes_partial_ranges() {
        let mut d = DamageSet::new();
        d.add(0, 5);
        d.damage_everything();
        assert!(d.is_whole_object());
        assert_eq!(d.intervals().count(), 0);
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut d = DamageSet::new();
        d.damage_everything();
        d.clear();
        assert!(d.is_empty());
        assert!(!d.is_whole_object());
    }

    #[test]
    fn translate_fd_is_idempotent_for_the_same_local_fd() {
        let mut map = FdTranslationMap::new(Side::Source);
        let fd1 = dummy_fd();
        let raw1 = fd1.as_raw_fd();
        let rid1 = map
            .translate_fd(fd1, FdKind::File, 4096, None)
            .unwrap()
            .remote_id;

        // A second lookup against the same raw fd number (e.g. the same
        // resource observed again in a later protocol message) must map to
        // the existing shadow rather than allocating a new remote id; the
        // duplicate handle is dropped, the shadow's original fd untouched.
        let alias = alias_raw_fd(raw1);
        let rid2 = map
            .translate_fd(alias, FdKind::File, 4096, None)
            .unwrap()
            .remote_id;
        assert_eq!(rid1, rid2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remote_ids_are_monotonic_and_positive() {
        let mut map = FdTranslationMap::new(Side::Source);
        let a = map
            .translate_fd(dummy_fd(), FdKind::File, 0, None)
            .unwrap()
            .remote_id;
        let b = map
            .translate_fd(dummy_fd(), FdKind::File, 0, None)
            .unwrap()
            .remote_id;
        assert!(a > 0 && b > 0);
        assert_ne!(a, b);
    }

    /// Wraps `raw` a second time for the idempotency test above.
    /// `translate_fd` keys its lookup off the raw fd number, so this
    /// produces a handle that looks, to the registry, like the same local
    /// fd being observed again; the test only inspects remote ids, not fd
    /// lifetime, so the aliasing is confined to this one assertion.
    fn alias_raw_fd(raw: RawFd) -> OwnedFd {
        use std::os::fd::FromRawFd;
        // Safety: this intentionally creates a second owner of `raw`, which
        // is unsound in general (the registry's duplicate-handling path
        // closes it on the spot) — confined to this test, which never
        // touches the fd again after checking the returned remote id.
        unsafe { OwnedFd::from_raw_fd(raw) }
    }
}

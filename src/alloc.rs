//! The dual allocator: durable on-disk extents plus transient in-memory
//! slabs, unified behind one 64-bit ref space (spec §4.2).
//!
//! Grounded on the teacher's `OpenOptions::open`/`StorageInner` for the
//! file-growth policy, and on the `FreePageState`/`IdTracker` bookkeeping in
//! `src/lib.rs` for the version-tagged free list the `SharedGroup` protocol
//! needs (spec §4.5, scenario F).

use crate::error::{Error, Result};
use crate::file_map::FileMap;

/// Minimum size of a freshly appended slab, to avoid pathological
/// one-allocation-per-slab growth for small Nodes.
const SLAB_GROW_HEURISTIC: u64 = 64 * 1024;

/// Doubling ceiling for file growth on commit (spec §4.4 step 2): the file
/// at least doubles up to this size, then grows linearly.
const FILE_DOUBLE_CEILING: u64 = 64 << 20;

/// Fixed start of the ref-number range reserved for slab space, chosen far
/// above any file this engine will realistically grow to (2^56 bytes).
///
/// Slab refs cannot simply start at `committed_len` and grow upward: during
/// commit, the Writer itself may extend the file to place a relocated Node,
/// handing back a ref `>= committed_len` (since `committed_len` only
/// advances at `finish_commit`) that would otherwise land squarely inside
/// the still-live slab arena's own ref range — two different backing
/// stores answering to the same ref. Pinning slab space to a disjoint,
/// constant base keeps file growth (however far, during however many
/// commits) and slab space from ever aliasing.
const SLAB_SPACE_BASE: u64 = 1 << 56;

struct Slab {
    start: u64,
    data: Vec<u8>,
    used: usize,
}

/// One free extent in the on-disk free-space database. `released_at` is the
/// reader version that was current when the extent was freed; the
/// [`crate::shared::SharedGroup`] protocol must not hand it out again while
/// any reader at or before that version is still live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeEntry {
    pub pos: u64,
    pub len: u64,
    pub released_at: u64,
}

/// Hands out refs usable both in memory and on disk, straddling the
/// boundary transparently.
pub struct SlabAllocator {
    file: FileMap,
    /// File length as of the last commit (or as of open, for a fresh
    /// transaction). Spec calls this `F`. Used to validate candidate top
    /// refs and as the starting point for file growth — NOT to distinguish
    /// slab refs from file refs, since the Writer can itself grow the file
    /// mid-commit to relocate a Node, past this same watermark (which only
    /// advances at [`Self::finish_commit`]). That distinction is instead
    /// `r >= SLAB_SPACE_BASE`, handled by [`Self::is_slab_ref`].
    committed_len: u64,
    slabs: Vec<Slab>,
    free_list: Vec<FreeEntry>,
    read_only: bool,
    /// The reader version ordinary (unversioned) `free()` calls tag newly
    /// freed extents with — i.e. the version this transaction's commit will
    /// become, set by the `SharedGroup` writer before a commit via
    /// [`Self::set_release_version`]. A bare `Group` never changes it from
    /// the default 0, which is harmless since it always commits with
    /// `min_live_version = u64::MAX` and so never excludes any extent.
    release_version: u64,
}

impl SlabAllocator {
    pub fn new_anon(initial: &[u8]) -> Result<Self> {
        let file = FileMap::open_anon(initial)?;
        let committed_len = file.len() as u64;
        Ok(Self {
            file,
            committed_len,
            slabs: Vec::new(),
            free_list: Vec::new(),
            read_only: false,
            release_version: 0,
        })
    }

    pub fn open_file(path: &std::path::Path, read_only: bool) -> Result<Self> {
        let file = FileMap::open(path, read_only)?;
        let committed_len = file.len() as u64;
        Ok(Self {
            file,
            committed_len,
            slabs: Vec::new(),
            free_list: Vec::new(),
            read_only,
            release_version: 0,
        })
    }

    /// Set the version ordinary `free()` calls will tag newly freed extents
    /// with for the rest of this transaction (spec §4.5: "the allocator
    /// therefore tags each released extent with the version at which it was
    /// released").
    pub fn set_release_version(&mut self, version: u64) {
        self.release_version = version;
    }

    pub fn file(&self) -> &FileMap {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut FileMap {
        &mut self.file
    }

    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_slab_ref(&self, r: u64) -> bool {
        r >= SLAB_SPACE_BASE
    }

    pub fn free_list(&self) -> &[FreeEntry] {
        &self.free_list
    }

    /// Replace the free list wholesale — used when reloading it from its
    /// on-disk Node pair at open time.
    pub fn load_free_list(&mut self, entries: Vec<FreeEntry>) {
        self.free_list = entries;
    }

    fn find_slab(&self, r: u64) -> Option<usize> {
        self.slabs
            .iter()
            .position(|s| r >= s.start && r < s.start + s.data.len() as u64)
    }

    /// Resolve `ref_` to its backing bytes.
    pub fn translate(&self, r: u64, len: u64) -> Result<&[u8]> {
        if r == 0 {
            return Err(Error::InvalidAccess { offset: 0, len: len as usize });
        }
        if !self.is_slab_ref(r) {
            self.file.read(r as usize, len as usize)
        } else if let Some(i) = self.find_slab(r) {
            let slab = &self.slabs[i];
            let start = (r - slab.start) as usize;
            slab.data
                .get(start..start + len as usize)
                .ok_or(Error::InvalidAccess { offset: r as usize, len: len as usize })
        } else {
            Err(Error::InvalidAccess { offset: r as usize, len: len as usize })
        }
    }

    pub fn translate_mut(&mut self, r: u64, len: u64) -> Result<&mut [u8]> {
        if r == 0 {
            return Err(Error::InvalidAccess { offset: 0, len: len as usize });
        }
        if !self.is_slab_ref(r) {
            self.file.write(r as usize, len as usize)
        } else if let Some(i) = self.find_slab(r) {
            let slab = &mut self.slabs[i];
            let start = (r - slab.start) as usize;
            slab.data
                .get_mut(start..start + len as usize)
                .ok_or(Error::InvalidAccess { offset: r as usize, len: len as usize })
        } else {
            Err(Error::InvalidAccess { offset: r as usize, len: len as usize })
        }
    }

    /// Allocate `bytes` (rounded up to a multiple of 8) from slab space.
    pub fn alloc(&mut self, bytes: u64) -> Result<(u64, &mut [u8])> {
        let bytes = bytes.div_ceil(8) * 8;
        let need_new_slab = match self.slabs.last() {
            Some(s) => (s.data.len() - s.used) < bytes as usize,
            None => true,
        };
        if need_new_slab {
            let slab_start = self
                .slabs
                .last()
                .map(|s| s.start + s.data.len() as u64)
                .unwrap_or(SLAB_SPACE_BASE);
            let size = bytes.max(SLAB_GROW_HEURISTIC) as usize;
            self.slabs.push(Slab { start: slab_start, data: vec![0u8; size], used: 0 });
        }
        let slab = self.slabs.last_mut().unwrap();
        let r = slab.start + slab.used as u64;
        let start = slab.used;
        slab.used += bytes as usize;
        Ok((r, &mut slab.data[start..start + bytes as usize]))
    }

    /// Release `ref_`'s `bytes` back to the allocator.
    ///
    /// Slab-space refs are simply discarded. File-space refs are inserted
    /// into the free list, coalesced with any touching neighbor, and tagged
    /// with `released_at` for the `SharedGroup` reclamation protocol (0 is
    /// fine for a bare, non-shared `Group`: there are no concurrent readers
    /// to protect).
    pub fn free(&mut self, r: u64, bytes: u64) -> Result<()> {
        let bytes = bytes.div_ceil(8) * 8;
        if self.is_slab_ref(r) {
            return Ok(());
        }
        self.free_at(r, bytes, self.release_version)
    }

    pub fn free_at(&mut self, r: u64, bytes: u64, released_at: u64) -> Result<()> {
        let bytes = bytes.div_ceil(8) * 8;
        let mut entry = FreeEntry { pos: r, len: bytes, released_at };
        let idx = self.free_list.partition_point(|e| e.pos < entry.pos);

        let mut remove_lo = None;
        if idx > 0 {
            let prev = self.free_list[idx - 1];
            if prev.pos + prev.len == entry.pos {
                entry.pos = prev.pos;
                entry.len += prev.len;
                entry.released_at = entry.released_at.max(prev.released_at);
                remove_lo = Some(idx - 1);
            }
        }
        let mut remove_hi = None;
        if idx < self.free_list.len() {
            let next = self.free_list[idx];
            if entry.pos + entry.len == next.pos {
                entry.len += next.len;
                entry.released_at = entry.released_at.max(next.released_at);
                remove_hi = Some(idx);
            }
        }
        if let Some(i) = remove_hi {
            self.free_list.remove(i);
        }
        if let Some(i) = remove_lo {
            self.free_list.remove(i);
        }
        let insert_at = self.free_list.partition_point(|e| e.pos < entry.pos);
        self.free_list.insert(insert_at, entry);
        Ok(())
    }

    /// Reallocate: always a fresh allocation plus copy plus free of the old
    /// extent — never extended in place, which is what preserves the COW
    /// invariant that any observable change yields a new ref.
    pub fn realloc(&mut self, old_ref: u64, old_bytes: u64, new_bytes: u64) -> Result<(u64, &mut [u8])> {
        let mut copy = vec![0u8; old_bytes as usize];
        if old_ref != 0 {
            copy.copy_from_slice(self.translate(old_ref, old_bytes)?);
        }
        let (new_ref, buf) = self.alloc(new_bytes)?;
        let n = copy.len().min(buf.len());
        buf[..n].copy_from_slice(&copy[..n]);
        if old_ref != 0 {
            self.free(old_ref, old_bytes)?;
        }
        Ok((new_ref, buf))
    }

    /// Used only by the Writer during commit: satisfy an allocation from the
    /// file's free-space database (best fit, among extents safe to reuse
    /// given `min_live_version`), extending the file if nothing fits.
    pub fn alloc_from_free_list(&mut self, bytes: u64, min_live_version: u64) -> Result<u64> {
        let bytes = bytes.div_ceil(8) * 8;
        let mut best: Option<(usize, u64)> = None;
        for (i, e) in self.free_list.iter().enumerate() {
            if e.released_at > min_live_version {
                continue;
            }
            if e.len >= bytes {
                match best {
                    Some((_, best_len)) if best_len <= e.len => {}
                    _ => best = Some((i, e.len)),
                }
            }
        }
        if let Some((i, _)) = best {
            let e = self.free_list[i];
            if e.len == bytes {
                self.free_list.remove(i);
            } else {
                self.free_list[i] = FreeEntry { pos: e.pos + bytes, len: e.len - bytes, released_at: e.released_at };
            }
            return Ok(e.pos);
        }

        // No fit: extend the file.
        let cur_len = self.file.len() as u64;
        let grow_target = if cur_len < FILE_DOUBLE_CEILING { cur_len } else { FILE_DOUBLE_CEILING / 4 };
        let grow = bytes.max(grow_target).max(8);
        let at = self.file.grow(grow as usize)? as u64;
        if grow > bytes {
            self.free_list.push(FreeEntry { pos: at + bytes, len: grow - bytes, released_at: 0 });
            self.free_list.sort_by_key(|e| e.pos);
        }
        Ok(at)
    }

    /// Copy a slab-resident Node's bytes into a now-durable file extent.
    pub fn copy_slab_to_file(&mut self, slab_ref: u64, file_ref: u64, bytes: u64) -> Result<()> {
        let mut tmp = vec![0u8; bytes as usize];
        tmp.copy_from_slice(self.translate(slab_ref, bytes)?);
        self.file.write(file_ref as usize, bytes as usize)?.copy_from_slice(&tmp);
        Ok(())
    }

    /// Called once a commit's relocation pass has finished: drop every slab
    /// and advance the committed-file-length watermark so the next
    /// transaction's allocations start fresh in slab space again.
    pub fn finish_commit(&mut self) {
        self.slabs.clear();
        self.committed_len = self.file.len() as u64;
    }

    /// Discard the current transaction's slabs without committing.
    pub fn rollback(&mut self) {
        self.slabs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_lands_in_slab_space() {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 16]).unwrap();
        let (r, _) = alloc.alloc(8).unwrap();
        assert!(alloc.is_slab_ref(r));
        assert_eq!(r, SLAB_SPACE_BASE);
    }

    #[test]
    fn file_growth_during_commit_is_never_mistaken_for_a_slab_ref() {
        // Regression: a commit that must extend the file to place a
        // relocated Node used to hand back a position >= committed_len,
        // which `is_slab_ref` mistook for slab space.
        let mut alloc = SlabAllocator::new_anon(&[0u8; 16]).unwrap();
        alloc.committed_len = 16;
        let grown = alloc.alloc_from_free_list(8, u64::MAX).unwrap();
        assert!(grown >= 16, "should have extended the file past its original length");
        assert!(!alloc.is_slab_ref(grown), "a file-grown position must never read back as a slab ref");
    }

    #[test]
    fn free_coalesces_adjacent_extents() {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 64]).unwrap();
        alloc.committed_len = 64;
        alloc.free_at(8, 8, 0).unwrap();
        alloc.free_at(16, 8, 0).unwrap();
        assert_eq!(alloc.free_list(), &[FreeEntry { pos: 8, len: 16, released_at: 0 }]);
    }

    #[test]
    fn version_tagged_extents_are_not_reused_early() {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 64]).unwrap();
        alloc.committed_len = 64;
        alloc.free_at(8, 8, 5).unwrap();
        // the extent at (8,8) was released at version 5, still live at version 4,
        // so this must fall through to growing the file rather than reusing it.
        let new_pos = alloc.alloc_from_free_list(8, 4).unwrap();
        assert_eq!(new_pos, 64, "must have grown the file instead of reusing the v5 extent");
        assert!(
            alloc.free_list().contains(&FreeEntry { pos: 8, len: 8, released_at: 5 }),
            "the v5 extent must still be in the free list, untouched"
        );
    }
}

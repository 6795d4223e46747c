//! The cross-process coordination file backing [`crate::shared::SharedGroup`].
//!
//! Grounded on `src/tightdb/group_shared.hpp` (`SharedInfo`, the
//! `ringbuf_*` methods) in the original sources, which keeps a header of
//! process-shared mutexes plus a fixed-capacity ring of `ReadCount` next to
//! the memory-mapped data. Rust has no portable process-shared
//! `pthread_mutex_t`; this crate's dependency stack already reaches for
//! `fs4` for file locking (see the teacher's `OpenOptions::open`), so that's
//! what stands in for the two mutexes here: the ring buffer's short
//! critical sections are guarded by an `fs4` lock on this file, and the
//! single-writer mutex is a separate, long-held `fs4` lock on a sibling
//! `.wlock` file (so a writer holding the write lock for an entire
//! transaction never contends with a reader's brief ring update). The
//! "condition variable" in the original becomes a blocking `lock_exclusive`
//! call: the OS already parks the thread until the lock frees, which is the
//! same observable behavior.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// Entries in the ring buffer (spec §4.5): one per distinct reader version
/// still in use, in increasing version order.
pub const RING_CAPACITY: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ReadCount {
    version: u64,
    count: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RingHeader {
    magic: [u8; 8],
    head: u32,
    tail: u32,
    top_version: u64,
    top_ref: u64,
}

const MAGIC: [u8; 8] = *b"strataLF";
const HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();
const ENTRY_SIZE: usize = std::mem::size_of::<ReadCount>();
const FILE_SIZE: usize = HEADER_SIZE + ENTRY_SIZE * RING_CAPACITY;

/// A reader's stable snapshot identity: the version it began at and the top
/// ref that was current then.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadLease {
    pub version: u64,
    pub top_ref: u64,
}

pub struct LockFile {
    file: File,
    map: MmapMut,
    writer_file: File,
}

impl LockFile {
    /// Open (creating if absent) the lock file alongside a database path.
    /// The initial top version/ref are supplied by the caller (typically
    /// read from the data file itself) and are only used if the lock file
    /// is being created fresh.
    pub fn open(db_path: &Path, initial_top_ref: u64) -> Result<Self> {
        let lock_path = sibling_path(db_path, "lock");
        let wlock_path = sibling_path(db_path, "wlock");

        let is_new = !lock_path.exists();
        let file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(Error::open_io)?;
        if is_new {
            file.set_len(FILE_SIZE as u64).map_err(|e| Error::ResizeFailed { size: 0, requested: FILE_SIZE, source: e })?;
        }
        let writer_file =
            FsOpenOptions::new().read(true).write(true).create(true).open(&wlock_path).map_err(Error::open_io)?;

        let mut map = unsafe { MmapOptions::new().len(FILE_SIZE).map_mut(&file).map_err(|_| Error::OutOfSpace { requested: FILE_SIZE })? };
        if is_new {
            let header = RingHeader { magic: MAGIC, head: 0, tail: 0, top_version: 1, top_ref: initial_top_ref };
            map[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        }
        Ok(Self { file, map, writer_file })
    }

    fn header(&self) -> RingHeader {
        *bytemuck::from_bytes(&self.map[..HEADER_SIZE])
    }

    fn set_header(&mut self, h: RingHeader) {
        self.map[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&h));
    }

    fn entry(&self, slot: usize) -> ReadCount {
        let start = HEADER_SIZE + slot * ENTRY_SIZE;
        *bytemuck::from_bytes(&self.map[start..start + ENTRY_SIZE])
    }

    fn set_entry(&mut self, slot: usize, e: ReadCount) {
        let start = HEADER_SIZE + slot * ENTRY_SIZE;
        self.map[start..start + ENTRY_SIZE].copy_from_slice(bytemuck::bytes_of(&e));
    }

    fn with_ring_lock<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> R,
    {
        self.file.lock_exclusive().map_err(Error::Lock)?;
        let result = f(self);
        FileExt::unlock(&self.file).map_err(Error::Lock)?;
        Ok(result)
    }

    /// Register a new reader at the current top version, returning the
    /// version and top ref it should attach to.
    pub fn begin_read(&mut self) -> Result<ReadLease> {
        self.with_ring_lock(|this| {
            let header = this.header();
            let v = header.top_version;
            let mut slot = None;
            for i in header.head..header.tail {
                let idx = (i as usize) % RING_CAPACITY;
                if this.entry(idx).version == v {
                    slot = Some(idx);
                    break;
                }
            }
            match slot {
                Some(idx) => {
                    let mut e = this.entry(idx);
                    e.count += 1;
                    this.set_entry(idx, e);
                }
                None => {
                    let idx = (header.tail as usize) % RING_CAPACITY;
                    if header.tail - header.head >= RING_CAPACITY as u32 {
                        return Err(Error::OutOfSpace { requested: ENTRY_SIZE });
                    }
                    this.set_entry(idx, ReadCount { version: v, count: 1, _pad: 0 });
                    let mut h = header;
                    h.tail += 1;
                    this.set_header(h);
                }
            }
            Ok(ReadLease { version: v, top_ref: header.top_ref })
        })?
    }

    /// Release a reader's lease, popping fully-drained entries off the head
    /// (never skipping ahead of a nonzero entry, which would reorder
    /// versions — spec §4.5 `end_read`).
    pub fn end_read(&mut self, version: u64) -> Result<()> {
        self.with_ring_lock(|this| {
            let header = this.header();
            for i in header.head..header.tail {
                let idx = (i as usize) % RING_CAPACITY;
                let mut e = this.entry(idx);
                if e.version == version {
                    debug_assert!(e.count > 0);
                    e.count -= 1;
                    this.set_entry(idx, e);
                    break;
                }
            }
            let mut h = this.header();
            while h.head < h.tail {
                let idx = (h.head as usize) % RING_CAPACITY;
                if this.entry(idx).count == 0 {
                    h.head += 1;
                } else {
                    break;
                }
            }
            this.set_header(h);
        })
    }

    /// The lowest version any live reader still holds a lease for, or
    /// `u64::MAX` if there are none (meaning every released extent is
    /// immediately reusable).
    pub fn min_live_version(&mut self) -> Result<u64> {
        self.with_ring_lock(|this| {
            let h = this.header();
            if h.head == h.tail {
                u64::MAX
            } else {
                this.entry((h.head as usize) % RING_CAPACITY).version
            }
        })
    }

    /// Record a successful commit's new version/top ref.
    pub fn bump_version(&mut self, new_version: u64, new_top_ref: u64) -> Result<()> {
        self.with_ring_lock(|this| {
            let mut h = this.header();
            h.top_version = new_version;
            h.top_ref = new_top_ref;
            this.set_header(h);
        })
    }

    pub fn current_top(&mut self) -> Result<(u64, u64)> {
        self.with_ring_lock(|this| {
            let h = this.header();
            (h.top_version, h.top_ref)
        })
    }

    /// Acquire the single-writer mutex, blocking until available. Paired
    /// with [`Self::unlock_writer`] — not RAII, since the guard's lifetime
    /// would otherwise have to borrow the whole `LockFile` for the duration
    /// of a transaction, which then couldn't also take the brief `&mut`
    /// borrows `begin_read`/`bump_version` need on the same struct.
    pub(crate) fn lock_writer(&self) -> Result<()> {
        self.writer_file.lock_exclusive().map_err(Error::Lock)
    }

    /// Non-blocking variant, used by the interruption interface (spec
    /// §4.5/§5): returns `Ok(false)` instead of blocking if another writer
    /// already holds the lock.
    pub(crate) fn try_lock_writer(&self) -> Result<bool> {
        self.writer_file.try_lock_exclusive().map_err(Error::Lock)
    }

    pub(crate) fn unlock_writer(&self) -> Result<()> {
        FileExt::unlock(&self.writer_file).map_err(Error::Lock)
    }
}

fn sibling_path(db_path: &Path, ext: &str) -> PathBuf {
    let mut name = db_path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    db_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_read_tracks_the_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let mut lf = LockFile::open(&db_path, 0).unwrap();
        let lease = lf.begin_read().unwrap();
        assert_eq!(lease.version, 1);
        assert_eq!(lf.min_live_version().unwrap(), 1);
        lf.end_read(lease.version).unwrap();
        assert_eq!(lf.min_live_version().unwrap(), u64::MAX);
    }

    #[test]
    fn head_only_pops_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let mut lf = LockFile::open(&db_path, 0).unwrap();
        let r1 = lf.begin_read().unwrap();
        lf.bump_version(2, 100).unwrap();
        let r2 = lf.begin_read().unwrap();
        assert_ne!(r1.version, r2.version);

        lf.end_read(r2.version).unwrap();
        // r2 is not at the head, so the head (r1) must still be reported as live.
        assert_eq!(lf.min_live_version().unwrap(), r1.version);

        lf.end_read(r1.version).unwrap();
        assert_eq!(lf.min_live_version().unwrap(), u64::MAX);
    }
}

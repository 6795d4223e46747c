//! Multi-process read/write coordination on top of a single database file
//! (spec §4.5).
//!
//! Grounded on `SharedGroup`/`ReadLockInfo` in the original sources: readers
//! never block each other or the writer (each just mmaps the file read-only
//! at whatever top ref was current when its transaction began), and there is
//! at most one writer at a time, serialized through [`crate::lock_file::LockFile`].
//! A reader's lease keeps the extents its snapshot still points at out of
//! the writer's free list until the reader ends, which is exactly the
//! `min_live_version` threaded through [`Group::commit_at`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::alloc::SlabAllocator;
use crate::error::{Error, Result};
use crate::group::{Group, OpenOptions};
use crate::lock_file::LockFile;
use crate::node::Ref;
use crate::writer;

/// A handle that can cancel an in-flight writer from another thread.
/// `SharedGroup` itself cannot expose this directly on `&mut self` methods,
/// since a live `WriteTransaction` already holds `&mut SharedGroup` for its
/// whole lifetime — get one with [`SharedGroup::interrupter`] before calling
/// [`SharedGroup::begin_write`].
#[derive(Clone)]
pub struct Interrupter(Arc<AtomicBool>);

impl Interrupter {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coordinates any number of readers and at most one writer across
/// processes sharing the same database file.
pub struct SharedGroup {
    path: PathBuf,
    lock: LockFile,
    options: OpenOptions,
    interrupted: Arc<AtomicBool>,
}

impl SharedGroup {
    /// Open (creating if absent) the database at `path` for shared access.
    pub fn open(path: &Path, options: OpenOptions) -> Result<Self> {
        let initial_top = {
            let alloc = SlabAllocator::open_file(path, false)?;
            writer::read_top_ref(&alloc)?.0
        };
        let lock = LockFile::open(path, initial_top)?;
        debug!("shared group attached at {:?}", path);
        Ok(Self { path: path.to_owned(), lock, options, interrupted: Arc::new(AtomicBool::new(false)) })
    }

    /// A handle that can cancel a blocking writer from another thread.
    /// Per spec §5 ("only writers in the replication-enabled variant are
    /// cancellable"), the flag this sets is only consulted by
    /// [`Self::begin_write`] when `OpenOptions::enable_replication` is set;
    /// otherwise it is silently ignored.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter(self.interrupted.clone())
    }

    /// Snapshot of the writer's free list, for tests checking spec invariant
    /// 4 (free-list conservation) and scenario F (multi-reader reclamation).
    /// Opens a fresh read-only allocator view rather than requiring a live
    /// transaction, since the free list itself lives in the committed file.
    pub fn free_list_snapshot(&self) -> Result<Vec<crate::alloc::FreeEntry>> {
        let alloc = SlabAllocator::open_file(&self.path, true)?;
        let top_ref = writer::read_top_ref(&alloc)?;
        let group = Group::attach_at(alloc, top_ref, self.options.clone())?;
        Ok(group.free_list_snapshot())
    }

    /// Begin a read transaction: snapshots the current top ref under the
    /// ring-buffer lock, then maps the file read-only. The snapshot stays
    /// valid (its extents cannot be reused by a concurrent writer) until the
    /// returned `ReadTransaction` is dropped.
    pub fn begin_read(&mut self) -> Result<ReadTransaction<'_>> {
        let lease = self.lock.begin_read()?;
        let alloc = SlabAllocator::open_file(&self.path, true)?;
        let options = OpenOptions { read_only: true, ..self.options.clone() };
        let group = Group::attach_at(alloc, Ref(lease.top_ref), options)?;
        Ok(ReadTransaction { shared: self, group: Some(group), version: lease.version })
    }

    /// Begin a write transaction, blocking until the single-writer mutex is
    /// available. Returns [`Error::Interrupted`] instead if
    /// [`Interrupter::interrupt`] was called first and
    /// `OpenOptions::enable_replication` is set.
    pub fn begin_write(&mut self) -> Result<WriteTransaction<'_>> {
        if self.options.enable_replication {
            self.lock_writer_interruptible()?;
        } else {
            self.lock.lock_writer()?;
        }
        let (current_version, top_ref) = match self.lock.current_top() {
            Ok(v) => v,
            Err(e) => {
                let _ = self.lock.unlock_writer();
                return Err(e);
            }
        };
        let alloc = match SlabAllocator::open_file(&self.path, false) {
            Ok(a) => a,
            Err(e) => {
                let _ = self.lock.unlock_writer();
                return Err(e);
            }
        };
        let mut group = match Group::attach_at(alloc, Ref(top_ref), self.options.clone()) {
            Ok(g) => g,
            Err(e) => {
                let _ = self.lock.unlock_writer();
                return Err(e);
            }
        };
        // Mutations made against this transaction (e.g. `table_set`) can
        // trigger copy-on-write frees well before `commit` is called, so the
        // version tag on those frees has to be set now, not at commit time —
        // the single-writer lock we just took guarantees `current_version + 1`
        // is still this transaction's eventual version when it commits.
        group.alloc_mut().set_release_version(current_version + 1);
        Ok(WriteTransaction { shared: self, group: Some(group), done: false })
    }

    /// Poll for the single-writer mutex instead of blocking on it outright,
    /// so a concurrent [`Interrupter::interrupt`] call is noticed promptly
    /// rather than only being checked once before a potentially long block.
    /// Only used when `enable_replication` is set, matching spec §5's
    /// restriction that cancellable writers are a replication-only feature.
    fn lock_writer_interruptible(&mut self) -> Result<()> {
        const POLL_INTERVAL: Duration = Duration::from_millis(1);
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }
            if self.lock.try_lock_writer()? {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// A live read snapshot. Dropping it (or calling [`Self::end`] explicitly)
/// releases the version lease, letting the writer reclaim the extents it
/// pinned once no other reader needs them either.
pub struct ReadTransaction<'a> {
    shared: &'a mut SharedGroup,
    group: Option<Group>,
    version: u64,
}

impl<'a> ReadTransaction<'a> {
    pub fn group(&self) -> &Group {
        self.group.as_ref().expect("group taken after end()")
    }

    /// The reader version this snapshot is pinned to (spec §4.5
    /// `begin_read`). Extents released at or after this version by any
    /// writer commit stay out of the reusable free-list pool until this
    /// transaction ends.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn end(mut self) -> Result<()> {
        self.end_inner()
    }

    fn end_inner(&mut self) -> Result<()> {
        if self.group.take().is_some() {
            self.shared.lock.end_read(self.version)?;
        }
        Ok(())
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.end_inner() {
            warn!("failed to release read lease: {e}");
        }
    }
}

/// A live write transaction. Exactly one of these can exist per
/// [`SharedGroup`] (enforced across processes by the lock file's
/// single-writer mutex). Must end in [`Self::commit`] or [`Self::rollback`];
/// dropping without either rolls back and releases the writer mutex.
pub struct WriteTransaction<'a> {
    shared: &'a mut SharedGroup,
    group: Option<Group>,
    done: bool,
}

impl<'a> WriteTransaction<'a> {
    pub fn group(&self) -> &Group {
        self.group.as_ref().expect("group taken after commit/rollback")
    }

    pub fn group_mut(&mut self) -> &mut Group {
        self.group.as_mut().expect("group taken after commit/rollback")
    }

    /// Relocate dirty Nodes into file space, bounded by the oldest live
    /// reader lease so a concurrent reader's snapshot is never clobbered,
    /// then atomically install the new top ref and advance the shared
    /// version counter.
    pub fn commit(mut self) -> Result<()> {
        if self.shared.options.enable_replication && self.shared.interrupted.load(Ordering::SeqCst) {
            self.rollback()?;
            return Err(Error::Interrupted);
        }
        let min_live_version = self.shared.lock.min_live_version()?;
        let (current_version, _) = self.shared.lock.current_top()?;
        let new_version = current_version + 1;
        let mut group = self.group.take().expect("group taken after commit/rollback");
        // `begin_write` already tagged the allocator with `new_version` so
        // that frees triggered by mutations made before this call are tagged
        // correctly too; re-asserting it here is just belt-and-suspenders
        // for the free-list-sync relocation pass this call itself triggers.
        let result = group.commit_at(min_live_version, new_version);
        match result {
            Ok(()) => {
                self.shared.lock.bump_version(new_version, group.top_ref().0)?;
                self.done = true;
                let unlock = self.shared.lock.unlock_writer();
                debug!("write transaction committed at version {new_version}");
                unlock
            }
            Err(e) => {
                self.done = true;
                let _ = self.shared.lock.unlock_writer();
                Err(e)
            }
        }
    }

    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if let Some(mut group) = self.group.take() {
            group.rollback()?;
        }
        self.shared.lock.unlock_writer()
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.rollback_inner() {
            warn!("failed to roll back abandoned write transaction: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_sees_committed_value() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared.db");

        let mut shared = SharedGroup::open(&db_path, OpenOptions::default()).unwrap();
        {
            let mut wt = shared.begin_write().unwrap();
            let t = wt.group_mut().get_table(b"t").unwrap();
            wt.group_mut().table_set(t, 0, 0, 99).unwrap();
            wt.commit().unwrap();
        }

        let mut rt = shared.begin_read().unwrap();
        let group = rt.group.as_mut().unwrap();
        let t = group.get_table(b"t").unwrap();
        assert_eq!(group.table_get(t, 0, 0).unwrap(), 99);
    }

    #[test]
    fn reader_blocks_writer_from_reclaiming_its_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared2.db");
        let mut shared = SharedGroup::open(&db_path, OpenOptions::default()).unwrap();

        {
            let mut wt = shared.begin_write().unwrap();
            let t = wt.group_mut().get_table(b"t").unwrap();
            wt.group_mut().table_set(t, 0, 0, 1).unwrap();
            wt.commit().unwrap();
        }

        let reader = shared.begin_read().unwrap();
        let held_version = reader.version;

        {
            let mut wt = shared.begin_write().unwrap();
            let t = wt.group_mut().get_table(b"t").unwrap();
            wt.group_mut().table_set(t, 0, 0, 2).unwrap();
            wt.commit().unwrap();
        }

        assert_eq!(shared.lock.min_live_version().unwrap(), held_version);
        drop(reader);
        assert_eq!(shared.lock.min_live_version().unwrap(), u64::MAX);
    }

    #[test]
    fn interrupting_before_begin_write_rejects_it() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared3.db");
        let options = OpenOptions { enable_replication: true, ..OpenOptions::default() };
        let mut shared = SharedGroup::open(&db_path, options).unwrap();
        let interrupter = shared.interrupter();
        interrupter.interrupt();
        assert!(matches!(shared.begin_write(), Err(Error::Interrupted)));
        interrupter.clear();
        assert!(shared.begin_write().is_ok());
    }
}

//! Commit: relocate a transaction's dirty (slab-resident) Nodes into durable
//! file extents, then swap the file's top ref atomically.
//!
//! Grounded on the teacher's `CommitUnit::commit` (`src/lib.rs`), which is
//! the one part of that module with a working implementation: it writes the
//! new root to a non-authoritative slot first, flushes, and only then
//! overwrites the authoritative slot — that overwrite is the linearization
//! point a reader's mmap observes atomically (an 8-byte aligned write is
//! indivisible on every architecture this crate targets). Crash recovery
//! falls back to the non-authoritative slot if the authoritative one is
//! unreadable or structurally invalid.

use crate::alloc::SlabAllocator;
use crate::error::{Error, Result};
use crate::node::{Node, Ref};

/// Byte offset of the authoritative top ref.
pub const PRIMARY_SLOT: usize = 0;
/// Byte offset of the fallback top ref, written first during commit.
pub const FALLBACK_SLOT: usize = 8;

/// Walks the dirty spine of `top`, relocating every slab-resident Node it
/// reaches into file space, and returns the resulting (now fully
/// file-resident) top ref. `min_live_version` bounds which free-list extents
/// are safe to reuse — pass `u64::MAX` for a `Group` with no concurrent
/// readers to protect.
pub fn relocate(alloc: &mut SlabAllocator, top: &mut Node, min_live_version: u64) -> Result<Ref> {
    relocate_node(top, alloc, min_live_version)?;
    Ok(top.ref_())
}

fn relocate_node(node: &mut Node, alloc: &mut SlabAllocator, min_live_version: u64) -> Result<()> {
    if !node.is_dirty(alloc) {
        return Ok(());
    }
    if node.has_child_refs(alloc)? {
        let n = node.size(alloc)?;
        for i in 0..n {
            let child_ref = node.get_ref(alloc, i)?;
            if child_ref.is_none() {
                continue;
            }
            let mut child = Node::open(child_ref);
            relocate_node(&mut child, alloc, min_live_version)?;
            if child.ref_() != child_ref {
                node.set(alloc, i, child.ref_().0, None)?;
            }
        }
    }
    node.relocate_to_file(alloc, min_live_version)?;
    Ok(())
}

/// The two-phase atomic top-ref swap (spec §4.4 step 3).
///
/// Must be called only after [`relocate`] has made `new_top` fully
/// file-resident — committing a ref that still points into slab space would
/// leave the file pointing at memory that vanishes with the process.
pub fn swap_top_ref(alloc: &mut SlabAllocator, new_top: Ref) -> Result<()> {
    let file = alloc.file_mut();
    file.write(FALLBACK_SLOT, 8)?.copy_from_slice(&new_top.0.to_le_bytes());
    file.flush_range(FALLBACK_SLOT, 8)?;
    file.write(PRIMARY_SLOT, 8)?.copy_from_slice(&new_top.0.to_le_bytes());
    file.flush_range(PRIMARY_SLOT, 8)?;
    Ok(())
}

/// Read the current top ref back out of the file header, preferring the
/// authoritative slot and falling back to the other if it looks unreadable.
///
/// "Looks unreadable" here means the slot's ref, when nonzero, must point to
/// a structural Node header within the file's current bounds — we have no
/// separate root checksum the way the teacher's `RootHeader` does, since our
/// header is a bare pair of ref slots rather than a full checksummed root
/// page; a shape check plays the same role.
pub fn read_top_ref(alloc: &SlabAllocator) -> Result<Ref> {
    let primary = read_slot(alloc, PRIMARY_SLOT)?;
    if slot_looks_valid(alloc, primary) {
        return Ok(primary);
    }
    let fallback = read_slot(alloc, FALLBACK_SLOT)?;
    if slot_looks_valid(alloc, fallback) {
        return Ok(fallback);
    }
    Err(Error::Corrupt("neither root slot holds a valid top ref"))
}

fn read_slot(alloc: &SlabAllocator, offset: usize) -> Result<Ref> {
    let bytes = alloc.file().read(offset, 8)?;
    let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::Corrupt("short root slot"))?;
    Ok(Ref(u64::from_le_bytes(arr)))
}

fn slot_looks_valid(alloc: &SlabAllocator, r: Ref) -> bool {
    if r.is_none() {
        return true;
    }
    if r.0 % 8 != 0 || r.0 >= alloc.committed_len() {
        return false;
    }
    Node::open(r).size(alloc).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_pages::Flags;

    #[test]
    fn relocate_moves_dirty_nodes_out_of_slab_space() {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 16]).unwrap();
        let mut top = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        top.add(&mut alloc, 41, None).unwrap();
        assert!(top.is_dirty(&alloc));

        let new_top = relocate(&mut alloc, &mut top, u64::MAX).unwrap();
        assert!(!alloc.is_slab_ref(new_top.0));
        assert_eq!(top.get(&alloc, 0).unwrap(), 41);
    }

    #[test]
    fn swap_then_read_round_trips() {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 16]).unwrap();
        let mut top = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        top.add(&mut alloc, 7, None).unwrap();
        let new_top = relocate(&mut alloc, &mut top, u64::MAX).unwrap();
        swap_top_ref(&mut alloc, new_top).unwrap();
        alloc.finish_commit();
        assert_eq!(read_top_ref(&alloc).unwrap(), new_top);
    }

    #[test]
    fn fallback_slot_recovers_when_primary_is_torn() {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 16]).unwrap();
        let mut top = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        top.add(&mut alloc, 7, None).unwrap();
        let new_top = relocate(&mut alloc, &mut top, u64::MAX).unwrap();
        swap_top_ref(&mut alloc, new_top).unwrap();
        alloc.finish_commit();

        // simulate a torn write to the primary slot only.
        alloc.file_mut().write(PRIMARY_SLOT, 8).unwrap().copy_from_slice(&[0xff; 8]);
        assert_eq!(read_top_ref(&alloc).unwrap(), new_top);
    }
}

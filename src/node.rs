//! The universal persistent record.
//!
//! Every higher-level structure in the engine — the Group's top array, a
//! table's column list, a column's own leaf and inner pages — is built out
//! of [`Node`]. A Node is a header-prefixed, variable-width packed vector of
//! 64-bit integers (see spec §3); [`strata_pages`] supplies the bit-packing
//! codec, this module supplies the ref-addressed, copy-on-write container
//! around it.
//!
//! Unlike the teacher crate, which threads raw `'static` pointers extracted
//! from the memory map through every handle, a [`Node`] here carries only a
//! [`Ref`] — it is a lightweight, `Copy` value type, and every operation
//! takes the owning [`crate::alloc::SlabAllocator`] explicitly. This keeps
//! the "refs instead of pointers" invariant from spec §9 but sidesteps the
//! unsafe lifetime extension the teacher needed to let many handles share
//! one map; see DESIGN.md for the tradeoff.

use strata_pages::{get, packed_byte_len, set, width_for_value, Flags, Header, HEADER_BYTES};

use crate::alloc::SlabAllocator;
use crate::error::{Error, Result};

/// An opaque 64-bit identity of a Node. Equal to its byte offset when the
/// Node resides in the file; a slab-space address otherwise. `Ref(0)` means
/// "none".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref(pub u64);

impl Ref {
    pub const NONE: Ref = Ref(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

/// One-hop up-notification protocol (spec §9 "Parent callbacks"). Any
/// structure that owns Nodes implements this so that a child's
/// copy-on-write reallocation can be reflected in its owner's slot.
pub trait Parent {
    fn update_child_ref(&mut self, alloc: &mut SlabAllocator, slot: usize, new_ref: Ref) -> Result<()>;
    fn get_child_ref(&self, alloc: &SlabAllocator, slot: usize) -> Ref;
}

/// The common case of a [`Parent`]: the owner is itself just another Node,
/// at a fixed slot. Covers every parent-binding in this engine, since Table
/// and subtable columns (which would need a custom `Parent` impl of their
/// own) are out of scope here — `Group`'s top array is entirely composed of
/// Node-in-Node ownership.
pub struct NodeSlot<'a> {
    pub node: &'a mut Node,
}

impl<'a> Parent for NodeSlot<'a> {
    fn update_child_ref(&mut self, alloc: &mut SlabAllocator, slot: usize, new_ref: Ref) -> Result<()> {
        self.node.set(alloc, slot, new_ref.0, None)
    }

    fn get_child_ref(&self, alloc: &SlabAllocator, slot: usize) -> Ref {
        self.node.get_ref(alloc, slot).unwrap_or(Ref::NONE)
    }
}

/// A reference to a Node, plus (optionally) the slot in a [`Parent`] that
/// must be notified when this Node's ref changes under copy-on-write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    ref_: Ref,
}

impl Node {
    /// Wrap an existing ref without touching the allocator. Reads are
    /// deferred until first use; this matches the `Detached`/`ImmutableMapped`
    /// states from spec §4.3 (the distinction between the two collapses here
    /// since both are just "not yet mutated").
    pub fn open(ref_: Ref) -> Self {
        Self { ref_ }
    }

    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    /// Allocate a brand new, empty Node.
    pub fn with_capacity(
        alloc: &mut SlabAllocator,
        flags: Flags,
        width_code: u8,
        capacity_elems: usize,
    ) -> Result<Self> {
        let cap_bytes = packed_byte_len(capacity_elems, width_code);
        let total = HEADER_BYTES + cap_bytes;
        let (r, buf) = alloc.alloc(total as u64)?;
        let header = Header::new(flags, width_code, 0, cap_bytes as u32);
        buf[..HEADER_BYTES].copy_from_slice(&header.as_bytes());
        buf[HEADER_BYTES..].fill(0);
        Ok(Self { ref_: Ref(r) })
    }

    fn header(&self, alloc: &SlabAllocator) -> Result<Header> {
        if self.ref_.is_none() {
            return Ok(Header::new(Flags::default(), 0, 0, 0));
        }
        let bytes = alloc.translate(self.ref_.0, HEADER_BYTES as u64)?;
        let arr: [u8; HEADER_BYTES] = bytes.try_into().map_err(|_| Error::Corrupt("short header"))?;
        Ok(Header::from_bytes(arr))
    }

    pub fn is_inner(&self, alloc: &SlabAllocator) -> Result<bool> {
        Ok(self.header(alloc)?.flags().is_inner)
    }

    pub fn has_child_refs(&self, alloc: &SlabAllocator) -> Result<bool> {
        Ok(self.header(alloc)?.flags().has_child_refs)
    }

    pub fn size(&self, alloc: &SlabAllocator) -> Result<usize> {
        Ok(self.header(alloc)?.len() as usize)
    }

    fn byte_len(&self, alloc: &SlabAllocator) -> Result<u64> {
        let h = self.header(alloc)?;
        Ok((HEADER_BYTES as u64) + h.capacity() as u64)
    }

    fn payload(&self, alloc: &SlabAllocator) -> Result<(Header, &[u8])> {
        let h = self.header(alloc)?;
        let total = HEADER_BYTES as u64 + h.capacity() as u64;
        let bytes = alloc.translate(self.ref_.0, total)?;
        Ok((h, &bytes[HEADER_BYTES..]))
    }

    pub fn get(&self, alloc: &SlabAllocator, i: usize) -> Result<u64> {
        let (h, payload) = self.payload(alloc)?;
        if i >= h.len() as usize {
            return Err(Error::InvalidAccess { offset: i, len: 1 });
        }
        Ok(get(payload, h.width_code(), i))
    }

    pub fn get_ref(&self, alloc: &SlabAllocator, i: usize) -> Result<Ref> {
        Ok(Ref(self.get(alloc, i)?))
    }

    /// Copy every element out, for callers that want the whole Node (used by
    /// `write()` and by the Writer's dirty-spine walk).
    pub fn to_vec(&self, alloc: &SlabAllocator) -> Result<Vec<u64>> {
        let (h, payload) = self.payload(alloc)?;
        let n = h.len() as usize;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(get(payload, h.width_code(), i));
        }
        Ok(out)
    }

    /// True once this Node's ref is in slab space — equivalently, it has been
    /// modified since the allocator's committed file length was fixed.
    pub fn is_dirty(&self, alloc: &SlabAllocator) -> bool {
        self.ref_.is_some() && alloc.is_slab_ref(self.ref_.0)
    }

    /// Ensure this Node's storage is mutable (in slab space), copy-on-write
    /// duplicating it first if it currently lives in the committed file
    /// region. Notifies `parent`/`slot` if a new ref was produced.
    fn ensure_mutable(
        &mut self,
        alloc: &mut SlabAllocator,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<bool> {
        if self.ref_.is_some() && alloc.is_slab_ref(self.ref_.0) {
            return Ok(false);
        }
        let bytes = self.byte_len(alloc)?;
        let old = self.ref_;
        let (new_ref, _) = if old.is_none() {
            alloc.alloc(bytes)?
        } else {
            alloc.realloc(old.0, bytes, bytes)?
        };
        self.ref_ = Ref(new_ref);
        if let Some((p, slot)) = parent {
            p.update_child_ref(alloc, slot, self.ref_)?;
        }
        Ok(true)
    }

    fn grow_capacity(
        &mut self,
        alloc: &mut SlabAllocator,
        new_width_code: u8,
        new_elem_capacity: usize,
        mut parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let h = self.header(alloc)?;
        let n = h.len();
        let old_values = self.to_vec(alloc)?;
        let new_cap_bytes = packed_byte_len(new_elem_capacity, new_width_code);
        let new_total = HEADER_BYTES as u64 + new_cap_bytes as u64;

        let old_ref = self.ref_;
        let old_total = self.byte_len(alloc)?;
        let (new_ref, buf) = alloc.alloc(new_total)?;
        let mut new_header = Header::new(h.flags(), new_width_code, n, new_cap_bytes as u32);
        buf[..HEADER_BYTES].copy_from_slice(&new_header.as_bytes());
        buf[HEADER_BYTES..].fill(0);
        {
            let payload = &mut buf[HEADER_BYTES..];
            for (i, v) in old_values.iter().enumerate() {
                set(payload, new_width_code, i, *v);
            }
        }
        new_header.set_len(n);
        buf[..HEADER_BYTES].copy_from_slice(&new_header.as_bytes());

        if old_ref.is_some() {
            alloc.free(old_ref.0, old_total)?;
        }
        self.ref_ = Ref(new_ref);
        if let Some((p, slot)) = parent.take() {
            p.update_child_ref(alloc, slot, self.ref_)?;
        }
        Ok(())
    }

    /// Set element `i`. Widens (and reallocates, producing a new ref) if
    /// `v` does not fit the current width; otherwise writes in place.
    pub fn set(
        &mut self,
        alloc: &mut SlabAllocator,
        i: usize,
        v: u64,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let h = self.header(alloc)?;
        if i >= h.len() as usize {
            return Err(Error::InvalidAccess { offset: i, len: 1 });
        }
        let needed_code = width_for_value(v);
        if needed_code > h.width_code() {
            let elem_cap = element_capacity(h.capacity(), h.width_code()).max(h.len() as usize);
            self.grow_capacity(alloc, needed_code, elem_cap, parent)?;
            let buf = alloc.translate_mut(self.ref_.0, self.byte_len(alloc)?)?;
            set(&mut buf[HEADER_BYTES..], needed_code, i, v);
            return Ok(());
        }
        let became_mutable = self.ensure_mutable(alloc, parent)?;
        let _ = became_mutable;
        let total = self.byte_len(alloc)?;
        let buf = alloc.translate_mut(self.ref_.0, total)?;
        set(&mut buf[HEADER_BYTES..], h.width_code(), i, v);
        Ok(())
    }

    /// Append a value, growing capacity (and possibly width) as needed.
    pub fn add(
        &mut self,
        alloc: &mut SlabAllocator,
        v: u64,
        mut parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let h = self.header(alloc)?;
        let n = h.len() as usize;
        let elem_cap = element_capacity(h.capacity(), h.width_code());
        let needed_code = width_for_value(v).max(h.width_code());
        if n + 1 > elem_cap || needed_code > h.width_code() {
            // `elem_cap` is the sentinel `usize::MAX` for a zero-width Node
            // (every Node starts life that way): doubling it would overflow,
            // so a zero-width Node grows from the element count alone.
            let doubled = if h.width_code() == 0 { 0 } else { elem_cap.saturating_mul(2) };
            let new_cap = (n + 1).max(doubled).max(4);
            self.grow_capacity(alloc, needed_code, new_cap, parent.take())?;
        } else {
            self.ensure_mutable(alloc, parent.take())?;
        }
        let h = self.header(alloc)?;
        let total = self.byte_len(alloc)?;
        let buf = alloc.translate_mut(self.ref_.0, total)?;
        set(&mut buf[HEADER_BYTES..], h.width_code(), n, v);
        let mut new_header = h;
        new_header.set_len((n + 1) as u32);
        buf[..HEADER_BYTES].copy_from_slice(&new_header.as_bytes());
        Ok(())
    }

    /// Insert `v` at position `i`, shifting subsequent elements up.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAllocator,
        i: usize,
        v: u64,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let mut values = self.to_vec(alloc)?;
        if i > values.len() {
            return Err(Error::InvalidAccess { offset: i, len: 1 });
        }
        values.insert(i, v);
        self.rebuild(alloc, &values, parent)
    }

    /// Remove the element at position `i`, shifting subsequent elements down.
    pub fn erase(
        &mut self,
        alloc: &mut SlabAllocator,
        i: usize,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let mut values = self.to_vec(alloc)?;
        if i >= values.len() {
            return Err(Error::InvalidAccess { offset: i, len: 1 });
        }
        values.remove(i);
        self.rebuild(alloc, &values, parent)
    }

    pub fn clear(
        &mut self,
        alloc: &mut SlabAllocator,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        self.rebuild(alloc, &[], parent)
    }

    pub fn resize(
        &mut self,
        alloc: &mut SlabAllocator,
        new_len: usize,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let mut values = self.to_vec(alloc)?;
        values.resize(new_len, 0);
        self.rebuild(alloc, &values, parent)
    }

    /// Add `delta` to every element from `from` onward. Used to maintain
    /// running-sum offset vectors (spec §4.3; grounded on
    /// `ArrayBinary::Adjust` in `original_source/src/array_binary.cpp`).
    pub fn adjust(
        &mut self,
        alloc: &mut SlabAllocator,
        from: usize,
        delta: i64,
        parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let mut values = self.to_vec(alloc)?;
        for v in values.iter_mut().skip(from) {
            *v = (*v as i64 + delta).max(0) as u64;
        }
        self.rebuild(alloc, &values, parent)
    }

    fn rebuild(
        &mut self,
        alloc: &mut SlabAllocator,
        values: &[u64],
        mut parent: Option<(&mut dyn Parent, usize)>,
    ) -> Result<()> {
        let h = self.header(alloc)?;
        let width_code = values.iter().copied().fold(0u8, |acc, v| acc.max(width_for_value(v)));
        let new_cap = values.len().max(4);
        let new_cap_bytes = packed_byte_len(new_cap, width_code);
        let new_total = HEADER_BYTES as u64 + new_cap_bytes as u64;

        let old_ref = self.ref_;
        let old_total = if old_ref.is_some() { self.byte_len(alloc)? } else { 0 };
        let (new_ref, buf) = alloc.alloc(new_total)?;
        let mut header = Header::new(h.flags(), width_code, values.len() as u32, new_cap_bytes as u32);
        buf[..HEADER_BYTES].copy_from_slice(&header.as_bytes());
        buf[HEADER_BYTES..].fill(0);
        {
            let payload = &mut buf[HEADER_BYTES..];
            for (i, v) in values.iter().enumerate() {
                set(payload, width_code, i, *v);
            }
        }
        header.set_len(values.len() as u32);
        buf[..HEADER_BYTES].copy_from_slice(&header.as_bytes());

        if old_ref.is_some() {
            alloc.free(old_ref.0, old_total)?;
        }
        self.ref_ = Ref(new_ref);
        if let Some((p, slot)) = parent.take() {
            p.update_child_ref(alloc, slot, self.ref_)?;
        }
        Ok(())
    }

    /// Move this Node's storage from slab space into a durable file extent,
    /// chosen by the allocator's free-space database (or by growing the
    /// file). Returns `false` without doing anything if the Node is already
    /// file-resident. Used only by the commit writer; ordinary transaction
    /// code never needs this since it deals purely in refs, not placement.
    pub fn relocate_to_file(&mut self, alloc: &mut SlabAllocator, min_live_version: u64) -> Result<bool> {
        if !self.is_dirty(alloc) {
            return Ok(false);
        }
        let bytes = self.byte_len(alloc)?;
        let old_ref = self.ref_;
        let new_pos = alloc.alloc_from_free_list(bytes, min_live_version)?;
        alloc.copy_slab_to_file(old_ref.0, new_pos, bytes)?;
        self.ref_ = Ref(new_pos);
        Ok(true)
    }

    /// Serialize this Node and all descendants (post-order) into `out`,
    /// returning the position this Node ends up at. Used by `Group::write`/
    /// `write_to_mem`, which lay the tree out compactly rather than
    /// consulting the free list.
    pub fn write(&self, alloc: &SlabAllocator, out: &mut Vec<u8>) -> Result<u64> {
        if self.ref_.is_none() {
            return Ok(0);
        }
        let (h, payload) = self.payload(alloc)?;
        let n = h.len() as usize;
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            values.push(get(payload, h.width_code(), i));
        }

        if h.flags().has_child_refs {
            for v in values.iter_mut() {
                if *v != 0 {
                    *v = Node::open(Ref(*v)).write(alloc, out)?;
                }
            }
        }

        let cap_bytes = packed_byte_len(values.len(), h.width_code());
        let mut header = Header::new(h.flags(), h.width_code(), values.len() as u32, cap_bytes as u32);
        header.set_len(values.len() as u32);
        let pos = out.len() as u64;
        out.extend_from_slice(&header.as_bytes());
        let start = out.len();
        out.resize(start + cap_bytes, 0);
        {
            let payload = &mut out[start..start + cap_bytes];
            for (i, v) in values.iter().enumerate() {
                set(payload, h.width_code(), i, *v);
            }
        }
        Ok(pos)
    }
}

/// How many elements of `width_code` fit in `capacity_bytes`.
fn element_capacity(capacity_bytes: u32, width_code: u8) -> usize {
    let bits = strata_pages::Width::from_code(width_code).bits;
    if bits == 0 {
        usize::MAX
    } else {
        ((capacity_bytes as u64) * 8 / bits as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAllocator;

    fn fresh_alloc() -> SlabAllocator {
        SlabAllocator::new_anon(&[0u8; 16]).unwrap()
    }

    #[test]
    fn add_and_widen() {
        let mut alloc = fresh_alloc();
        let mut node = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        let r0 = node.ref_();
        node.add(&mut alloc, 0, None).unwrap();
        assert_eq!(node.get(&alloc, 0).unwrap(), 0);

        node.add(&mut alloc, 1, None).unwrap();
        let r1 = node.ref_();
        assert_ne!(r0, r1, "widening 0-bit -> 1-bit must reallocate");

        node.add(&mut alloc, 300, None).unwrap();
        let r2 = node.ref_();
        assert_ne!(r1, r2, "widening 1-bit -> 16-bit must reallocate");
        assert_eq!(node.size(&alloc).unwrap(), 3);
        assert_eq!(node.get(&alloc, 2).unwrap(), 300);
        assert_eq!(node.get(&alloc, 1).unwrap(), 1);
        assert_eq!(node.get(&alloc, 0).unwrap(), 0);
    }

    #[test]
    fn insert_and_erase() {
        let mut alloc = fresh_alloc();
        let mut node = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        for v in [10u64, 20, 30] {
            node.add(&mut alloc, v, None).unwrap();
        }
        node.insert(&mut alloc, 1, 15, None).unwrap();
        assert_eq!(node.to_vec(&alloc).unwrap(), vec![10, 15, 20, 30]);
        node.erase(&mut alloc, 0, None).unwrap();
        assert_eq!(node.to_vec(&alloc).unwrap(), vec![15, 20, 30]);
    }

    #[test]
    fn adjust_maintains_running_sums() {
        let mut alloc = fresh_alloc();
        let mut offsets = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        for v in [0u64, 5, 12] {
            offsets.add(&mut alloc, v, None).unwrap();
        }
        offsets.adjust(&mut alloc, 1, 3, None).unwrap();
        assert_eq!(offsets.to_vec(&alloc).unwrap(), vec![0, 8, 15]);
    }

    #[test]
    fn write_round_trips_child_refs() {
        let mut alloc = fresh_alloc();
        let mut leaf = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();
        leaf.add(&mut alloc, 7, None).unwrap();

        let mut top = Node::with_capacity(
            &mut alloc,
            Flags { is_inner: false, has_child_refs: true, is_index: false },
            6,
            4,
        )
        .unwrap();
        top.add(&mut alloc, leaf.ref_().0, None).unwrap();

        let mut out = Vec::new();
        let pos = top.write(&alloc, &mut out).unwrap();
        assert!(pos == 0 || !out.is_empty());
    }
}

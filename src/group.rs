//! The top-level container: maps table names to table-root refs, and
//! orchestrates the write/commit boundary.
//!
//! Grounded on `include/group.hpp` in the original sources: a fixed-shape
//! top array (`m_top`) owning five children — table names, table refs, and
//! the free-list Nodes — plus the write-placeholder-then-recurse pattern
//! used by `Group::write()`. `Table`/`Spec`/column types are out of scope
//! here (see spec §1); the handles this module hands back are thin,
//! generic wrappers over a child-ref Node, not a schema system — just
//! enough to exercise the allocator and commit protocol.
//!
//! All table mutation goes through `Group`'s own methods rather than
//! through a borrowed `&mut TableRef`: a live borrow of one of `Group`'s
//! cached tables and a live borrow of its allocator can't coexist across
//! separate calls, since both ultimately come from the same `Group`. Doing
//! the read-modify-propagate sequence inside one `Group` method keeps the
//! borrows disjoint and short-lived.

use std::fmt;
use std::path::Path;

use log::{debug, trace};
use strata_pages::Flags;

use crate::alloc::{FreeEntry, SlabAllocator};
use crate::error::{Error, Result};
use crate::node::{Node, NodeSlot, Ref};
use crate::writer;

const SLOT_NAMES: usize = 0;
const SLOT_TABLE_REFS: usize = 1;
const SLOT_FREE_POS: usize = 2;
const SLOT_FREE_LEN: usize = 3;
const SLOT_FREE_VER: usize = 4;
const TOP_ARITY: usize = 5;

const NAME_SLOT_OFFSETS: usize = 0;
const NAME_SLOT_BLOB: usize = 1;

/// How a [`Group`] was opened; governs whether `commit` is permitted and
/// whether it participates in the shared lock-file protocol.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub read_only: bool,
    /// Reserved for the write-ahead journal / interrupt interface described
    /// in spec §4.5 and §6; carried here as a config knob but the journal
    /// itself is out of scope per spec §1's non-goals.
    pub enable_replication: bool,
    /// Debug-only: track allocation provenance. Currently only gates the
    /// `trace!` logging density in the allocator paths.
    pub mem_diagnostics: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { read_only: false, enable_replication: false, mem_diagnostics: false }
    }
}

/// Opaque handle to a top-level, materialized table. Stable across
/// non-destructive mutations (spec §9 "Table cache") since it is just an
/// index into `Group`'s table cache, not a borrow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableHandle(usize);

/// Parallel string storage for table names (spec §3 "string-node listing
/// table names"), built from the `ArrayBinary` offsets+blob pattern in
/// `original_source/src/array_binary.cpp`: a running-sum offsets Node plus a
/// packed byte blob.
#[derive(Clone, Copy)]
struct NameList {
    container: Node,
}

impl NameList {
    fn create_empty(alloc: &mut SlabAllocator) -> Result<Self> {
        let offsets = Node::with_capacity(alloc, Flags::default(), 0, 4)?;
        let blob = Node::with_capacity(alloc, Flags::default(), 0, 4)?;
        let mut container = Node::with_capacity(
            alloc,
            Flags { is_inner: false, has_child_refs: true, is_index: false },
            7,
            2,
        )?;
        container.add(alloc, offsets.ref_().0, None)?;
        container.add(alloc, blob.ref_().0, None)?;
        Ok(Self { container })
    }

    fn attach(container_ref: Ref) -> Self {
        Self { container: Node::open(container_ref) }
    }

    fn ref_(&self) -> Ref {
        self.container.ref_()
    }

    fn offsets(&self, alloc: &SlabAllocator) -> Result<Node> {
        Ok(Node::open(self.container.get_ref(alloc, NAME_SLOT_OFFSETS)?))
    }

    fn blob(&self, alloc: &SlabAllocator) -> Result<Node> {
        Ok(Node::open(self.container.get_ref(alloc, NAME_SLOT_BLOB)?))
    }

    fn len(&self, alloc: &SlabAllocator) -> Result<usize> {
        self.offsets(alloc)?.size(alloc)
    }

    fn name_at(&self, alloc: &SlabAllocator, i: usize) -> Result<Vec<u8>> {
        let offsets = self.offsets(alloc)?;
        let blob = self.blob(alloc)?;
        let start = if i == 0 { 0 } else { offsets.get(alloc, i - 1)? } as usize;
        let end = offsets.get(alloc, i)? as usize;
        let mut out = Vec::with_capacity(end - start);
        for j in start..end {
            out.push(blob.get(alloc, j)? as u8);
        }
        Ok(out)
    }

    fn index_of(&self, alloc: &SlabAllocator, name: &[u8]) -> Result<Option<usize>> {
        let n = self.len(alloc)?;
        for i in 0..n {
            if self.name_at(alloc, i)? == name {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Append `name`, notifying `top` at `SLOT_NAMES` if the container
    /// itself relocates.
    fn push(&mut self, alloc: &mut SlabAllocator, name: &[u8], top: &mut Node) -> Result<()> {
        let mut offsets = self.offsets(alloc)?;
        let mut blob = self.blob(alloc)?;
        let prev_end = if offsets.size(alloc)? == 0 { 0 } else { offsets.get(alloc, offsets.size(alloc)? - 1)? };

        {
            let mut parent = NodeSlot { node: &mut self.container };
            for byte in name {
                blob.add(alloc, *byte as u64, Some((&mut parent, NAME_SLOT_BLOB)))?;
            }
        }
        let new_end = prev_end + name.len() as u64;
        {
            let mut parent = NodeSlot { node: &mut self.container };
            offsets.add(alloc, new_end, Some((&mut parent, NAME_SLOT_OFFSETS)))?;
        }
        top.set(alloc, SLOT_NAMES, self.container.ref_().0, None)?;
        Ok(())
    }
}

/// A thin, generic handle over a table's top Node — an array of column
/// refs. Intentionally not a schema/typed-column system (those are out of
/// scope, spec §1); just enough structure for tests to exercise the
/// allocator and commit machinery through something table-shaped.
#[derive(Clone, Copy)]
pub struct TableRef {
    top: Node,
}

impl TableRef {
    fn create_empty(alloc: &mut SlabAllocator) -> Result<Self> {
        let top = Node::with_capacity(
            alloc,
            Flags { is_inner: false, has_child_refs: true, is_index: false },
            7,
            4,
        )?;
        Ok(Self { top })
    }

    fn attach(top_ref: Ref) -> Self {
        Self { top: Node::open(top_ref) }
    }

    pub fn top_ref(&self) -> Ref {
        self.top.ref_()
    }

    pub fn column_count(&self, alloc: &SlabAllocator) -> Result<usize> {
        self.top.size(alloc)
    }

    fn ensure_column_slot(&mut self, alloc: &mut SlabAllocator, col: usize) -> Result<()> {
        let n = self.top.size(alloc)?;
        if col < n {
            return Ok(());
        }
        for _ in n..=col {
            self.top.add(alloc, Ref::NONE.0, None)?;
        }
        Ok(())
    }

    fn column_node(&self, alloc: &SlabAllocator, col: usize) -> Result<Node> {
        Ok(Node::open(self.top.get_ref(alloc, col)?))
    }

    /// Read `column[row]` as a plain integer value.
    pub fn get(&self, alloc: &SlabAllocator, col: usize, row: usize) -> Result<u64> {
        let column = self.column_node(alloc, col)?;
        if column.ref_().is_none() {
            return Err(Error::InvalidAccess { offset: row, len: 1 });
        }
        column.get(alloc, row)
    }

    /// Write `column[row]`, appending/zero-filling as needed (spec §4.3
    /// `resize`/`add`/`set`).
    fn set(&mut self, alloc: &mut SlabAllocator, col: usize, row: usize, value: u64) -> Result<()> {
        self.ensure_column_slot(alloc, col)?;
        let mut column = self.column_node(alloc, col)?;
        if column.ref_().is_none() {
            column = Node::with_capacity(alloc, Flags::default(), 0, 4)?;
            self.top.set(alloc, col, column.ref_().0, None)?;
        }
        let n = column.size(alloc)?;
        if row < n {
            let mut parent = NodeSlot { node: &mut self.top };
            column.set(alloc, row, value, Some((&mut parent, col)))?;
        } else {
            let mut parent = NodeSlot { node: &mut self.top };
            for _ in n..row {
                column.add(alloc, 0, Some((&mut parent, col)))?;
            }
            column.add(alloc, value, Some((&mut parent, col)))?;
        }
        Ok(())
    }

    /// Read the subtable handle at `column[row]` (spec's nested-subtable
    /// scenario D). Errors if no subtable has been created there yet.
    fn get_subtable(&self, alloc: &SlabAllocator, col: usize, row: usize) -> Result<TableRef> {
        let column = self.column_node(alloc, col)?;
        let r = column.get_ref(alloc, row)?;
        if r.is_none() {
            return Err(Error::InvalidAccess { offset: row, len: 1 });
        }
        Ok(TableRef::attach(r))
    }

    /// Materialize (creating if absent) the subtable handle at
    /// `column[row]`.
    fn ensure_subtable(&mut self, alloc: &mut SlabAllocator, col: usize, row: usize) -> Result<TableRef> {
        self.ensure_column_slot(alloc, col)?;
        let mut column = self.column_node(alloc, col)?;
        if column.ref_().is_none() {
            column = Node::with_capacity(
                alloc,
                Flags { is_inner: false, has_child_refs: true, is_index: false },
                7,
                4,
            )?;
            self.top.set(alloc, col, column.ref_().0, None)?;
        }
        let n = column.size(alloc)?;
        if row >= n {
            let mut parent = NodeSlot { node: &mut self.top };
            for _ in n..=row {
                column.add(alloc, Ref::NONE.0, Some((&mut parent, col)))?;
            }
        }
        let existing = column.get_ref(alloc, row)?;
        if existing.is_some() {
            return Ok(TableRef::attach(existing));
        }
        let sub = TableRef::create_empty(alloc)?;
        let mut parent = NodeSlot { node: &mut self.top };
        column.set(alloc, row, sub.top_ref().0, Some((&mut parent, col)))?;
        Ok(sub)
    }

    /// Overwrite `column[row]` with an already-known child ref, used when
    /// writing a subtable's new top ref back into its parent after the
    /// subtable itself relocated under copy-on-write.
    fn set_subtable_ref(&mut self, alloc: &mut SlabAllocator, col: usize, row: usize, new_ref: Ref) -> Result<()> {
        self.ensure_column_slot(alloc, col)?;
        let mut column = self.column_node(alloc, col)?;
        let n = column.size(alloc)?;
        if row >= n {
            for _ in n..=row {
                column.add(alloc, Ref::NONE.0, None)?;
            }
        }
        column.set(alloc, row, new_ref.0, None)?;
        self.top.set(alloc, col, column.ref_().0, None)?;
        Ok(())
    }
}

/// The top-level, named-table container (spec §4.4). Not thread-safe; one
/// handle owns one in-flight transaction.
pub struct Group {
    alloc: SlabAllocator,
    top: Node,
    tables: Vec<Option<TableRef>>,
    options: OpenOptions,
    is_buffer: bool,
}

impl Group {
    /// Construct a minimal empty Group backed by an anonymous, growable
    /// region (no file).
    pub fn open_empty() -> Result<Self> {
        let mut alloc = SlabAllocator::new_anon(&[0u8; 16])?;
        let top = Self::build_empty_top(&mut alloc)?;
        debug!("opened empty in-memory group");
        Ok(Self { alloc, top, tables: Vec::new(), options: OpenOptions::default(), is_buffer: false })
    }

    /// Open (creating if absent, unless `read_only`) the database file at
    /// `path`.
    pub fn open_file(path: &Path, options: OpenOptions) -> Result<Self> {
        let mut alloc = SlabAllocator::open_file(path, options.read_only)?;
        let top_ref = writer::read_top_ref(&alloc)?;
        let top = if top_ref.is_none() {
            Self::build_empty_top(&mut alloc)?
        } else {
            let top = Node::open(top_ref);
            Self::validate_top_shape(&alloc, &top)?;
            top
        };
        Self::load_free_list_from_top(&mut alloc, &top)?;
        let tables = vec![None; top_table_refs_len(&alloc, &top)?];
        debug!("opened group at {:?}, {} table(s)", path, tables.len());
        Ok(Self { alloc, top, tables, options, is_buffer: false })
    }

    /// Attach to an immutable in-memory byte range with the same layout as
    /// the file format (spec §6 "in-memory buffer export"). `commit` is
    /// disallowed on the result.
    pub fn open_buffer(bytes: &[u8]) -> Result<Self> {
        let mut alloc = SlabAllocator::new_anon(bytes)?;
        let top_ref = writer::read_top_ref(&alloc)?;
        let top = if top_ref.is_none() {
            Self::build_empty_top(&mut alloc)?
        } else {
            let top = Node::open(top_ref);
            Self::validate_top_shape(&alloc, &top)?;
            top
        };
        Self::load_free_list_from_top(&mut alloc, &top)?;
        let tables = vec![None; top_table_refs_len(&alloc, &top)?];
        let options = OpenOptions { read_only: true, ..OpenOptions::default() };
        Ok(Self { alloc, top, tables, options, is_buffer: true })
    }

    /// Read the free-space database out of `top`'s `free_pos`/`free_len`/
    /// `free_ver` children and install it into `alloc` (spec §4.4 step 5:
    /// the free list is itself part of the Node tree, reloaded at every
    /// open rather than kept across separate allocator instances).
    fn load_free_list_from_top(alloc: &mut SlabAllocator, top: &Node) -> Result<()> {
        let entries = if top.ref_().is_none() {
            Vec::new()
        } else {
            let free_pos = Node::open(top.get_ref(&*alloc, SLOT_FREE_POS)?);
            let free_len = Node::open(top.get_ref(&*alloc, SLOT_FREE_LEN)?);
            let free_ver = Node::open(top.get_ref(&*alloc, SLOT_FREE_VER)?);
            let n = free_pos.size(&*alloc)?;
            let mut v = Vec::with_capacity(n);
            for i in 0..n {
                v.push(FreeEntry {
                    pos: free_pos.get(&*alloc, i)?,
                    len: free_len.get(&*alloc, i)?,
                    released_at: free_ver.get(&*alloc, i)?,
                });
            }
            v
        };
        alloc.load_free_list(entries);
        Ok(())
    }

    /// Encode `alloc`'s current free list into the top array's
    /// `free_pos`/`free_len`/`free_ver` children (spec §4.4 step 5). Writing
    /// these Nodes can itself free or allocate slab space (a width-growing
    /// reallocation, or a `resize` shrinking the backing buffer), which
    /// perturbs the very free list being encoded — so this loops until the
    /// entry count stops changing, mirroring the teacher's acknowledgment
    /// (`connect_free_space`'s `ensureRest`) that this is a fixed point, not
    /// a single pass.
    fn sync_free_list_to_top(&mut self) -> Result<()> {
        let mut last_len = usize::MAX;
        for _ in 0..8 {
            let entries = self.alloc.free_list().to_vec();
            self.write_free_list_nodes(&entries)?;
            if self.alloc.free_list().len() == entries.len() && entries.len() == last_len {
                return Ok(());
            }
            last_len = entries.len();
        }
        Ok(())
    }

    fn write_free_list_nodes(&mut self, entries: &[FreeEntry]) -> Result<()> {
        let mut free_pos = Node::open(self.top.get_ref(&self.alloc, SLOT_FREE_POS)?);
        let mut free_len = Node::open(self.top.get_ref(&self.alloc, SLOT_FREE_LEN)?);
        let mut free_ver = Node::open(self.top.get_ref(&self.alloc, SLOT_FREE_VER)?);

        {
            let mut parent = NodeSlot { node: &mut self.top };
            free_pos.resize(&mut self.alloc, entries.len(), Some((&mut parent, SLOT_FREE_POS)))?;
        }
        {
            let mut parent = NodeSlot { node: &mut self.top };
            free_len.resize(&mut self.alloc, entries.len(), Some((&mut parent, SLOT_FREE_LEN)))?;
        }
        {
            let mut parent = NodeSlot { node: &mut self.top };
            free_ver.resize(&mut self.alloc, entries.len(), Some((&mut parent, SLOT_FREE_VER)))?;
        }
        for (i, e) in entries.iter().enumerate() {
            let mut parent = NodeSlot { node: &mut self.top };
            free_pos.set(&mut self.alloc, i, e.pos, Some((&mut parent, SLOT_FREE_POS)))?;
            let mut parent = NodeSlot { node: &mut self.top };
            free_len.set(&mut self.alloc, i, e.len, Some((&mut parent, SLOT_FREE_LEN)))?;
            let mut parent = NodeSlot { node: &mut self.top };
            free_ver.set(&mut self.alloc, i, e.released_at, Some((&mut parent, SLOT_FREE_VER)))?;
        }
        Ok(())
    }

    fn build_empty_top(alloc: &mut SlabAllocator) -> Result<Node> {
        let names = NameList::create_empty(alloc)?;
        let table_refs = Node::with_capacity(alloc, Flags { is_inner: false, has_child_refs: true, is_index: false }, 7, 4)?;
        let free_pos = Node::with_capacity(alloc, Flags::default(), 0, 4)?;
        let free_len = Node::with_capacity(alloc, Flags::default(), 0, 4)?;
        let free_ver = Node::with_capacity(alloc, Flags::default(), 0, 4)?;

        let mut top = Node::with_capacity(
            alloc,
            Flags { is_inner: false, has_child_refs: true, is_index: false },
            7,
            TOP_ARITY,
        )?;
        top.add(alloc, names.ref_().0, None)?;
        top.add(alloc, table_refs.ref_().0, None)?;
        top.add(alloc, free_pos.ref_().0, None)?;
        top.add(alloc, free_len.ref_().0, None)?;
        top.add(alloc, free_ver.ref_().0, None)?;
        Ok(top)
    }

    /// Full top-array shape validation (spec §9 open question (b)): arity,
    /// flags, and names/table_refs length agreement.
    fn validate_top_shape(alloc: &SlabAllocator, top: &Node) -> Result<()> {
        if top.size(alloc)? != TOP_ARITY {
            return Err(Error::Corrupt("group top array does not have 5 children"));
        }
        if !top.has_child_refs(alloc)? || top.is_inner(alloc)? {
            return Err(Error::Corrupt("group top array has the wrong shape flags"));
        }
        let names = NameList::attach(top.get_ref(alloc, SLOT_NAMES)?);
        let table_refs = Node::open(top.get_ref(alloc, SLOT_TABLE_REFS)?);
        let free_pos = Node::open(top.get_ref(alloc, SLOT_FREE_POS)?);
        let free_len = Node::open(top.get_ref(alloc, SLOT_FREE_LEN)?);
        if names.len(alloc)? != table_refs.size(alloc)? {
            return Err(Error::Corrupt("table names and table refs have different lengths"));
        }
        if free_pos.size(alloc)? != free_len.size(alloc)? {
            return Err(Error::Corrupt("free position and length lists have different lengths"));
        }
        Ok(())
    }

    fn names(&self) -> NameList {
        NameList::attach(self.top.get_ref(&self.alloc, SLOT_NAMES).unwrap_or(Ref::NONE))
    }

    fn table_refs(&self) -> Node {
        Node::open(self.top.get_ref(&self.alloc, SLOT_TABLE_REFS).unwrap_or(Ref::NONE))
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn table_names(&self) -> Result<Vec<Vec<u8>>> {
        let names = self.names();
        let n = names.len(&self.alloc)?;
        (0..n).map(|i| names.name_at(&self.alloc, i)).collect()
    }

    fn ensure_table_materialized(&mut self, h: TableHandle) -> Result<()> {
        if self.tables[h.0].is_none() {
            let r = self.table_refs().get_ref(&self.alloc, h.0)?;
            self.tables[h.0] = Some(TableRef::attach(r));
        }
        Ok(())
    }

    /// Write the (possibly new) top ref for the table at `idx` back through
    /// `table_refs` into `top`.
    fn propagate_table_ref(&mut self, idx: usize, new_ref: Ref) -> Result<()> {
        let mut table_refs = self.table_refs();
        let mut top_parent = NodeSlot { node: &mut self.top };
        table_refs.set(&mut self.alloc, idx, new_ref.0, Some((&mut top_parent, SLOT_TABLE_REFS)))?;
        Ok(())
    }

    /// Find `name`; if present, return a handle to the cached (or freshly
    /// materialized) table. If absent, create a fresh empty table, append
    /// its name and ref, and cache it.
    pub fn get_table(&mut self, name: &[u8]) -> Result<TableHandle> {
        let names = self.names();
        if let Some(i) = names.index_of(&self.alloc, name)? {
            self.ensure_table_materialized(TableHandle(i))?;
            return Ok(TableHandle(i));
        }

        if self.options.read_only {
            return Err(Error::Invalid("cannot create a table on a read-only group"));
        }
        let table = TableRef::create_empty(&mut self.alloc)?;
        let table_ref = table.top_ref();
        let idx = self.tables.len();

        {
            let mut top_parent = NodeSlot { node: &mut self.top };
            let mut table_refs = self.table_refs();
            table_refs.add(&mut self.alloc, table_ref.0, Some((&mut top_parent, SLOT_TABLE_REFS)))?;
        }
        {
            let mut names = self.names();
            names.push(&mut self.alloc, name, &mut self.top)?;
        }

        self.tables.push(Some(table));
        trace!("created table {:?}", String::from_utf8_lossy(name));
        Ok(TableHandle(idx))
    }

    pub fn table_column_count(&self, h: TableHandle) -> Result<usize> {
        self.tables[h.0]
            .as_ref()
            .ok_or(Error::Invalid("table not materialized"))?
            .column_count(&self.alloc)
    }

    pub fn table_get(&self, h: TableHandle, col: usize, row: usize) -> Result<u64> {
        self.tables[h.0].as_ref().ok_or(Error::Invalid("table not materialized"))?.get(&self.alloc, col, row)
    }

    pub fn table_set(&mut self, h: TableHandle, col: usize, row: usize, value: u64) -> Result<()> {
        self.ensure_table_materialized(h)?;
        let old_ref = self.tables[h.0].as_ref().unwrap().top_ref();
        self.tables[h.0].as_mut().unwrap().set(&mut self.alloc, col, row, value)?;
        let new_ref = self.tables[h.0].as_ref().unwrap().top_ref();
        if new_ref != old_ref {
            self.propagate_table_ref(h.0, new_ref)?;
        }
        Ok(())
    }

    /// Read a value reached by descending through zero or more subtable
    /// hops (`path`, each a `(col, row)` pair), then reading `col`/`row` in
    /// the table found at the end of the path.
    pub fn table_get_nested(&mut self, h: TableHandle, path: &[(usize, usize)], col: usize, row: usize) -> Result<u64> {
        self.ensure_table_materialized(h)?;
        let mut top_ref = self.tables[h.0].as_ref().unwrap().top_ref();
        for &(pcol, prow) in path {
            let parent = TableRef::attach(top_ref);
            let sub = parent.get_subtable(&self.alloc, pcol, prow)?;
            top_ref = sub.top_ref();
        }
        TableRef::attach(top_ref).get(&self.alloc, col, row)
    }

    /// Write a value reached by descending through zero or more subtable
    /// hops, creating intermediate subtables as needed, and propagate every
    /// level's (possibly new, post-COW) top ref back up to `Group::top`.
    pub fn table_set_nested(&mut self, h: TableHandle, path: &[(usize, usize)], col: usize, row: usize, value: u64) -> Result<()> {
        self.ensure_table_materialized(h)?;
        let mut tops = vec![self.tables[h.0].as_ref().unwrap().top_ref()];
        for &(pcol, prow) in path {
            let mut parent = TableRef::attach(*tops.last().unwrap());
            let sub = parent.ensure_subtable(&mut self.alloc, pcol, prow)?;
            *tops.last_mut().unwrap() = parent.top_ref();
            tops.push(sub.top_ref());
        }

        {
            let mut innermost = TableRef::attach(*tops.last().unwrap());
            innermost.set(&mut self.alloc, col, row, value)?;
            *tops.last_mut().unwrap() = innermost.top_ref();
        }

        for level in (0..path.len()).rev() {
            let (pcol, prow) = path[level];
            let mut parent = TableRef::attach(tops[level]);
            parent.set_subtable_ref(&mut self.alloc, pcol, prow, tops[level + 1])?;
            tops[level] = parent.top_ref();
        }

        self.tables[h.0] = Some(TableRef::attach(tops[0]));
        self.propagate_table_ref(h.0, tops[0])?;
        Ok(())
    }

    /// Full serialization of the current in-memory state into a fresh byte
    /// buffer, laid out compactly in post-order — does not consult the free
    /// list (spec §4.4 `write`/`write_to_mem`).
    pub fn write_to_mem(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; 16];
        let top_pos = self.top.write(&self.alloc, &mut out)?;
        out[0..8].copy_from_slice(&top_pos.to_le_bytes());
        out[8..16].copy_from_slice(&top_pos.to_le_bytes());
        Ok(out)
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let bytes = self.write_to_mem()?;
        std::fs::write(path, bytes).map_err(Error::Open)
    }

    /// Relocate the dirty spine into durable file extents and atomically
    /// install the new top ref (spec §4.4 Writer algorithm).
    pub fn commit(&mut self) -> Result<()> {
        self.commit_at(u64::MAX, 0)
    }

    /// As `commit`, but bounding free-list reuse to extents released at or
    /// before `min_live_version`, and tagging extents this commit itself
    /// frees with `release_version` — used by `SharedGroup`, which has
    /// concurrent readers to protect. A bare `Group` always passes
    /// `(u64::MAX, 0)`: with no readers to protect, every extent is
    /// reusable regardless of its tag.
    pub(crate) fn commit_at(&mut self, min_live_version: u64, release_version: u64) -> Result<()> {
        if self.is_buffer || self.options.read_only {
            return Err(Error::Invalid("cannot commit a read-only or buffer-mode group"));
        }
        self.alloc.set_release_version(release_version);
        // First pass relocates everything dirtied by this transaction's own
        // mutations, which also updates `self.alloc`'s free list with
        // whatever those mutations superseded.
        writer::relocate(&mut self.alloc, &mut self.top, min_live_version)?;
        // Fold that (possibly still-settling) free list back into the top
        // array, then relocate again to persist the free-list Nodes
        // themselves and pick up `top`'s resulting dirty slots.
        self.sync_free_list_to_top()?;
        let new_top = writer::relocate(&mut self.alloc, &mut self.top, min_live_version)?;
        writer::swap_top_ref(&mut self.alloc, new_top)?;
        self.alloc.file_mut().flush()?;
        self.alloc.finish_commit();
        debug!("committed, new top ref = {}", new_top.0);
        Ok(())
    }

    /// Stub half of the interruption interface (spec §4.5/§6): a bare
    /// `Group` has no concurrent writer and nothing blocking to interrupt,
    /// so these only make sense gated behind `enable_replication`, matching
    /// `SharedGroup`'s real interruption support.
    pub fn interrupt_transact(&self) -> Result<()> {
        if !self.options.enable_replication {
            return Err(Error::Invalid("interrupt_transact requires enable_replication"));
        }
        Ok(())
    }

    pub fn clear_interrupt_transact(&self) -> Result<()> {
        if !self.options.enable_replication {
            return Err(Error::Invalid("clear_interrupt_transact requires enable_replication"));
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let top_ref = writer::read_top_ref(&self.alloc)?;
        self.alloc.rollback();
        self.top = if top_ref.is_none() { Self::build_empty_top(&mut self.alloc)? } else { Node::open(top_ref) };
        Self::load_free_list_from_top(&mut self.alloc, &self.top)?;
        self.tables.clear();
        self.tables.resize_with(top_table_refs_len(&self.alloc, &self.top)?, || None);
        Ok(())
    }

    pub(crate) fn alloc(&self) -> &SlabAllocator {
        &self.alloc
    }

    pub(crate) fn alloc_mut(&mut self) -> &mut SlabAllocator {
        &mut self.alloc
    }

    pub(crate) fn top_ref(&self) -> Ref {
        self.top.ref_()
    }

    /// Attach to an already-open allocator at `top_ref`, building a fresh
    /// empty top array if the file has never been committed to (spec §4.4
    /// `open_file`'s "if zero, treat as empty" rule applies here too — used
    /// by [`crate::shared::SharedGroup`], whose transactions each open their
    /// own allocator against whatever top ref the lock file currently
    /// records).
    pub(crate) fn attach_at(mut alloc: SlabAllocator, top_ref: Ref, options: OpenOptions) -> Result<Self> {
        let top = if top_ref.is_none() {
            Self::build_empty_top(&mut alloc)?
        } else {
            let top = Node::open(top_ref);
            Self::validate_top_shape(&alloc, &top)?;
            top
        };
        Self::load_free_list_from_top(&mut alloc, &top)?;
        let tables = vec![None; top_table_refs_len(&alloc, &top)?];
        Ok(Self { alloc, top, tables, options, is_buffer: false })
    }

    /// Snapshot of the free list as (position, length) pairs, for tests
    /// that check spec invariant 4 (free-list conservation).
    pub fn free_list_snapshot(&self) -> Vec<FreeEntry> {
        self.alloc.free_list().to_vec()
    }
}

/// Debug-only allocation provenance snapshot (spec §6 `mem_diagnostics`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub committed_len: u64,
    pub free_extents: usize,
    pub free_bytes: u64,
    pub table_count: usize,
}

impl Group {
    /// Snapshot allocator/table bookkeeping. Always available, but callers
    /// following spec §6 are expected to only poll it when
    /// `OpenOptions::mem_diagnostics` is set — this crate doesn't gate the
    /// computation itself since it's cheap, only the `trace!` density in the
    /// allocator paths is actually conditioned on the flag.
    pub fn stats(&self) -> Stats {
        let free_bytes = self.alloc.free_list().iter().map(|e| e.len).sum();
        Stats {
            committed_len: self.alloc.committed_len(),
            free_extents: self.alloc.free_list().len(),
            free_bytes,
            table_count: self.tables.len(),
        }
    }
}

impl fmt::Debug for Group {
    /// A `to_json`-flavored debug dump (spec §9.7): table names and counts,
    /// not a full JSON column serializer (that belongs to the column layer,
    /// out of scope here).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.table_names().unwrap_or_default();
        f.debug_struct("Group")
            .field("tables", &names.iter().map(|n| String::from_utf8_lossy(n).into_owned()).collect::<Vec<_>>())
            .field("top_ref", &self.top.ref_().0)
            .finish()
    }
}

fn top_table_refs_len(alloc: &SlabAllocator, top: &Node) -> Result<usize> {
    if top.ref_().is_none() {
        return Ok(0);
    }
    let table_refs = Node::open(top.get_ref(alloc, SLOT_TABLE_REFS)?);
    table_refs.size(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_has_no_tables() {
        let group = Group::open_empty().unwrap();
        assert_eq!(group.table_count(), 0);
    }

    #[test]
    fn create_table_then_find_by_name() {
        let mut group = Group::open_empty().unwrap();
        group.get_table(b"t").unwrap();
        assert_eq!(group.table_count(), 1);
        assert_eq!(group.table_names().unwrap(), vec![b"t".to_vec()]);
        // second lookup finds the same table, doesn't create a duplicate
        group.get_table(b"t").unwrap();
        assert_eq!(group.table_count(), 1);
    }

    #[test]
    fn single_table_single_value_round_trips_through_write_to_mem() {
        let mut group = Group::open_empty().unwrap();
        let t = group.get_table(b"t").unwrap();
        group.table_set(t, 0, 0, 42).unwrap();
        assert_eq!(group.table_get(t, 0, 0).unwrap(), 42);

        let buf = group.write_to_mem().unwrap();
        let mut reopened = Group::open_buffer(&buf).unwrap();
        assert_eq!(reopened.table_count(), 1);
        let t2 = reopened.get_table(b"t").unwrap();
        assert_eq!(reopened.table_get(t2, 0, 0).unwrap(), 42);
    }

    #[test]
    fn nested_subtables_round_trip() {
        let mut group = Group::open_empty().unwrap();
        let t = group.get_table(b"T").unwrap();
        group.table_set_nested(t, &[(0, 0), (0, 0)], 0, 0, 6661012).unwrap();
        assert_eq!(group.table_get_nested(t, &[(0, 0), (0, 0)], 0, 0).unwrap(), 6661012);

        let buf = group.write_to_mem().unwrap();
        let mut reopened = Group::open_buffer(&buf).unwrap();
        let t2 = reopened.get_table(b"T").unwrap();
        assert_eq!(reopened.table_get_nested(t2, &[(0, 0), (0, 0)], 0, 0).unwrap(), 6661012);
    }
}

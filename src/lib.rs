//! An embedded, single-file columnar storage engine built around a
//! persistent, copy-on-write tree of positionally-addressable arrays.
//!
//! The core pieces, roughly bottom-up:
//!
//! - [`node`]: the universal packed-array record ([`node::Node`]) every
//!   higher structure is built from.
//! - [`alloc`]: the dual allocator handing out refs into either durable file
//!   extents or transient in-process slabs ([`alloc::SlabAllocator`]).
//! - [`writer`]: the commit algorithm — relocate a transaction's dirty spine
//!   into file space, then atomically swap the file's top ref.
//! - [`group`]: [`group::Group`], the named-table container and the single-
//!   process entry point.
//! - [`shared`]/[`lock_file`]: [`shared::SharedGroup`], coordinating readers
//!   and a single writer across processes via a companion lock file.
//!
//! Concrete column types, table schemas, and query/aggregation facilities
//! are deliberately out of scope here; see `SPEC_FULL.md` for the full
//! design rationale and `DESIGN.md` for how each module traces back to its
//! source material.

pub mod alloc;
pub mod error;
pub mod file_map;
pub mod group;
pub mod lock_file;
pub mod node;
pub mod shared;
pub mod writer;

pub use error::{Error, Result};
pub use group::{Group, OpenOptions, Stats, TableHandle};
pub use node::{Node, Ref};
pub use shared::{Interrupter, ReadTransaction, SharedGroup, WriteTransaction};

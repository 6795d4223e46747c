#![no_std]

//! Bit-packed variable-width integer array primitives.
//!
//! This crate holds the low-level codec for the single data structure the
//! storage engine in `strata-db` builds everything from: a header-prefixed,
//! variable-width packed vector of unsigned integers. It has no notion of
//! refs, allocators, or files — it only knows how to read and write integers
//! of a given bit width into a byte buffer.
//!
//! The width grows through a fixed ladder of bit widths; widening always
//! means re-encoding into a new buffer at the next width, never in place.

extern crate alloc;

mod packed;
mod header;

pub use header::{Header, Flags, HEADER_BYTES};
pub use packed::{
    Width, width_for_value, packed_byte_len, get, set, read_into, encode,
};

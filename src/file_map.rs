//! Maps a database file (or an anonymous region, for buffer-mode Groups)
//! into a logically contiguous address range.
//!
//! Grounded on the teacher's `StorageInner` (`src/storage.rs`) and the
//! `RawMemory` multi-map lookup in `src/lib.rs`: growing the backing file
//! does not necessarily relocate earlier bytes. On platforms where the OS
//! lets us extend a mapping in place (Linux `mremap` with `may_move(false)`)
//! we do so; otherwise we append a new, independently-mapped segment whose
//! virtual start picks up exactly where the last one left off. Either way,
//! a `FileMap` presents one contiguous `[0, len())` range to its caller and
//! hides the seam.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions, RemapOptions};

use crate::error::{Error, Result};

struct Segment {
    /// Virtual offset of this segment's first byte within the FileMap.
    start: usize,
    map: MmapMut,
}

/// A database file (or anonymous buffer) mapped into memory as one
/// contiguous, growable byte range.
pub struct FileMap {
    segments: Vec<Segment>,
    file: Option<File>,
}

impl FileMap {
    /// Open `path` for reading, and for writing unless `read_only`.
    ///
    /// On first write-open of a zero-length file, writes an 8-byte header of
    /// zeros (the "no top ref yet" marker) and extends the file to 16 bytes,
    /// per spec §4.1.
    pub fn open(path: &std::path::Path, read_only: bool) -> Result<Self> {
        let mut open_opts = std::fs::OpenOptions::new();
        open_opts.read(true).write(!read_only);
        if !read_only {
            open_opts.create(true);
        }
        let file = open_opts.open(path).map_err(Error::open_io)?;

        let len = file.metadata().map_err(Error::Open)?.len() as usize;
        let is_new = len == 0;
        if is_new && !read_only {
            file.set_len(16).map_err(|e| Error::ResizeFailed {
                size: 0,
                requested: 16,
                source: e,
            })?;
        } else if is_new && read_only {
            return Err(Error::NotFound);
        }

        let mapped_len = if is_new { 16 } else { len };
        let map = unsafe {
            MmapOptions::new()
                .len(mapped_len)
                .map_mut(&file)
                .map_err(|_| Error::OutOfSpace { requested: mapped_len })?
        };
        Ok(Self {
            segments: vec![Segment { start: 0, map }],
            file: Some(file),
        })
    }

    /// Create a purely in-memory map, seeded with `initial` bytes (used for
    /// buffer-mode Groups and anonymous databases). Growth still works, it
    /// just never touches a file.
    pub fn open_anon(initial: &[u8]) -> Result<Self> {
        let mut map = MmapMut::map_anon(initial.len().max(16))
            .map_err(|e| Error::OutOfSpace { requested: initial.len() })?;
        map[..initial.len()].copy_from_slice(initial);
        Ok(Self { segments: vec![Segment { start: 0, map }], file: None })
    }

    /// Total length of the logical address range currently mapped.
    pub fn len(&self) -> usize {
        self.segments.last().map(|s| s.start + s.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, offset: usize, len: usize) -> Result<(usize, usize)> {
        for (i, seg) in self.segments.iter().enumerate() {
            let end = seg.start + seg.map.len();
            if offset >= seg.start && offset < end {
                if offset + len > end {
                    return Err(Error::InvalidAccess { offset, len });
                }
                return Ok((i, offset - seg.start));
            }
        }
        Err(Error::InvalidAccess { offset, len })
    }

    /// Read a byte range.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let (i, local) = self.locate(offset, len)?;
        Ok(&self.segments[i].map[local..local + len])
    }

    /// Write (mutably borrow) a byte range.
    pub fn write(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let (i, local) = self.locate(offset, len)?;
        Ok(&mut self.segments[i].map[local..local + len])
    }

    /// Grow the mapped range by `additional` bytes, extending the backing
    /// file first if there is one. Returns the offset of the first newly
    /// available byte.
    ///
    /// No outstanding borrows from [`Self::read`]/[`Self::write`] may be live
    /// across this call — the borrow checker enforces this since it takes
    /// `&mut self`.
    pub fn grow(&mut self, additional: usize) -> Result<usize> {
        let old_len = self.len();
        if let Some(file) = &self.file {
            let new_len = old_len as u64 + additional as u64;
            file.set_len(new_len).map_err(|e| Error::ResizeFailed {
                size: old_len,
                requested: new_len as usize,
                source: e,
            })?;
        }

        // Try to grow the last segment in place (Linux only; memmap2 only
        // implements MmapMut::remap there).
        #[cfg(target_os = "linux")]
        {
            if let Some(last) = self.segments.last_mut() {
                let new_size = last.map.len() + additional;
                if last.map.remap(new_size, RemapOptions::new().may_move(false)).is_ok() {
                    return Ok(old_len);
                }
            }
        }

        let map = if let Some(file) = &self.file {
            unsafe {
                MmapOptions::new()
                    .offset(old_len as u64)
                    .len(additional)
                    .map_mut(file)
                    .map_err(|_| Error::OutOfSpace { requested: additional })?
            }
        } else {
            MmapMut::map_anon(additional).map_err(|_| Error::OutOfSpace { requested: additional })?
        };
        self.segments.push(Segment { start: old_len, map });
        Ok(old_len)
    }

    /// Flush every dirty segment to the backing file. A no-op for anonymous
    /// maps.
    pub fn flush(&self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        for seg in &self.segments {
            seg.map.flush().map_err(Error::Sync)?;
        }
        Ok(())
    }

    /// Flush a single byte range. Errors if the range crosses a segment
    /// boundary (callers should keep flush ranges within one Node or one
    /// root page, which they always are in this engine).
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let (i, local) = self.locate(offset, len)?;
        self.segments[i].map.flush_range(local, len).map_err(Error::Sync)
    }

    pub fn is_anon(&self) -> bool {
        self.file.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_grow_extends_len() {
        let mut fm = FileMap::open_anon(&[0u8; 16]).unwrap();
        assert_eq!(fm.len(), 16);
        let at = fm.grow(32).unwrap();
        assert_eq!(at, 16);
        assert_eq!(fm.len(), 48);
    }

    #[test]
    fn read_write_round_trip() {
        let mut fm = FileMap::open_anon(&[0u8; 16]).unwrap();
        fm.write(0, 8).unwrap().copy_from_slice(&42u64.to_le_bytes());
        assert_eq!(u64::from_le_bytes(fm.read(0, 8).unwrap().try_into().unwrap()), 42);
    }

    #[test]
    fn out_of_range_read_errors() {
        let fm = FileMap::open_anon(&[0u8; 16]).unwrap();
        assert!(matches!(fm.read(10, 100), Err(Error::InvalidAccess { .. })));
    }
}

use thiserror::Error;

/// Every failure mode the engine surfaces to callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A read-only open was requested but the file does not exist.
    #[error("database file not found")]
    NotFound,
    /// Opening the backing file failed.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file for exclusive (writer) or shared
    /// (reader) use.
    #[error("failed to lock the backing file")]
    Lock(#[source] std::io::Error),
    /// Synchronizing mapped pages to the backing file failed.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file to the requested length.
    #[error("can't resize the backing file. Have 0x{size:x} bytes, wanted 0x{requested:x} bytes")]
    ResizeFailed {
        size: usize,
        requested: usize,
        #[source]
        source: std::io::Error,
    },
    /// Couldn't grow the memory map any further.
    #[error("out of address space: tried to map 0x{requested:x} more bytes")]
    OutOfSpace { requested: usize },
    /// The file header, a root page, or a Node's shape violates the format
    /// invariants described in §3 of the spec.
    #[error("database file is corrupt: {0}")]
    Corrupt(&'static str),
    /// An operation was rejected because the current handle does not permit
    /// it: committing a buffer-mode Group, creating a duplicate table name,
    /// or a free/realloc call whose size does not match the original
    /// allocation.
    #[error("invalid operation: {0}")]
    Invalid(&'static str),
    /// Attempted to read or write outside of the mapped range.
    #[error("invalid access at offset 0x{offset:x} with length 0x{len:x}")]
    InvalidAccess { offset: usize, len: usize },
    /// A blocking writer operation was interrupted via
    /// `SharedGroup::interrupt_transact`. Only `rollback` is valid next,
    /// until `clear_interrupt` is called.
    #[error("transaction was interrupted")]
    Interrupted,
}

impl Error {
    /// Map a raw io error to `NotFound` when that's what it actually was,
    /// otherwise wrap it generically.
    pub(crate) fn open_io(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Open(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

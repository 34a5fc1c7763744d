//! Error kinds surfaced by the sparse-file engine.
//!
//! Every error that can abort a run is one of these variants; completion
//! handlers record the first one and the driver drains outstanding work
//! before returning it. Warnings (timestamp restore, final flush) are
//! logged, never returned.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SparseError>;

#[derive(Debug, thiserror::Error)]
pub enum SparseError {
    /// Misuse of the bitmap API or an invalid CLI/driver argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Destination for a copy already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Another process holds the file open.
    #[error("file is in use: {0}")]
    AlreadyInUse(String),

    #[error("out of memory")]
    OutOfMemory,

    /// Underlying read/write/ioctl failure, tagged with the byte offset at
    /// which it occurred (0 when the operation has no meaningful offset).
    #[error("io error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// A read or write moved fewer bytes than requested away from EOF.
    #[error("short transfer at offset {offset}")]
    ShortTransfer { offset: u64 },

    /// The filesystem refused cluster-size discovery, the sparse attribute,
    /// or a deallocate-range request.
    #[error("filesystem does not support sparse files")]
    UnsupportedFilesystem,
}

impl SparseError {
    /// Wrap an `io::Error` with the byte offset it occurred at.
    pub fn io_at(offset: u64, source: io::Error) -> Self {
        SparseError::Io { offset, source }
    }

    /// Map an open/create failure to its error kind, keeping the path for
    /// the message.
    pub fn from_open(path: &std::path::Path, err: io::Error) -> Self {
        let name = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => SparseError::NotFound(name),
            io::ErrorKind::PermissionDenied => SparseError::AccessDenied(name),
            io::ErrorKind::AlreadyExists => SparseError::AlreadyExists(name),
            _ => SparseError::Io {
                offset: 0,
                source: err,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn from_open_maps_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            SparseError::from_open(Path::new("/x"), err),
            SparseError::NotFound(_)
        ));
    }

    #[test]
    fn from_open_maps_permission_denied() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            SparseError::from_open(Path::new("/x"), err),
            SparseError::AccessDenied(_)
        ));
    }

    #[test]
    fn from_open_maps_already_exists() {
        let err = io::Error::new(io::ErrorKind::AlreadyExists, "there");
        assert!(matches!(
            SparseError::from_open(Path::new("/x"), err),
            SparseError::AlreadyExists(_)
        ));
    }

    #[test]
    fn io_at_keeps_offset() {
        let err = SparseError::io_at(4096, io::Error::other("boom"));
        match err {
            SparseError::Io { offset, .. } => assert_eq!(offset, 4096),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}

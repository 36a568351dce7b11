//! File-system error values.
//!
//! Argument and lookup failures are reported as `Err`; structural
//! inconsistencies (double free, reading a freed inode, lookup on a
//! non-directory) and resource exhaustion are panics, since callers have
//! no way to recover from either.

/// Errors surfaced to callers of the file-system API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("offset out of range")]
    InvalidOffset,
    #[error("file too large")]
    FileTooLarge,
    #[error("too many levels of symbolic links")]
    TooManyLinks,
    #[error("path too long")]
    PathTooLong,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("bad file-system image: {0}")]
    BadImage(&'static str),
}

//! NAR (Nix ARchive) format handling.
//!
//! The canonical archive byte stream encodes a directory tree as nested
//! nodes (`regular`, `symlink`, `directory`). This crate flattens that
//! nesting into a sequence of entries keyed by slash-joined paths, which is
//! the shape the expand/collapse transform and the delta pipeline work on:
//!
//! - [`NarReader`] pulls entries out of any [`AsyncRead`] without ever
//!   holding more than one file body at a time,
//! - [`NarWriter`] takes entries in archive traversal order and re-derives
//!   the nesting, byte-for-byte compatible with the canonical encoding.
//!
//! [`AsyncRead`]: tokio::io::AsyncRead

pub mod reader;
pub mod wire;
pub mod writer;

pub use reader::NarReader;
pub use writer::{BodySource, NarWriter};

use bytes::Bytes;
use thiserror::Error;

/// One flattened archive entry. `path` is empty for the root node and
/// slash-joined (no leading slash) below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarEntry {
    pub path: Vec<u8>,
    pub kind: NarEntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarEntryKind {
    Directory,
    Symlink { target: Bytes },
    Regular { executable: bool, size: u64 },
}

impl NarEntry {
    pub fn directory(path: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            kind: NarEntryKind::Directory,
        }
    }

    pub fn symlink(path: impl Into<Vec<u8>>, target: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            kind: NarEntryKind::Symlink {
                target: target.into(),
            },
        }
    }

    pub fn regular(path: impl Into<Vec<u8>>, executable: bool, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: NarEntryKind::Regular { executable, size },
        }
    }

    /// Size of the body that follows this entry (0 unless regular).
    pub fn body_size(&self) -> u64 {
        match self.kind {
            NarEntryKind::Regular { size, .. } => size,
            _ => 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum NarError {
    #[error("archive read/write error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a nix archive (bad magic)")]
    BadMagic,

    #[error("unexpected token {got:?}, expected {expected:?}")]
    UnexpectedToken { expected: String, got: String },

    #[error("string of {len} bytes exceeds limit {limit}")]
    StringTooLong { len: u64, limit: u64 },

    #[error("non-zero padding byte")]
    BadPadding,

    #[error("archive truncated")]
    UnexpectedEof,

    #[error("trailing data after root node")]
    TrailingData,

    #[error("entry {path:?} is not ordered after its predecessor")]
    OutOfOrder { path: String },

    #[error("entry {path:?} does not belong under the open directory")]
    BadNesting { path: String },

    #[error("body for {path:?}: expected {expected} bytes, got {got}")]
    BodySize { path: String, expected: u64, got: u64 },
}

pub type Result<T> = std::result::Result<T, NarError>;

pub(crate) fn display_path(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

/// Parent directory of a flattened path: `"a/b/c"` → `"a/b"`, `"a"` → `""`.
pub(crate) fn parent_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[..i],
        None => b"",
    }
}

/// Final component of a flattened path.
pub(crate) fn base_name(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

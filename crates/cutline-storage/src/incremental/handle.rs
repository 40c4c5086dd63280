//! State handles and registry keys.
//!
//! A [`StreamStateHandle`] points at one immutable blob of checkpointed
//! state. Handles are value-like: two handles are equal when they describe
//! the same physical state. Once registered they are never mutated, only
//! replaced by the handle the registry hands back.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of one logical piece of shared state, stable across the
/// snapshots that reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedStateRegistryKey(String);

impl SharedStateRegistryKey {
    /// Create a key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SharedStateRegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SharedStateRegistryKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for SharedStateRegistryKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Inclusive range of key groups owned by a keyed state backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    /// First key group.
    pub start: u32,
    /// Last key group, inclusive.
    pub end: u32,
}

impl KeyGroupRange {
    /// Create a range; `end < start` yields an empty range.
    #[must_use]
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Whether `key_group` falls into the range.
    #[must_use]
    pub fn contains(&self, key_group: u32) -> bool {
        (self.start..=self.end).contains(&key_group)
    }

    /// Number of key groups in the range.
    #[must_use]
    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Whether the range holds no key groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State stored in a file on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileStateHandle {
    path: PathBuf,
    size: u64,
}

impl FileStateHandle {
    /// Create a handle for `size` bytes stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Location of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. A file that is already gone counts as discarded.
    ///
    /// # Errors
    ///
    /// Returns any other I/O error from the filesystem.
    pub fn discard(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "state file already discarded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Small state kept inline in memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteStreamStateHandle {
    name: String,
    data: Bytes,
}

impl ByteStreamStateHandle {
    /// Create an in-memory handle.
    #[must_use]
    pub fn new(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Handle name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The state bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Stand-in for shared state that an earlier checkpoint already uploaded.
///
/// Carries no physical state, so it is never discarded. The registry swaps
/// it for the real handle on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlaceholderStreamStateHandle;

/// Handle to one blob of checkpointed state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamStateHandle {
    /// File-backed state.
    File(FileStateHandle),
    /// In-memory state.
    Memory(ByteStreamStateHandle),
    /// Dedup marker without backing.
    Placeholder(PlaceholderStreamStateHandle),
}

impl StreamStateHandle {
    /// Shorthand for a file handle.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, size: u64) -> Self {
        Self::File(FileStateHandle::new(path, size))
    }

    /// Shorthand for an in-memory handle.
    #[must_use]
    pub fn memory(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory(ByteStreamStateHandle::new(name, data.into()))
    }

    /// Shorthand for a placeholder.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::Placeholder(PlaceholderStreamStateHandle)
    }

    /// Whether this is a placeholder.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    /// Size of the referenced state in bytes. Placeholders report 0.
    #[must_use]
    pub fn state_size(&self) -> u64 {
        match self {
            Self::File(f) => f.size,
            Self::Memory(m) => m.data.len() as u64,
            Self::Placeholder(_) => 0,
        }
    }

    /// Release the physical state behind the handle.
    ///
    /// In-memory state and placeholders have nothing to release.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if deleting a state file fails.
    pub fn discard(&self) -> io::Result<()> {
        match self {
            Self::File(f) => f.discard(),
            Self::Memory(_) | Self::Placeholder(_) => Ok(()),
        }
    }
}

impl fmt::Display for StreamStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(h) => write!(f, "file:{} ({} bytes)", h.path.display(), h.size),
            Self::Memory(h) => write!(f, "memory:{} ({} bytes)", h.name, h.data.len()),
            Self::Placeholder(_) => f.write_str("placeholder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_equality_is_by_value() {
        let a = StreamStateHandle::memory("sst-1", Bytes::from_static(b"abc"));
        let b = StreamStateHandle::memory("sst-1", Bytes::from_static(b"abc"));
        let c = StreamStateHandle::memory("sst-1", Bytes::from_static(b"abd"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, StreamStateHandle::placeholder());
    }

    #[test]
    fn test_state_size() {
        assert_eq!(StreamStateHandle::file("/tmp/x", 42).state_size(), 42);
        assert_eq!(StreamStateHandle::memory("m", vec![0u8; 5]).state_size(), 5);
        assert_eq!(StreamStateHandle::placeholder().state_size(), 0);
        assert!(StreamStateHandle::placeholder().is_placeholder());
    }

    #[test]
    fn test_file_discard_removes_file_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000042.sst");
        std::fs::write(&path, b"state").unwrap();

        let handle = StreamStateHandle::file(&path, 5);
        handle.discard().unwrap();
        assert!(!path.exists());
        handle.discard().unwrap();
    }

    #[test]
    fn test_file_discard_reports_other_errors() {
        let dir = tempfile::tempdir().unwrap();
        let handle = StreamStateHandle::file(dir.path(), 0);
        assert!(handle.discard().is_err());
    }

    #[test]
    fn test_key_group_range() {
        let range = KeyGroupRange::new(4, 7);
        assert_eq!(range.len(), 4);
        assert!(range.contains(4) && range.contains(7));
        assert!(!range.contains(8));
        assert!(KeyGroupRange::new(3, 2).is_empty());
    }

    #[test]
    fn test_key_display_and_conversions() {
        let key = SharedStateRegistryKey::from("backend-000001.sst");
        assert_eq!(key.to_string(), "backend-000001.sst");
        assert_eq!(key, SharedStateRegistryKey::new(String::from("backend-000001.sst")));
        assert_eq!(key.as_str(), "backend-000001.sst");
    }
}

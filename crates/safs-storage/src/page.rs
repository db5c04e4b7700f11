//! Core page types for the storage subsystem.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Identifier of a logical file, unique within one data root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// A fixed-size logical block of a logical file. The unit of caching and I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Owning logical file.
    pub file: FileId,
    /// Page index inside the file (0-based).
    pub index: u64,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(file: FileId, index: u64) -> Self {
        Self { file, index }
    }

    /// Returns the logical byte offset of this page for the given page size.
    pub fn byte_offset(&self, page_size: u64) -> u64 {
        self.index * page_size
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({}, {})", self.file.0, self.index)
    }
}

/// Direction of a device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDirection {
    /// Device to memory.
    Read,
    /// Memory to device.
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

impl ByteRange {
    /// Creates a range from an offset and a length.
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            start: offset,
            end: offset + len,
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true for a zero-length range.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns true when the two ranges share at least one byte.
    #[inline]
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true when the two ranges overlap or touch end to start.
    #[inline]
    pub fn touches(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &ByteRange) -> ByteRange {
        ByteRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Splits a logical byte range into the pages it touches.
///
/// Yields `(page_index, offset_in_page, len)` for each page.
pub fn page_spans(offset: u64, len: u64, page_size: u64) -> impl Iterator<Item = (u64, usize, usize)> {
    let end = offset + len;
    let first = offset / page_size;
    let last = if len == 0 { first } else { (end - 1) / page_size + 1 };
    (first..last).map(move |index| {
        let page_start = index * page_size;
        let from = offset.max(page_start);
        let to = end.min(page_start + page_size);
        (index, (from - page_start) as usize, (to - from) as usize)
    })
}

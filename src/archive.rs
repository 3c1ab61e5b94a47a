//! Random-access reads over a large immutable archive file.
//!
//! The archive is mapped read-only once per reader. Readers are cheap to open and are
//! meant to live for a single request: open, read, close.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

use crate::Error;

/// Byte-range access to an opened archive.
pub trait RangeRead {
    /// Size of the archive in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns at most `length` bytes starting at `offset`.
    ///
    /// Fails with [`Error::InvalidOffset`] when `offset` is at or past the end of the
    /// archive. A range running past the end is clamped, so fewer bytes than requested
    /// may come back.
    fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, Error>;

    /// Returns the whole archive.
    fn read_all(&self) -> Result<Bytes, Error>;

    /// Releases the underlying resources. Calling it more than once is a no-op.
    fn close(&mut self);
}

/// Opens readers for archive paths.
pub trait ArchiveOpener: Send + Sync {
    type Reader: RangeRead;

    fn open(&self, path: &Path) -> Result<Self::Reader, Error>;
}

/// Opens [`ArchiveRangeReader`]s backed by a memory map.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapOpener;

impl ArchiveOpener for MmapOpener {
    type Reader = ArchiveRangeReader;

    fn open(&self, path: &Path) -> Result<ArchiveRangeReader, Error> {
        ArchiveRangeReader::open(path)
    }
}

/// A read-only memory-mapped view of an archive file.
///
/// The mapping and the file handle are released by [`RangeRead::close`] or, failing
/// that, when the reader is dropped.
#[derive(Debug)]
pub struct ArchiveRangeReader {
    path: PathBuf,
    file: Option<File>,
    // Empty files cannot be mapped, so they keep no map at all.
    map: Option<Mmap>,
    len: u64,
}

impl ArchiveRangeReader {
    pub fn open(path: impl AsRef<Path>) -> Result<ArchiveRangeReader, Error> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(source) => return Err(Error::Archive { path, source }),
        };
        let len = match file.metadata() {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => {
                return Err(Error::Archive {
                    path,
                    source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
                })
            }
            Err(source) => return Err(Error::Archive { path, source }),
        };

        let map = if len == 0 {
            None
        } else {
            // SAFETY: archives are immutable once published and are replaced
            // wholesale rather than rewritten in place.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => Some(map),
                Err(source) => return Err(Error::Archive { path, source }),
            }
        };

        Ok(ArchiveRangeReader {
            path,
            file: Some(file),
            map,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn bytes(&self) -> Result<&[u8], Error> {
        if self.is_closed() {
            return Err(Error::Archive {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::Other, "archive reader is closed"),
            });
        }
        Ok(self.map.as_deref().unwrap_or(&[]))
    }
}

impl RangeRead for ArchiveRangeReader {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, Error> {
        let data = self.bytes()?;
        if offset >= self.len {
            return Err(Error::InvalidOffset {
                offset,
                size: self.len,
            });
        }

        let length = length.min(self.len - offset);
        // Both bounds are within the mapping, which fits in the address space.
        let start = offset as usize;
        let end = start + length as usize;
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    fn read_all(&self) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(self.bytes()?))
    }

    fn close(&mut self) {
        // Unmap before the descriptor goes away.
        self.map.take();
        self.file.take();
    }
}

impl Drop for ArchiveRangeReader {
    fn drop(&mut self) {
        self.close();
    }
}

use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::QueueResult;
use crate::fs::open_or_create_file;

/// One fixed-size file mapped shared, readable and writable.
///
/// An arena is a dumb byte substrate: it knows how to move fixed-width
/// integers and byte ranges at offsets and how to push dirty pages to disk.
/// It keeps no dirty bookkeeping of its own; that lives in the arena manager.
/// The backing file descriptor is closed as soon as the mapping exists, and
/// the mapping is released when the arena is dropped.
pub(crate) struct Arena {
    map: MmapMut,
    path: PathBuf,
}

impl Arena {
    /// Maps the file at `path`, creating it at `size` bytes when missing and
    /// growing it when smaller. A file already larger than `size` is mapped
    /// at its actual length (the metadata file grows past its initial size).
    pub(crate) fn open(path: &Path, size: u64) -> QueueResult<Self> {
        let file = open_or_create_file(path, size)?;
        // SAFETY: the mapping is shared and file-backed; all access goes
        // through the queue's exclusive lock, and no other process maps the
        // queue directory (single-process access is part of the contract).
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.map.len() as u64
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a little-endian u64. `offset + 8` must lie within the mapping.
    #[inline]
    pub(crate) fn read_u64_at(&self, offset: u64) -> u64 {
        let start = offset as usize;
        let bytes: [u8; 8] = self.map[start..start + 8]
            .try_into()
            .expect("eight bytes within the mapping");
        u64::from_le_bytes(bytes)
    }

    /// Writes a little-endian u64. `offset + 8` must lie within the mapping.
    #[inline]
    pub(crate) fn write_u64_at(&mut self, offset: u64, value: u64) {
        let start = offset as usize;
        self.map[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Copies as many bytes as fit between `offset` and the end of the
    /// mapping into `buf`, returning how many were moved.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let start = (offset as usize).min(self.map.len());
        let n = buf.len().min(self.map.len() - start);
        buf[..n].copy_from_slice(&self.map[start..start + n]);
        n
    }

    /// Copies as many bytes of `buf` as fit between `offset` and the end of
    /// the mapping, returning how many were moved.
    pub(crate) fn write_at(&mut self, buf: &[u8], offset: u64) -> usize {
        let start = (offset as usize).min(self.map.len());
        let n = buf.len().min(self.map.len() - start);
        self.map[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    /// Synchronously pushes dirty pages to disk.
    pub(crate) fn flush(&self) -> QueueResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::ArenaId;

/// Name of the metadata file inside a queue directory.
pub(crate) const METADATA_FILE_NAME: &str = "metadata.dat";

/// Permissions for files created by the queue.
#[cfg(unix)]
const FILE_MODE: u32 = 0o744;

/// Path of the backing file for the given arena.
pub(crate) fn arena_file_path(dir: &Path, aid: ArenaId) -> PathBuf {
    dir.join(format!("arena_{}.dat", aid.as_u64()))
}

/// Opens `path` read-write, creating it when missing, and grows it to at
/// least `size` bytes. Files larger than `size` keep their length; only the
/// metadata file ever grows past its initial size.
pub(crate) fn open_or_create_file(path: &Path, size: u64) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    let file = options.open(path)?;
    if file.metadata()?.len() < size {
        file.set_len(size)?;
    }
    Ok(file)
}

/// OS page size in bytes.
pub(crate) fn os_page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 { 4096 } else { raw as u64 }
}

//! Reading a single fork of a file into a borrowable, immutable byte block.
//!
//! A fork is described by a `(file, offset, size)` triple ([`ForkRef`]).
//! Large forks are served from a read-only, page-aligned memory mapping;
//! small forks (and mappings that fail to establish, e.g. on filesystems
//! that don't support `mmap`) are read onto the heap instead. Either way the
//! caller only ever sees a `&[u8]`; which strategy was used is an
//! implementation detail of [`ByteBlock`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use log::{debug, trace};

use crate::error::{Error, Result};

/// Forks at or above this size are served from a memory mapping; smaller
/// ones are read onto the heap. Mirrors the 16 KiB threshold used by the
/// original C implementation, chosen because the mapping and page-fault
/// overhead isn't worth it for small forks.
const MMAP_MINIMUM: u64 = 16 * 1024;

/// A reference to one fork of a file: `(file, offset, size)`.
///
/// `size == 0` is the spec's "fork absent" sentinel. `file` is `None` when
/// there is no underlying file at all (forks synthesized purely in memory,
/// e.g. by [`crate::resource::ResourceFork::from_bytes`]).
#[derive(Clone)]
pub struct ForkRef {
    file: Option<Arc<std::fs::File>>,
    offset: u64,
    size: u64,
}

impl fmt::Debug for ForkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkRef")
            .field("file", &self.file.is_some())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl ForkRef {
    /// A fork that does not exist.
    pub fn absent() -> ForkRef {
        ForkRef {
            file: None,
            offset: 0,
            size: 0,
        }
    }

    /// A fork backed by a region of an open file.
    pub fn new(file: Arc<std::fs::File>, offset: u64, size: u64) -> ForkRef {
        ForkRef {
            file: Some(file),
            offset,
            size,
        }
    }

    /// Whether this fork is present (non-zero size).
    pub fn is_present(&self) -> bool {
        self.size > 0
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// An immutable, borrowable sequence of bytes with a release action.
///
/// Two variants, invisible to consumers: an owned heap buffer, or a
/// borrowed view into a memory mapping that is kept alive for as long as
/// the `ByteBlock` is. In both cases `Deref<Target = [u8]>` is the only
/// thing callers need.
pub enum ByteBlock {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<memmap2::Mmap>,
        start: usize,
        len: usize,
    },
}

impl ByteBlock {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ByteBlock::Owned(v) => v.as_slice(),
            ByteBlock::Mapped { map, start, len } => &map[*start..*start + *len],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for ByteBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ByteBlock {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Reads an entire fork into memory, choosing mmap vs. a heap copy based on
/// size.
pub fn read_fork(fork: &ForkRef) -> Result<ByteBlock> {
    if fork.size == 0 {
        return Ok(ByteBlock::Owned(Vec::new()));
    }
    let file = fork.file.as_deref().ok_or(Error::Invalid)?;
    let size = usize::try_from(fork.size).map_err(|_| Error::TooLarge)?;

    if fork.size >= MMAP_MINIMUM {
        trace!("reading {size} byte fork at offset {} via mmap", fork.offset);
        if let Some(block) = try_mmap(file, fork.offset, size) {
            return Ok(block);
        }
        // Fall through to the heap path on mapping failure (e.g. the
        // underlying filesystem doesn't support mmap).
        debug!("mmap failed for {size} byte fork at offset {}, falling back to a heap read", fork.offset);
    } else {
        trace!("reading {size} byte fork at offset {} onto the heap", fork.offset);
    }

    read_heap(file, fork.offset, size)
}

#[cfg(unix)]
fn try_mmap(file: &std::fs::File, offset: u64, size: usize) -> Option<ByteBlock> {
    let page_size = page_size();
    let aligned_offset = offset - (offset % page_size);
    let delta = (offset - aligned_offset) as usize;
    let map_len = delta + size;

    let map = unsafe {
        memmap2::MmapOptions::new()
            .offset(aligned_offset)
            .len(map_len)
            .map(file)
            .ok()?
    };
    Some(ByteBlock::Mapped {
        map: Arc::new(map),
        start: delta,
        len: size,
    })
}

#[cfg(not(unix))]
fn try_mmap(_file: &std::fs::File, _offset: u64, _size: usize) -> Option<ByteBlock> {
    None
}

#[cfg(unix)]
fn page_size() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(v)) if v > 0 => v as u64,
        _ => 4096,
    }
}

#[cfg(unix)]
fn read_heap(file: &std::fs::File, offset: u64, size: usize) -> Result<ByteBlock> {
    let mut buf = vec![0u8; size];
    let mut pos = 0usize;
    while pos < size {
        // `File::read_at` retries internally on `EINTR`; a zero-length read
        // before the buffer is full means the fork was truncated on disk.
        let n = file.read_at(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(Error::Invalid);
        }
        pos += n;
    }
    Ok(ByteBlock::Owned(buf))
}

#[cfg(not(unix))]
fn read_heap(file: &std::fs::File, offset: u64, size: usize) -> Result<ByteBlock> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size];
    let mut pos = 0usize;
    while pos < size {
        let n = file.read(&mut buf[pos..])?;
        if n == 0 {
            return Err(Error::Invalid);
        }
        pos += n;
    }
    Ok(ByteBlock::Owned(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> (tempfile_shim::NamedTempFile, Arc<std::fs::File>) {
        let mut tmp = tempfile_shim::NamedTempFile::new();
        tmp.file.write_all(bytes).unwrap();
        let file = Arc::new(std::fs::File::open(tmp.path()).unwrap());
        (tmp, file)
    }

    // A tiny ad-hoc stand-in for the `tempfile` crate so the fork reader's
    // tests don't need a new dev-dependency just to create a scratch file.
    mod tempfile_shim {
        use std::fs::File;
        use std::path::{Path, PathBuf};

        pub struct NamedTempFile {
            pub file: File,
            path: PathBuf,
        }

        impl NamedTempFile {
            pub fn new() -> NamedTempFile {
                use std::sync::atomic::{AtomicUsize, Ordering};
                static COUNTER: AtomicUsize = AtomicUsize::new(0);
                let mut path = std::env::temp_dir();
                let unique = format!(
                    "unrez-test-{}-{}",
                    std::process::id(),
                    COUNTER.fetch_add(1, Ordering::Relaxed)
                );
                path.push(unique);
                let file = File::create(&path).unwrap();
                NamedTempFile { file, path }
            }

            pub fn path(&self) -> &Path {
                &self.path
            }
        }

        impl Drop for NamedTempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn absent_fork_is_empty() {
        let block = read_fork(&ForkRef::absent()).unwrap();
        assert!(block.is_empty());
    }

    #[test]
    fn heap_path_reads_small_fork() {
        let data: Vec<u8> = (0..200u32).map(|n| n as u8).collect();
        let (_tmp, file) = write_temp(&data);
        let fork = ForkRef::new(file, 10, 50);
        let block = read_fork(&fork).unwrap();
        assert_eq!(&*block, &data[10..60]);
    }

    #[test]
    fn mmap_path_reads_large_fork() {
        let data: Vec<u8> = (0..(64 * 1024)).map(|n| (n % 256) as u8).collect();
        let (_tmp, file) = write_temp(&data);
        let fork = ForkRef::new(file, 4096 + 7, 20_000);
        let block = read_fork(&fork).unwrap();
        assert_eq!(&*block, &data[4096 + 7..4096 + 7 + 20_000]);
    }
}

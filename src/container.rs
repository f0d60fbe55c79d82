//! Container detection and fork extraction.
//!
//! A classic Mac file's data fork and resource fork can show up on a modern
//! filesystem in one of four shapes: MacBinary (forks + metadata joined
//! into one stream), AppleDouble (metadata + resource fork in a hidden
//! `._name` side file, data fork is the plain file), AppleSingle (both
//! forks in one stream, like MacBinary but extensible and rare), or native
//! OS-level forks exposed through a pseudo-path. [`open`] and [`open_at`]
//! run the detection in the order the original library used, chosen to
//! preserve user intent: the more deliberate a way of attaching a resource
//! fork is, the earlier it is tried.
//!
//! All filesystem access goes through a directory handle and a relative
//! name (an "openat" discipline) so that a path that is resolved once by
//! the caller cannot be raced out from under this code by a rename.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use log::{debug, trace};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, Mode, SFlag};

use crate::error::{Error, Result};
use crate::fork::ForkRef;
use crate::FourCC;

const APPLEDOUBLE_PREFIX: &[u8] = b"._";
const MACBINARY_SUFFIX: &[u8] = b".bin";
const NATIVE_FORK_PATHS: [&str; 2] = ["..namedfork/rsrc", "rsrc"];

/// Which on-disk encoding a [`ForkedFile`] was recovered from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContainerKind {
    /// Forks live at native filesystem paths (or there is no resource fork).
    Native,
    MacBinary,
    AppleDouble,
    AppleSingle,
}

/// Parsed Finder metadata, plus the discovered fork locations.
///
/// Every field is optional in spirit: absence is represented by empty
/// names/comments and zero-size fork ranges, per the spec's data model.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub filename: Vec<u8>,
    pub filename_script: u8,
    pub comment: Vec<u8>,
    pub file_type: FourCC,
    pub file_creator: FourCC,
    pub finder_flags: u16,
    pub vpos: i16,
    pub hpos: i16,
    pub window_id: i16,
    pub protected: bool,
    pub modified: u32,
}

impl Default for FourCC {
    fn default() -> Self {
        FourCC(0)
    }
}

/// A file's data fork and resource fork (if present), plus metadata and
/// which container encoding they were found in.
pub struct ForkedFile {
    pub data: ForkRef,
    pub rsrc: ForkRef,
    pub metadata: Metadata,
    pub kind: ContainerKind,
}

impl ForkedFile {
    /// Reads the data fork into memory. Empty if the data fork is absent.
    pub fn read_data_fork(&self) -> Result<crate::fork::ByteBlock> {
        crate::fork::read_fork(&self.data)
    }

    /// Reads the resource fork into memory, for the caller to hand to
    /// [`crate::resource::ResourceFork::new`]. Returns `Error::NoResourceFork`
    /// if this file has none.
    pub fn read_resource_fork(&self) -> Result<crate::fork::ByteBlock> {
        if !self.rsrc.is_present() {
            return Err(Error::NoResourceFork);
        }
        if self.rsrc.size() > 32 * 1024 * 1024 {
            return Err(Error::ResourceForkTooLarge);
        }
        crate::fork::read_fork(&self.rsrc)
    }
}

/// Opens both forks of the file at `path`, using the directory detection
/// heuristics described in the module docs.
pub fn open(path: &Path) -> Result<ForkedFile> {
    let (dir, name) = split_parent(path)?;
    open_at(&dir, name.as_os_str())
}

/// An open directory, used to perform `openat`-relative lookups.
pub struct Dir {
    file: std::fs::File,
}

impl Dir {
    pub fn open(path: &Path) -> Result<Dir> {
        let fd = fcntl::open(
            path,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .map_err(nix_err)?;
        Ok(Dir {
            file: unsafe { std::fs::File::from_raw_fd(fd) },
        })
    }

    pub fn cwd() -> Result<Dir> {
        Dir::open(Path::new("."))
    }

    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn split_parent(path: &Path) -> Result<(Dir, std::ffi::OsString)> {
    let name = path
        .file_name()
        .ok_or(Error::Invalid)?
        .to_os_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => Dir::open(p)?,
        _ => Dir::cwd()?,
    };
    Ok((dir, name))
}

fn nix_err(err: nix::Error) -> Error {
    match err.as_errno() {
        Some(errno) => Error::Io(io::Error::from_raw_os_error(errno as i32)),
        None => Error::Io(io::Error::new(io::ErrorKind::Other, "unknown OS error")),
    }
}

/// Opens a regular file relative to `dirfd`, returning `None` if it simply
/// doesn't exist (callers use this to probe candidate side-files). Any
/// other OS error, or the entry existing but not being a regular file, is
/// reported.
fn open_relative(dirfd: RawFd, name: &OsStr) -> Result<Option<std::fs::File>> {
    let fd = match fcntl::openat(dirfd, name, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
        Ok(fd) => fd,
        Err(err) => {
            return if err.as_errno() == Some(nix::errno::Errno::ENOENT) {
                Ok(None)
            } else {
                Err(nix_err(err))
            };
        }
    };
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    let st = stat::fstat(fd).map_err(nix_err)?;
    if (st.st_mode & SFlag::S_IFMT.bits() as u32) != SFlag::S_IFREG.bits() as u32 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            if (st.st_mode & SFlag::S_IFMT.bits() as u32) == SFlag::S_IFDIR.bits() as u32 {
                "is a directory"
            } else {
                "not a regular file"
            },
        )));
    }
    Ok(Some(file))
}

fn file_size(file: &std::fs::File) -> Result<u64> {
    Ok(file.metadata()?.len())
}

fn join(name: &OsStr, suffix: &str) -> std::ffi::OsString {
    let mut out = name.to_os_string();
    out.push(suffix);
    out
}

fn strip_appledouble_prefix(name: &OsStr) -> Option<std::ffi::OsString> {
    let bytes = name.as_bytes();
    bytes
        .strip_prefix(APPLEDOUBLE_PREFIX)
        .map(|rest| OsStr::from_bytes(rest).to_os_string())
}

fn with_appledouble_prefix(name: &OsStr) -> std::ffi::OsString {
    let mut bytes = APPLEDOUBLE_PREFIX.to_vec();
    bytes.extend_from_slice(name.as_bytes());
    std::ffi::OsString::from(OsStr::from_bytes(&bytes))
}

/// Opens both forks of `name`, relative to `dir`.
///
/// See the module documentation for the detection order.
pub fn open_at(dir: &Dir, name: &OsStr) -> Result<ForkedFile> {
    let dirfd = dir.as_raw_fd();
    let main: Option<Arc<std::fs::File>> = open_relative(dirfd, name)?.map(Arc::new);
    let main_size = match &main {
        Some(f) => Some(file_size(f)?),
        None => None,
    };

    if let (Some(main_file), Some(main_size)) = (&main, main_size) {
        // 1. `._name` that is itself AppleSingle/AppleDouble.
        if strip_appledouble_prefix(name).is_some() {
            match parse_applefile(main_file, main_size as i64) {
                Ok((kind, mdata)) => {
                    debug!("{name:?}: detected as {kind:?} (via `._name` prefix)");
                    return finish_applefile(dir, name, main_file.clone(), kind, mdata);
                }
                Err(Error::Format) => trace!("{name:?}: not AppleSingle/AppleDouble, trying next candidate"),
                Err(e) => return Err(e),
            }
        }

        // 2. `.bin` that parses as MacBinary.
        if name.as_bytes().ends_with(MACBINARY_SUFFIX) {
            match parse_macbinary(main_file, main_size as i64) {
                Ok(mdata) => {
                    debug!("{name:?}: detected as MacBinary");
                    return Ok(ForkedFile {
                        data: ForkRef::new(main_file.clone(), mdata.data_offset as u64, mdata.data_size as u64),
                        rsrc: ForkRef::new(main_file.clone(), mdata.rsrc_offset as u64, mdata.rsrc_size as u64),
                        metadata: mdata.metadata,
                        kind: ContainerKind::MacBinary,
                    });
                }
                Err(Error::Format) => trace!("{name:?}: `.bin` extension but not MacBinary, trying next candidate"),
                Err(e) => return Err(e),
            }
        }

        // 3. The file itself is AppleDouble or AppleSingle.
        match parse_applefile(main_file, main_size as i64) {
            Ok((kind, mdata)) => {
                debug!("{name:?}: detected as {kind:?}");
                let data = if kind == ContainerKind::AppleSingle {
                    ForkRef::new(main_file.clone(), mdata.data_offset as u64, mdata.data_size as u64)
                } else {
                    ForkRef::absent()
                };
                return Ok(ForkedFile {
                    data,
                    rsrc: ForkRef::new(main_file.clone(), mdata.rsrc_offset as u64, mdata.rsrc_size as u64),
                    metadata: mdata.metadata,
                    kind,
                });
            }
            Err(Error::Format) => trace!("{name:?}: not AppleSingle/AppleDouble, trying next candidate"),
            Err(e) => return Err(e),
        }
    }

    // 4. A companion `._name` file.
    let companion_name = with_appledouble_prefix(name);
    if let Some(companion) = open_relative(dirfd, &companion_name)? {
        let size = file_size(&companion)? as i64;
        match parse_applefile(&companion, size) {
            Ok((_kind, mdata)) => {
                debug!("{name:?}: paired with AppleDouble companion {companion_name:?}");
                let companion = Arc::new(companion);
                let data = match (&main, main_size) {
                    (Some(main_file), Some(size)) => ForkRef::new(main_file.clone(), 0, size),
                    _ => ForkRef::absent(),
                };
                return Ok(ForkedFile {
                    data,
                    rsrc: ForkRef::new(companion, mdata.rsrc_offset as u64, mdata.rsrc_size as u64),
                    metadata: mdata.metadata,
                    kind: ContainerKind::AppleDouble,
                });
            }
            Err(Error::Format) => trace!("{companion_name:?}: exists but isn't AppleDouble, trying next candidate"),
            Err(e) => return Err(e),
        }
    }

    // 5. Native side-stream pseudo-paths.
    for suffix in NATIVE_FORK_PATHS {
        let candidate = join(name, &format!("/{suffix}"));
        if let Some(rsrc_file) = open_relative(dirfd, &candidate)? {
            debug!("{name:?}: paired with native fork path {candidate:?}");
            let rsrc_size = file_size(&rsrc_file)?;
            let data = match (&main, main_size) {
                (Some(main_file), Some(size)) => ForkRef::new(main_file.clone(), 0, size),
                _ => ForkRef::absent(),
            };
            return Ok(ForkedFile {
                data,
                rsrc: ForkRef::new(Arc::new(rsrc_file), 0, rsrc_size),
                metadata: Metadata::default(),
                kind: ContainerKind::Native,
            });
        }
    }

    // 6. No resource fork: just the main file as the data fork.
    match (main, main_size) {
        (Some(main_file), Some(size)) => {
            trace!("{name:?}: no resource fork found, data fork only");
            Ok(ForkedFile {
                data: ForkRef::new(main_file, 0, size),
                rsrc: ForkRef::absent(),
                metadata: Metadata::default(),
                kind: ContainerKind::Native,
            })
        }
        _ => Err(Error::Io(io::Error::from(io::ErrorKind::NotFound))),
    }
}

fn finish_applefile(
    _dir: &Dir,
    name: &OsStr,
    main: Arc<std::fs::File>,
    kind: ContainerKind,
    mdata: AppleFileMeta,
) -> Result<ForkedFile> {
    if kind == ContainerKind::AppleSingle {
        return Ok(ForkedFile {
            data: ForkRef::new(main.clone(), mdata.data_offset as u64, mdata.data_size as u64),
            rsrc: ForkRef::new(main, mdata.rsrc_offset as u64, mdata.rsrc_size as u64),
            metadata: mdata.metadata,
            kind,
        });
    }
    // AppleDouble: the companion data fork is the file with the `._` prefix
    // stripped, opened relative to the same directory.
    let original = strip_appledouble_prefix(name).ok_or(Error::Invalid)?;
    let data = match open_relative(_dir.as_raw_fd(), &original)? {
        Some(f) => {
            let size = file_size(&f)?;
            ForkRef::new(Arc::new(f), 0, size)
        }
        None => ForkRef::absent(),
    };
    Ok(ForkedFile {
        data,
        rsrc: ForkRef::new(main, mdata.rsrc_offset as u64, mdata.rsrc_size as u64),
        metadata: mdata.metadata,
        kind,
    })
}

// ---------------------------------------------------------------------
// MacBinary
// ---------------------------------------------------------------------

struct MacBinaryMeta {
    data_offset: i64,
    data_size: i64,
    rsrc_offset: i64,
    rsrc_size: i64,
    metadata: Metadata,
}

fn crc16_xmodem(data: &[u8]) -> u16 {
    let crc: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);
    crc.checksum(data)
}

/// Parses a MacBinary header (I/II/III) from the start of `file`.
///
/// Returns `Error::Format` if the magic bytes/CRC don't match -- the
/// caller is expected to fall through to the next candidate encoding.
fn parse_macbinary(file: &std::fs::File, fsize: i64) -> Result<MacBinaryMeta> {
    let mut header = [0u8; 128];
    read_exact_at(file, &mut header, 0)?;

    if header[0] != 0 || header[74] != 0 || header[82] != 0 || header[1] > 63 || header[123] > 129
    {
        return Err(Error::Format);
    }
    let file_crc = u16::from_be_bytes([header[124], header[125]]);
    if crc16_xmodem(&header[..124]) != file_crc {
        return Err(Error::Format);
    }

    let data_size = u32::from_be_bytes(header[83..87].try_into().unwrap()) as i64;
    let rsrc_size = u32::from_be_bytes(header[87..91].try_into().unwrap()) as i64;
    let data_offset = 128i64;
    let rsrc_offset = align128(data_offset + data_size);

    if data_size > fsize - data_offset || rsrc_offset > fsize || rsrc_size > fsize - rsrc_offset {
        return Err(Error::Invalid);
    }

    let filename_len = usize::from(header[1]);
    let filename = header[2..2 + filename_len].to_vec();
    let file_type = FourCC(u32::from_be_bytes(header[65..69].try_into().unwrap()));
    let file_creator = FourCC(u32::from_be_bytes(header[69..73].try_into().unwrap()));
    let finder_flags = u16::from(header[73]) << 8 | u16::from(header[101]);
    let vpos = i16::from_be_bytes(header[75..77].try_into().unwrap());
    let hpos = i16::from_be_bytes(header[77..79].try_into().unwrap());
    let window_id = i16::from_be_bytes(header[79..81].try_into().unwrap());
    let protected = header[81] != 0;
    let modified = u32::from_be_bytes(header[95..99].try_into().unwrap());
    let filename_script = header[106];

    Ok(MacBinaryMeta {
        data_offset,
        data_size,
        rsrc_offset,
        rsrc_size,
        metadata: Metadata {
            filename,
            filename_script,
            comment: Vec::new(),
            file_type,
            file_creator,
            finder_flags,
            vpos,
            hpos,
            window_id,
            protected,
            modified: mactime(modified),
        },
    })
}

fn align128(value: i64) -> i64 {
    let rem = value % 128;
    if rem == 0 {
        value
    } else {
        value + (128 - rem)
    }
}

/// Converts a Mac OS timestamp (seconds since 1 Jan 1904) to a Unix
/// timestamp (seconds since 1 Jan 1970).
fn mactime(timestamp: u32) -> u32 {
    const OFFSET: u32 = 66 * 365 * 86400 + 18 * 86400;
    timestamp.wrapping_sub(OFFSET)
}

fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    let mut pos = 0usize;
    while pos < buf.len() {
        let n = file.read_at(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(Error::Format);
        }
        pos += n;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// AppleDouble / AppleSingle
// ---------------------------------------------------------------------

struct AppleFileMeta {
    data_offset: i64,
    data_size: i64,
    rsrc_offset: i64,
    rsrc_size: i64,
    metadata: Metadata,
}

const APPLEDOUBLE_MAGIC: u32 = 0x0005_1607;
const APPLESINGLE_MAGIC: u32 = 0x0005_1600;
const APPLEFILE_HEADER_SIZE: usize = 26;
const APPLEFILE_ENTRY_SIZE: usize = 12;
const APPLEFILE_MAX_ENTRIES: usize = 16;
const ENTRY_DATA_FORK: u32 = 1;
const ENTRY_RSRC_FORK: u32 = 2;

fn parse_applefile(file: &std::fs::File, fsize: i64) -> Result<(ContainerKind, AppleFileMeta)> {
    let cap = APPLEFILE_HEADER_SIZE + APPLEFILE_ENTRY_SIZE * APPLEFILE_MAX_ENTRIES;
    let mut buf = vec![0u8; cap];
    let amt = read_at_best_effort(file, &mut buf, 0)?;
    if amt < APPLEFILE_HEADER_SIZE {
        return Err(Error::Format);
    }
    let buf = &buf[..amt];

    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let kind = if magic == APPLEDOUBLE_MAGIC {
        ContainerKind::AppleDouble
    } else if magic == APPLESINGLE_MAGIC {
        ContainerKind::AppleSingle
    } else {
        return Err(Error::Format);
    };

    let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if version > 0x0002_0000 {
        return Err(Error::Unsupported);
    }

    let num_entries = usize::from(u16::from_be_bytes(buf[24..26].try_into().unwrap()));
    let header_size = APPLEFILE_HEADER_SIZE + num_entries * APPLEFILE_ENTRY_SIZE;
    if header_size as i64 > fsize {
        return Err(Error::Invalid);
    }
    if num_entries > APPLEFILE_MAX_ENTRIES {
        return Err(Error::Unsupported);
    }
    if header_size > amt {
        return Err(Error::Invalid);
    }

    let mut data_offset = 0i64;
    let mut data_size = 0i64;
    let mut rsrc_offset = 0i64;
    let mut rsrc_size = 0i64;
    let mut has_data = false;
    let mut has_rsrc = false;

    for i in 0..num_entries {
        let eptr = APPLEFILE_HEADER_SIZE + APPLEFILE_ENTRY_SIZE * i;
        let eid = u32::from_be_bytes(buf[eptr..eptr + 4].try_into().unwrap());
        let eoffset = u32::from_be_bytes(buf[eptr + 4..eptr + 8].try_into().unwrap());
        let esize = u32::from_be_bytes(buf[eptr + 8..eptr + 12].try_into().unwrap());
        if i64::from(eoffset) > fsize || i64::from(esize) > fsize - i64::from(eoffset) {
            return Err(Error::Invalid);
        }
        match eid {
            ENTRY_DATA_FORK => {
                if has_data {
                    return Err(Error::Invalid);
                }
                has_data = true;
                data_offset = i64::from(eoffset);
                data_size = i64::from(esize);
            }
            ENTRY_RSRC_FORK => {
                if has_rsrc {
                    return Err(Error::Invalid);
                }
                has_rsrc = true;
                rsrc_offset = i64::from(eoffset);
                rsrc_size = i64::from(esize);
            }
            _ => {}
        }
    }

    Ok((
        kind,
        AppleFileMeta {
            data_offset,
            data_size,
            rsrc_offset,
            rsrc_size,
            metadata: Metadata::default(),
        },
    ))
}

fn read_at_best_effort(file: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut pos = 0usize;
    loop {
        let n = file.read_at(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            break;
        }
        pos += n;
        if pos == buf.len() {
            break;
        }
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mactime_epoch() {
        // Midnight 1 Jan 1970 stored as a Mac timestamp is seconds-since-1904.
        const OFFSET: u32 = 66 * 365 * 86400 + 18 * 86400;
        assert_eq!(mactime(OFFSET), 0);
    }

    #[test]
    fn align128_rounds_up() {
        assert_eq!(align128(0), 0);
        assert_eq!(align128(1), 128);
        assert_eq!(align128(128), 128);
        assert_eq!(align128(129), 256);
    }

    #[test]
    fn macbinary_rejects_bad_crc() {
        let mut header = [0u8; 128];
        header[1] = 5; // filename length
        // CRC left at zero, won't match the computed CRC of an all-zero
        // (mostly) header.
        let tmp = write_temp(&header);
        let err = parse_macbinary(&tmp, 128).unwrap_err();
        assert!(matches!(err, Error::Format));
    }

    #[test]
    fn macbinary_accepts_valid_header() {
        let mut header = [0u8; 128];
        header[1] = 3; // "Foo" filename length
        header[2..5].copy_from_slice(b"Foo");
        let crc = crc16_xmodem(&header[..124]);
        header[124..126].copy_from_slice(&crc.to_be_bytes());
        let tmp = write_temp(&header);
        let meta = parse_macbinary(&tmp, 128).unwrap();
        assert_eq!(meta.data_offset, 128);
        assert_eq!(meta.data_size, 0);
        assert_eq!(meta.metadata.filename, b"Foo");
    }

    #[test]
    fn appledouble_magic_detected() {
        let mut header = [0u8; 26];
        header[0..4].copy_from_slice(&APPLEDOUBLE_MAGIC.to_be_bytes());
        let tmp = write_temp(&header);
        let (kind, _) = parse_applefile(&tmp, 26).unwrap();
        assert_eq!(kind, ContainerKind::AppleDouble);
    }

    #[test]
    fn appledouble_too_many_entries_is_unsupported() {
        let num_entries = 17u16;
        let mut header = vec![0u8; APPLEFILE_HEADER_SIZE + APPLEFILE_ENTRY_SIZE * num_entries as usize];
        header[0..4].copy_from_slice(&APPLEDOUBLE_MAGIC.to_be_bytes());
        header[24..26].copy_from_slice(&num_entries.to_be_bytes());
        let tmp = write_temp(&header);
        let err = parse_applefile(&tmp, header.len() as i64).unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    fn write_temp(bytes: &[u8]) -> std::fs::File {
        use std::io::{Seek, SeekFrom, Write};
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "unrez-container-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        std::fs::File::open(&path).unwrap()
    }
}

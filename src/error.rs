//! Error types
//!
//! Two taxonomies cooperate here. [`ParseError`] is the low-level vocabulary
//! used by the zero-copy binary reader (`binary::read`) and the resource-fork
//! directory structures built on top of it: out-of-range offsets, truncated
//! reads, bad indices. [`Error`] is the crate-level taxonomy named by the
//! on-disk format specs (MacBinary, AppleDouble/AppleSingle, resource fork,
//! PICT): `Format` / `Invalid` / `Unsupported` / not-found / too-large, plus
//! OS errors from the fork reader and container detector. A `ParseError`
//! that escapes a committed format parse always becomes `Error::Invalid`:
//! by the time binary-layout parsing is underway the format has already been
//! identified, so there is no format left to fall through to.

use core::fmt;

use crate::binary::read::ReadEof;

/// Result alias used throughout the crate's public API.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that originate when parsing binary data.
///
/// These are internal to the zero-copy reader and the resource-fork
/// directory parser; they never escape the crate directly; see [`Error`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ParseError {
    /// EOF was reached unexpectedly.
    BadEof,
    /// A value was outside the expected range.
    BadValue,
    /// A version field contained an unsupported version.
    BadVersion,
    /// An offset was outside allowed bounds.
    BadOffset,
    /// An index was outside the valid range.
    BadIndex,
    /// A value overflowed its storage type.
    Overflow,
    /// CRC did not match expected value.
    CrcMismatch,
}

impl From<ReadEof> for ParseError {
    fn from(_error: ReadEof) -> Self {
        ParseError::BadEof
    }
}

impl From<core::num::TryFromIntError> for ParseError {
    fn from(_error: core::num::TryFromIntError) -> Self {
        ParseError::BadValue
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadEof => write!(f, "end of data reached unexpectedly"),
            ParseError::BadValue => write!(f, "invalid value"),
            ParseError::BadVersion => write!(f, "unexpected data version"),
            ParseError::BadOffset => write!(f, "invalid data offset"),
            ParseError::BadIndex => write!(f, "invalid data index"),
            ParseError::Overflow => write!(f, "a value overflowed its range"),
            ParseError::CrcMismatch => write!(f, "CRC mismatch"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Errors produced while detecting containers, parsing resource forks, or
/// decoding PICT streams.
///
/// Negative codes in the original C library correspond to the non-`Io`
/// variants here; positive (errno) codes correspond to [`Error::Io`].
#[derive(Debug)]
pub enum Error {
    /// The input does not have the format a candidate parser expected.
    /// Recoverable during container detection: the caller may try the
    /// next candidate encoding.
    Format,
    /// The input claimed to have a format but is internally inconsistent
    /// or corrupt. Terminal for the operation in progress.
    Invalid,
    /// A known but unimplemented feature was encountered (e.g. PICT
    /// patterns, polygons, or non-rectangular regions).
    Unsupported,
    /// No resource with the requested type and id exists.
    ResourceNotFound,
    /// The forked file has no resource fork.
    NoResourceFork,
    /// A file or fork exceeds a size limit this crate enforces.
    TooLarge,
    /// A resource fork exceeds the 32 MiB ceiling.
    ResourceForkTooLarge,
    /// An OS-level error (open, read, mmap, stat) surfaced unchanged.
    Io(std::io::Error),
}

impl From<ParseError> for Error {
    fn from(_error: ParseError) -> Self {
        Error::Invalid
    }
}

impl From<ReadEof> for Error {
    fn from(_error: ReadEof) -> Self {
        Error::Invalid
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_error: std::num::TryFromIntError) -> Self {
        Error::Invalid
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format => write!(f, "file does not have specified format"),
            Error::Invalid => write!(f, "file is corrupt"),
            Error::Unsupported => write!(f, "file is unsupported"),
            Error::ResourceNotFound => write!(f, "resource not found"),
            Error::NoResourceFork => write!(f, "file has no resource fork"),
            Error::TooLarge => write!(f, "file is too large"),
            Error::ResourceForkTooLarge => write!(f, "resource fork is too large"),
            Error::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_maps_to_invalid() {
        assert!(matches!(Error::from(ParseError::BadEof), Error::Invalid));
        assert!(matches!(Error::from(ParseError::BadOffset), Error::Invalid));
    }

    #[test]
    fn display_messages_are_non_empty() {
        for err in [
            Error::Format,
            Error::Invalid,
            Error::Unsupported,
            Error::ResourceNotFound,
            Error::NoResourceFork,
            Error::TooLarge,
            Error::ResourceForkTooLarge,
        ] {
            assert!(!err.to_string().is_empty());
        }
    }
}

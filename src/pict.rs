//! QuickDraw PICT decoding.
//!
//! A PICT stream is a 10-byte header (a picture size nobody trusts any more,
//! plus a frame [`Rect`]) followed by a sequence of opcodes. Version 1
//! opcodes are a single byte indexed into a fixed 256-entry table; version 2
//! opcodes are a big-endian `u16` read on 16-bit alignment relative to the
//! *previous* opcode's payload length, and fall back to the same 256-entry
//! table for values `<= 0x00ff`. Rather than building a picture in memory,
//! [`decode`] walks the opcode stream and reports each header/opcode/pixel
//! event to a [`PictHandler`], mirroring the callback-driven decoder this
//! crate's picture-walking code is grounded on: callers that want a struct
//! back implement the trait themselves and collect what they need.
//!
//! The only opcode decoded down to pixels is `PackBitsRect`/`DirectBitsRect`
//! (`0x0098`/`0x009a`); everything else is walked just far enough to find
//! the next opcode, or reported as `Unsupported`/`Invalid` per the opcode's
//! kind (patterns, text, polygons, non-rectangular regions, embedded
//! QuickTime).

use crate::error::Error;
use crate::Rect;

const HEADER_SIZE: usize = 10;
const OP_VERSION: u16 = 0x0011;
const OP_END_OF_PICTURE: u16 = 0x00ff;
const OP_PACK_BITS_RECT: u16 = 0x0098;
const OP_DIRECT_BITS_RECT: u16 = 0x009a;

const ERR_EOF: &str = "unexpected end of file";
const ERR_BAD_LENGTH: &str = "invalid length";

/// A single 16-bit-per-channel QuickDraw color table entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Color {
    /// "Index or other value"; safe to ignore.
    pub v: i16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
}

/// A decoded pixel map: raw, planar-unshuffled, byte-ordered-native pixel
/// bytes plus the geometry/packing fields a caller needs to interpret them.
///
/// 8-bit data is left as raw palette indices (see `color_table`); 16- and
/// 32-bit data is expanded in place to interleaved 8-bit-per-channel
/// `R G B 0` quadruplets, matching the reference decoder this crate is
/// grounded on (the on-disk `pixelSize` is kept unchanged in this struct,
/// even though the unpacked bytes are no longer that many bits per pixel).
#[derive(Debug, Clone)]
pub struct PixelMap {
    pub data: Vec<u8>,
    pub row_bytes: i32,
    pub bounds: Rect,
    pub pack_type: i16,
    pub pixel_type: i16,
    pub pixel_size: i16,
    pub cmp_count: i16,
    pub cmp_size: i16,
    pub color_table: Option<Vec<Color>>,
    pub src_rect: Rect,
    pub dest_rect: Rect,
    pub mode: i16,
}

/// Callback set for walking a PICT opcode stream.
///
/// Each method that returns `bool` should return `true` to keep decoding, or
/// `false` to stop early (the source library's "return 0 to continue"
/// convention, inverted to read naturally in Rust). Stopping this way is not
/// reported as an error: `decode` simply returns without further calls.
/// `error` is called at most once, and always ends decoding.
pub trait PictHandler {
    /// The picture's version (1 or 2) and frame rectangle. Called exactly
    /// once, before any other callback.
    fn header(&mut self, version: u8, frame: Rect) -> bool;
    /// An opcode this decoder doesn't turn into pixels, along with its raw
    /// payload (including any length prefix the opcode's own encoding uses).
    fn opcode(&mut self, opcode: u16, data: &[u8]) -> bool;
    /// A `PackBitsRect`/`DirectBitsRect` opcode's decoded pixel map.
    fn pixels(&mut self, opcode: u16, pix: &PixelMap) -> bool;
    /// Called when the stream cannot be decoded further. `opcode` is `-1`
    /// when the error isn't attributable to one opcode in particular.
    fn error(&mut self, err: Error, opcode: i32, message: Option<&str>);
}

/// Walks `data` as a QuickDraw picture, invoking `handler`'s callbacks in
/// stream order. Never panics on malformed input: every error path reports
/// through [`PictHandler::error`] instead.
pub fn decode(data: &[u8], handler: &mut dyn PictHandler) {
    if data.len() < HEADER_SIZE + 1 {
        handler.error(Error::Invalid, -1, Some(ERR_EOF));
        return;
    }

    let mut cursor = Cursor::new(data);
    cursor.skip_unchecked(2); // picture size, ignored even for v1
    let frame = Rect {
        top: cursor.read_i16be_unchecked(),
        left: cursor.read_i16be_unchecked(),
        bottom: cursor.read_i16be_unchecked(),
        right: cursor.read_i16be_unchecked(),
    };

    let version: u8 = if cursor.remaining() >= 2 && cursor.peek_u16be() == Some(OP_VERSION) {
        2
    } else {
        1
    };

    if !handler.header(version, frame) {
        return;
    }

    // `last_payload_len`'s parity decides whether a v2 opcode read must
    // first skip one alignment byte; `0` (even) before the first opcode.
    let mut last_payload_len: usize = 0;

    loop {
        let opcode: u16;
        if version == 1 {
            let Some(b) = cursor.read_u8() else { break };
            opcode = u16::from(b);
        } else {
            let align = last_payload_len & 1;
            if cursor.remaining() < 2 + align {
                break;
            }
            cursor.skip_unchecked(align);
            opcode = cursor.read_u16be_unchecked();
        }

        match dispatch(opcode, version, &mut cursor, handler) {
            Outcome::Continue(len) => last_payload_len = len,
            Outcome::Stop => return,
        }
    }

    handler.error(Error::Invalid, -1, Some(ERR_EOF));
}

enum Outcome {
    /// Decoding continues; the opcode's payload (including any internal
    /// length prefix) was this many bytes.
    Continue(usize),
    /// Decoding has ended, either cleanly (`OpEndPic`, or a callback asked
    /// to stop) or after `error` already reported the problem.
    Stop,
}

fn dispatch(opcode: u16, version: u8, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    match payload_kind(opcode, version) {
        PayloadKind::Fixed(len) => {
            let Some(slice) = cursor.take(len) else {
                handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
                return Outcome::Stop;
            };
            if !handler.opcode(opcode, slice) {
                return Outcome::Stop;
            }
            Outcome::Continue(len)
        }
        PayloadKind::Version => handle_version(opcode, version, cursor, handler),
        PayloadKind::End => Outcome::Stop,
        PayloadKind::Data16 => handle_data16(opcode, cursor, handler),
        PayloadKind::Data32 => handle_data32(opcode, cursor, handler),
        PayloadKind::LongComment => handle_long_comment(opcode, cursor, handler),
        PayloadKind::Region => handle_region(opcode, cursor, handler),
        PayloadKind::Pattern => {
            handler.error(Error::Unsupported, i32::from(opcode), Some("patterns not supported"));
            Outcome::Stop
        }
        PayloadKind::Text => {
            handler.error(Error::Unsupported, i32::from(opcode), Some("text not supported"));
            Outcome::Stop
        }
        PayloadKind::NotDetermined => {
            handler.error(
                Error::Invalid,
                i32::from(opcode),
                Some("reserved opcode has undetermined size"),
            );
            Outcome::Stop
        }
        PayloadKind::Polygon => {
            handler.error(Error::Unsupported, i32::from(opcode), Some("polygons not supported"));
            Outcome::Stop
        }
        PayloadKind::PixelData => handle_pixel_data(opcode, cursor, handler),
        PayloadKind::QuickTime => {
            handler.error(
                Error::Unsupported,
                i32::from(opcode),
                Some("embedded QuickTime images not supported"),
            );
            Outcome::Stop
        }
        PayloadKind::Unknown => {
            handler.error(Error::Invalid, i32::from(opcode), Some("unknown opcode"));
            Outcome::Stop
        }
    }
}

fn handle_version(opcode: u16, version: u8, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    let Some(b) = cursor.read_u8() else {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    };
    if b != version {
        handler.error(Error::Invalid, i32::from(opcode), Some("invalid format version"));
        return Outcome::Stop;
    }
    let byte = [b];
    if !handler.opcode(opcode, &byte) {
        return Outcome::Stop;
    }
    Outcome::Continue(1)
}

fn handle_data16(opcode: u16, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    let start = cursor.pos;
    let Some(size) = cursor.read_i16be() else {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    };
    if size < 0 {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_BAD_LENGTH));
        return Outcome::Stop;
    }
    if cursor.skip(size as usize).is_err() {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    }
    let len = cursor.pos - start;
    if !handler.opcode(opcode, &cursor.data[start..cursor.pos]) {
        return Outcome::Stop;
    }
    Outcome::Continue(len)
}

fn handle_data32(opcode: u16, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    let start = cursor.pos;
    let Some(size) = cursor.read_i32be() else {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    };
    if size < 0 {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_BAD_LENGTH));
        return Outcome::Stop;
    }
    if cursor.skip(size as usize).is_err() {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    }
    let len = cursor.pos - start;
    if !handler.opcode(opcode, &cursor.data[start..cursor.pos]) {
        return Outcome::Stop;
    }
    Outcome::Continue(len)
}

fn handle_long_comment(opcode: u16, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    let start = cursor.pos;
    if cursor.remaining() < 4 {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    }
    let _kind = cursor.read_u16be_unchecked();
    let size = cursor.read_i16be_unchecked();
    if size < 0 {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_BAD_LENGTH));
        return Outcome::Stop;
    }
    if cursor.skip(size as usize).is_err() {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    }
    let len = cursor.pos - start;
    if !handler.opcode(opcode, &cursor.data[start..cursor.pos]) {
        return Outcome::Stop;
    }
    Outcome::Continue(len)
}

/// Reads a rectangular region. QuickDraw regions lead with a `u16` size
/// that counts itself: a plain rectangular region is `size == 10` (the
/// 2-byte size field plus an 8-byte bounding box); anything else is a
/// shape this decoder has no support for.
fn handle_region(opcode: u16, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    let start = cursor.pos;
    let Some(size) = cursor.peek_u16be() else {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    };
    if size < 2 {
        handler.error(Error::Invalid, i32::from(opcode), Some("invalid region size"));
        return Outcome::Stop;
    }
    if size != 10 {
        handler.error(Error::Unsupported, i32::from(opcode), Some("unsupported region format"));
        return Outcome::Stop;
    }
    if cursor.skip(usize::from(size)).is_err() {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    }
    if !handler.opcode(opcode, &cursor.data[start..cursor.pos]) {
        return Outcome::Stop;
    }
    Outcome::Continue(usize::from(size))
}

// ---------------------------------------------------------------------
// Opcode table
// ---------------------------------------------------------------------

#[derive(Debug, Copy, Clone)]
enum PayloadKind {
    Fixed(usize),
    Version,
    End,
    Data16,
    Data32,
    LongComment,
    Region,
    Pattern,
    Text,
    NotDetermined,
    Polygon,
    PixelData,
    QuickTime,
    Unknown,
}

/// Looks up an opcode's payload shape. Opcodes `0x0000..=0x00ff` share one
/// table between v1 and v2 pictures; larger values are only valid in v2
/// streams and are looked up in a small ordered range table, mirroring the
/// source decoder's `find_opcode` linear scan.
fn payload_kind(opcode: u16, version: u8) -> PayloadKind {
    if opcode <= 0x00ff {
        return payload_kind_low(opcode as u8);
    }
    if version == 1 {
        return PayloadKind::Unknown;
    }
    for &(start, end, kind) in RANGE_TABLE {
        if (start..=end).contains(&opcode) {
            return kind;
        }
    }
    PayloadKind::Unknown
}

fn payload_kind_low(opcode: u8) -> PayloadKind {
    use PayloadKind::*;
    match opcode {
        0x00 => Fixed(0),        // NOP
        0x01 => Region,          // ClipRgn
        0x02 => Fixed(8),        // BkPat
        0x03 => Fixed(2),        // TxFont
        0x04 => Fixed(1),        // TxFace
        0x05 => Fixed(2),        // TxMode
        0x06 => Fixed(4),        // SpExtra
        0x07 => Fixed(4),        // PnSize
        0x08 => Fixed(2),        // PnMode
        0x09 => Fixed(8),        // PnPat
        0x0a => Fixed(8),        // FillPat
        0x0b => Fixed(4),        // OvSize
        0x0c => Fixed(4),        // Origin
        0x0d => Fixed(2),        // TxSize
        0x0e => Fixed(4),        // FgColor
        0x0f => Fixed(4),        // BkColor
        0x10 => Fixed(8),        // TxRatio
        0x11 => Version,
        0x12..=0x14 => Pattern,  // BkPixPat / PnPixPat / FillPixPat
        0x1a => Fixed(6),        // RGBFgCol
        0x1b => Fixed(6),        // RGBBkCol
        0x1c => Fixed(0),        // HiliteMode
        0x1d => Fixed(6),        // HiliteColor
        0x1e => Fixed(0),        // DefHilite
        0x1f => Fixed(6),        // OpColor
        0x20 => Fixed(4),        // Line
        0x21 => Fixed(2),        // LineFrom
        0x22 => Fixed(6),        // ShortLine
        0x23 => Fixed(3),        // ShortLineFrom
        0x28 => Text,            // LongText
        0x29 => Text,            // DHText
        0x2a => Text,            // DVText
        0x2b => Text,            // DHDVText
        0x30..=0x39 => Fixed(8), // frame/paint/erase/invert/fill of Rect
        0x40..=0x49 => Fixed(8), // ...of SameRect
        0x50..=0x59 => Fixed(8), // ...of RRect
        0x60..=0x69 => Fixed(8), // ...of Oval
        0x70..=0x75 => Polygon,  // Poly/PolyClip/PaintPoly/EraseRgn/InvertPoly/FillPoly
        0x80..=0x87 => Region,   // frame/paint/erase/invert/fill/.. of Rgn
        0x90 => Fixed(0),        // BitsRect (old-style, unsupported monochrome path)
        0x91 => Fixed(0),        // BitsRgn
        0x98 => PixelData,       // PackBitsRect
        0x99 => PixelData,       // PackBitsRgn (falls through to the "unsupported pixel opcode" branch)
        0x9a => PixelData,       // DirectBitsRect
        0x9b => PixelData,       // DirectBitsRgn (same)
        0xa0 => Fixed(2),        // ShortComment
        0xa1 => LongComment,
        0xff => End,             // OpEndPic
        // Reserved/unused opcodes in this range carry no payload on disk;
        // treating them as zero-length keeps the stream in sync instead of
        // guessing at a size.
        _ => Fixed(0),
    }
}

const RANGE_TABLE: &[(u16, u16, PayloadKind)] = &[
    (0x0c00, 0x0c00, PayloadKind::Fixed(24)), // HeaderOp
    (0x8200, 0x8200, PayloadKind::QuickTime), // CompressedQuickTime
    (0x8201, 0x8201, PayloadKind::QuickTime), // UncompressedQuickTime
];

// ---------------------------------------------------------------------
// PixMap / pixel data
// ---------------------------------------------------------------------

struct RawPixMap {
    row_bytes: i32,
    bounds: Rect,
    pack_type: i16,
    pack_size: i32,
    pixel_type: i16,
    pixel_size: i16,
    cmp_count: i16,
    cmp_size: i16,
}

fn read_pixmap(cursor: &mut Cursor) -> Option<RawPixMap> {
    let row_bytes = i32::from(cursor.read_u16be()? & 0x7fff);
    let bounds = read_rect(cursor)?;
    let _pm_version = cursor.read_i16be()?;
    let pack_type = cursor.read_i16be()?;
    let pack_size = cursor.read_i32be()?;
    let _h_res = cursor.read_i32be()?;
    let _v_res = cursor.read_i32be()?;
    let pixel_type = cursor.read_i16be()?;
    let pixel_size = cursor.read_i16be()?;
    let cmp_count = cursor.read_i16be()?;
    let cmp_size = cursor.read_i16be()?;
    let _plane_bytes = cursor.read_i32be()?;
    let _pm_table = cursor.read_i32be()?;
    let _pm_reserved = cursor.read_i32be()?;

    Some(RawPixMap {
        row_bytes,
        bounds,
        pack_type,
        pack_size,
        pixel_type,
        pixel_size,
        cmp_count,
        cmp_size,
    })
}

fn read_color_table(cursor: &mut Cursor) -> Result<Vec<Color>, &'static str> {
    let _ct_seed = cursor.read_u32be().ok_or(ERR_EOF)?;
    let _ct_flags = cursor.read_u16be().ok_or(ERR_EOF)?;
    let ct_size = cursor.read_i16be().ok_or(ERR_EOF)?;
    let count = i32::from(ct_size) + 1;
    if !(0..=256).contains(&count) {
        return Err(ERR_BAD_LENGTH);
    }
    let mut colors = Vec::with_capacity(count as usize);
    for _ in 0..count {
        colors.push(Color {
            v: cursor.read_i16be().ok_or(ERR_EOF)?,
            r: cursor.read_u16be().ok_or(ERR_EOF)?,
            g: cursor.read_u16be().ok_or(ERR_EOF)?,
            b: cursor.read_u16be().ok_or(ERR_EOF)?,
        });
    }
    Ok(colors)
}

fn read_rect(cursor: &mut Cursor) -> Option<Rect> {
    Some(Rect {
        top: cursor.read_i16be()?,
        left: cursor.read_i16be()?,
        bottom: cursor.read_i16be()?,
        right: cursor.read_i16be()?,
    })
}

fn handle_pixel_data(opcode: u16, cursor: &mut Cursor, handler: &mut dyn PictHandler) -> Outcome {
    let start = cursor.pos;
    let direct_bits = opcode == OP_DIRECT_BITS_RECT;
    if opcode != OP_PACK_BITS_RECT && !direct_bits {
        handler.error(Error::Invalid, i32::from(opcode), Some("unsupported pixel data opcode"));
        return Outcome::Stop;
    }

    if direct_bits {
        // baseAddr placeholder, present on disk but never used.
        if cursor.skip(4).is_err() {
            handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
            return Outcome::Stop;
        }
    }
    let Some(pixmap) = read_pixmap(cursor) else {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    };

    let color_table = if direct_bits {
        None
    } else {
        match read_color_table(cursor) {
            Ok(colors) => Some(colors),
            Err(msg) => {
                handler.error(Error::Invalid, i32::from(opcode), Some(msg));
                return Outcome::Stop;
            }
        }
    };

    let (Some(src_rect), Some(dest_rect), Some(mode)) =
        (read_rect(cursor), read_rect(cursor), cursor.read_i16be())
    else {
        handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
        return Outcome::Stop;
    };

    match decode_pixels(cursor, &pixmap) {
        Ok(data) => {
            let pix = PixelMap {
                data,
                row_bytes: pixmap_dest_row_bytes(&pixmap),
                bounds: pixmap.bounds,
                pack_type: pixmap.pack_type,
                pixel_type: pixmap.pixel_type,
                pixel_size: pixmap.pixel_size,
                cmp_count: pixmap.cmp_count,
                cmp_size: pixmap.cmp_size,
                color_table,
                src_rect,
                dest_rect,
                mode,
            };
            let _ = pixmap.pack_size;
            if !handler.pixels(opcode, &pix) {
                return Outcome::Stop;
            }
            Outcome::Continue(cursor.pos - start)
        }
        Err(PixelError::Eof) => {
            handler.error(Error::Invalid, i32::from(opcode), Some(ERR_EOF));
            Outcome::Stop
        }
        Err(PixelError::Message(msg)) => {
            handler.error(Error::Invalid, i32::from(opcode), Some(msg));
            Outcome::Stop
        }
        Err(PixelError::Unsupported(msg)) => {
            handler.error(Error::Unsupported, i32::from(opcode), Some(msg));
            Outcome::Stop
        }
    }
}

fn pixmap_dest_row_bytes(pixmap: &RawPixMap) -> i32 {
    let width = pixmap.bounds.width();
    match pixmap.pixel_size {
        8 => (width + 3) & !3,
        _ => width * 4,
    }
}

enum PixelError {
    Eof,
    Message(&'static str),
    Unsupported(&'static str),
}

/// Decodes the packed scanlines following a `PixMap`/color-table/rect/mode
/// header into a raster. 8-bit data stays as raw palette indices; 16- and
/// 32-bit data is expanded row by row into `R G B 0` quadruplets.
fn decode_pixels(cursor: &mut Cursor, pixmap: &RawPixMap) -> Result<Vec<u8>, PixelError> {
    let width = pixmap.bounds.width();
    let height = pixmap.bounds.height();
    if width <= 0 || height <= 0 {
        return Err(PixelError::Message("invalid bounds"));
    }
    let width = width as usize;
    let height = height as usize;

    let mut src_row_bytes = pixmap.row_bytes;
    if src_row_bytes & 1 != 0 || src_row_bytes <= 0 || src_row_bytes > 0x4000 {
        return Err(PixelError::Message("bad rowBytes value"));
    }

    let dest_row_bytes = match pixmap.pixel_size {
        8 => {
            if (src_row_bytes as usize) < width {
                return Err(PixelError::Message("bad rowBytes value"));
            }
            (width + 3) & !3
        }
        16 => {
            if (src_row_bytes as usize) < width * 2 {
                return Err(PixelError::Message("bad rowBytes value"));
            }
            width * 4
        }
        32 => {
            // Planar 32-bit rows pack 3 bytes per pixel (R/G/B planes), not 4.
            src_row_bytes = (src_row_bytes * 3) / 4;
            if (src_row_bytes as usize) < width * 3 {
                return Err(PixelError::Message("bad rowBytes value"));
            }
            width * 4
        }
        _ => return Err(PixelError::Message("bad pixelSize value")),
    };
    let src_row_bytes = src_row_bytes as usize;

    let effective_pack_type = if dest_row_bytes < 8 { 1 } else { i32::from(pixmap.pack_type) };

    let mut out = vec![0u8; dest_row_bytes * height];
    for row in 0..height {
        let dest = &mut out[row * dest_row_bytes..(row + 1) * dest_row_bytes];
        match (effective_pack_type, pixmap.pixel_size) {
            (0, 8) => {
                let packed = read_length_prefixed(cursor, src_row_bytes)?;
                let decoded = packbits_decode(&packed, src_row_bytes)?;
                dest[..src_row_bytes].copy_from_slice(&decoded);
            }
            (1, 8) => {
                let row_data = cursor.read_vec(src_row_bytes).ok_or(PixelError::Eof)?;
                dest[..src_row_bytes].copy_from_slice(&row_data);
            }
            (1, 16) => {
                let row_data = cursor.read_vec(src_row_bytes).ok_or(PixelError::Eof)?;
                unpack_16(&row_data, dest, width);
            }
            (1, 32) => {
                let row_data = cursor.read_vec(src_row_bytes).ok_or(PixelError::Eof)?;
                unpack_32_planar(&row_data, dest, width);
            }
            (3, 16) => {
                let packed = read_length_prefixed(cursor, src_row_bytes)?;
                let words = packbits_decode_words(&packed, src_row_bytes / 2)?;
                unpack_16_words(&words, dest, width);
            }
            (4, 32) => {
                let packed = read_length_prefixed(cursor, src_row_bytes)?;
                let decoded = packbits_decode(&packed, src_row_bytes)?;
                unpack_32_planar(&decoded, dest, width);
            }
            _ => return Err(PixelError::Unsupported("unsupported packType value")),
        }
    }

    Ok(out)
}

fn read_length_prefixed(cursor: &mut Cursor, row_bytes: usize) -> Result<Vec<u8>, PixelError> {
    let len = if row_bytes <= 250 {
        usize::from(cursor.read_u8().ok_or(PixelError::Eof)?)
    } else {
        usize::from(cursor.read_u16be().ok_or(PixelError::Eof)?)
    };
    cursor.read_vec(len).ok_or(PixelError::Eof)
}

/// Expands a 5-bit RGB555 sample (as stored, MSB unused) into an 8-bit
/// value by replicating the high bits into the low bits.
fn expand_5_to_8(v: u8) -> u8 {
    ((v << 3) & 0xf8) | ((v >> 2) & 0x07)
}

fn unpack_16(row: &[u8], dest: &mut [u8], width: usize) {
    for x in 0..width {
        let hi = row.get(x * 2).copied().unwrap_or(0);
        let lo = row.get(x * 2 + 1).copied().unwrap_or(0);
        write_rgb555(u16::from_be_bytes([hi, lo]), &mut dest[x * 4..x * 4 + 4]);
    }
}

fn unpack_16_words(words: &[u16], dest: &mut [u8], width: usize) {
    for x in 0..width {
        write_rgb555(words.get(x).copied().unwrap_or(0), &mut dest[x * 4..x * 4 + 4]);
    }
}

fn write_rgb555(word: u16, out: &mut [u8]) {
    let r5 = ((word >> 10) & 0x1f) as u8;
    let g5 = ((word >> 5) & 0x1f) as u8;
    let b5 = (word & 0x1f) as u8;
    out[0] = expand_5_to_8(r5);
    out[1] = expand_5_to_8(g5);
    out[2] = expand_5_to_8(b5);
    out[3] = 0;
}

/// Unpacks row-planar 8-bit-per-component data (all reds, then all greens,
/// then all blues, `width` samples each) into interleaved `R G B 0`.
fn unpack_32_planar(row: &[u8], dest: &mut [u8], width: usize) {
    for x in 0..width {
        dest[x * 4] = row.get(x).copied().unwrap_or(0);
        dest[x * 4 + 1] = row.get(width + x).copied().unwrap_or(0);
        dest[x * 4 + 2] = row.get(2 * width + x).copied().unwrap_or(0);
        dest[x * 4 + 3] = 0;
    }
}

/// Decodes a single PackBits-compressed scanline to exactly `out_len`
/// bytes. Control byte semantics (per Apple Technical Note TN1023): `c` in
/// `0..=127` means `c + 1` literal bytes follow; `c` in `-127..=-1` (i.e.
/// `129..=255`) means the next byte repeats `257 - c` times; `c == -128`
/// (`128`) is a documented no-op and is skipped.
///
/// Input-driven, like the original decoder: a row is allowed to run dry
/// before producing `out_len` bytes (e.g. a trailing run of zeros was
/// omitted from the stream entirely), in which case the remainder is
/// zero-filled rather than treated as an error.
fn packbits_decode(input: &[u8], out_len: usize) -> Result<Vec<u8>, PixelError> {
    let mut out = Vec::with_capacity(out_len);
    let mut i = 0;
    while out.len() < out_len && i < input.len() {
        let control = input[i];
        i += 1;
        if control == 0x80u8 as i8 as u8 {
            continue;
        } else if (control as i8) >= 0 {
            let run = (control as usize + 1).min(out_len - out.len());
            let available = (input.len() - i).min(run);
            out.extend_from_slice(&input[i..i + available]);
            i += available;
        } else {
            let run = (257 - i32::from(control)) as usize;
            let run = run.min(out_len - out.len());
            let Some(&byte) = input.get(i) else { break };
            i += 1;
            out.resize(out.len() + run, byte);
        }
    }
    out.resize(out_len, 0);
    Ok(out)
}

/// The 16-bit-unit variant of [`packbits_decode`]: the control byte still
/// counts runs of *units*, but each unit is a big-endian `u16` rather than
/// a byte. Same input-driven, zero-fill-the-tail behavior.
fn packbits_decode_words(input: &[u8], out_words: usize) -> Result<Vec<u16>, PixelError> {
    let mut out = Vec::with_capacity(out_words);
    let mut i = 0;
    while out.len() < out_words && i < input.len() {
        let control = input[i];
        i += 1;
        if control == 0x80u8 as i8 as u8 {
            continue;
        } else if (control as i8) >= 0 {
            let run = (control as usize + 1).min(out_words - out.len());
            let available = ((input.len() - i) / 2).min(run);
            for w in input[i..i + available * 2].chunks_exact(2) {
                out.push(u16::from_be_bytes([w[0], w[1]]));
            }
            i += available * 2;
        } else {
            let run = (257 - i32::from(control)) as usize;
            let run = run.min(out_words - out.len());
            let Some(bytes) = input.get(i..i + 2) else { break };
            let word = u16::from_be_bytes([bytes[0], bytes[1]]);
            i += 2;
            out.resize(out.len() + run, word);
        }
    }
    out.resize(out_words, 0);
    Ok(out)
}

/// Encodes `data` with PackBits, used by tests to exercise round-tripping
/// and by producers that want to re-pack scanlines.
pub fn packbits_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let mut run_len = 1;
        while i + run_len < data.len() && data[i + run_len] == data[i] && run_len < 128 {
            run_len += 1;
        }
        if run_len >= 2 {
            out.push((257 - run_len as i32) as u8);
            out.push(data[i]);
            i += run_len;
            continue;
        }

        let start = i;
        let mut len = 1;
        while start + len < data.len() && len < 128 {
            let remaining = &data[start + len..];
            if remaining.len() >= 2 && remaining[0] == remaining.get(1).copied().unwrap_or(!remaining[0]) {
                break;
            }
            len += 1;
        }
        out.push((len - 1) as u8);
        out.extend_from_slice(&data[start..start + len]);
        i = start + len;
    }
    out
}

/// Converts a decoded 16-bit-per-pixel [`PixelMap`]'s data to 32-bit RGBA,
/// expanding the packed 5-bit-per-channel samples. In this implementation
/// `decode` already performs this expansion inline (matching the reference
/// decoder's behavior of never handing callers raw 16-bit words), so this
/// is effectively an identity conversion retained for API parity with the
/// source library's `unrez_pixdata_16to32` and for callers that received a
/// [`PixelMap`] from somewhere other than [`decode`].
pub fn pixdata_16to32(pix: &PixelMap) -> Vec<u8> {
    pix.data.clone()
}

// ---------------------------------------------------------------------
// Cursor: a small bounds-checked big-endian reader
// ---------------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn skip_unchecked(&mut self, n: usize) {
        self.pos += n;
    }

    fn skip(&mut self, n: usize) -> Result<(), ()> {
        if self.remaining() < n {
            return Err(());
        }
        self.pos += n;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn peek_u16be(&self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        Some(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    fn read_i16be_unchecked(&mut self) -> i16 {
        self.read_i16be().unwrap_or(0)
    }

    fn read_u16be_unchecked(&mut self) -> u16 {
        self.read_u16be().unwrap_or(0)
    }

    fn read_u16be(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_i16be(&mut self) -> Option<i16> {
        Some(self.read_u16be()? as i16)
    }

    fn read_u32be(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_i32be(&mut self) -> Option<i32> {
        Some(self.read_u32be()? as i32)
    }

    fn read_vec(&mut self, len: usize) -> Option<Vec<u8>> {
        let bytes = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects every callback invocation, for assertions in tests.
    #[derive(Default)]
    struct Recorder {
        header: Option<(u8, Rect)>,
        opcodes: Vec<(u16, Vec<u8>)>,
        pixels: Vec<(u16, PixelMap)>,
        error: Option<(String, i32, Option<String>)>,
    }

    impl PictHandler for Recorder {
        fn header(&mut self, version: u8, frame: Rect) -> bool {
            self.header = Some((version, frame));
            true
        }

        fn opcode(&mut self, opcode: u16, data: &[u8]) -> bool {
            self.opcodes.push((opcode, data.to_vec()));
            true
        }

        fn pixels(&mut self, opcode: u16, pix: &PixelMap) -> bool {
            self.pixels.push((opcode, pix.clone()));
            true
        }

        fn error(&mut self, err: Error, opcode: i32, message: Option<&str>) {
            self.error = Some((err.to_string(), opcode, message.map(str::to_owned)));
        }
    }

    fn v2_header(frame: Rect) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_be_bytes()); // picture size, ignored
        data.extend_from_slice(&frame.top.to_be_bytes());
        data.extend_from_slice(&frame.left.to_be_bytes());
        data.extend_from_slice(&frame.bottom.to_be_bytes());
        data.extend_from_slice(&frame.right.to_be_bytes());
        data.extend_from_slice(&0x0011u16.to_be_bytes()); // VersionOp
        data.push(0x02); // version byte (v2)
        data
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let mut rec = Recorder::default();
        decode(&[0u8; 4], &mut rec);
        assert!(rec.header.is_none());
        let (_, opcode, _) = rec.error.unwrap();
        assert_eq!(opcode, -1);
    }

    #[test]
    fn decode_reports_clean_end() {
        let frame = Rect { top: 0, left: 0, bottom: 4, right: 4 };
        let mut data = v2_header(frame);
        data.extend_from_slice(&OP_END_OF_PICTURE.to_be_bytes());

        let mut rec = Recorder::default();
        decode(&data, &mut rec);
        assert_eq!(rec.header, Some((2, frame)));
        assert!(rec.error.is_none());
    }

    #[test]
    fn decode_reports_unsupported_pattern_opcode() {
        let frame = Rect { top: 0, left: 0, bottom: 1, right: 1 };
        let mut data = v2_header(frame);
        data.extend_from_slice(&0x0012u16.to_be_bytes()); // BkPixPat

        let mut rec = Recorder::default();
        decode(&data, &mut rec);
        let (_, opcode, msg) = rec.error.unwrap();
        assert_eq!(opcode, 0x0012);
        assert_eq!(msg.as_deref(), Some("patterns not supported"));
    }

    #[test]
    fn decode_walks_fixed_opcode_and_continues() {
        let frame = Rect { top: 0, left: 0, bottom: 1, right: 1 };
        let mut data = v2_header(frame);
        data.extend_from_slice(&0x0003u16.to_be_bytes()); // TxFont, 2-byte payload
        data.extend_from_slice(&[0xAB, 0xCD]);
        data.extend_from_slice(&OP_END_OF_PICTURE.to_be_bytes());

        let mut rec = Recorder::default();
        decode(&data, &mut rec);
        assert_eq!(rec.opcodes, vec![(0x0003, vec![0xAB, 0xCD])]);
        assert!(rec.error.is_none());
    }

    #[test]
    fn decode_8bit_packbits_rect() {
        let frame = Rect { top: 0, left: 0, bottom: 2, right: 4 };
        let mut data = v2_header(frame);
        data.extend_from_slice(&OP_PACK_BITS_RECT.to_be_bytes());

        // PixMap (46 bytes): rowBytes, bounds, pmVersion, packType, packSize,
        // hRes, vRes, pixelType, pixelSize, cmpCount, cmpSize, 3x4 ignored.
        data.extend_from_slice(&4u16.to_be_bytes()); // rowBytes
        data.extend_from_slice(&0i16.to_be_bytes()); // bounds.top
        data.extend_from_slice(&0i16.to_be_bytes()); // bounds.left
        data.extend_from_slice(&2i16.to_be_bytes()); // bounds.bottom
        data.extend_from_slice(&4i16.to_be_bytes()); // bounds.right
        data.extend_from_slice(&0i16.to_be_bytes()); // pmVersion
        data.extend_from_slice(&0i16.to_be_bytes()); // packType (unpacked since rowBytes<8)
        data.extend_from_slice(&0i32.to_be_bytes()); // packSize
        data.extend_from_slice(&0i32.to_be_bytes()); // hRes
        data.extend_from_slice(&0i32.to_be_bytes()); // vRes
        data.extend_from_slice(&0i16.to_be_bytes()); // pixelType
        data.extend_from_slice(&8i16.to_be_bytes()); // pixelSize
        data.extend_from_slice(&1i16.to_be_bytes()); // cmpCount
        data.extend_from_slice(&8i16.to_be_bytes()); // cmpSize
        data.extend_from_slice(&[0u8; 12]); // planeBytes/pmTable/pmReserved

        // Color table: ctSeed, ctFlags, ctSize(=1 => 2 entries), 2 entries.
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1i16.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]); // color 0: black
        data.extend_from_slice(&[0, 0xff, 0xff, 0xff, 0xff, 0, 0, 0]); // color 1

        // srcRect, destRect, mode
        data.extend_from_slice(&0i16.to_be_bytes());
        data.extend_from_slice(&0i16.to_be_bytes());
        data.extend_from_slice(&2i16.to_be_bytes());
        data.extend_from_slice(&4i16.to_be_bytes());
        data.extend_from_slice(&0i16.to_be_bytes());
        data.extend_from_slice(&0i16.to_be_bytes());
        data.extend_from_slice(&2i16.to_be_bytes());
        data.extend_from_slice(&4i16.to_be_bytes());
        data.extend_from_slice(&0i16.to_be_bytes()); // mode

        // Row data: rowBytes (4) is below the 8-byte floor, so the
        // effective pack type is 1 (unpacked) regardless of the on-disk
        // packType, meaning each row is exactly 4 raw bytes with no
        // length prefix.
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(&[5, 6, 7, 8]);

        let mut rec = Recorder::default();
        decode(&data, &mut rec);
        assert!(rec.error.is_none(), "unexpected error: {:?}", rec.error);
        assert_eq!(rec.pixels.len(), 1);
        let (opcode, pix) = &rec.pixels[0];
        assert_eq!(*opcode, OP_PACK_BITS_RECT);
        assert_eq!(pix.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(pix.color_table.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn packbits_round_trips_mixed_run() {
        let data = [1u8, 1, 1, 1, 2, 3, 4, 5, 5, 5];
        let packed = packbits_encode(&data);
        let unpacked = packbits_decode(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn packbits_decode_respects_no_op_control_byte() {
        let input = [0x80u8, 0x00, 2];
        let out = packbits_decode(&input, 1).unwrap();
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn packbits_decode_zero_fills_short_row() {
        // A 2-byte literal run when the caller wants 5 bytes: the row runs
        // dry before `out_len` is reached, so the tail is zero-filled
        // instead of erroring.
        let input = [1u8, 0xaa, 0xbb];
        let out = packbits_decode(&input, 5).unwrap();
        assert_eq!(out, vec![0xaa, 0xbb, 0, 0, 0]);
    }

    #[test]
    fn packbits_decode_words_zero_fills_short_row() {
        let input = [0u8, 0x11, 0x22]; // one literal word: 0x1122
        let out = packbits_decode_words(&input, 3).unwrap();
        assert_eq!(out, vec![0x1122, 0, 0]);
    }

    #[test]
    fn packbits_decode_truncated_control_byte_zero_fills() {
        // No control byte at all: input is empty, output is all zero.
        let out = packbits_decode(&[], 4).unwrap();
        assert_eq!(out, vec![0, 0, 0, 0]);
    }

    #[test]
    fn expand_5_to_8_covers_full_range() {
        assert_eq!(expand_5_to_8(0), 0);
        assert_eq!(expand_5_to_8(0x1f), 0xff);
    }

    #[test]
    fn decoding_same_input_twice_is_idempotent() {
        let frame = Rect { top: 0, left: 0, bottom: 1, right: 1 };
        let mut data = v2_header(frame);
        data.extend_from_slice(&OP_END_OF_PICTURE.to_be_bytes());

        let mut first = Recorder::default();
        decode(&data, &mut first);
        let mut second = Recorder::default();
        decode(&data, &mut second);
        assert_eq!(first.header, second.header);
        assert_eq!(first.opcodes.len(), second.opcodes.len());
    }
}

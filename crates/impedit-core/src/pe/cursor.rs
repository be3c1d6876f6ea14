//! Bounds-checked little-endian access to a raw image buffer.
//!
//! Every structure in a PE file is reached through an offset into one
//! buffer.  [`ByteCursor`] is the only reader the parsers use, so a corrupt
//! offset surfaces as [`ParseError::Truncated`] instead of a panic.  The
//! `put_*` helpers are the matching writers used while laying out new data.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ParseError;

/// Longest NUL-terminated name accepted from an image.
pub const MAX_NAME_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// A read-only view over an image buffer.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], ParseError> {
        let truncated = ParseError::Truncated { offset, needed: len };
        let end = offset.checked_add(len).ok_or(truncated.clone())?;
        self.data.get(offset..end).ok_or(truncated)
    }

    pub fn u16(&self, offset: usize) -> Result<u16, ParseError> {
        Ok(LittleEndian::read_u16(self.bytes(offset, 2)?))
    }

    pub fn u32(&self, offset: usize) -> Result<u32, ParseError> {
        Ok(LittleEndian::read_u32(self.bytes(offset, 4)?))
    }

    pub fn u64(&self, offset: usize) -> Result<u64, ParseError> {
        Ok(LittleEndian::read_u64(self.bytes(offset, 8)?))
    }

    /// Read a pointer-sized thunk: 8 bytes for PE32+, 4 bytes (zero-extended)
    /// for PE32.
    pub fn thunk(&self, offset: usize, wide: bool) -> Result<u64, ParseError> {
        if wide {
            self.u64(offset)
        } else {
            self.u32(offset).map(u64::from)
        }
    }

    /// Read a NUL-terminated string.  Invalid UTF-8 is replaced rather than
    /// rejected since module and symbol names are ASCII in practice.
    pub fn cstr(&self, offset: usize) -> Result<String, ParseError> {
        let tail = self
            .data
            .get(offset..)
            .filter(|tail| !tail.is_empty())
            .ok_or(ParseError::Truncated { offset, needed: 1 })?;
        let window = &tail[..tail.len().min(MAX_NAME_LEN)];
        let len = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParseError::Truncated { offset, needed: window.len() + 1 })?;
        Ok(String::from_utf8_lossy(&window[..len]).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut buf[offset..offset + 2], value);
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], value);
}

/// Write a thunk in the image's pointer width.
pub(crate) fn put_thunk(buf: &mut [u8], offset: usize, value: u64, wide: bool) {
    if wide {
        put_u64(buf, offset, value);
    } else {
        put_u32(buf, offset, value as u32);
    }
}

/// Round `value` up to the nearest multiple of `alignment` (a power of two).
/// Returns `None` on overflow.
pub(crate) fn align_up(value: u32, alignment: u32) -> Option<u32> {
    if alignment <= 1 {
        return Some(value);
    }
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

//! Range-scoped binary cursor used for every frame and metadata record.
//!
//! [`HexCursor`] owns a byte buffer, a cursor and an active sub-range
//! `[start, end)`. Positions handed in and out are relative to the range
//! start. Writes fail fast with [`CodecError::OutOfRange`] when they would
//! cross the range end; reads never fail and yield `0` or a truncated result,
//! moving the cursor no further than the range end.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Out of range: {size} bytes at offset {pos} exceed range size {end}")]
    OutOfRange { pos: usize, size: usize, end: usize },

    #[error("Buffer is read-only")]
    ReadOnly,

    #[error("Invalid integer width: {0} bytes")]
    InvalidWidth(usize),
}

/// Byte order of multi-byte integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Seekable reader/writer over an owned buffer.
#[derive(Debug, Clone, Default)]
pub struct HexCursor {
    buf: Vec<u8>,
    pos: usize,
    start: usize,
    end: usize,
    endian: Endian,
    readonly: bool,
}

impl HexCursor {
    /// Zero-filled buffer of `size` bytes, range covering all of it.
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        let end = buf.len();
        Self {
            buf,
            pos: 0,
            start: 0,
            end,
            endian: Endian::Little,
            readonly: false,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn is_read_only(&self) -> bool {
        self.readonly
    }

    /// Size of the whole underlying buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Bytes of the active range.
    pub fn range_bytes(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Bytes between the cursor and the range end.
    pub fn remaining_bytes(&self) -> &[u8] {
        &self.buf[self.pos..self.end]
    }

    // ---- position & range ------------------------------------------------

    /// Cursor position relative to the range start.
    pub fn pos(&self) -> usize {
        self.pos - self.start
    }

    /// Moves the cursor, clamped to the active range.
    pub fn set_pos(&mut self, pos: usize) -> &mut Self {
        self.pos = self.start.saturating_add(pos).min(self.end);
        self
    }

    /// Moves the cursor by `delta`, clamped to the active range.
    pub fn skip(&mut self, delta: isize) -> &mut Self {
        let target = if delta >= 0 {
            self.pos.saturating_add(delta.unsigned_abs())
        } else {
            self.pos.saturating_sub(delta.unsigned_abs())
        };
        self.pos = target.clamp(self.start, self.end);
        self
    }

    /// Restricts reads and writes to `[offset, offset + size)`, clamped to the buffer.
    pub fn set_range(&mut self, offset: usize, size: usize) -> &mut Self {
        let start = offset.min(self.buf.len());
        let end = start.saturating_add(size).min(self.buf.len());
        self.start = start;
        self.end = end;
        self.pos = self.pos.clamp(start, end);
        self
    }

    pub fn set_range_all(&mut self) -> &mut Self {
        let len = self.buf.len();
        self.set_range(0, len)
    }

    /// Rewinds the cursor to the range start.
    pub fn reset(&mut self) -> &mut Self {
        self.pos = self.start;
        self
    }

    /// Absolute offset of the range start inside the buffer.
    pub fn range_start(&self) -> usize {
        self.start
    }

    pub fn range_size(&self) -> usize {
        self.end - self.start
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    // ---- writes ----------------------------------------------------------

    fn check_write(&self, size: usize) -> Result<(), CodecError> {
        if self.readonly {
            return Err(CodecError::ReadOnly);
        }
        if self.pos.saturating_add(size) > self.end {
            return Err(CodecError::OutOfRange {
                pos: self.pos - self.start,
                size,
                end: self.end - self.start,
            });
        }
        Ok(())
    }

    /// Writes the low `size` bytes of `val` in the cursor's byte order.
    pub fn put(&mut self, size: usize, val: u64) -> Result<&mut Self, CodecError> {
        self.put_with(size, val, self.endian)
    }

    pub fn put_with(
        &mut self,
        size: usize,
        val: u64,
        endian: Endian,
    ) -> Result<&mut Self, CodecError> {
        if !(1..=8).contains(&size) {
            return Err(CodecError::InvalidWidth(size));
        }
        self.check_write(size)?;
        let val = if size == 8 {
            val
        } else {
            val & ((1u64 << (size * 8)) - 1)
        };
        let dst = &mut self.buf[self.pos..self.pos + size];
        match endian {
            Endian::Little => LittleEndian::write_uint(dst, val, size),
            Endian::Big => BigEndian::write_uint(dst, val, size),
        }
        self.pos += size;
        Ok(self)
    }

    pub fn put_u8(&mut self, val: u8) -> Result<&mut Self, CodecError> {
        self.put(1, val.into())
    }

    pub fn put_u16(&mut self, val: u16) -> Result<&mut Self, CodecError> {
        self.put(2, val.into())
    }

    pub fn put_u32(&mut self, val: u32) -> Result<&mut Self, CodecError> {
        self.put(4, val.into())
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<&mut Self, CodecError> {
        self.check_write(data.len())?;
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(self)
    }

    /// Writes `text` into a fixed field of `size` bytes, zero-padded or truncated.
    pub fn put_ascii(&mut self, size: usize, text: &str) -> Result<&mut Self, CodecError> {
        self.check_write(size)?;
        let src = text.as_bytes();
        let n = src.len().min(size);
        let field = &mut self.buf[self.pos..self.pos + size];
        field[..n].copy_from_slice(&src[..n]);
        field[n..].fill(0);
        self.pos += size;
        Ok(self)
    }

    /// Fills `count` bytes with `val`, stopping at the range end.
    pub fn fill(&mut self, count: usize, val: u8) -> Result<&mut Self, CodecError> {
        if self.readonly {
            return Err(CodecError::ReadOnly);
        }
        let n = count.min(self.end - self.pos);
        self.buf[self.pos..self.pos + n].fill(val);
        self.pos += n;
        Ok(self)
    }

    // ---- reads -----------------------------------------------------------

    /// Reads a `size`-byte unsigned integer; `0` when it would cross the range end.
    pub fn get(&mut self, size: usize) -> u64 {
        self.get_with(size, self.endian)
    }

    pub fn get_with(&mut self, size: usize, endian: Endian) -> u64 {
        if !(1..=8).contains(&size) {
            return 0;
        }
        if self.pos + size > self.end {
            self.pos = self.end;
            return 0;
        }
        let src = &self.buf[self.pos..self.pos + size];
        let val = match endian {
            Endian::Little => LittleEndian::read_uint(src, size),
            Endian::Big => BigEndian::read_uint(src, size),
        };
        self.pos += size;
        val
    }

    pub fn get_u8(&mut self) -> u8 {
        self.get(1) as u8
    }

    pub fn get_u16(&mut self) -> u16 {
        self.get(2) as u16
    }

    pub fn get_u32(&mut self) -> u32 {
        self.get(4) as u32
    }

    /// Reads up to `size` bytes; shorter when the range ends first.
    pub fn get_bytes(&mut self, size: usize) -> Vec<u8> {
        let n = size.min(self.remaining());
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }

    /// Reads a string from a fixed field, terminated by `0x00` or `0xFF`.
    /// The cursor always moves past the whole field.
    pub fn get_cstring(&mut self, size: usize) -> String {
        let n = size.min(self.remaining());
        let field = &self.buf[self.pos..self.pos + n];
        let len = field
            .iter()
            .position(|&b| b == 0x00 || b == 0xFF)
            .unwrap_or(n);
        let text = String::from_utf8_lossy(&field[..len]).into_owned();
        self.pos += n;
        text
    }

    /// Byte at a range-relative position, without moving the cursor.
    pub fn peek(&self, pos: usize) -> Option<u8> {
        let abs = self.start.checked_add(pos)?;
        if abs < self.end { Some(self.buf[abs]) } else { None }
    }

    /// Additive checksum of `size` bytes at a range-relative position, clamped to the range.
    pub fn checksum(&self, pos: usize, size: usize) -> u32 {
        let s = self.start.saturating_add(pos).min(self.end);
        let e = s.saturating_add(size).min(self.end);
        additive_checksum(&self.buf[s..e])
    }
}

/// Wrapping 32-bit sum of all bytes.
pub fn additive_checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Space separated upper-case hex dump, used in log records and error messages.
pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}

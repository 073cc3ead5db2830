//! Pointer-sized reads out of raw section bytes.

use crate::{Endianness, Error};

/// Reads pointers and fixed-width integers with a given width and byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerReader {
    pointer_size: usize,
    endianness: Endianness,
}

impl PointerReader {
    /// Creates a reader for 4- or 8-byte pointers.
    pub fn new(pointer_size: usize, endianness: Endianness) -> Result<Self, Error> {
        match pointer_size {
            4 | 8 => Ok(Self {
                pointer_size,
                endianness,
            }),
            other => Err(Error::UnsupportedPointerSize(other)),
        }
    }

    /// Returns the pointer size in bytes.
    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    /// Returns the byte order.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Reads an unsigned pointer at `offset`.
    pub fn read_pointer(&self, data: &[u8], offset: usize) -> Option<u64> {
        match self.pointer_size {
            4 => self.read_u32(data, offset).map(u64::from),
            _ => self.read_u64(data, offset),
        }
    }

    /// Reads a signed pointer-sized value at `offset`.
    pub fn read_signed_pointer(&self, data: &[u8], offset: usize) -> Option<i64> {
        match self.pointer_size {
            4 => self.read_u32(data, offset).map(|v| v as i32 as i64),
            _ => self.read_u64(data, offset).map(|v| v as i64),
        }
    }

    /// Reads a `u32` at `offset`.
    pub fn read_u32(&self, data: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self.endianness {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    /// Reads a `u64` at `offset`.
    pub fn read_u64(&self, data: &[u8], offset: usize) -> Option<u64> {
        let bytes: [u8; 8] = data.get(offset..offset.checked_add(8)?)?.try_into().ok()?;
        Some(match self.endianness {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }

    /// Reads a NUL-terminated UTF-8 string at `offset`.
    pub fn read_c_str<'a>(&self, data: &'a [u8], offset: usize) -> Option<&'a str> {
        let tail = data.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        if end == 0 {
            return None;
        }
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Encodes a pointer in this reader's width and byte order.
    pub fn encode_pointer(&self, value: u64) -> Vec<u8> {
        match (self.pointer_size, self.endianness) {
            (4, Endianness::Little) => (value as u32).to_le_bytes().to_vec(),
            (4, Endianness::Big) => (value as u32).to_be_bytes().to_vec(),
            (_, Endianness::Little) => value.to_le_bytes().to_vec(),
            (_, Endianness::Big) => value.to_be_bytes().to_vec(),
        }
    }
}

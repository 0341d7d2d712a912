// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::DecodeError;

/// A bounds-checked reader over a byte slice.
///
/// Every read either consumes the bytes it returns or fails without
/// consuming past the end of the slice, so the position after a failed parse
/// is always strictly inside the input.
#[derive(Clone, Copy, Debug)]
pub struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

macro_rules! impl_read_fixed {
    ($($(#[$doc:meta])* $name:ident -> $ty:ty),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self) -> Result<$ty, DecodeError> {
                const SIZE: usize = core::mem::size_of::<$ty>();
                let bytes = self.read_bytes(SIZE)?;
                let mut raw = [0u8; SIZE];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.position == self.data.len()
    }

    /// Returns the next `len` bytes without copying them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated);
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    impl_read_fixed! {
        read_u8 -> u8,
        read_u16 -> u16,
        read_u32 -> u32,
        /// Reads a little-endian u64, e.g. a GUID or hash field.
        read_u64 -> u64,
        /// Reads a little-endian i64, e.g. an absolute code address.
        read_i64 -> i64,
    }

    /// Decodes a ULEB128 value of up to 64 bits. A failed decode leaves the
    /// cursor where it was.
    pub fn read_uleb128(&mut self) -> Result<u64, DecodeError> {
        let mut lookahead = *self;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = lookahead.read_u8()?;
            let low = u64::from(byte & 0x7F);
            if shift > 63 || (shift == 63 && low > 1) {
                return Err(DecodeError::Overflow);
            }
            value |= low << shift;
            if byte & 0x80 == 0 {
                *self = lookahead;
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Decodes a ULEB128 value that the format declares as 32-bit, such as a
    /// probe index or a record count.
    pub fn read_uleb128_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_uleb128()?
            .try_into()
            .map_err(|_| DecodeError::Overflow)
    }

    /// Decodes an SLEB128 value of up to 64 bits. A failed decode leaves the
    /// cursor where it was.
    pub fn read_sleb128(&mut self) -> Result<i64, DecodeError> {
        let mut lookahead = *self;
        let mut value = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = lookahead.read_u8()?;
            if shift > 63 {
                return Err(DecodeError::Overflow);
            }
            value |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                *self = lookahead;
                return Ok(value);
            }
        }
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Write};

/// Encodes a [`ULEB128`] value.
///
/// Serialization happens one byte at a time; use a buffered writer.
///
/// [`ULEB128`]: https://dwarfstd.org/doc/DWARF5.pdf#subsection.7.6
#[inline]
pub(crate) fn write_uleb128(mut value: u64, writer: &mut impl Write) -> io::Result<()> {
    loop {
        let byte = if value < 0x80 {
            value as u8
        } else {
            ((value & 0x7F) | 0x80) as u8
        };
        writer.write_all(&[byte])?;
        if value < 0x80 {
            return Ok(());
        }
        value >>= 7;
    }
}

/// Encodes an SLEB128 value. The encoding terminates on the first byte whose
/// high bit is clear and whose bit 6 already matches the value's sign.
#[inline]
pub(crate) fn write_sleb128(mut value: i64, writer: &mut impl Write) -> io::Result<()> {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        writer.write_all(&[if done { byte } else { byte | 0x80 }])?;
        if done {
            return Ok(());
        }
    }
}

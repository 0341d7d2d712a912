// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::EncodeError;
use crate::leb128;
use crate::probe::Label;
use rustc_hash::FxHashMap;
use std::io::{self, Write};

/// The seam between the probe emitter and the object writer.
///
/// The emitter only produces integers, label references, and label
/// differences; everything address-shaped is the streamer's problem. An
/// implementation backed by a real object writer would translate these calls
/// into section data and relocations.
pub trait ProbeStreamer {
    /// Size in bytes of an absolute code address on the target.
    fn code_pointer_size(&self) -> usize;

    fn emit_u8(&mut self, value: u8) -> io::Result<()>;

    /// Emit a fixed-width little-endian u64.
    fn emit_u64(&mut self, value: u64) -> io::Result<()>;

    fn emit_uleb128(&mut self, value: u64) -> io::Result<()>;

    fn emit_sleb128(&mut self, value: i64) -> io::Result<()>;

    /// Emit `label` as an absolute code address of [`code_pointer_size`]
    /// bytes.
    ///
    /// [`code_pointer_size`]: ProbeStreamer::code_pointer_size
    fn emit_code_address(&mut self, label: Label) -> io::Result<()>;

    /// Fold `lhs - rhs` to a constant if both addresses are already known
    /// at emission time.
    fn try_fold_address_delta(&self, lhs: Label, rhs: Label) -> Option<i64>;

    /// Record a deferred fixup for SLEB128(`lhs - rhs`), to be resolved once
    /// the object writer has laid out both labels.
    fn emit_address_delta_fixup(&mut self, lhs: Label, rhs: Label) -> io::Result<()>;
}

enum Segment {
    Bytes(Vec<u8>),
    Address(Label),
    AddressDelta { lhs: Label, rhs: Label },
}

/// A [`ProbeStreamer`] that assembles one section into a byte buffer.
///
/// Labels may be defined before or after emission; folding only succeeds for
/// labels already defined, anything else is kept as a pending segment and
/// resolved in [`SectionWriter::finish`]. This mirrors how an object writer
/// relaxes address fragments after layout.
pub struct SectionWriter {
    pointer_size: usize,
    symbols: FxHashMap<Label, u64>,
    segments: Vec<Segment>,
}

impl SectionWriter {
    pub fn new(pointer_size: usize) -> Self {
        Self {
            pointer_size,
            symbols: FxHashMap::default(),
            segments: Vec::new(),
        }
    }

    /// Assign an absolute address to a label.
    pub fn define_symbol(&mut self, label: Label, address: u64) {
        self.symbols.insert(label, address);
    }

    fn resolve(&self, label: Label) -> Result<u64, EncodeError> {
        self.symbols
            .get(&label)
            .copied()
            .ok_or(EncodeError::UnresolvedLabel(label))
    }

    fn buffer(&mut self) -> &mut Vec<u8> {
        if !matches!(self.segments.last(), Some(Segment::Bytes(_))) {
            self.segments.push(Segment::Bytes(Vec::new()));
        }
        match self.segments.last_mut() {
            Some(Segment::Bytes(bytes)) => bytes,
            // The push above makes this branch unreachable.
            _ => unreachable!(),
        }
    }

    /// Resolve every pending segment and return the section bytes.
    pub fn finish(self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Bytes(bytes) => out.extend_from_slice(bytes),
                Segment::Address(label) => {
                    let address = self.resolve(*label)?;
                    out.extend_from_slice(&address.to_le_bytes()[..self.pointer_size]);
                }
                Segment::AddressDelta { lhs, rhs } => {
                    let delta = self.resolve(*lhs)?.wrapping_sub(self.resolve(*rhs)?) as i64;
                    leb128::write_sleb128(delta, &mut out)?;
                }
            }
        }
        Ok(out)
    }
}

impl Default for SectionWriter {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ProbeStreamer for SectionWriter {
    fn code_pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn emit_u8(&mut self, value: u8) -> io::Result<()> {
        self.buffer().write_all(&[value])
    }

    fn emit_u64(&mut self, value: u64) -> io::Result<()> {
        self.buffer().write_all(&value.to_le_bytes())
    }

    fn emit_uleb128(&mut self, value: u64) -> io::Result<()> {
        leb128::write_uleb128(value, self.buffer())
    }

    fn emit_sleb128(&mut self, value: i64) -> io::Result<()> {
        leb128::write_sleb128(value, self.buffer())
    }

    fn emit_code_address(&mut self, label: Label) -> io::Result<()> {
        self.segments.push(Segment::Address(label));
        Ok(())
    }

    fn try_fold_address_delta(&self, lhs: Label, rhs: Label) -> Option<i64> {
        let lhs = *self.symbols.get(&lhs)?;
        let rhs = *self.symbols.get(&rhs)?;
        Some(lhs.wrapping_sub(rhs) as i64)
    }

    fn emit_address_delta_fixup(&mut self, lhs: Label, rhs: Label) -> io::Result<()> {
        self.segments.push(Segment::AddressDelta { lhs, rhs });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_address_resolved_at_finish() {
        let mut writer = SectionWriter::new(8);
        writer.emit_code_address(Label(7)).unwrap();
        writer.define_symbol(Label(7), 0x1122334455667788);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes, 0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn test_pointer_size_truncates_address() {
        let mut writer = SectionWriter::new(4);
        writer.define_symbol(Label(7), 0x1_0000_2000);
        writer.emit_code_address(Label(7)).unwrap();
        assert_eq!(writer.finish().unwrap(), [0x00, 0x20, 0x00, 0x00]);
    }

    #[test]
    fn test_deferred_delta_fixup() {
        let mut writer = SectionWriter::new(8);
        assert_eq!(writer.try_fold_address_delta(Label(1), Label(2)), None);
        writer.emit_u8(0xAB).unwrap();
        writer.emit_address_delta_fixup(Label(1), Label(2)).unwrap();
        writer.emit_u8(0xCD).unwrap();
        // Layout happens after emission, as in a real assembler.
        writer.define_symbol(Label(1), 0x1000);
        writer.define_symbol(Label(2), 0x1003);
        assert_eq!(writer.finish().unwrap(), [0xAB, 0x7D, 0xCD]);
    }

    #[test]
    fn test_folding_with_known_symbols() {
        let mut writer = SectionWriter::new(8);
        writer.define_symbol(Label(1), 0x1005);
        writer.define_symbol(Label(2), 0x1000);
        assert_eq!(writer.try_fold_address_delta(Label(1), Label(2)), Some(5));
        assert_eq!(writer.try_fold_address_delta(Label(2), Label(1)), Some(-5));
    }

    #[test]
    fn test_unresolved_label_is_an_error() {
        let mut writer = SectionWriter::default();
        writer.emit_code_address(Label(9)).unwrap();
        assert!(matches!(
            writer.finish(),
            Err(EncodeError::UnresolvedLabel(Label(9)))
        ));
    }
}

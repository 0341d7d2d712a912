// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::EncodeError;
use crate::streamer::ProbeStreamer;

/// Opaque handle for a machine-code position. The object writer decides the
/// final address; the encoder only ever names labels and lets the streamer
/// resolve or defer them.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Label(pub u64);

/// The probe kinds with defined semantics. The wire format reserves 4 bits,
/// so kinds up to 15 round-trip; only these three mean anything today.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ProbeKind {
    Block = 0,
    IndirectCall = 1,
    DirectCall = 2,
}

impl From<ProbeKind> for u8 {
    fn from(kind: ProbeKind) -> u8 {
        kind as u8
    }
}

/// The probe marks a call that is a tail call.
pub const PROBE_ATTR_TAIL_CALL: u8 = 0x1;
/// The probe no longer maps to a real machine instruction.
pub const PROBE_ATTR_DANGLING: u8 = 0x2;

pub(crate) const PROBE_KIND_MASK: u8 = 0x0F;
pub(crate) const PROBE_ATTR_SHIFT: u32 = 4;
pub(crate) const PROBE_ATTR_MASK: u8 = 0x07;
pub(crate) const PROBE_DELTA_FLAG: u8 = 0x80;

/// One instrumentation point, identified by `(guid, index)` and anchored to
/// a code position through its label.
///
/// `kind` is stored raw so downstream consumers can carry kinds this crate
/// does not interpret; it must still fit in 4 bits, and `attributes` in 3,
/// or emission refuses the probe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Probe {
    pub guid: u64,
    pub index: u32,
    pub kind: u8,
    pub attributes: u8,
    pub label: Label,
}

impl Probe {
    pub fn new(guid: u64, index: u32, kind: ProbeKind, attributes: u8, label: Label) -> Self {
        Self {
            guid,
            index,
            kind: kind.into(),
            attributes,
            label,
        }
    }

    /// Serializes the probe record:
    ///
    /// 1. ULEB128 index.
    /// 2. A packed byte: bit 7 set iff `last_probe` supplies a delta base,
    ///    bits 6..4 the attributes, bits 3..0 the kind.
    /// 3. Either an absolute pointer-size code address (no previous probe)
    ///    or the SLEB128 delta from the previous probe's address. A delta
    ///    the streamer cannot fold at emission time becomes a deferred
    ///    fixup the object writer resolves later.
    pub fn emit<S: ProbeStreamer>(
        &self,
        streamer: &mut S,
        last_probe: Option<&Probe>,
    ) -> Result<(), EncodeError> {
        if self.kind > PROBE_KIND_MASK {
            return Err(EncodeError::KindTooLarge(self.kind));
        }
        if self.attributes > PROBE_ATTR_MASK {
            return Err(EncodeError::AttributesTooLarge(self.attributes));
        }

        streamer.emit_uleb128(u64::from(self.index))?;

        let mut packed = self.kind | (self.attributes << PROBE_ATTR_SHIFT);
        if last_probe.is_some() {
            packed |= PROBE_DELTA_FLAG;
        }
        streamer.emit_u8(packed)?;

        match last_probe {
            Some(last) => match streamer.try_fold_address_delta(self.label, last.label) {
                Some(delta) => streamer.emit_sleb128(delta)?,
                None => streamer.emit_address_delta_fixup(self.label, last.label)?,
            },
            None => streamer.emit_code_address(self.label)?,
        }
        Ok(())
    }
}

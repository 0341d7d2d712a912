// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::probe::Label;
use std::io;

/// Errors surfaced while emitting probe sections.
///
/// Kind and attribute overflows mean the caller built an invalid probe; the
/// emitter refuses to serialize it rather than produce a stream that cannot
/// be decoded back.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A probe kind did not fit in the 4 bits the packed flag byte gives it.
    #[error("probe kind {0:#x} exceeds 15")]
    KindTooLarge(u8),
    /// Probe attributes did not fit in their 3 bits.
    #[error("probe attributes {0:#x} exceed 7")]
    AttributesTooLarge(u8),
    /// A label referenced by the section was never given an address, so a
    /// deferred fixup could not be resolved.
    #[error("no address defined for label {0:?}")]
    UnresolvedLabel(Label),
}

/// Errors surfaced while parsing the descriptor or probe sections.
///
/// Parsing is all-or-nothing: any of these aborts the build and the caller
/// is expected to discard the partially populated decoder.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A read extended past the end of the section data.
    #[error("unexpected end of section data")]
    Truncated,
    /// A ULEB128/SLEB128 value exceeded the width the format allows for it.
    #[error("varint exceeds the width declared by the format")]
    Overflow,
    /// Bytes remained after the parser consumed every record it expected.
    #[error("{0} bytes remain past the end of the last record")]
    ResidualBytes(usize),
}

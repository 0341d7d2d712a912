// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! This crate implements the codec for pseudo-probe instrumentation
//! sections: the encoder groups probes by function and inlining context
//! into per-section inline trees and serializes them with a delta-compressed
//! address stream through a [`ProbeStreamer`]; the decoder parses the two
//! sections back into an inline forest plus an address-to-probes index and
//! answers context-reconstruction queries for PGO tooling.
//!
//! Probe section: repeated function-body records, concatenated, no outer
//! length:
//!
//! ```reference
//! function-body := inline-site-index  ULEB128; omitted for top-level
//!                                     records, the decoder synthesizes
//!                                     a sequential id
//!                  guid               u64 LE
//!                  nprobes            ULEB128
//!                  num-inlined        ULEB128
//!                  probe × nprobes
//!                  function-body × num-inlined
//! probe         := index              ULEB128
//!                  packed             u8; bit7 = delta flag,
//!                                     bits6..4 = attributes,
//!                                     bits3..0 = kind
//!                  address            i64 LE        if delta flag = 0
//!                                     SLEB128 delta if delta flag = 1
//! ```
//!
//! Descriptor section: repeated, concatenated:
//!
//! ```reference
//! descriptor    := guid               u64 LE
//!                  hash               u64 LE
//!                  name-size          ULEB128
//!                  name               name-size bytes, encoding opaque
//! ```
//!
//! The first probe of a section walk carries an absolute pointer-size code
//! address; every probe after it is a signed delta from the previous
//! probe's address, and that base runs across function-body boundaries.
//! Decoders keep the same running cursor, with wrapping arithmetic.
//!
//! The decoder is zero-copy over the descriptor buffer: function names are
//! raw byte slices into it, so the buffer must outlive the decoder.

mod cursor;
mod decoder;
mod error;
mod leb128;
mod probe;
mod streamer;
mod tree;

pub use cursor::*;
pub use decoder::*;
pub use error::*;
pub use probe::*;
pub use streamer::*;
pub use tree::*;

use std::hash::BuildHasherDefault;

/// An insertion-ordered map with the fast rustc hasher; parse and emission
/// order both need to be reproducible.
pub(crate) type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::EncodeError;
use crate::probe::Probe;
use crate::streamer::ProbeStreamer;
use crate::FxIndexMap;
use log::trace;
use std::collections::BTreeMap;
use std::hash::Hash;

/// Keys one child under an inline-tree node: the probe index of the call
/// site in the parent, and the GUID of the inlined callee.
///
/// The same pair type describes one step of an inline stack, where
/// `callsite_index` is the call-site probe index *inside* `guid` at which it
/// inlined the next function down.
///
/// The derived ordering (callsite index first, then GUID) is the emission
/// order of siblings and therefore part of the wire contract.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InlineSite {
    pub callsite_index: u32,
    pub guid: u64,
}

impl InlineSite {
    pub fn new(callsite_index: u32, guid: u64) -> Self {
        Self {
            callsite_index,
            guid,
        }
    }
}

/// One function's probes grouped with the functions inlined into it.
///
/// The root is synthetic (`guid == 0`, no probes); its children are the
/// top-level functions, keyed by `(0, guid)`. Children are kept sorted so
/// that re-emitting the same tree is byte-identical no matter the insertion
/// order.
#[derive(Debug, Default)]
pub struct InlineTree {
    guid: u64,
    probes: Vec<Probe>,
    children: BTreeMap<InlineSite, InlineTree>,
}

impl InlineTree {
    /// Creates a synthetic root.
    pub fn new() -> Self {
        Self::default()
    }

    fn node(guid: u64) -> Self {
        Self {
            guid,
            ..Self::default()
        }
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn is_root(&self) -> bool {
        self.guid == 0
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty() && self.children.is_empty()
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn children(&self) -> impl Iterator<Item = (&InlineSite, &InlineTree)> {
        self.children.iter()
    }

    fn child(&mut self, site: InlineSite) -> &mut InlineTree {
        self.children
            .entry(site)
            .or_insert_with(|| InlineTree::node(site.guid))
    }

    /// Files a probe under its inline context. Must be called on the root.
    ///
    /// The inline stack reads outermost to innermost: with a stack of
    /// `[(c1, A), (c2, B)]` for a probe of C, function A inlined B at its
    /// call-site probe `c1` and B inlined C at `c2`, so the probe lands on
    /// the path `(0, A)`, `(c1, B)`, `(c2, C)`. An empty stack files the probe
    /// directly under `(0, probe.guid)`.
    pub fn add_probe(&mut self, probe: Probe, inline_stack: &[InlineSite]) {
        debug_assert!(self.is_root(), "probes are inserted through the root");

        let top_guid = match inline_stack.first() {
            Some(first) => first.guid,
            None => probe.guid,
        };
        let mut cur = self.child(InlineSite::new(0, top_guid));

        if let Some(first) = inline_stack.first() {
            let mut callsite_index = first.callsite_index;
            for site in &inline_stack[1..] {
                cur = cur.child(InlineSite::new(callsite_index, site.guid));
                callsite_index = site.callsite_index;
            }
            cur = cur.child(InlineSite::new(callsite_index, probe.guid));
        }

        cur.probes.push(probe);
    }

    /// Walks the tree, emitting each node's header and probes before its
    /// children. `last_probe` is the running address-delta base; it must
    /// start as `None` for a fresh section and is threaded through the whole
    /// walk so deltas keep compressing across function-body boundaries.
    pub fn emit<'t, S: ProbeStreamer>(
        &'t self,
        streamer: &mut S,
        last_probe: &mut Option<&'t Probe>,
    ) -> Result<(), EncodeError> {
        if self.guid != 0 {
            trace!(
                "probe group: guid={:#x} probes={} inlinees={}",
                self.guid,
                self.probes.len(),
                self.children.len()
            );
            streamer.emit_u64(self.guid)?;
            streamer.emit_uleb128(self.probes.len() as u64)?;
            streamer.emit_uleb128(self.children.len() as u64)?;
            for probe in &self.probes {
                probe.emit(streamer, *last_probe)?;
                *last_probe = Some(probe);
            }
        } else {
            debug_assert!(self.probes.is_empty(), "the root holds no probes");
        }

        for (site, child) in &self.children {
            // Top-level functions hang off the root with no inline-site
            // index on the wire; the decoder synthesizes one.
            if self.guid != 0 {
                streamer.emit_uleb128(u64::from(site.callsite_index))?;
            }
            child.emit(streamer, last_probe)?;
        }
        Ok(())
    }
}

/// The inline trees of one object file, split by output section so comdat
/// groups get their own probe stream. Sections emit in insertion order, each
/// with a fresh address-delta cursor.
#[derive(Debug)]
pub struct ProbeSections<K> {
    sections: FxIndexMap<K, InlineTree>,
}

impl<K: Eq + Hash> ProbeSections<K> {
    pub fn new() -> Self {
        Self {
            sections: FxIndexMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// The inline tree for `key`, created empty on first use.
    pub fn tree_mut(&mut self, key: K) -> &mut InlineTree {
        self.sections.entry(key).or_default()
    }

    pub fn add_probe(&mut self, key: K, probe: Probe, inline_stack: &[InlineSite]) {
        self.tree_mut(key).add_probe(probe, inline_stack);
    }

    /// Emits every section. `switch_section` activates the output section
    /// for a key on the streamer and may return `false` to skip it (for
    /// instance a comdat group that was discarded). An empty container
    /// touches the streamer not at all.
    pub fn emit<S: ProbeStreamer>(
        &self,
        streamer: &mut S,
        mut switch_section: impl FnMut(&mut S, &K) -> bool,
    ) -> Result<(), EncodeError> {
        for (key, tree) in &self.sections {
            if !switch_section(streamer, key) {
                continue;
            }
            let mut last_probe = None;
            tree.emit(streamer, &mut last_probe)?;
        }
        Ok(())
    }
}

impl<K: Eq + Hash> Default for ProbeSections<K> {
    fn default() -> Self {
        Self::new()
    }
}

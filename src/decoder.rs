// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cursor::Cursor;
use crate::error::DecodeError;
use crate::probe::{
    ProbeKind, PROBE_ATTR_DANGLING, PROBE_ATTR_MASK, PROBE_ATTR_SHIFT, PROBE_ATTR_TAIL_CALL,
    PROBE_DELTA_FLAG, PROBE_KIND_MASK,
};
use crate::tree::InlineSite;
use crate::FxIndexMap;
use log::trace;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

/// A function descriptor from the descriptor section.
///
/// The name borrows the section buffer directly; nothing about its encoding
/// is validated or assumed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FuncDesc<'a> {
    pub guid: u64,
    pub hash: u64,
    pub name: &'a [u8],
}

impl<'a> FuncDesc<'a> {
    /// The name decoded for display. Lossy on purpose; the wire format does
    /// not promise UTF-8.
    pub fn display_name(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.name)
    }
}

/// One frame of a reconstructed inline context: a function name and the
/// probe index inside it (the call-site index for caller frames, the probe's
/// own index for the leaf frame).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameLocation<'a> {
    pub name: &'a [u8],
    pub index: u32,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
struct NodeId(u32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct ProbeId(u32);

const ROOT: NodeId = NodeId(0);

impl NodeId {
    fn from_offset(offset: usize) -> Self {
        debug_assert!(u32::try_from(offset).is_ok());
        Self(offset as u32)
    }
}

impl ProbeId {
    fn from_offset(offset: usize) -> Self {
        debug_assert!(u32::try_from(offset).is_ok());
        Self(offset as u32)
    }
}

/// A probe reconstructed from the probe section, with its address-delta
/// chain already resolved to an absolute address.
#[derive(Clone, Debug)]
pub struct DecodedProbe {
    pub address: u64,
    pub guid: u64,
    pub index: u32,
    /// Raw 4-bit kind; kinds this crate does not know are carried as-is.
    pub kind: u8,
    /// Raw 3-bit attribute set.
    pub attributes: u8,
    node: NodeId,
}

impl DecodedProbe {
    pub fn is_block(&self) -> bool {
        self.kind == ProbeKind::Block as u8
    }

    pub fn is_indirect_call(&self) -> bool {
        self.kind == ProbeKind::IndirectCall as u8
    }

    pub fn is_direct_call(&self) -> bool {
        self.kind == ProbeKind::DirectCall as u8
    }

    pub fn is_call(&self) -> bool {
        self.is_indirect_call() || self.is_direct_call()
    }

    pub fn is_tail_call(&self) -> bool {
        self.attributes & PROBE_ATTR_TAIL_CALL != 0
    }

    pub fn is_dangling(&self) -> bool {
        self.attributes & PROBE_ATTR_DANGLING != 0
    }
}

/// A node of the decoded inline forest.
///
/// Children own nothing directly; the arena inside [`ProbeDecoder`] owns
/// every node and probe, and nodes refer to each other through stable ids.
#[derive(Debug)]
pub struct DecodedInlineTree {
    guid: u64,
    site: InlineSite,
    parent: Option<NodeId>,
    children: FxIndexMap<InlineSite, NodeId>,
    probes: Vec<ProbeId>,
}

impl DecodedInlineTree {
    pub fn guid(&self) -> u64 {
        self.guid
    }

    /// How this node is keyed under its parent. For top-level functions the
    /// call-site index is a synthesized sequential id, which context
    /// reconstruction never reads.
    pub fn inline_site(&self) -> InlineSite {
        self.site
    }
}

/// Decoder for the descriptor and probe sections.
///
/// Build the descriptor map and the address index first; all queries after
/// that are `&self` and safe to share across threads. Both builds are
/// all-or-nothing; on error the caller should drop the decoder, partially
/// populated state and all.
#[derive(Debug)]
pub struct ProbeDecoder<'a> {
    func_descs: BTreeMap<u64, FuncDesc<'a>>,
    nodes: Vec<DecodedInlineTree>,
    probes: Vec<DecodedProbe>,
    address_index: FxIndexMap<u64, Vec<ProbeId>>,
}

impl<'a> ProbeDecoder<'a> {
    pub fn new() -> Self {
        let root = DecodedInlineTree {
            guid: 0,
            site: InlineSite::new(0, 0),
            parent: None,
            children: FxIndexMap::default(),
            probes: Vec::new(),
        };
        Self {
            func_descs: BTreeMap::new(),
            nodes: vec![root],
            probes: Vec::new(),
            address_index: FxIndexMap::default(),
        }
    }

    /// Parses the descriptor section into the GUID-to-descriptor map.
    ///
    /// Records are `(guid u64 LE, hash u64 LE, name_size ULEB128, name
    /// bytes)` back to back with no outer length. Name slices borrow `data`,
    /// so the buffer must outlive the decoder. A duplicated GUID keeps the
    /// last descriptor seen.
    pub fn build_func_desc_map(&mut self, data: &'a [u8]) -> Result<(), DecodeError> {
        let mut cursor = Cursor::new(data);
        while !cursor.is_empty() {
            let guid = cursor.read_u64()?;
            let hash = cursor.read_u64()?;
            let name_size = cursor.read_uleb128_u32()?;
            let name = cursor.read_bytes(name_size as usize)?;
            self.func_descs.insert(guid, FuncDesc { guid, hash, name });
        }
        trace!("decoded {} function descriptors", self.func_descs.len());
        Ok(())
    }

    /// Parses the probe section, keeping every top-level function.
    pub fn build_address_index(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.build_address_index_with_filter(data, &HashSet::new())
    }

    /// Parses the probe section, keeping only top-level functions whose GUID
    /// is in `guid_filter` (an empty filter keeps everything). Filtered
    /// records are still consumed structurally so the records after them
    /// stay aligned, and they still advance the shared address cursor.
    pub fn build_address_index_with_filter(
        &mut self,
        data: &[u8],
        guid_filter: &HashSet<u64>,
    ) -> Result<(), DecodeError> {
        let mut cursor = Cursor::new(data);
        let mut last_addr = 0u64;
        while !cursor.is_empty() {
            self.parse_function_body(&mut cursor, Some(ROOT), &mut last_addr, guid_filter)?;
        }
        trace!(
            "decoded {} probes at {} addresses",
            self.probes.len(),
            self.address_index.len()
        );
        Ok(())
    }

    fn parse_function_body(
        &mut self,
        cursor: &mut Cursor<'_>,
        parent: Option<NodeId>,
        last_addr: &mut u64,
        guid_filter: &HashSet<u64>,
    ) -> Result<(), DecodeError> {
        let at_root = parent == Some(ROOT);
        // Top-level records carry no inline-site index on the wire; use a
        // sequential id instead.
        let index = if at_root {
            self.node(ROOT).children.len() as u32
        } else {
            cursor.read_uleb128_u32()?
        };
        let guid = cursor.read_u64()?;

        let mut cur = parent;
        if at_root && !guid_filter.is_empty() && !guid_filter.contains(&guid) {
            cur = None;
        }
        if let Some(parent_id) = cur {
            cur = Some(self.get_or_add_node(parent_id, InlineSite::new(index, guid)));
        }

        let num_probes = cursor.read_uleb128_u32()?;
        let num_inlinees = cursor.read_uleb128_u32()?;
        for _ in 0..num_probes {
            let index = cursor.read_uleb128_u32()?;
            let packed = cursor.read_u8()?;
            let kind = packed & PROBE_KIND_MASK;
            let attributes = (packed >> PROBE_ATTR_SHIFT) & PROBE_ATTR_MASK;
            let address = if packed & PROBE_DELTA_FLAG != 0 {
                let offset = cursor.read_sleb128()?;
                last_addr.wrapping_add(offset as u64)
            } else {
                cursor.read_i64()? as u64
            };
            if let Some(node_id) = cur {
                self.add_probe(node_id, address, index, kind, attributes);
            }
            // The delta base advances even across filtered-out probes; it is
            // shared by the whole section.
            *last_addr = address;
        }
        for _ in 0..num_inlinees {
            self.parse_function_body(cursor, cur, last_addr, guid_filter)?;
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> &DecodedInlineTree {
        &self.nodes[id.0 as usize]
    }

    fn get_or_add_node(&mut self, parent: NodeId, site: InlineSite) -> NodeId {
        if let Some(id) = self.node(parent).children.get(&site) {
            return *id;
        }
        let id = NodeId::from_offset(self.nodes.len());
        self.nodes.push(DecodedInlineTree {
            guid: site.guid,
            site,
            parent: Some(parent),
            children: FxIndexMap::default(),
            probes: Vec::new(),
        });
        self.nodes[parent.0 as usize].children.insert(site, id);
        id
    }

    fn add_probe(&mut self, node: NodeId, address: u64, index: u32, kind: u8, attributes: u8) {
        let guid = self.node(node).guid;
        let probe_id = ProbeId::from_offset(self.probes.len());
        self.probes.push(DecodedProbe {
            address,
            guid,
            index,
            kind,
            attributes,
            node,
        });
        self.address_index.entry(address).or_default().push(probe_id);
        self.nodes[node.0 as usize].probes.push(probe_id);
    }

    pub fn func_desc_for_guid(&self, guid: u64) -> Option<&FuncDesc<'a>> {
        self.func_descs.get(&guid)
    }

    /// Descriptors in ascending GUID order.
    pub fn func_descs(&self) -> impl Iterator<Item = &FuncDesc<'a>> {
        self.func_descs.values()
    }

    /// Every decoded probe, in parse order.
    pub fn probes(&self) -> impl Iterator<Item = &DecodedProbe> {
        self.probes.iter()
    }

    /// The probes decoded at `address`, in parse order.
    pub fn probes_at_address(&self, address: u64) -> impl Iterator<Item = &DecodedProbe> {
        self.address_index
            .get(&address)
            .into_iter()
            .flatten()
            .map(move |id| &self.probes[id.0 as usize])
    }

    /// The unique call-kind probe at a call-site address. Two call probes at
    /// one address is a caller contract violation; the first wins.
    pub fn call_probe_at_address(&self, address: u64) -> Option<&DecodedProbe> {
        let mut call_probe = None;
        for probe in self.probes_at_address(address) {
            if probe.is_call() {
                debug_assert!(
                    call_probe.is_none(),
                    "a call-site address holds at most one call probe"
                );
                if call_probe.is_none() {
                    call_probe = Some(probe);
                }
            }
        }
        call_probe
    }

    /// The inline-forest node for the function (at its inlining depth) that
    /// produced this probe.
    pub fn inline_tree_node(&self, probe: &DecodedProbe) -> &DecodedInlineTree {
        self.node(probe.node)
    }

    /// The parent of `node`; the synthetic root for top-level functions,
    /// `None` for the root itself.
    pub fn parent_node(&self, node: &DecodedInlineTree) -> Option<&DecodedInlineTree> {
        node.parent.map(|id| self.node(id))
    }

    /// Reconstructs the probe's inlining context in caller-to-callee order.
    /// Without the leaf, a top-level probe has an empty context; with it,
    /// the probe's own `(function, index)` frame is appended.
    pub fn inline_context_for_probe(
        &self,
        probe: &DecodedProbe,
        include_leaf: bool,
    ) -> Vec<FrameLocation<'a>> {
        let mut context = Vec::new();
        let mut cur = self.node(probe.node);
        while let Some(parent_id) = cur.parent {
            let parent = self.node(parent_id);
            if parent.guid == 0 {
                // Top-level reached; the synthetic root is not a frame.
                break;
            }
            context.push(FrameLocation {
                name: self.func_name(parent.guid),
                index: cur.site.callsite_index,
            });
            cur = parent;
        }
        context.reverse();
        if include_leaf {
            context.push(FrameLocation {
                name: self.func_name(probe.guid),
                index: probe.index,
            });
        }
        context
    }

    /// The context as a `name:index` chain joined by `" @ "`, leaf excluded.
    /// Top-level probes yield an empty string.
    pub fn inline_context_str(&self, probe: &DecodedProbe) -> String {
        let mut out = String::new();
        for frame in self.inline_context_for_probe(probe, false) {
            if !out.is_empty() {
                out.push_str(" @ ");
            }
            out.push_str(&String::from_utf8_lossy(frame.name));
            out.push(':');
            out.push_str(&frame.index.to_string());
        }
        out
    }

    /// The descriptor of the function that inlined this probe's owner, or
    /// `None` for probes of top-level functions.
    pub fn inliner_desc_for_probe(&self, probe: &DecodedProbe) -> Option<&FuncDesc<'a>> {
        let node = self.node(probe.node);
        let parent = self.node(node.parent?);
        if parent.guid == 0 {
            return None;
        }
        self.func_desc_for_guid(parent.guid)
    }

    fn func_name(&self, guid: u64) -> &'a [u8] {
        debug_assert!(
            self.func_descs.contains_key(&guid),
            "a descriptor must exist for a decoded GUID"
        );
        self.func_descs.get(&guid).map(|desc| desc.name).unwrap_or(b"")
    }
}

impl Default for ProbeDecoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios: bytes produced by the emitter are fed straight
//! back into the decoder and the reconstructed forest is checked against
//! the inserted probes.

use datadog_pseudo_probe::{
    DecodedProbe, InlineSite, InlineTree, Label, Probe, ProbeDecoder, ProbeKind, ProbeSections,
    SectionWriter, PROBE_ATTR_TAIL_CALL,
};
use std::collections::HashSet;

fn emit_tree(tree: &InlineTree, symbols: &[(Label, u64)]) -> Vec<u8> {
    let mut writer = SectionWriter::new(8);
    for (label, address) in symbols {
        writer.define_symbol(*label, *address);
    }
    let mut last_probe = None;
    tree.emit(&mut writer, &mut last_probe).unwrap();
    writer.finish().unwrap()
}

/// Builds a descriptor section; names must stay under 128 bytes so the
/// length fits one ULEB128 byte.
fn desc_section(descs: &[(u64, u64, &[u8])]) -> Vec<u8> {
    let mut data = Vec::new();
    for (guid, hash, name) in descs {
        assert!(name.len() < 0x80);
        data.extend_from_slice(&guid.to_le_bytes());
        data.extend_from_slice(&hash.to_le_bytes());
        data.push(name.len() as u8);
        data.extend_from_slice(name);
    }
    data
}

fn top_level_guid(decoder: &ProbeDecoder, probe: &DecodedProbe) -> u64 {
    let mut node = decoder.inline_tree_node(probe);
    while let Some(parent) = decoder.parent_node(node) {
        if parent.guid() == 0 {
            break;
        }
        node = parent;
    }
    node.guid()
}

#[test]
fn minimal_block_probe_emits_known_bytes() {
    let mut tree = InlineTree::new();
    tree.add_probe(Probe::new(0xAAAA, 1, ProbeKind::Block, 0, Label(1)), &[]);
    let bytes = emit_tree(&tree, &[(Label(1), 0x1000)]);

    let mut expected = Vec::new();
    expected.extend_from_slice(&0xAAAAu64.to_le_bytes());
    // one probe, no inlinees, then index 1 with an absolute block record
    expected.extend_from_slice(&[0x01, 0x00, 0x01, 0x00]);
    expected.extend_from_slice(&0x1000u64.to_le_bytes());
    assert_eq!(bytes, expected);

    let mut decoder = ProbeDecoder::new();
    decoder.build_address_index(&bytes).unwrap();
    let probe = decoder.probes_at_address(0x1000).next().unwrap();
    assert_eq!(probe.guid, 0xAAAA);
    assert_eq!(probe.index, 1);
    assert!(probe.is_block());
    assert_eq!(probe.attributes, 0);
    assert!(decoder.inline_context_for_probe(probe, false).is_empty());
}

#[test]
fn second_probe_encodes_as_sleb_delta() {
    let mut tree = InlineTree::new();
    tree.add_probe(Probe::new(0xAAAA, 1, ProbeKind::Block, 0, Label(1)), &[]);
    tree.add_probe(Probe::new(0xAAAA, 2, ProbeKind::Block, 0, Label(2)), &[]);
    let bytes = emit_tree(&tree, &[(Label(1), 0x1000), (Label(2), 0x1005)]);

    // guid + counts + first probe, then the delta-encoded second probe.
    let absolute_part = 8 + 2 + (1 + 1 + 8);
    assert_eq!(&bytes[absolute_part..], &[0x02, 0x80, 0x05]);

    let mut decoder = ProbeDecoder::new();
    decoder.build_address_index(&bytes).unwrap();
    assert_eq!(decoder.probes_at_address(0x1005).next().unwrap().index, 2);
}

#[test]
fn inlined_probe_reconstructs_its_context() {
    let mut tree = InlineTree::new();
    tree.add_probe(
        Probe::new(0xA, 7, ProbeKind::DirectCall, PROBE_ATTR_TAIL_CALL, Label(1)),
        &[],
    );
    tree.add_probe(
        Probe::new(0xB, 1, ProbeKind::Block, 0, Label(2)),
        &[InlineSite::new(7, 0xA)],
    );
    let bytes = emit_tree(&tree, &[(Label(1), 0x1000), (Label(2), 0x1010)]);
    let descs = desc_section(&[(0xA, 100, b"A"), (0xB, 200, b"B")]);

    let mut decoder = ProbeDecoder::new();
    decoder.build_func_desc_map(&descs).unwrap();
    decoder.build_address_index(&bytes).unwrap();

    let block = decoder.probes_at_address(0x1010).next().unwrap();
    assert_eq!(block.guid, 0xB);

    let context = decoder.inline_context_for_probe(block, false);
    assert_eq!(context.len(), 1);
    assert_eq!((context[0].name, context[0].index), (b"A".as_slice(), 7));

    let with_leaf = decoder.inline_context_for_probe(block, true);
    assert_eq!(with_leaf.len(), 2);
    assert_eq!((with_leaf[1].name, with_leaf[1].index), (b"B".as_slice(), 1));

    assert_eq!(decoder.inline_context_str(block), "A:7");
    assert_eq!(decoder.inliner_desc_for_probe(block).unwrap().guid, 0xA);

    let call = decoder.call_probe_at_address(0x1000).unwrap();
    assert!(call.is_direct_call());
    assert!(call.is_tail_call());
    assert_eq!(decoder.inliner_desc_for_probe(call).map(|d| d.guid), None);
}

#[test]
fn guid_filter_contains_every_decoded_probe() {
    let g1 = 0x1111u64;
    let g2 = 0x2222u64;
    let mut tree = InlineTree::new();
    tree.add_probe(Probe::new(g1, 1, ProbeKind::Block, 0, Label(1)), &[]);
    tree.add_probe(
        Probe::new(0xC, 1, ProbeKind::Block, 0, Label(2)),
        &[InlineSite::new(4, g1)],
    );
    tree.add_probe(Probe::new(g2, 1, ProbeKind::Block, 0, Label(3)), &[]);
    tree.add_probe(
        Probe::new(0xC, 2, ProbeKind::Block, 0, Label(4)),
        &[InlineSite::new(9, g2)],
    );
    let bytes = emit_tree(
        &tree,
        &[
            (Label(1), 0x1000),
            (Label(2), 0x1008),
            (Label(3), 0x2000),
            (Label(4), 0x2008),
        ],
    );

    let mut decoder = ProbeDecoder::new();
    decoder
        .build_address_index_with_filter(&bytes, &HashSet::from([g2]))
        .unwrap();

    let decoded: Vec<_> = decoder.probes().collect();
    assert_eq!(decoded.len(), 2);
    for probe in &decoded {
        assert_eq!(top_level_guid(&decoder, probe), g2);
    }
    assert_eq!(decoder.probes_at_address(0x1000).count(), 0);
    assert_eq!(decoder.probes_at_address(0x2008).count(), 1);
}

#[test]
fn every_prefix_truncation_fails() {
    // A single function-body record, so any strict prefix cuts a field.
    let mut tree = InlineTree::new();
    tree.add_probe(Probe::new(0xA, 7, ProbeKind::DirectCall, 0, Label(1)), &[]);
    tree.add_probe(
        Probe::new(0xB, 1, ProbeKind::Block, 0, Label(2)),
        &[InlineSite::new(7, 0xA)],
    );
    let bytes = emit_tree(&tree, &[(Label(1), 0x1000), (Label(2), 0x1010)]);

    for len in 1..bytes.len() {
        let mut decoder = ProbeDecoder::new();
        assert!(
            decoder.build_address_index(&bytes[..len]).is_err(),
            "prefix of {len} bytes decoded successfully"
        );
    }

    // One descriptor record, same argument: no interior record boundary.
    let descs = desc_section(&[(0xA, 100, b"A")]);
    for len in 1..descs.len() {
        let mut decoder = ProbeDecoder::new();
        assert!(decoder.build_func_desc_map(&descs[..len]).is_err());
    }
}

#[test]
fn insertion_order_does_not_change_the_bytes() {
    let symbols = [
        (Label(1), 0x1000),
        (Label(2), 0x1004),
        (Label(3), 0x1008),
        (Label(4), 0x100C),
    ];
    let probes: [(Probe, Vec<InlineSite>); 4] = [
        (Probe::new(0xA, 1, ProbeKind::Block, 0, Label(1)), vec![]),
        (
            Probe::new(0xB, 1, ProbeKind::Block, 0, Label(2)),
            vec![InlineSite::new(2, 0xA)],
        ),
        (
            Probe::new(0xC, 1, ProbeKind::Block, 0, Label(3)),
            vec![InlineSite::new(2, 0xA)],
        ),
        (
            Probe::new(0xD, 1, ProbeKind::Block, 0, Label(4)),
            vec![InlineSite::new(2, 0xA), InlineSite::new(5, 0xD)],
        ),
    ];

    let mut forward = InlineTree::new();
    for (probe, stack) in &probes {
        forward.add_probe(*probe, stack);
    }
    let mut reversed = InlineTree::new();
    for (probe, stack) in probes.iter().rev() {
        reversed.add_probe(*probe, stack);
    }

    assert_eq!(emit_tree(&forward, &symbols), emit_tree(&reversed, &symbols));
}

#[test]
fn delta_and_absolute_streams_decode_identically() {
    // The emitter's delta-compressed stream...
    let mut tree = InlineTree::new();
    let addresses = [0x1000u64, 0x1005, 0x0FF0, 0x2000];
    for (i, _) in addresses.iter().enumerate() {
        tree.add_probe(
            Probe::new(0xA, i as u32 + 1, ProbeKind::Block, 0, Label(i as u64 + 1)),
            &[],
        );
    }
    let symbols: Vec<_> = addresses
        .iter()
        .enumerate()
        .map(|(i, addr)| (Label(i as u64 + 1), *addr))
        .collect();
    let delta_stream = emit_tree(&tree, &symbols);

    // ...against a hand-built stream where every probe is absolute.
    let mut absolute_stream = Vec::new();
    absolute_stream.extend_from_slice(&0xAu64.to_le_bytes());
    absolute_stream.extend_from_slice(&[addresses.len() as u8, 0x00]);
    for (i, addr) in addresses.iter().enumerate() {
        absolute_stream.extend_from_slice(&[i as u8 + 1, 0x00]);
        absolute_stream.extend_from_slice(&addr.to_le_bytes());
    }

    let mut from_delta = ProbeDecoder::new();
    from_delta.build_address_index(&delta_stream).unwrap();
    let mut from_absolute = ProbeDecoder::new();
    from_absolute.build_address_index(&absolute_stream).unwrap();

    let mut delta_probes: Vec<_> = from_delta.probes().map(|p| (p.index, p.address)).collect();
    let mut absolute_probes: Vec<_> = from_absolute
        .probes()
        .map(|p| (p.index, p.address))
        .collect();
    delta_probes.sort_unstable();
    absolute_probes.sort_unstable();
    assert_eq!(delta_probes, absolute_probes);
}

#[test]
fn each_section_restarts_the_delta_base() {
    let mut sections = ProbeSections::new();
    sections.add_probe(
        "text.main",
        Probe::new(0xA, 1, ProbeKind::Block, 0, Label(1)),
        &[],
    );
    sections.add_probe(
        "text.main",
        Probe::new(0xA, 2, ProbeKind::Block, 0, Label(2)),
        &[],
    );
    sections.add_probe(
        "text.cold",
        Probe::new(0xB, 1, ProbeKind::Block, 0, Label(3)),
        &[],
    );
    sections.add_probe(
        "text.cold",
        Probe::new(0xB, 2, ProbeKind::Block, 0, Label(4)),
        &[],
    );

    let mut writer = SectionWriter::new(8);
    writer.define_symbol(Label(1), 0x1000);
    writer.define_symbol(Label(2), 0x1008);
    writer.define_symbol(Label(3), 0x9000);
    writer.define_symbol(Label(4), 0x9010);
    sections.emit(&mut writer, |_, _| true).unwrap();
    let bytes = writer.finish().unwrap();

    // Section one: guid + counts + absolute probe + one-byte-delta probe.
    let first_section_len = 8 + 2 + (1 + 1 + 8) + 3;
    // The first probe of the second section is absolute again.
    let packed = bytes[first_section_len + 8 + 2 + 1];
    assert_eq!(packed & 0x80, 0);

    // Decoding both sections as one stream of function bodies still yields
    // the right addresses, because each section re-anchors.
    let mut decoder = ProbeDecoder::new();
    decoder.build_address_index(&bytes).unwrap();
    for address in [0x1000u64, 0x1008, 0x9000, 0x9010] {
        assert_eq!(decoder.probes_at_address(address).count(), 1, "{address:#x}");
    }
}

#[test]
fn random_probe_sets_round_trip() {
    let names: [&[u8]; 4] = [b"alpha", b"beta", b"gamma", b"delta"];
    let guid_of = |sel: u8| u64::from(sel % 4) + 1;

    bolero::check!()
        .with_type::<Vec<(u8, u8, u8, u8, (u8, u8))>>()
        .for_each(|entries| {
            let mut tree = InlineTree::new();
            let mut symbols = Vec::new();
            let mut inserted = Vec::new();

            for (i, (guid_sel, index, kind_sel, attr, stack_seed)) in
                entries.iter().take(24).enumerate()
            {
                let kind = match kind_sel % 3 {
                    0 => ProbeKind::Block,
                    1 => ProbeKind::IndirectCall,
                    _ => ProbeKind::DirectCall,
                };
                let label = Label(i as u64 + 1);
                // Spread addresses out so call probes never collide.
                let address = 0x4000 + (i as u64) * 0x10;
                symbols.push((label, address));

                let depth = usize::from(stack_seed.0 % 3);
                let stack: Vec<InlineSite> = (0..depth)
                    .map(|level| {
                        InlineSite::new(
                            u32::from(stack_seed.1 % 7) + 1 + level as u32,
                            guid_of(stack_seed.1.wrapping_add(level as u8)),
                        )
                    })
                    .collect();

                let probe = Probe::new(
                    guid_of(*guid_sel),
                    u32::from(*index) + 1,
                    kind,
                    attr % 8,
                    label,
                );
                tree.add_probe(probe, &stack);
                inserted.push((probe, stack, address));
            }

            let bytes = emit_tree(&tree, &symbols);
            let descs: Vec<(u64, u64, &[u8])> = (0u8..4)
                .map(|sel| (guid_of(sel), 0, names[usize::from(sel % 4)]))
                .collect();
            let desc_bytes = desc_section(&descs);

            let mut decoder = ProbeDecoder::new();
            decoder.build_func_desc_map(&desc_bytes).unwrap();
            decoder.build_address_index(&bytes).unwrap();
            assert_eq!(decoder.probes().count(), inserted.len());

            for (probe, stack, address) in &inserted {
                // Each stack entry projects to one caller frame: the
                // function's name and the call-site index inside it.
                let expected_context: Vec<(&[u8], u32)> = stack
                    .iter()
                    .map(|site| {
                        let desc = decoder.func_desc_for_guid(site.guid).unwrap();
                        (desc.name, site.callsite_index)
                    })
                    .collect();

                let found = decoder.probes_at_address(*address).any(|decoded| {
                    if (decoded.guid, decoded.index, decoded.kind, decoded.attributes)
                        != (probe.guid, probe.index, probe.kind, probe.attributes)
                    {
                        return false;
                    }
                    let context: Vec<(&[u8], u32)> = decoder
                        .inline_context_for_probe(decoded, false)
                        .iter()
                        .map(|frame| (frame.name, frame.index))
                        .collect();
                    context == expected_context
                });
                assert!(found, "no decoded probe matches {probe:?}");
            }
        });
}

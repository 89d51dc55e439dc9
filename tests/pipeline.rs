//! End-to-end exercise of the block coding core: parse a codestream
//! header, derive the tile geometry, entropy-code every code-block of
//! the tile through the worker pool, then rate-allocate the results
//! into layered packets.

use ebcot_rs::code_block::SIGN_BIT;
use ebcot_rs::parallel::BlockCoderPool;
use ebcot_rs::progression::TileProgressionInput;
use ebcot_rs::rate_allocator::{PacketBody, PacketRef, PacketSink};
use ebcot_rs::{
    BlockDecoder, BlockId, CodeBlock, CoderOptions, Geometry, HeaderParser, J2kError, LayerSpec,
    ProgressionOrder, RateAllocator, SubbandOrientation,
};

fn canonical_header(width: u32, height: u32, levels: u8, cb_exp: u8) -> Vec<u8> {
    let mut data = vec![0xFF, 0x4F];
    // SIZ
    data.extend([0xFF, 0x51]);
    data.extend(41u16.to_be_bytes());
    data.extend(0u16.to_be_bytes());
    data.extend(width.to_be_bytes());
    data.extend(height.to_be_bytes());
    data.extend(0u32.to_be_bytes());
    data.extend(0u32.to_be_bytes());
    data.extend(width.to_be_bytes());
    data.extend(height.to_be_bytes());
    data.extend(0u32.to_be_bytes());
    data.extend(0u32.to_be_bytes());
    data.extend(1u16.to_be_bytes());
    data.extend([0x07, 0x01, 0x01]);
    // COD
    data.extend([0xFF, 0x52]);
    data.extend(12u16.to_be_bytes());
    data.push(0x00);
    data.push(0x00); // LRCP
    data.extend(2u16.to_be_bytes()); // two layers
    data.push(0x00);
    data.push(levels);
    data.push(cb_exp - 2);
    data.push(cb_exp - 2);
    data.push(0x00);
    data.push(0x01); // reversible 5-3
    // QCD, reversible with 2 guard bits
    let n_bands = 3 * levels as usize + 1;
    data.extend([0xFF, 0x5C]);
    data.extend(((3 + n_bands) as u16).to_be_bytes());
    data.push(2 << 5);
    for _ in 0..n_bands {
        data.push(8 << 3);
    }
    // SOT / SOD
    data.extend([0xFF, 0x90]);
    data.extend(10u16.to_be_bytes());
    data.extend(0u16.to_be_bytes());
    data.extend(0u32.to_be_bytes());
    data.push(0);
    data.push(1);
    data.extend([0xFF, 0x93]);
    data
}

struct CountingSink {
    packets: Vec<(u16, u8, u32, usize)>,
}

impl PacketSink for CountingSink {
    fn encode_packet(
        &mut self,
        packet: &PacketRef<'_>,
        simulate: bool,
    ) -> Result<PacketBody, J2kError> {
        let body_len: usize = packet.blocks.iter().map(|b| b.rate_end - b.rate_start).sum();
        if !simulate {
            self.packets.push((
                packet.slot.layer,
                packet.slot.resolution,
                packet.slot.precinct,
                body_len,
            ));
        }
        Ok(PacketBody { header_len: 2, body_len })
    }

    fn is_packet_writable(&self) -> bool {
        true
    }
}

fn synth_block(id: BlockId, size: usize, seed: u32) -> CodeBlock {
    let mut data = vec![0i32; size * size];
    for (i, v) in data.iter_mut().enumerate() {
        let r = (i as u32).wrapping_mul(seed.wrapping_mul(2654435761).max(3));
        let mag = (r >> 16) & 0xFF;
        let mag = if i % 4 == 0 { 0 } else { mag };
        let neg = (r >> 9) & 1 == 1 && mag != 0;
        *v = (mag | if neg { SIGN_BIT } else { 0 }) as i32;
    }
    CodeBlock::new(id, data, size, size, SubbandOrientation::LL, 9)
}

#[test]
fn header_to_packets_pipeline() {
    let header = canonical_header(256, 256, 5, 6);
    let mut parser = HeaderParser::new();
    let sot = parser.parse_main_header(&header).unwrap();
    let info = parser.parse_tile_part_header(&header[sot..]).unwrap();
    assert_eq!(info.tile, 0);
    let spec = parser.into_spec();

    let mut geom = Geometry::new(&spec).unwrap();
    geom.set_tile(0);
    let coding = spec.coding_for(0, 0).unwrap();
    assert_eq!(coding.num_layers, 2);
    assert_eq!(coding.code_block_width_exp, 6);

    // Entropy-code a handful of code-blocks of the lowest resolution
    // through the pool.
    let opts = CoderOptions::default();
    let mut pool = BlockCoderPool::new(4, opts);
    let n_blocks = 4u32;
    for i in 0..n_blocks {
        let id = BlockId::new(0, 0, 0, SubbandOrientation::LL, i);
        pool.submit(0, synth_block(id, 8, i + 1), 0);
    }

    let mut allocator = RateAllocator::new(vec![
        LayerSpec { target_bytes: Some(120), optimize: true },
        LayerSpec { target_bytes: None, optimize: false },
    ]);
    while let Some(result) = pool.collect(0) {
        allocator.add_block(result.coded, result.precinct);
    }
    assert!(!pool.any_failed());
    assert_eq!(allocator.num_blocks(), n_blocks as usize);

    let tile_input = TileProgressionInput::from_geometry(&geom, &spec, 0, coding.num_layers);
    let mut sink = CountingSink { packets: Vec::new() };
    let thresholds = allocator
        .allocate(
            &[tile_input],
            spec.coding_for(0, 0).unwrap().progression,
            &mut sink,
        )
        .unwrap();

    // Non-increasing thresholds, final layer lossless.
    assert_eq!(thresholds.len(), 2);
    assert!(thresholds[0] >= thresholds[1]);
    assert_eq!(thresholds[1], 0.0);

    // Layer 0 honors its byte budget.
    let layer0: usize =
        sink.packets.iter().filter(|p| p.0 == 0).map(|p| p.3 + 2).sum();
    assert!(layer0 <= 120, "layer 0 cost {layer0} bytes");

    // Every packet of the LRCP sequence for the populated resolution
    // appears exactly once per layer.
    let layer0_count = sink.packets.iter().filter(|p| p.0 == 0).count();
    let layer1_count = sink.packets.iter().filter(|p| p.0 == 1).count();
    assert_eq!(layer0_count, layer1_count);
}

#[test]
fn pool_and_sequential_agree_end_to_end() {
    let opts = CoderOptions::default();
    let blocks: Vec<CodeBlock> = (0..5)
        .map(|i| {
            synth_block(BlockId::new(0, 0, 0, SubbandOrientation::LL, i), 16, 97 + i)
        })
        .collect();

    let mut pool = BlockCoderPool::new(2, opts);
    for b in &blocks {
        pool.submit(0, b.clone(), 0);
    }
    let mut results = pool.collect_all();
    results.sort_by_key(|r| r.coded.id);

    let mut decoder = BlockDecoder::new(opts);
    for (result, original) in results.iter().zip(&blocks) {
        let decoded = decoder.decode(
            &result.coded,
            original.width,
            original.height,
            original.orientation,
            usize::MAX,
        );
        for (i, &expect) in original.data.iter().enumerate() {
            let expect = if expect as u32 & !SIGN_BIT == 0 { 0 } else { expect };
            assert_eq!(decoded[i], expect, "block {} sample {i}", result.coded.id.index);
        }
    }
}

#[test]
fn infeasible_total_budget_fails_cleanly() {
    let mut allocator =
        RateAllocator::new(vec![LayerSpec { target_bytes: Some(1), optimize: true }]);
    for i in 0..4u32 {
        let id = BlockId::new(0, 0, 0, SubbandOrientation::LL, i);
        let mut coder = ebcot_rs::BlockCoder::new(CoderOptions::default());
        let coded = coder.encode(&synth_block(id, 8, i + 11));
        allocator.add_block(coded, 0);
    }

    let tile_input = TileProgressionInput {
        tile_rect: ebcot_rs::geometry::Rect { x0: 0, y0: 0, x1: 32, y1: 32 },
        num_layers: 1,
        components: vec![ebcot_rs::progression::CompProgInfo {
            dx: 1,
            dy: 1,
            resolutions: vec![ebcot_rs::progression::ResProgInfo {
                npx: 1,
                npy: 1,
                rect: ebcot_rs::geometry::Rect { x0: 0, y0: 0, x1: 32, y1: 32 },
                ppx: 15,
                ppy: 15,
                span_x: 1 << 15,
                span_y: 1 << 15,
            }],
        }],
    };
    let mut sink = CountingSink { packets: Vec::new() };
    let err = allocator
        .allocate(&[tile_input], ProgressionOrder::Lrcp, &mut sink)
        .unwrap_err();
    assert!(matches!(err, J2kError::RateInfeasible(_)));
}
